//! Volume driver: the five plugin operations over the server registry.
//!
//! Every operation that touches the registry holds its lock for the whole
//! operation. A mount checks for a live entry, prepares the directory,
//! starts the server and inserts the entry without releasing it, so two
//! concurrent mounts of the same volume can never both start a server.
//! The lock is process-wide; a slow backend during one mount delays every
//! other request until it completes.

use log::{debug, error, info, warn};
use std::fs::{self, DirBuilder};
use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use super::constants::MOUNTPOINT_PERMISSION;
use super::error::{Error, Result};
use super::registry::ServerRegistry;
use super::startup::{FuseLauncher, ServerLauncher};

/// A volume with a live server and its number of holders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedVolume {
    pub name: String,
    pub mountpoint: PathBuf,
    pub connections: usize,
}

/// Maps volume names to mountpoints backed by filesystem servers.
pub struct VolumeDriver<L = FuseLauncher> {
    root: PathBuf,
    launcher: L,
    registry: ServerRegistry,
}

impl<L: ServerLauncher> VolumeDriver<L> {
    /// Creates a driver serving volumes under `root`.
    pub fn new(root: impl Into<PathBuf>, launcher: L) -> Self {
        Self {
            root: root.into(),
            launcher,
            registry: ServerRegistry::new(),
        }
    }

    /// Directory holding every mountpoint.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn mountpoint(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Volumes need no allocation until they are mounted.
    pub fn create(&self, name: &str) -> Result<()> {
        debug!("Create volume {}", name);
        Ok(())
    }

    /// Drops leftover bookkeeping for a volume nobody holds anymore.
    ///
    /// This never unmounts; teardown belongs to [`VolumeDriver::unmount`].
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut registry = self.registry.lock();
        let m = self.mountpoint(name);
        debug!("Removing volume {} at {}", name, m.display());

        let unused = registry
            .get(&m)
            .is_some_and(|entry| entry.connections() <= 1);
        if unused && registry.remove(&m).is_some() {
            warn!("Dropped registry entry for {} without unmounting", m.display());
        }
        Ok(())
    }

    /// Mountpoint for `name`, whether or not it is mounted.
    pub fn path(&self, name: &str) -> PathBuf {
        self.mountpoint(name)
    }

    /// Mounts `name`, starting a server unless one is already live.
    pub fn mount(&self, name: &str) -> Result<PathBuf> {
        let mut registry = self.registry.lock();
        let m = self.mountpoint(name);
        info!("Mounting volume {} on {}", name, m.display());

        if let Some(connections) = registry.increment(&m) {
            debug!("{} already served, {} connections", m.display(), connections);
            return Ok(m);
        }

        prepare_mountpoint(&m)?;

        let server = self.launcher.launch(&m)?;
        registry.insert(m.clone(), server);
        Ok(m)
    }

    /// Releases one holder of `name`, tearing the server down with the last.
    ///
    /// The entry is dropped even when teardown fails; the failure is still
    /// returned to the caller.
    pub fn unmount(&self, name: &str) -> Result<()> {
        let mut registry = self.registry.lock();
        let m = self.mountpoint(name);
        info!("Unmounting volume {} from {}", name, m.display());

        let connections = registry
            .get(&m)
            .map(|entry| entry.connections())
            .ok_or_else(|| Error::NotMounted(m.clone()))?;

        if connections > 1 {
            registry.decrement(&m);
            return Ok(());
        }

        match registry.remove(&m) {
            Some(entry) => entry.into_server().unmount(),
            None => Err(Error::NotMounted(m)),
        }
    }

    /// Live volumes with their connection counts.
    pub fn list(&self) -> Vec<MountedVolume> {
        let registry = self.registry.lock();
        registry
            .mountpoints()
            .into_iter()
            .map(|mountpoint| MountedVolume {
                name: mountpoint
                    .strip_prefix(&self.root)
                    .unwrap_or(&mountpoint)
                    .to_string_lossy()
                    .into_owned(),
                connections: registry.get(&mountpoint).map_or(0, |e| e.connections()),
                mountpoint,
            })
            .collect()
    }

    /// Number of holders of `name`; zero when it is not mounted.
    pub fn connections(&self, name: &str) -> usize {
        let m = self.mountpoint(name);
        self.registry.lock().get(&m).map_or(0, |e| e.connections())
    }

    /// Tears down every live server, returning how many were unmounted.
    pub fn shutdown(&self) -> usize {
        let entries = self.registry.lock().drain();
        let mut unmounted = 0;
        for (m, entry) in entries {
            match entry.into_server().unmount() {
                Ok(()) => unmounted += 1,
                Err(e) => error!("Failed to unmount {}: {}", m.display(), e),
            }
        }
        unmounted
    }
}

/// Ensures `m` is a directory, creating it and its parents when missing.
///
/// An existing directory is reused, an existing non-directory is refused.
fn prepare_mountpoint(m: &Path) -> Result<()> {
    match fs::symlink_metadata(m) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(Error::PathConflict(m.to_path_buf())),
        Err(e) if e.kind() == ErrorKind::NotFound => DirBuilder::new()
            .recursive(true)
            .mode(MOUNTPOINT_PERMISSION)
            .create(m)
            .map_err(|source| Error::DirectoryCreation {
                path: m.to_path_buf(),
                source,
            }),
        Err(source) => Err(Error::DirectoryCreation {
            path: m.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::modules::startup::ServerHandle;
    use anyhow::Result;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Counts launches and teardowns instead of mounting anything.
    #[derive(Clone, Default)]
    pub(crate) struct MockLauncher {
        pub launches: Arc<AtomicUsize>,
        pub teardowns: Arc<AtomicUsize>,
        pub fail_launch: bool,
        pub fail_teardown: bool,
        pub delay: Duration,
    }

    struct MockServer {
        teardowns: Arc<AtomicUsize>,
        fail: bool,
        mountpoint: PathBuf,
    }

    impl ServerHandle for MockServer {
        fn unmount(self: Box<Self>) -> crate::modules::error::Result<()> {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Teardown {
                    path: self.mountpoint,
                    reason: "device busy".into(),
                });
            }
            Ok(())
        }
    }

    impl ServerLauncher for MockLauncher {
        fn launch(
            &self,
            mountpoint: &Path,
        ) -> crate::modules::error::Result<Box<dyn ServerHandle>> {
            thread::sleep(self.delay);
            self.launches.fetch_add(1, Ordering::SeqCst);
            if self.fail_launch {
                return Err(Error::backend("connection refused"));
            }
            Ok(Box::new(MockServer {
                teardowns: self.teardowns.clone(),
                fail: self.fail_teardown,
                mountpoint: mountpoint.to_path_buf(),
            }))
        }
    }

    pub(crate) fn setup_test_driver(
        launcher: MockLauncher,
    ) -> (TempDir, VolumeDriver<MockLauncher>) {
        let temp_dir = tempfile::tempdir().unwrap();
        let driver = VolumeDriver::new(temp_dir.path().join("volumes"), launcher);
        (temp_dir, driver)
    }

    #[test]
    fn test_path_is_root_joined_name() {
        let (_dir, driver) = setup_test_driver(MockLauncher::default());
        assert_eq!(driver.path("secrets"), driver.root().join("secrets"));
        assert_eq!(driver.path("db"), driver.root().join("db"));
    }

    #[test]
    fn test_create_does_not_touch_registry() -> Result<()> {
        let (_dir, driver) = setup_test_driver(MockLauncher::default());
        driver.create("secrets")?;
        assert!(driver.list().is_empty());
        assert!(!driver.path("secrets").exists());
        Ok(())
    }

    #[test]
    fn test_mount_creates_directory_and_entry() -> Result<()> {
        let launcher = MockLauncher::default();
        let (_dir, driver) = setup_test_driver(launcher.clone());

        let m = driver.mount("secrets")?;
        assert_eq!(m, driver.path("secrets"));
        assert!(m.is_dir());
        assert_eq!(
            fs::metadata(&m)?.permissions().mode() & 0o777,
            MOUNTPOINT_PERMISSION
        );
        assert_eq!(driver.connections("secrets"), 1);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn test_second_mount_reuses_server() -> Result<()> {
        let launcher = MockLauncher::default();
        let (_dir, driver) = setup_test_driver(launcher.clone());

        driver.mount("secrets")?;
        driver.mount("secrets")?;
        assert_eq!(driver.connections("secrets"), 2);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn test_mount_reuses_existing_directory() -> Result<()> {
        let (_dir, driver) = setup_test_driver(MockLauncher::default());
        fs::create_dir_all(driver.path("stale"))?;

        driver.mount("stale")?;
        assert_eq!(driver.connections("stale"), 1);
        Ok(())
    }

    #[test]
    fn test_mount_refuses_regular_file() -> Result<()> {
        let launcher = MockLauncher::default();
        let (_dir, driver) = setup_test_driver(launcher.clone());
        fs::create_dir_all(driver.root())?;
        fs::write(driver.path("file"), "not a directory")?;

        let err = driver.mount("file").unwrap_err();
        assert_eq!(err.code(), "path_conflict");
        assert_eq!(driver.connections("file"), 0);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn test_failed_launch_leaves_no_entry() {
        let launcher = MockLauncher {
            fail_launch: true,
            ..Default::default()
        };
        let (_dir, driver) = setup_test_driver(launcher.clone());

        let err = driver.mount("secrets").unwrap_err();
        assert_eq!(err.code(), "backend_construction");
        assert!(driver.list().is_empty());

        // A later attempt runs the whole startup again
        assert!(driver.mount("secrets").is_err());
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unmount_decrements_then_tears_down() -> Result<()> {
        let launcher = MockLauncher::default();
        let (_dir, driver) = setup_test_driver(launcher.clone());

        driver.mount("secrets")?;
        driver.mount("secrets")?;

        driver.unmount("secrets")?;
        assert_eq!(driver.connections("secrets"), 1);
        assert_eq!(launcher.teardowns.load(Ordering::SeqCst), 0);

        driver.unmount("secrets")?;
        assert_eq!(driver.connections("secrets"), 0);
        assert_eq!(launcher.teardowns.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn test_unmount_without_mount() {
        let launcher = MockLauncher::default();
        let (_dir, driver) = setup_test_driver(launcher.clone());

        let err = driver.unmount("secrets").unwrap_err();
        assert_eq!(err.code(), "not_mounted");
        assert!(driver.list().is_empty());
        assert_eq!(launcher.teardowns.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_teardown_still_drops_entry() -> Result<()> {
        let launcher = MockLauncher {
            fail_teardown: true,
            ..Default::default()
        };
        let (_dir, driver) = setup_test_driver(launcher.clone());

        driver.mount("secrets")?;
        let err = driver.unmount("secrets").unwrap_err();
        assert_eq!(err.code(), "teardown");
        assert_eq!(driver.connections("secrets"), 0);

        // The next unmount is a protocol violation, not a second teardown
        assert_eq!(driver.unmount("secrets").unwrap_err().code(), "not_mounted");
        assert_eq!(launcher.teardowns.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn test_full_cycle_starts_new_server() -> Result<()> {
        let launcher = MockLauncher::default();
        let (_dir, driver) = setup_test_driver(launcher.clone());

        driver.mount("secrets")?;
        driver.unmount("secrets")?;
        driver.mount("secrets")?;

        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
        assert_eq!(launcher.teardowns.load(Ordering::SeqCst), 1);
        assert_eq!(driver.connections("secrets"), 1);
        Ok(())
    }

    #[test]
    fn test_remove_drops_unused_entry_without_teardown() -> Result<()> {
        let launcher = MockLauncher::default();
        let (_dir, driver) = setup_test_driver(launcher.clone());

        driver.mount("secrets")?;
        driver.remove("secrets")?;
        assert_eq!(driver.connections("secrets"), 0);
        assert_eq!(launcher.teardowns.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn test_remove_keeps_shared_entry() -> Result<()> {
        let (_dir, driver) = setup_test_driver(MockLauncher::default());

        driver.mount("secrets")?;
        driver.mount("secrets")?;
        driver.remove("secrets")?;
        assert_eq!(driver.connections("secrets"), 2);

        // Unknown volumes are fine too
        driver.remove("unknown")?;
        Ok(())
    }

    #[test]
    fn test_concurrent_mounts_start_one_server() {
        let launcher = MockLauncher {
            delay: Duration::from_millis(20),
            ..Default::default()
        };
        let (_dir, driver) = setup_test_driver(launcher.clone());
        let driver = Arc::new(driver);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let driver = driver.clone();
                thread::spawn(move || driver.mount("secrets"))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }

        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert_eq!(driver.connections("secrets"), 10);
    }

    #[test]
    fn test_list_and_shutdown() -> Result<()> {
        let launcher = MockLauncher::default();
        let (_dir, driver) = setup_test_driver(launcher.clone());

        driver.mount("b")?;
        driver.mount("a")?;
        driver.mount("a")?;

        let listed = driver.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "a");
        assert_eq!(listed[0].connections, 2);
        assert_eq!(listed[1].mountpoint, driver.path("b"));

        assert_eq!(driver.shutdown(), 2);
        assert!(driver.list().is_empty());
        assert_eq!(launcher.teardowns.load(Ordering::SeqCst), 2);
        Ok(())
    }
}
