//! Startup sequence for one filesystem server.
//!
//! [`FuseLauncher`] builds the backend client, ownership policy and
//! timeout budget, asks a [`FilesystemFactory`] for the filesystem, binds
//! it to the mountpoint and starts the serve loop on its own thread.
//! Nothing is left running if any step fails.

use fuser::{Filesystem, MountOption, Session};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::mount::{umount2, MntFlags};
use std::fmt;
use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::client::BackendClient;
use super::config::{Config, TimeoutBudget};
use super::constants::{FUSERMOUNT_HELPERS, PARENT_PERMISSION, SERVE_EXIT_TIMEOUT};
use super::error::{Error, Result};
use super::ownership::Ownership;
use super::secretfs::SecretsFsFactory;

/// A live filesystem server bound to one mountpoint.
pub trait ServerHandle: Send {
    /// Unmounts synchronously and waits for the serve loop to stop.
    ///
    /// A mount that cannot be released is reported without waiting.
    fn unmount(self: Box<Self>) -> Result<()>;
}

/// Builds and starts a server for a mountpoint.
pub trait ServerLauncher: Send + Sync {
    fn launch(&self, mountpoint: &Path) -> Result<Box<dyn ServerHandle>>;
}

/// Constructs the filesystem a server exposes.
///
/// The filesystem's `Display` output names the mount.
pub trait FilesystemFactory: Send + Sync {
    type Fs: Filesystem + fmt::Display + Send + 'static;

    fn build(
        &self,
        client: BackendClient,
        ownership: Ownership,
        timeouts: TimeoutBudget,
        mountpoint: &Path,
    ) -> Result<Self::Fs>;
}

/// Launches FUSE servers using the process configuration.
pub struct FuseLauncher<F = SecretsFsFactory> {
    config: Arc<Config>,
    factory: F,
}

impl FuseLauncher {
    pub fn new(config: Arc<Config>) -> Self {
        Self::with_factory(config, SecretsFsFactory)
    }
}

impl<F: FilesystemFactory> FuseLauncher<F> {
    pub fn with_factory(config: Arc<Config>, factory: F) -> Self {
        Self { config, factory }
    }
}

impl<F: FilesystemFactory> ServerLauncher for FuseLauncher<F> {
    fn launch(&self, mountpoint: &Path) -> Result<Box<dyn ServerHandle>> {
        let timeouts = self.config.timeout_budget();
        debug!("Timeout budget for {}: {:?}", mountpoint.display(), timeouts);

        let client = BackendClient::new(&self.config).inspect_err(|e| {
            error!("Mount fail: {}", e);
        })?;
        let ownership = Ownership::new(&self.config.user, &self.config.group);

        let fs = self
            .factory
            .build(client, ownership, timeouts, mountpoint)
            .inspect_err(|e| error!("Mount fail: {}", e))?;

        if let Some(parent) = mountpoint.parent() {
            DirBuilder::new()
                .recursive(true)
                .mode(PARENT_PERMISSION)
                .create(parent)
                .map_err(|source| Error::DirectoryCreation {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let options = mount_options(&fs.to_string());
        let server = FuseServer::start(fs, mountpoint, &options).inspect_err(|e| {
            error!("Mount fail: {}", e);
        })?;
        Ok(Box::new(server))
    }
}

/// Mount options for a server exposing a filesystem called `name`.
pub fn mount_options(name: &str) -> Vec<MountOption> {
    vec![
        MountOption::AllowOther,
        MountOption::DefaultPermissions,
        MountOption::FSName(name.to_string()),
    ]
}

/// Kernel mount plus the thread running its serve loop.
pub struct FuseServer {
    mountpoint: PathBuf,
    serve: JoinHandle<io::Result<()>>,
}

impl FuseServer {
    /// Binds `fs` to `mountpoint` and starts serving in the background.
    pub fn start<FS>(fs: FS, mountpoint: &Path, options: &[MountOption]) -> Result<Self>
    where
        FS: Filesystem + Send + 'static,
    {
        let mut session =
            Session::new(fs, mountpoint, options).map_err(|e| Error::server(mountpoint, e))?;

        let serve = thread::Builder::new()
            .name(format!("serve:{}", mountpoint.display()))
            .spawn(move || session.run())
            .map_err(|e| Error::server(mountpoint, e))?;

        info!("Serving {}", mountpoint.display());
        Ok(Self {
            mountpoint: mountpoint.to_path_buf(),
            serve,
        })
    }
}

impl ServerHandle for FuseServer {
    fn unmount(self: Box<Self>) -> Result<()> {
        let Self { mountpoint, serve } = *self;

        // The serve loop only returns once the kernel mount is gone, so it
        // is never joined while the mount may still be live.
        unmount_kernel(&mountpoint)?;

        match wait_for_exit(serve, SERVE_EXIT_TIMEOUT) {
            Some(Ok(Ok(()))) => debug!("Serve loop for {} exited", mountpoint.display()),
            Some(Ok(Err(e))) => warn!("Serve loop for {} failed: {}", mountpoint.display(), e),
            Some(Err(_)) => warn!("Serve loop for {} panicked", mountpoint.display()),
            None => warn!(
                "Serve loop for {} still running after {:?}, detaching",
                mountpoint.display(),
                SERVE_EXIT_TIMEOUT
            ),
        }
        Ok(())
    }
}

/// Removes the kernel mount, failing on a busy filesystem.
///
/// Unprivileged processes cannot call umount2 and go through the setuid
/// fusermount helper instead.
fn unmount_kernel(mountpoint: &Path) -> Result<()> {
    match umount2(mountpoint, MntFlags::empty()) {
        // Not a mount point any more
        Ok(()) | Err(Errno::EINVAL) => Ok(()),
        Err(Errno::EPERM) => fusermount_unmount(mountpoint),
        Err(errno) => Err(teardown(mountpoint, errno)),
    }
}

fn fusermount_unmount(mountpoint: &Path) -> Result<()> {
    let mut last_error = None;
    for helper in FUSERMOUNT_HELPERS {
        match Command::new(helper).arg("-u").arg(mountpoint).output() {
            Ok(output) if output.status.success() => return Ok(()),
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(teardown(mountpoint, stderr.trim()));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => last_error = Some(e),
            Err(e) => return Err(teardown(mountpoint, e)),
        }
    }
    Err(teardown(
        mountpoint,
        last_error.map_or_else(|| "no fusermount helper".to_string(), |e| e.to_string()),
    ))
}

fn teardown<E: fmt::Display>(mountpoint: &Path, reason: E) -> Error {
    Error::Teardown {
        path: mountpoint.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Joins `handle` if it finishes within `timeout`, otherwise gives it up.
fn wait_for_exit<T>(handle: JoinHandle<T>, timeout: Duration) -> Option<thread::Result<T>> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(Duration::from_millis(10));
    }
    Some(handle.join())
}
