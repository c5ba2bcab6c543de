//! Read-only filesystem served at each volume mountpoint.
//!
//! The root directory holds a few status files describing the daemon and
//! its backend. Attributes report the configured default owner.

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEntry, Request,
};
use libc::{EISDIR, ENOENT};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use super::client::BackendClient;
use super::config::TimeoutBudget;
use super::constants::*;
use super::error::Result;
use super::ownership::Ownership;
use super::startup::FilesystemFactory;

const RUNNING_INODE: u64 = INITIAL_INODE;
const VERSION_INODE: u64 = INITIAL_INODE + 1;
const STATUS_INODE: u64 = INITIAL_INODE + 2;

/// Anything that can report backend status within a deadline.
pub trait StatusSource: Send {
    fn status(&self, deadline: Duration) -> Result<String>;
}

impl StatusSource for BackendClient {
    fn status(&self, deadline: Duration) -> Result<String> {
        BackendClient::status(self, Some(deadline))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Content {
    Running,
    Version,
    Status,
}

/// Last backend status and when it was fetched.
struct StatusCache {
    body: Vec<u8>,
    fetched: Option<Instant>,
}

/// Status filesystem for one mountpoint.
pub struct SecretsFs<S = BackendClient> {
    source: S,
    ownership: Ownership,
    timeouts: TimeoutBudget,
    mountpoint: PathBuf,
    mounted_at: SystemTime,
    files: BTreeMap<u64, (OsString, Content)>,
    status: StatusCache,
}

impl<S: StatusSource> SecretsFs<S> {
    pub fn new(
        source: S,
        ownership: Ownership,
        timeouts: TimeoutBudget,
        mountpoint: &Path,
    ) -> Self {
        let files = BTreeMap::from([
            (RUNNING_INODE, (OsString::from(".running"), Content::Running)),
            (VERSION_INODE, (OsString::from(".version"), Content::Version)),
            (STATUS_INODE, (OsString::from(".status"), Content::Status)),
        ]);

        Self {
            source,
            ownership,
            timeouts,
            mountpoint: mountpoint.to_path_buf(),
            mounted_at: SystemTime::now(),
            files,
            status: StatusCache {
                body: Vec::new(),
                fetched: None,
            },
        }
    }

    fn attr(&self, ino: u64, kind: FileType, size: u64) -> FileAttr {
        let (perm, nlink) = match kind {
            FileType::Directory => (ROOT_PERMISSION, 2),
            _ => (FILE_PERMISSION, 1),
        };
        FileAttr {
            ino,
            size,
            blocks: size.div_ceil(BLOCK_SIZE),
            atime: self.mounted_at,
            mtime: self.mounted_at,
            ctime: self.mounted_at,
            crtime: self.mounted_at,
            kind,
            perm,
            nlink,
            uid: self.ownership.uid,
            gid: self.ownership.gid,
            rdev: 0,
            flags: 0,
            blksize: BLOCK_SIZE as u32,
        }
    }

    fn content(&mut self, content: Content) -> Vec<u8> {
        match content {
            Content::Running => format!("{}\n", std::process::id()).into_bytes(),
            Content::Version => format!("{}\n", env!("CARGO_PKG_VERSION")).into_bytes(),
            Content::Status => self.refresh_status().to_vec(),
        }
    }

    /// Refetches backend status once the cached copy is no longer fresh.
    ///
    /// A failed fetch keeps serving the previous body until it is older
    /// than the max wait, then reports the failure instead.
    fn refresh_status(&mut self) -> &[u8] {
        let age = self.status.fetched.map(|at| at.elapsed());
        if matches!(age, Some(age) if age <= self.timeouts.fresh) {
            return &self.status.body;
        }

        match self.source.status(self.timeouts.backend_deadline) {
            Ok(body) => {
                self.status.body = format!("ok {}\n", body.trim()).into_bytes();
                self.status.fetched = Some(Instant::now());
            }
            Err(e) => {
                warn!("Status refresh for {} failed: {}", self.mountpoint.display(), e);
                let stale = !matches!(age, Some(age) if age <= self.timeouts.max_wait);
                if stale {
                    self.status.body = format!("error {e}\n").into_bytes();
                    self.status.fetched = None;
                }
            }
        }
        &self.status.body
    }

    fn lookup_entry(&mut self, parent: u64, name: &OsStr) -> Option<FileAttr> {
        if parent != ROOT_INODE {
            return None;
        }
        let (ino, content) = self
            .files
            .iter()
            .find(|(_, (entry_name, _))| entry_name.as_os_str() == name)
            .map(|(ino, (_, content))| (*ino, *content))?;
        let size = self.content(content).len() as u64;
        Some(self.attr(ino, FileType::RegularFile, size))
    }

    fn getattr_entry(&mut self, ino: u64) -> Option<FileAttr> {
        if ino == ROOT_INODE {
            return Some(self.attr(ROOT_INODE, FileType::Directory, 0));
        }
        let content = self.files.get(&ino).map(|(_, content)| *content)?;
        let size = self.content(content).len() as u64;
        Some(self.attr(ino, FileType::RegularFile, size))
    }

    fn read_entry(&mut self, ino: u64, offset: i64, size: u32) -> Option<Vec<u8>> {
        let content = self.files.get(&ino).map(|(_, content)| *content)?;
        let data = self.content(content);
        let start = (offset.max(0) as usize).min(data.len());
        let end = start.saturating_add(size as usize).min(data.len());
        Some(data[start..end].to_vec())
    }

    fn root_entries(&self) -> Vec<(u64, FileType, OsString)> {
        let mut entries = vec![
            (ROOT_INODE, FileType::Directory, OsString::from(".")),
            (ROOT_INODE, FileType::Directory, OsString::from("..")),
        ];
        entries.extend(
            self.files
                .iter()
                .map(|(ino, (name, _))| (*ino, FileType::RegularFile, name.clone())),
        );
        entries
    }
}

impl<S> fmt::Display for SecretsFs<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "keywhizfs")
    }
}

impl<S: StatusSource> Filesystem for SecretsFs<S> {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("Lookup for parent: {}, name: {:?}", parent, name);
        match self.lookup_entry(parent, name) {
            Some(attr) => reply.entry(&TTL, &attr, 0),
            None => reply.error(ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.getattr_entry(ino) {
            Some(attr) => reply.attr(&TTL, &attr),
            None => reply.error(ENOENT),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyData,
    ) {
        if ino == ROOT_INODE {
            reply.error(EISDIR);
            return;
        }
        match self.read_entry(ino, offset, size) {
            Some(data) => reply.data(&data),
            None => reply.error(ENOENT),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        if ino != ROOT_INODE {
            reply.error(ENOENT);
            return;
        }

        for (i, entry) in self
            .root_entries()
            .into_iter()
            .enumerate()
            .skip(offset as usize)
        {
            if reply.add(entry.0, (i + 1) as i64, entry.1, &entry.2) {
                break;
            }
        }
        reply.ok();
    }
}

/// Builds a [`SecretsFs`] backed by the backend client.
#[derive(Debug, Default, Clone, Copy)]
pub struct SecretsFsFactory;

impl FilesystemFactory for SecretsFsFactory {
    type Fs = SecretsFs<BackendClient>;

    fn build(
        &self,
        client: BackendClient,
        ownership: Ownership,
        timeouts: TimeoutBudget,
        mountpoint: &Path,
    ) -> Result<Self::Fs> {
        Ok(SecretsFs::new(client, ownership, timeouts, mountpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct FakeBackend {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl StatusSource for FakeBackend {
        fn status(&self, _deadline: Duration) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::backend("connection refused"))
            } else {
                Ok("healthy".to_string())
            }
        }
    }

    fn setup_test_fs(backend: FakeBackend, timeout: Duration) -> SecretsFs<FakeBackend> {
        SecretsFs::new(
            backend,
            Ownership { uid: 1000, gid: 1000 },
            TimeoutBudget::new(timeout),
            Path::new("/volumes/secrets"),
        )
    }

    #[test]
    fn test_root_directory_attributes() {
        let mut fs = setup_test_fs(FakeBackend::default(), Duration::from_secs(20));
        let attr = fs.getattr_entry(ROOT_INODE).unwrap();

        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.perm, ROOT_PERMISSION);
        assert_eq!((attr.uid, attr.gid), (1000, 1000));
    }

    #[test]
    fn test_directory_listing() {
        let fs = setup_test_fs(FakeBackend::default(), Duration::from_secs(20));
        let names: Vec<_> = fs
            .root_entries()
            .into_iter()
            .map(|(_, _, name)| name.into_string().unwrap())
            .collect();

        assert_eq!(names, vec![".", "..", ".running", ".version", ".status"]);
    }

    #[test]
    fn test_file_lookup() {
        let mut fs = setup_test_fs(FakeBackend::default(), Duration::from_secs(20));

        let attr = fs.lookup_entry(ROOT_INODE, OsStr::new(".version")).unwrap();
        assert_eq!(attr.ino, VERSION_INODE);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, FILE_PERMISSION);

        assert!(fs.lookup_entry(ROOT_INODE, OsStr::new("missing")).is_none());
        assert!(fs.lookup_entry(VERSION_INODE, OsStr::new(".version")).is_none());
    }

    #[test]
    fn test_file_content() {
        let mut fs = setup_test_fs(FakeBackend::default(), Duration::from_secs(20));

        let running = fs.read_entry(RUNNING_INODE, 0, 64).unwrap();
        assert_eq!(running, format!("{}\n", std::process::id()).into_bytes());

        let partial = fs.read_entry(VERSION_INODE, 1, 2).unwrap();
        assert_eq!(partial, env!("CARGO_PKG_VERSION").as_bytes()[1..3].to_vec());

        // Reads past the end are empty rather than panicking
        assert!(fs.read_entry(VERSION_INODE, 4096, 16).unwrap().is_empty());
    }

    #[test]
    fn status_is_cached_while_fresh() {
        let backend = FakeBackend::default();
        let mut fs = setup_test_fs(backend.clone(), Duration::from_secs(20));

        assert_eq!(fs.read_entry(STATUS_INODE, 0, 64).unwrap(), b"ok healthy\n");
        assert_eq!(fs.read_entry(STATUS_INODE, 0, 64).unwrap(), b"ok healthy\n");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn status_reports_backend_failure() {
        let backend = FakeBackend {
            fail: true,
            ..Default::default()
        };
        let mut fs = setup_test_fs(backend, Duration::from_secs(20));

        let body = fs.read_entry(STATUS_INODE, 0, 256).unwrap();
        assert!(String::from_utf8(body)
            .unwrap()
            .starts_with("error backend client error: connection refused"));
    }

    #[test]
    fn stale_status_served_within_max_wait() {
        let mut fs = setup_test_fs(FakeBackend::default(), Duration::from_secs(20));
        assert_eq!(fs.read_entry(STATUS_INODE, 0, 64).unwrap(), b"ok healthy\n");

        fs.source.fail = true;
        fs.status.fetched = Instant::now().checked_sub(Duration::from_secs(1));
        assert_eq!(fs.read_entry(STATUS_INODE, 0, 64).unwrap(), b"ok healthy\n");
    }

    #[test]
    fn filesystem_name() {
        let fs = setup_test_fs(FakeBackend::default(), Duration::from_secs(20));
        assert_eq!(fs.to_string(), "keywhizfs");
    }
}
