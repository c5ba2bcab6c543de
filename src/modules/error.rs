//! Error types for the volume plugin.
//!
//! Every failure the driver can report is a variant of [`Error`]. The
//! `Display` output is what ends up in the `Err` field of a plugin
//! response, and [`Error::code`] gives a stable machine-readable tag.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Closed set of failures raised by the driver and its startup path.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed command-line input.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// `mlockall` failed in a way that is unsafe to ignore.
    #[error("could not perform mlockall and prevent swapping memory: {0}")]
    MemoryLock(#[source] nix::errno::Errno),

    /// The mountpoint exists but is not a directory.
    #[error("{} already exist and it's not a directory", .0.display())]
    PathConflict(PathBuf),

    /// Inspecting or creating a mountpoint directory failed.
    #[error("failed to prepare directory {}: {source}", .path.display())]
    DirectoryCreation {
        /// Directory that could not be prepared.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The authenticated backend client could not be built.
    #[error("backend client error: {0}")]
    BackendConstruction(String),

    /// The filesystem server could not be bound to its mountpoint.
    #[error("mount fail on {}: {reason}", .path.display())]
    ServerConstruction {
        /// Mountpoint the server was meant to serve.
        path: PathBuf,
        /// Human-readable failure reason.
        reason: String,
    },

    /// Unmount was requested for a mountpoint with no live server.
    #[error("Unable to find volume mounted on {}", .0.display())]
    NotMounted(PathBuf),

    /// Tearing down a live server failed.
    #[error("unmount fail on {}: {reason}", .path.display())]
    Teardown {
        /// Mountpoint that was being released.
        path: PathBuf,
        /// Human-readable failure reason.
        reason: String,
    },
}

impl Error {
    /// Stable identifier for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::MemoryLock(_) => "memory_lock",
            Self::PathConflict(_) => "path_conflict",
            Self::DirectoryCreation { .. } => "directory_creation",
            Self::BackendConstruction(_) => "backend_construction",
            Self::ServerConstruction { .. } => "server_construction",
            Self::NotMounted(_) => "not_mounted",
            Self::Teardown { .. } => "teardown",
        }
    }

    /// Build a [`Error::BackendConstruction`] from anything displayable.
    pub fn backend<E: std::fmt::Display>(e: E) -> Self {
        Self::BackendConstruction(e.to_string())
    }

    /// Build a [`Error::ServerConstruction`] for `path`.
    pub fn server<E: std::fmt::Display>(path: impl Into<PathBuf>, e: E) -> Self {
        Self::ServerConstruction {
            path: path.into(),
            reason: e.to_string(),
        }
    }
}
