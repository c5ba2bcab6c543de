#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::missing_crate_level_docs)]

//! kwvolume: Docker volume plugin for Keywhiz-backed secrets
//!
//! Each volume name maps to a mountpoint under a root directory. The first
//! mount of a volume starts a FUSE server for it; later mounts share that
//! server, and the last unmount tears it down.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kwvolume::{Config, FuseLauncher, VolumeDriver};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::new(
//!     "https://keywhiz.example.com:4444",
//!     "client.crt",
//!     "client.key",
//!     "cacert.crt",
//!     "keywhiz",
//!     "keywhiz",
//!     false,
//!     false,
//!     Duration::from_secs(20),
//! )?;
//! let driver = VolumeDriver::new("/var/lib/docker-volumes/_keywhiz", FuseLauncher::new(Arc::new(config)));
//!
//! let mountpoint = driver.mount("secrets")?;
//! println!("secrets served at {}", mountpoint.display());
//! driver.unmount("secrets")?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Operations
//!
//! - `create`: Accepts any name; nothing is allocated
//! - `path`: Mountpoint for a name
//! - `mount`: Starts or shares the server for a name
//! - `unmount`: Releases one holder, tearing down with the last
//! - `remove`: Drops leftover bookkeeping

pub mod modules;

pub use modules::config::{Config, TimeoutBudget};
pub use modules::driver::VolumeDriver;
pub use modules::error::Error;
pub use modules::startup::{FuseLauncher, ServerHandle, ServerLauncher};
