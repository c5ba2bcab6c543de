//! Core plugin modules.
//!
//! - `constants`: Paths, permissions and timeout defaults
//! - `config`: Process configuration and the derived timeout budget
//! - `error`: Error taxonomy reported to plugin callers
//! - `registry`: Reference-counted table of live servers
//! - `driver`: The volume driver operations
//! - `startup`: Building and launching one filesystem server
//! - `client`: Authenticated backend client
//! - `ownership`: Default file owner resolution
//! - `secretfs`: Filesystem exposed at each mountpoint
//! - `memlock`: Keeping process memory out of swap
//! - `plugin`: Docker plugin protocol adapter

pub mod client;
pub mod config;
pub mod constants;
pub mod driver;
pub mod error;
pub mod memlock;
pub mod ownership;
pub mod plugin;
pub mod registry;
pub mod secretfs;
pub mod startup;
