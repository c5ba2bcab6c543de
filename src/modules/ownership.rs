//! Default owner reported for files exposed by the filesystem.

use log::warn;
use nix::unistd::{getegid, geteuid, Group, User};

/// Resolved uid/gid pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

impl Ownership {
    /// Resolves `user` and `group` by name.
    ///
    /// Names that cannot be resolved fall back to the effective uid/gid of
    /// this process.
    pub fn new(user: &str, group: &str) -> Self {
        let uid = match User::from_name(user) {
            Ok(Some(u)) => u.uid.as_raw(),
            Ok(None) => {
                warn!("Unknown user {}, falling back to uid {}", user, geteuid());
                geteuid().as_raw()
            }
            Err(e) => {
                warn!("Error looking up user {}: {}", user, e);
                geteuid().as_raw()
            }
        };

        let gid = match Group::from_name(group) {
            Ok(Some(g)) => g.gid.as_raw(),
            Ok(None) => {
                warn!("Unknown group {}, falling back to gid {}", group, getegid());
                getegid().as_raw()
            }
            Err(e) => {
                warn!("Error looking up group {}: {}", group, e);
                getegid().as_raw()
            }
        };

        Self { uid, gid }
    }
}
