//! Reference-counted table of live filesystem servers.
//!
//! The table is only reachable through a [`RegistryGuard`], so every
//! read-modify-write happens under the one lock. Callers keep the guard
//! for their whole critical section, including the directory checks and
//! server construction of a mount.

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::startup::ServerHandle;

/// One live server and the number of holders keeping it alive.
pub struct RegistryEntry {
    server: Box<dyn ServerHandle>,
    connections: usize,
}

impl RegistryEntry {
    /// Number of outstanding holders.
    pub fn connections(&self) -> usize {
        self.connections
    }

    /// Gives up the server handle so it can be torn down.
    pub fn into_server(self) -> Box<dyn ServerHandle> {
        self.server
    }
}

/// Mutex-guarded map from mountpoint to live server.
#[derive(Default)]
pub struct ServerRegistry {
    servers: Mutex<HashMap<PathBuf, RegistryEntry>>,
}

impl ServerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters the critical section.
    pub fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            servers: self.servers.lock(),
        }
    }
}

/// Exclusive access to the registry for the lifetime of the guard.
pub struct RegistryGuard<'a> {
    servers: MutexGuard<'a, HashMap<PathBuf, RegistryEntry>>,
}

impl RegistryGuard<'_> {
    /// Looks up the entry for `mountpoint`.
    pub fn get(&self, mountpoint: &Path) -> Option<&RegistryEntry> {
        self.servers.get(mountpoint)
    }

    /// Registers a freshly started server with one holder.
    ///
    /// Any previous entry for the mountpoint is returned so the caller can
    /// decide what to do with its server.
    pub fn insert(
        &mut self,
        mountpoint: PathBuf,
        server: Box<dyn ServerHandle>,
    ) -> Option<RegistryEntry> {
        self.servers.insert(
            mountpoint,
            RegistryEntry {
                server,
                connections: 1,
            },
        )
    }

    /// Drops the entry for `mountpoint`, handing it back to the caller.
    pub fn remove(&mut self, mountpoint: &Path) -> Option<RegistryEntry> {
        self.servers.remove(mountpoint)
    }

    /// Adds a holder; returns the new count.
    pub fn increment(&mut self, mountpoint: &Path) -> Option<usize> {
        self.servers.get_mut(mountpoint).map(|entry| {
            entry.connections += 1;
            entry.connections
        })
    }

    /// Releases a holder without going below one; returns the new count.
    ///
    /// The last holder is released by removing the entry.
    pub fn decrement(&mut self, mountpoint: &Path) -> Option<usize> {
        self.servers.get_mut(mountpoint).map(|entry| {
            entry.connections = entry.connections.saturating_sub(1).max(1);
            entry.connections
        })
    }

    /// Mountpoints that currently have a live server, sorted.
    pub fn mountpoints(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.servers.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Empties the registry, returning every entry.
    pub fn drain(&mut self) -> Vec<(PathBuf, RegistryEntry)> {
        self.servers.drain().collect()
    }
}
