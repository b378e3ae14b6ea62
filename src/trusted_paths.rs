//! Trusted column master key paths.
//!
//! A server with no entry trusts every path. A server with an entry trusts only
//! the listed paths, so an empty list rejects everything. Server names and paths
//! compare case-insensitively.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct TrustedKeyPaths {
    /// lowercased server → lowercased trusted paths
    servers: RwLock<HashMap<String, Vec<String>>>,
}

impl TrustedKeyPaths {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: &HashMap<String, Vec<String>>) -> Self {
        let registry = Self::new();
        for (server, paths) in map {
            registry.set(server, paths.iter().map(String::as_str));
        }
        registry
    }

    /// Replace the trusted paths for a server.
    pub fn set<'a>(&self, server: &str, paths: impl IntoIterator<Item = &'a str>) {
        let paths = paths.into_iter().map(str::to_lowercase).collect();
        self.servers.write().insert(server.to_lowercase(), paths);
    }

    /// Remove the entry for a server, making it default-open again.
    pub fn remove(&self, server: &str) -> bool {
        self.servers.write().remove(&server.to_lowercase()).is_some()
    }

    pub fn clear(&self) {
        self.servers.write().clear();
    }

    pub fn is_restricted(&self, server: &str) -> bool {
        self.servers.read().contains_key(&server.to_lowercase())
    }

    /// Check a master key path before any provider sees it.
    pub fn validate(&self, server: &str, master_key_path: &str) -> Result<()> {
        let servers = self.servers.read();
        let Some(paths) = servers.get(&server.to_lowercase()) else {
            return Ok(());
        };
        let wanted = master_key_path.to_lowercase();
        if paths.iter().any(|p| *p == wanted) {
            return Ok(());
        }
        tracing::warn!(server, master_key_path, "rejected untrusted column master key path");
        Err(Error::UntrustedKeyPath {
            path: master_key_path.to_string(),
            server: server.to_string(),
        })
    }
}
