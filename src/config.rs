//! Process-level configuration for column encryption.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default capacity of the query metadata cache.
pub const DEFAULT_METADATA_CACHE_CAPACITY: usize = 2000;

/// Entries dropped from the query metadata cache when it fills up.
pub const DEFAULT_METADATA_CACHE_TRIM: usize = 300;

/// Query metadata entries expire after 10 hours.
pub const DEFAULT_METADATA_CACHE_EXPIRY_SECS: u64 = 10 * 60 * 60;

/// Settings for a [`crate::ColumnEncryption`] context.
///
/// Every field has a default, so a partial JSON document is valid:
///
/// ```
/// let settings = colcrypt::EncryptionSettings::from_json(
///     r#"{ "query_metadata_cache_enabled": false }"#,
/// ).unwrap();
/// assert!(settings.column_encryption_key_cache_enabled);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionSettings {
    /// Cache decrypted column encryption keys (default: true)
    pub column_encryption_key_cache_enabled: bool,
    /// Expire cached column encryption keys after this many seconds (default: never)
    pub column_encryption_key_cache_ttl_secs: Option<u64>,
    /// Cache describe-parameter-encryption results per statement (default: true)
    pub query_metadata_cache_enabled: bool,
    pub query_metadata_cache_capacity: usize,
    pub query_metadata_cache_trim: usize,
    pub query_metadata_cache_expiry_secs: u64,
    /// server → master key paths trusted for that server
    pub trusted_master_key_paths: HashMap<String, Vec<String>>,
    /// Command execution timeout in seconds (default: none)
    pub command_timeout_secs: Option<u64>,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            column_encryption_key_cache_enabled: true,
            column_encryption_key_cache_ttl_secs: None,
            query_metadata_cache_enabled: true,
            query_metadata_cache_capacity: DEFAULT_METADATA_CACHE_CAPACITY,
            query_metadata_cache_trim: DEFAULT_METADATA_CACHE_TRIM,
            query_metadata_cache_expiry_secs: DEFAULT_METADATA_CACHE_EXPIRY_SECS,
            trusted_master_key_paths: HashMap::new(),
            command_timeout_secs: None,
        }
    }
}

impl EncryptionSettings {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn key_cache_ttl(&self) -> Option<Duration> {
        self.column_encryption_key_cache_ttl_secs.map(Duration::from_secs)
    }

    pub fn metadata_cache_expiry(&self) -> Duration {
        Duration::from_secs(self.query_metadata_cache_expiry_secs)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }
}
