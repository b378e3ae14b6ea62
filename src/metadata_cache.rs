//! Caches of server metadata: describe results per statement and the outcome
//! of column master key signature checks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EncryptionSettings;
use crate::expiring::ExpiringCache;
use crate::metadata::DescribeResult;

// ============================================================================
// QueryMetadataCache
// ============================================================================

/// Describe results keyed by (server, statement text).
pub struct QueryMetadataCache {
    entries: ExpiringCache<(String, String), Arc<DescribeResult>>,
    enabled: AtomicBool,
}

impl QueryMetadataCache {
    pub fn new(capacity: usize, trim: usize, expiry: Duration, enabled: bool) -> Self {
        Self {
            entries: ExpiringCache::new(capacity, trim, Some(expiry)),
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn from_settings(settings: &EncryptionSettings) -> Self {
        Self::new(
            settings.query_metadata_cache_capacity,
            settings.query_metadata_cache_trim,
            settings.metadata_cache_expiry(),
            settings.query_metadata_cache_enabled,
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Disabling also drops every cached entry.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        if !enabled {
            self.entries.clear();
        }
    }

    pub fn get(&self, server: &str, statement: &str) -> Option<Arc<DescribeResult>> {
        if !self.is_enabled() {
            return None;
        }
        self.entries.get(&(server.to_string(), statement.to_string()))
    }

    pub fn insert(&self, server: &str, statement: &str, result: Arc<DescribeResult>) {
        if self.is_enabled() {
            self.entries
                .insert((server.to_string(), statement.to_string()), result);
        }
    }

    pub fn invalidate(&self, server: &str, statement: &str) -> bool {
        let removed = self
            .entries
            .remove(&(server.to_string(), statement.to_string()));
        if removed {
            tracing::debug!(server, "invalidated cached query metadata");
        }
        removed
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// SignatureCache
// ============================================================================

const SIGNATURE_CACHE_CAPACITY: usize = 2000;
const SIGNATURE_CACHE_TRIM: usize = 300;
const SIGNATURE_CACHE_TTL: Duration = Duration::from_secs(10 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SignatureKey {
    provider: String,
    /// lowercased
    master_key_path: String,
    allow_enclave_computations: bool,
    signature: Vec<u8>,
}

/// Outcomes of column master key metadata verification.
pub struct SignatureCache {
    entries: ExpiringCache<SignatureKey, bool>,
}

impl Default for SignatureCache {
    fn default() -> Self {
        Self {
            entries: ExpiringCache::new(
                SIGNATURE_CACHE_CAPACITY,
                SIGNATURE_CACHE_TRIM,
                Some(SIGNATURE_CACHE_TTL),
            ),
        }
    }
}

impl SignatureCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(provider: &str, path: &str, allow_enclave: bool, signature: &[u8]) -> SignatureKey {
        SignatureKey {
            provider: provider.to_string(),
            master_key_path: path.to_lowercase(),
            allow_enclave_computations: allow_enclave,
            signature: signature.to_vec(),
        }
    }

    pub fn get(&self, provider: &str, path: &str, allow_enclave: bool, signature: &[u8]) -> Option<bool> {
        self.entries
            .get(&Self::key(provider, path, allow_enclave, signature))
    }

    pub fn insert(&self, provider: &str, path: &str, allow_enclave: bool, signature: &[u8], verified: bool) {
        self.entries
            .insert(Self::key(provider, path, allow_enclave, signature), verified);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
