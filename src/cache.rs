//! Column encryption key caches.
//!
//! One global cache is shared by every command of a [`crate::ColumnEncryption`]
//! context. Commands with their own key store providers get a private cache
//! instead and never read from or write to the global one. A single switch,
//! shared by the global cache and every command cache, turns caching off.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use colcrypt_crypto::{CryptoError, COLUMN_KEY_LENGTH};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::expiring::ExpiringCache;
use crate::provider::KeyStoreProvider;

// ============================================================================
// ColumnKey
// ============================================================================

/// A decrypted 32-byte column encryption key. Cheap to clone; the bytes are
/// zeroized when the last clone is dropped.
#[derive(Clone)]
pub struct ColumnKey(Arc<Zeroizing<Vec<u8>>>);

impl ColumnKey {
    pub fn new(bytes: Zeroizing<Vec<u8>>) -> Result<Self> {
        if bytes.len() != COLUMN_KEY_LENGTH {
            return Err(CryptoError::InvalidKeyLength {
                expected: COLUMN_KEY_LENGTH,
                got: bytes.len(),
            }
            .into());
        }
        Ok(Self(Arc::new(bytes)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl PartialEq for ColumnKey {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for ColumnKey {}

impl std::fmt::Debug for ColumnKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ColumnKey([REDACTED])")
    }
}

/// Identity of an encrypted column encryption key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnKeyId {
    pub master_key_path: String,
    pub encrypted_key: Vec<u8>,
    pub algorithm: String,
}

// ============================================================================
// CacheSwitch
// ============================================================================

/// Shared on/off flag for a family of caches.
#[derive(Debug, Clone)]
pub struct CacheSwitch(Arc<AtomicBool>);

impl CacheSwitch {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Release);
    }
}

// ============================================================================
// ColumnKeyCache
// ============================================================================

/// Which cache a key resolution reads and populates.
#[derive(Clone, Copy)]
pub enum CacheScope<'a> {
    Global,
    Command(&'a ColumnKeyCache),
}

pub struct ColumnKeyCache {
    scope: &'static str,
    entries: ExpiringCache<ColumnKeyId, ColumnKey>,
    switch: CacheSwitch,
}

impl ColumnKeyCache {
    pub fn new(scope: &'static str, switch: CacheSwitch, ttl: Option<Duration>) -> Self {
        Self {
            scope,
            entries: ExpiringCache::new(usize::MAX, 1, ttl),
            switch,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.switch.is_enabled()
    }

    pub fn get(&self, id: &ColumnKeyId) -> Option<ColumnKey> {
        if !self.is_enabled() {
            return None;
        }
        self.entries.get(id)
    }

    pub fn insert(&self, id: ColumnKeyId, key: ColumnKey) {
        if self.is_enabled() {
            self.entries.insert(id, key);
        }
    }

    pub fn remove(&self, id: &ColumnKeyId) -> bool {
        self.entries.remove(id)
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

    /// Return the cached key, or decrypt it with `provider` and cache it.
    ///
    /// The lock is released before the provider is called, so a cancelled
    /// decrypt leaves nothing behind. Concurrent misses for the same key may
    /// both decrypt; the last insert wins.
    pub async fn get_or_decrypt(
        &self,
        id: &ColumnKeyId,
        provider_name: &str,
        provider: &dyn KeyStoreProvider,
    ) -> Result<ColumnKey> {
        if let Some(key) = self.get(id) {
            tracing::debug!(scope = self.scope, path = %id.master_key_path, "column key cache hit");
            return Ok(key);
        }
        tracing::debug!(
            scope = self.scope,
            provider = provider_name,
            path = %id.master_key_path,
            "column key cache miss, decrypting"
        );

        let plaintext = provider
            .decrypt_column_encryption_key(&id.master_key_path, &id.algorithm, &id.encrypted_key)
            .await
            .map_err(|e| Error::key_decryption_failed(provider_name, &id.encrypted_key, e))?;
        let key = ColumnKey::new(plaintext)?;
        self.insert(id.clone(), key.clone());
        Ok(key)
    }
}
