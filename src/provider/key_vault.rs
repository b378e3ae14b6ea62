//! Cloud key vault provider.
//!
//! Master key paths are key URLs such as
//! `https://myvault.vault.azure.net/keys/MyKey/0123abcd`. The host must match a
//! trusted endpoint. All RSA operations are delegated to a [`KeyVaultClient`];
//! the provider only builds and checks the envelope around them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use colcrypt_crypto::{
    encode_unsigned, master_key_metadata_digest, parse_envelope, unsigned_digest, CryptoError,
    MasterKeyKind, RsaMasterKey,
};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use zeroize::Zeroizing;

use super::{
    validate_algorithm, validate_column_key, validate_encrypted_key, validate_signature,
    KeyStoreProvider, AZURE_KEY_VAULT,
};
use crate::error::{with_internal_prefix, Error, Result};

/// Hosts trusted when no explicit list is given.
pub const DEFAULT_TRUSTED_ENDPOINTS: [&str; 8] = [
    "vault.azure.net",
    "vault.azure.cn",
    "vault.usgovcloudapi.net",
    "vault.microsoftazure.de",
    "managedhsm.azure.net",
    "managedhsm.azure.cn",
    "managedhsm.usgovcloudapi.net",
    "managedhsm.microsoftazure.de",
];

// ============================================================================
// KeyVaultClient
// ============================================================================

/// Failure reported by a key vault.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct VaultError {
    pub message: String,
}

impl VaultError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Remote RSA key operations, addressed by key URL.
#[async_trait]
pub trait KeyVaultClient: Send + Sync {
    /// Modulus size in bytes of the key at `key_url`.
    async fn key_size(&self, key_url: &str) -> std::result::Result<usize, VaultError>;

    async fn wrap_key(
        &self,
        key_url: &str,
        algorithm: &str,
        column_key: &[u8],
    ) -> std::result::Result<Vec<u8>, VaultError>;

    async fn unwrap_key(
        &self,
        key_url: &str,
        algorithm: &str,
        ciphertext: &[u8],
    ) -> std::result::Result<Zeroizing<Vec<u8>>, VaultError>;

    async fn sign_digest(
        &self,
        key_url: &str,
        digest: &[u8; 32],
    ) -> std::result::Result<Vec<u8>, VaultError>;

    async fn verify_digest(
        &self,
        key_url: &str,
        digest: &[u8; 32],
        signature: &[u8],
    ) -> std::result::Result<bool, VaultError>;
}

// ============================================================================
// InMemoryKeyVault
// ============================================================================

/// Key vault held in process memory. Access can be revoked and latency added
/// to model an unreachable or slow vault.
#[derive(Default)]
pub struct InMemoryKeyVault {
    /// lowercased key URL → key
    keys: RwLock<HashMap<String, Arc<RsaMasterKey>>>,
    revoked: AtomicBool,
    latency: Mutex<Option<Duration>>,
    unwrap_calls: AtomicUsize,
}

impl InMemoryKeyVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn import(&self, key_url: &str, key: RsaMasterKey) {
        self.keys.write().insert(key_url.to_lowercase(), Arc::new(key));
    }

    /// Fail every subsequent operation with an access error.
    pub fn revoke_access(&self) {
        self.revoked.store(true, Ordering::Release);
    }

    pub fn restore_access(&self) {
        self.revoked.store(false, Ordering::Release);
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Number of unwrap requests served so far.
    pub fn unwrap_count(&self) -> usize {
        self.unwrap_calls.load(Ordering::SeqCst)
    }

    async fn key(&self, key_url: &str) -> std::result::Result<Arc<RsaMasterKey>, VaultError> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.revoked.load(Ordering::Acquire) {
            return Err(VaultError::new(format!(
                "Access denied to key '{}'.",
                key_url
            )));
        }
        self.keys
            .read()
            .get(&key_url.to_lowercase())
            .cloned()
            .ok_or_else(|| VaultError::new(format!("Key '{}' was not found.", key_url)))
    }
}

fn vault_crypto_error(e: CryptoError) -> VaultError {
    VaultError::new(e.to_string())
}

#[async_trait]
impl KeyVaultClient for InMemoryKeyVault {
    async fn key_size(&self, key_url: &str) -> std::result::Result<usize, VaultError> {
        Ok(self.key(key_url).await?.key_size())
    }

    async fn wrap_key(
        &self,
        key_url: &str,
        _algorithm: &str,
        column_key: &[u8],
    ) -> std::result::Result<Vec<u8>, VaultError> {
        self.key(key_url)
            .await?
            .wrap_key(column_key)
            .map_err(vault_crypto_error)
    }

    async fn unwrap_key(
        &self,
        key_url: &str,
        _algorithm: &str,
        ciphertext: &[u8],
    ) -> std::result::Result<Zeroizing<Vec<u8>>, VaultError> {
        self.unwrap_calls.fetch_add(1, Ordering::SeqCst);
        self.key(key_url)
            .await?
            .unwrap_key(ciphertext)
            .map_err(vault_crypto_error)
    }

    async fn sign_digest(
        &self,
        key_url: &str,
        digest: &[u8; 32],
    ) -> std::result::Result<Vec<u8>, VaultError> {
        self.key(key_url)
            .await?
            .sign_digest(digest)
            .map_err(vault_crypto_error)
    }

    async fn verify_digest(
        &self,
        key_url: &str,
        digest: &[u8; 32],
        signature: &[u8],
    ) -> std::result::Result<bool, VaultError> {
        Ok(self.key(key_url).await?.verify_digest(digest, signature))
    }
}

// ============================================================================
// KeyVaultProvider
// ============================================================================

pub struct KeyVaultProvider {
    client: Arc<dyn KeyVaultClient>,
    trusted_endpoints: Vec<String>,
}

impl KeyVaultProvider {
    /// Provider trusting the default public and sovereign cloud endpoints.
    pub fn new(client: Arc<dyn KeyVaultClient>) -> Self {
        Self {
            client,
            trusted_endpoints: DEFAULT_TRUSTED_ENDPOINTS.iter().map(|e| e.to_string()).collect(),
        }
    }

    pub fn with_trusted_endpoints(
        client: Arc<dyn KeyVaultClient>,
        trusted_endpoints: Vec<String>,
    ) -> Result<Self> {
        if trusted_endpoints.is_empty() {
            return Err(Error::invalid_argument(
                "trustedEndpoints",
                "One or more of the elements in trustedEndpoints are null or empty or consist of only whitespace.",
            ));
        }
        if trusted_endpoints.iter().any(|e| e.trim().is_empty()) {
            return Err(Error::invalid_argument(
                "trustedEndpoints",
                "One or more of the elements in trustedEndpoints are null or empty or consist of only whitespace.",
            ));
        }
        Ok(Self {
            client,
            trusted_endpoints,
        })
    }

    pub fn trusted_endpoints(&self) -> &[String] {
        &self.trusted_endpoints
    }

    fn validate_path(&self, path: &str, system_op: bool) -> Result<()> {
        if path.is_empty() {
            return Err(Error::null_argument(
                "masterKeyPath",
                "Azure Key Vault key path cannot be null.",
                system_op,
            ));
        }
        let Some(host) = key_url_host(path) else {
            return Err(Error::invalid_argument(
                "masterKeyPath",
                with_internal_prefix(&format!("Invalid url specified: '{}'.", path), system_op),
            ));
        };
        let host = host.to_lowercase();
        let trusted = self.trusted_endpoints.iter().any(|endpoint| {
            let endpoint = endpoint.trim().to_lowercase();
            host == endpoint || host.ends_with(&format!(".{}", endpoint))
        });
        if !trusted {
            return Err(Error::invalid_argument(
                "masterKeyPath",
                with_internal_prefix(
                    &format!(
                        "Invalid Azure Key Vault key path specified: '{}'. Valid trusted endpoints: {}.",
                        path,
                        self.trusted_endpoints.join(", ")
                    ),
                    system_op,
                ),
            ));
        }
        Ok(())
    }
}

/// Host of an absolute http(s) URL with at least two path segments.
fn key_url_host(path: &str) -> Option<&str> {
    let (scheme, rest) = path.split_once("://")?;
    if !scheme.eq_ignore_ascii_case("https") && !scheme.eq_ignore_ascii_case("http") {
        return None;
    }
    let (authority, resource) = rest.split_once('/').unwrap_or((rest, ""));
    let host = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    let host = host.split_once(':').map_or(host, |(h, _)| h);
    if host.is_empty() || host.contains(char::is_whitespace) {
        return None;
    }
    let resource = resource.split(['?', '#']).next().unwrap_or_default();
    let segments = resource.split('/').filter(|s| !s.is_empty()).count();
    (segments >= 2).then_some(host)
}

fn vault_failure(e: VaultError) -> Error {
    Error::provider(AZURE_KEY_VAULT, e.message)
}

#[async_trait]
impl KeyStoreProvider for KeyVaultProvider {
    async fn encrypt_column_encryption_key(
        &self,
        master_key_path: &str,
        algorithm: &str,
        column_key: &[u8],
    ) -> Result<Vec<u8>> {
        self.validate_path(master_key_path, false)?;
        validate_column_key(column_key)?;
        validate_algorithm(algorithm, false)?;

        let key_size = self.client.key_size(master_key_path).await.map_err(vault_failure)?;
        let ciphertext = self
            .client
            .wrap_key(master_key_path, algorithm, column_key)
            .await
            .map_err(vault_failure)?;
        if ciphertext.len() != key_size {
            return Err(CryptoError::WrapFailed(
                "CipherText length does not match the RSA key size.".into(),
            )
            .into());
        }

        let mut envelope = encode_unsigned(master_key_path, &ciphertext)?;
        let signature = self
            .client
            .sign_digest(master_key_path, &unsigned_digest(&envelope))
            .await
            .map_err(vault_failure)?;
        envelope.extend_from_slice(&signature);
        Ok(envelope)
    }

    async fn decrypt_column_encryption_key(
        &self,
        master_key_path: &str,
        algorithm: &str,
        encrypted_key: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        self.validate_path(master_key_path, true)?;
        validate_encrypted_key(encrypted_key)?;
        validate_algorithm(algorithm, true)?;

        let key_size = self.client.key_size(master_key_path).await.map_err(vault_failure)?;
        let envelope = parse_envelope(
            encrypted_key,
            key_size,
            MasterKeyKind::KeyVaultKey,
            master_key_path,
        )?;
        let verified = self
            .client
            .verify_digest(master_key_path, &envelope.digest(), envelope.signature)
            .await
            .map_err(vault_failure)?;
        if !verified {
            return Err(CryptoError::KeySignatureMismatch {
                kind: MasterKeyKind::KeyVaultKey,
                path: master_key_path.to_string(),
            }
            .into());
        }

        self.client
            .unwrap_key(master_key_path, algorithm, envelope.ciphertext)
            .await
            .map_err(vault_failure)
    }

    async fn sign_column_master_key_metadata(
        &self,
        master_key_path: &str,
        allow_enclave_computations: bool,
    ) -> Result<Vec<u8>> {
        self.validate_path(master_key_path, false)?;
        let digest =
            master_key_metadata_digest(AZURE_KEY_VAULT, master_key_path, allow_enclave_computations);
        self.client
            .sign_digest(master_key_path, &digest)
            .await
            .map_err(vault_failure)
    }

    async fn verify_column_master_key_metadata(
        &self,
        master_key_path: &str,
        allow_enclave_computations: bool,
        signature: &[u8],
    ) -> Result<bool> {
        self.validate_path(master_key_path, true)?;
        validate_signature(signature)?;
        let digest =
            master_key_metadata_digest(AZURE_KEY_VAULT, master_key_path, allow_enclave_computations);
        self.client
            .verify_digest(master_key_path, &digest, signature)
            .await
            .map_err(vault_failure)
    }
}
