//! Key store providers.
//!
//! A provider owns column master keys and can wrap/unwrap column encryption
//! keys with them. Empty strings and slices stand in for missing arguments.
//! Arguments on the decrypt path come from server metadata, so their errors
//! carry an "Internal error." prefix.

pub mod certificate;
pub mod csp;
pub mod key_vault;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use colcrypt_crypto::{RSA_OAEP, RSA_OAEP_ALT};
use zeroize::Zeroizing;

use crate::error::{with_internal_prefix, Error, Result};

pub use certificate::{CertificateStore, CertificateStoreProvider, StoreLocation};
pub use csp::{CspProvider, KeyContainerStore, DEFAULT_CSP_NAME};
pub use key_vault::{InMemoryKeyVault, KeyVaultClient, KeyVaultProvider, VaultError};

/// Name of the certificate store system provider.
pub const MSSQL_CERTIFICATE_STORE: &str = "MSSQL_CERTIFICATE_STORE";

/// Name of the CSP system provider.
pub const MSSQL_CSP_PROVIDER: &str = "MSSQL_CSP_PROVIDER";

/// Conventional registration name of the key vault provider.
pub const AZURE_KEY_VAULT: &str = "AZURE_KEY_VAULT";

/// Names with this prefix are reserved for system providers.
pub const SYSTEM_PROVIDER_PREFIX: &str = "MSSQL_";

// ============================================================================
// KeyStoreProvider
// ============================================================================

/// A store of column master keys.
///
/// Implementations must accept ciphertext produced by any other provider that
/// holds the same RSA key: all built-in providers share the envelope format in
/// [`colcrypt_crypto::column_key`].
#[async_trait]
pub trait KeyStoreProvider: Send + Sync {
    /// Wrap and sign a plaintext column encryption key.
    async fn encrypt_column_encryption_key(
        &self,
        master_key_path: &str,
        algorithm: &str,
        column_key: &[u8],
    ) -> Result<Vec<u8>>;

    /// Validate, verify and unwrap an encrypted column encryption key.
    async fn decrypt_column_encryption_key(
        &self,
        master_key_path: &str,
        algorithm: &str,
        encrypted_key: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>>;

    async fn sign_column_master_key_metadata(
        &self,
        master_key_path: &str,
        allow_enclave_computations: bool,
    ) -> Result<Vec<u8>>;

    async fn verify_column_master_key_metadata(
        &self,
        master_key_path: &str,
        allow_enclave_computations: bool,
        signature: &[u8],
    ) -> Result<bool>;
}

// ============================================================================
// Shared argument validation
// ============================================================================

pub(crate) fn validate_algorithm(algorithm: &str, system_op: bool) -> Result<()> {
    if algorithm.is_empty() {
        return Err(Error::null_argument(
            "encryptionAlgorithm",
            "Key encryption algorithm cannot be null.",
            system_op,
        ));
    }
    if algorithm != RSA_OAEP && algorithm != RSA_OAEP_ALT {
        return Err(Error::invalid_algorithm(algorithm, system_op));
    }
    Ok(())
}

pub(crate) fn validate_column_key(column_key: &[u8]) -> Result<()> {
    if column_key.is_empty() {
        return Err(Error::invalid_argument(
            "columnEncryptionKey",
            "Empty column encryption key specified.",
        ));
    }
    Ok(())
}

pub(crate) fn validate_encrypted_key(encrypted_key: &[u8]) -> Result<()> {
    if encrypted_key.is_empty() {
        return Err(Error::invalid_argument(
            "encryptedColumnEncryptionKey",
            with_internal_prefix("Empty encrypted column encryption key specified.", true),
        ));
    }
    Ok(())
}

pub(crate) fn validate_signature(signature: &[u8]) -> Result<()> {
    if signature.is_empty() {
        return Err(Error::null_argument(
            "signature",
            "Column master key metadata signature cannot be null or empty.",
            false,
        ));
    }
    Ok(())
}

// ============================================================================
// ProviderRegistry
// ============================================================================

/// A named set of key store providers registered at one scope. Names are
/// matched case-insensitively; the registered spelling is kept for messages.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, (String, Arc<dyn KeyStoreProvider>)>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl ProviderRegistry {
    /// Build a registry of custom providers. Names must be non-blank, must
    /// not use the reserved system prefix and must be unique ignoring case.
    pub fn custom(providers: HashMap<String, Arc<dyn KeyStoreProvider>>) -> Result<Self> {
        for name in providers.keys() {
            if name.trim().is_empty() {
                return Err(Error::EmptyProviderName);
            }
            if name
                .to_uppercase()
                .starts_with(SYSTEM_PROVIDER_PREFIX)
            {
                return Err(Error::ReservedProviderName(name.clone()));
            }
        }
        Self::from_map(providers)
    }

    /// The built-in providers, whose names are fixed constants.
    pub(crate) fn system(providers: HashMap<String, Arc<dyn KeyStoreProvider>>) -> Self {
        let providers = providers
            .into_iter()
            .map(|(name, provider)| (name.to_uppercase(), (name, provider)))
            .collect();
        Self { providers }
    }

    fn from_map(providers: HashMap<String, Arc<dyn KeyStoreProvider>>) -> Result<Self> {
        let mut keyed: HashMap<String, (String, Arc<dyn KeyStoreProvider>)> =
            HashMap::with_capacity(providers.len());
        for (name, provider) in providers {
            let key = name.to_uppercase();
            if let Some((existing, _)) = keyed.get(&key) {
                let (first, second) = if *existing < name {
                    (existing, &name)
                } else {
                    (&name, existing)
                };
                return Err(Error::DuplicateProviderName {
                    first: first.clone(),
                    second: second.clone(),
                });
            }
            keyed.insert(key, (name, provider));
        }
        Ok(Self { providers: keyed })
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn KeyStoreProvider>> {
        self.providers
            .get(&name.to_uppercase())
            .map(|(_, provider)| Arc::clone(provider))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.values().map(|(name, _)| name.clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Names formatted for error messages: `'A', 'B'`.
    pub(crate) fn quoted_names(&self) -> String {
        self.names()
            .iter()
            .map(|n| format!("'{}'", n))
            .collect::<Vec<_>>()
            .join(", ")
    }
}
