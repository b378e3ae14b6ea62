//! Process-level column encryption state.
//!
//! [`ColumnEncryption`] owns every cache and registry that commands share:
//! the global key cache, query metadata and signature caches, trusted key
//! paths, and the system and global provider registries. Commands hold an
//! `Arc` to one context; nothing lives in statics.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cache::{CacheScope, CacheSwitch, ColumnKey, ColumnKeyCache, ColumnKeyId};
use crate::config::EncryptionSettings;
use crate::error::{Error, Result};
use crate::metadata::{ColumnKeyEntry, ColumnKeyValue};
use crate::metadata_cache::{QueryMetadataCache, SignatureCache};
use crate::provider::{
    CertificateStore, CertificateStoreProvider, CspProvider, KeyContainerStore, KeyStoreProvider,
    ProviderRegistry, MSSQL_CERTIFICATE_STORE, MSSQL_CSP_PROVIDER, SYSTEM_PROVIDER_PREFIX,
};
use crate::trusted_paths::TrustedKeyPaths;

/// Providers and key cache a single command resolves keys with.
#[derive(Clone, Copy)]
pub struct CommandScope<'a> {
    /// Providers registered on the command, if any.
    pub providers: Option<&'a ProviderRegistry>,
    pub cache: &'a ColumnKeyCache,
}

/// Where a provider name resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProviderRoute {
    System,
    Global,
    Command,
}

pub struct ColumnEncryption {
    settings: EncryptionSettings,
    key_cache_switch: CacheSwitch,
    global_keys: ColumnKeyCache,
    query_metadata: QueryMetadataCache,
    signatures: SignatureCache,
    trusted_paths: TrustedKeyPaths,
    certificates: Arc<CertificateStore>,
    key_containers: Arc<KeyContainerStore>,
    system_providers: ProviderRegistry,
    custom_providers: RwLock<Option<ProviderRegistry>>,
}

impl Default for ColumnEncryption {
    fn default() -> Self {
        Self::new(EncryptionSettings::default())
    }
}

impl std::fmt::Debug for ColumnEncryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnEncryption")
            .field("settings", &self.settings)
            .field("system_providers", &self.system_providers)
            .field("custom_providers", &*self.custom_providers.read())
            .field("cached_keys", &self.global_keys.len())
            .finish()
    }
}

impl ColumnEncryption {
    pub fn new(settings: EncryptionSettings) -> Self {
        let key_cache_switch = CacheSwitch::new(settings.column_encryption_key_cache_enabled);
        let certificates = Arc::new(CertificateStore::new());
        let key_containers = Arc::new(KeyContainerStore::new());

        let mut system: HashMap<String, Arc<dyn KeyStoreProvider>> = HashMap::new();
        system.insert(
            MSSQL_CERTIFICATE_STORE.to_string(),
            Arc::new(CertificateStoreProvider::new(certificates.clone())),
        );
        system.insert(
            MSSQL_CSP_PROVIDER.to_string(),
            Arc::new(CspProvider::new(key_containers.clone())),
        );

        Self {
            global_keys: ColumnKeyCache::new("global", key_cache_switch.clone(), settings.key_cache_ttl()),
            query_metadata: QueryMetadataCache::from_settings(&settings),
            signatures: SignatureCache::new(),
            trusted_paths: TrustedKeyPaths::from_map(&settings.trusted_master_key_paths),
            key_cache_switch,
            certificates,
            key_containers,
            system_providers: ProviderRegistry::system(system),
            custom_providers: RwLock::new(None),
            settings,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(Self::new(EncryptionSettings::from_json(json)?))
    }

    pub fn settings(&self) -> &EncryptionSettings {
        &self.settings
    }

    // ========================================================================
    // Registries
    // ========================================================================

    /// Register the global custom providers. Allowed once per context.
    pub fn register_key_store_providers(
        &self,
        providers: HashMap<String, Arc<dyn KeyStoreProvider>>,
    ) -> Result<()> {
        let registry = ProviderRegistry::custom(providers)?;
        let mut custom = self.custom_providers.write();
        if custom.is_some() {
            return Err(Error::ProvidersAlreadyRegistered);
        }
        tracing::debug!(providers = ?registry.names(), "registered global key store providers");
        *custom = Some(registry);
        Ok(())
    }

    pub fn system_providers(&self) -> &ProviderRegistry {
        &self.system_providers
    }

    pub fn custom_providers(&self) -> ProviderRegistry {
        self.custom_providers.read().clone().unwrap_or_default()
    }

    pub fn certificate_store(&self) -> &Arc<CertificateStore> {
        &self.certificates
    }

    pub fn key_container_store(&self) -> &Arc<KeyContainerStore> {
        &self.key_containers
    }

    pub fn trusted_key_paths(&self) -> &TrustedKeyPaths {
        &self.trusted_paths
    }

    // ========================================================================
    // Caches
    // ========================================================================

    pub fn global_key_cache(&self) -> &ColumnKeyCache {
        &self.global_keys
    }

    pub fn query_metadata_cache(&self) -> &QueryMetadataCache {
        &self.query_metadata
    }

    pub fn signature_cache(&self) -> &SignatureCache {
        &self.signatures
    }

    /// Turn the column encryption key cache on or off for the global cache and
    /// every command cache created from this context.
    pub fn set_column_key_cache_enabled(&self, enabled: bool) {
        self.key_cache_switch.set(enabled);
        if !enabled {
            self.global_keys.clear();
        }
    }

    pub fn is_column_key_cache_enabled(&self) -> bool {
        self.key_cache_switch.is_enabled()
    }

    pub fn set_query_metadata_cache_enabled(&self, enabled: bool) {
        self.query_metadata.set_enabled(enabled);
    }

    /// A fresh cache for one command's private providers.
    pub fn new_command_cache(&self) -> ColumnKeyCache {
        ColumnKeyCache::new("command", self.key_cache_switch.clone(), self.settings.key_cache_ttl())
    }

    pub async fn get_or_decrypt(
        &self,
        id: &ColumnKeyId,
        provider_name: &str,
        provider: &dyn KeyStoreProvider,
        scope: CacheScope<'_>,
    ) -> Result<ColumnKey> {
        let cache = match scope {
            CacheScope::Global => &self.global_keys,
            CacheScope::Command(cache) => cache,
        };
        cache.get_or_decrypt(id, provider_name, provider).await
    }

    // ========================================================================
    // Key resolution
    // ========================================================================

    /// Find the provider for `name`. System names always resolve to the system
    /// providers. Otherwise a command with its own providers uses only those,
    /// and every other command uses the global registry.
    pub(crate) fn route(
        &self,
        name: &str,
        command: Option<&ProviderRegistry>,
    ) -> Result<(Arc<dyn KeyStoreProvider>, ProviderRoute)> {
        let custom;
        let (registry, route) = if name.to_uppercase().starts_with(SYSTEM_PROVIDER_PREFIX) {
            (&self.system_providers, ProviderRoute::System)
        } else if let Some(command) = command {
            (command, ProviderRoute::Command)
        } else {
            custom = self.custom_providers();
            (&custom, ProviderRoute::Global)
        };

        match registry.get(name) {
            Some(provider) => {
                tracing::trace!(provider = name, ?route, "dispatching to key store provider");
                Ok((provider, route))
            }
            None => {
                let custom_names = match command {
                    Some(command) => command.quoted_names(),
                    None => self.custom_providers().quoted_names(),
                };
                Err(Error::UnrecognizedProvider {
                    name: name.to_string(),
                    system: self.system_providers.quoted_names(),
                    custom: custom_names,
                })
            }
        }
    }

    /// Decrypt a column encryption key from the server's key table, trying each
    /// encrypted value in order. The last failure is returned if none works.
    pub(crate) async fn resolve_column_key(
        &self,
        server: &str,
        entry: &ColumnKeyEntry,
        scope: &CommandScope<'_>,
    ) -> Result<ColumnKey> {
        let mut last_error = None;
        for value in &entry.values {
            match self.decrypt_value(server, value, scope).await {
                Ok(key) => return Ok(key),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::debug!(
                        ordinal = entry.ordinal,
                        provider = %value.key_store_provider,
                        error = %e,
                        "column encryption key value failed"
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            Error::InvalidMetadata(format!(
                "column encryption key {} has no encrypted values",
                entry.ordinal
            ))
        }))
    }

    async fn decrypt_value(
        &self,
        server: &str,
        value: &ColumnKeyValue,
        scope: &CommandScope<'_>,
    ) -> Result<ColumnKey> {
        self.trusted_paths.validate(server, &value.master_key_path)?;
        let (provider, route) = self.route(&value.key_store_provider, scope.providers)?;

        if let Some(signature) = &value.master_key_signature {
            self.verify_master_key_signature(value, signature, provider.as_ref(), route)
                .await?;
        }

        let cache_scope = match route {
            ProviderRoute::Command => CacheScope::Command(scope.cache),
            ProviderRoute::System | ProviderRoute::Global => CacheScope::Global,
        };
        self.get_or_decrypt(&value.key_id(), &value.key_store_provider, provider.as_ref(), cache_scope)
            .await
    }

    async fn verify_master_key_signature(
        &self,
        value: &ColumnKeyValue,
        signature: &[u8],
        provider: &dyn KeyStoreProvider,
        route: ProviderRoute,
    ) -> Result<()> {
        let cacheable = route != ProviderRoute::Command;
        let cached = if cacheable {
            self.signatures.get(
                &value.key_store_provider,
                &value.master_key_path,
                value.allow_enclave_computations,
                signature,
            )
        } else {
            None
        };

        let verified = match cached {
            Some(verified) => verified,
            None => {
                let verified = provider
                    .verify_column_master_key_metadata(
                        &value.master_key_path,
                        value.allow_enclave_computations,
                        signature,
                    )
                    .await?;
                if cacheable {
                    self.signatures.insert(
                        &value.key_store_provider,
                        &value.master_key_path,
                        value.allow_enclave_computations,
                        signature,
                        verified,
                    );
                }
                verified
            }
        };

        if !verified {
            tracing::warn!(
                provider = %value.key_store_provider,
                path = %value.master_key_path,
                "column master key metadata signature mismatch"
            );
            return Err(Error::InvalidMasterKeySignature {
                provider: value.key_store_provider.clone(),
                path: value.master_key_path.clone(),
            });
        }
        Ok(())
    }
}
