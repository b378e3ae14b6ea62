//! Client-side column encryption.
//!
//! Resolves column encryption keys through pluggable key store providers,
//! caches them per scope, and encrypts/decrypts cell values with
//! AEAD_AES_256_CBC_HMAC_SHA256 around an encrypted command's execution.

pub mod cache;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
mod expiring;
pub mod metadata;
pub mod metadata_cache;
pub mod provider;
pub mod resolver;
pub mod transport;
pub mod trusted_paths;

pub use colcrypt_crypto as crypto;
pub use colcrypt_crypto::{AeadCellCipher, EncryptionType, RsaMasterKey};

pub use cache::{CacheScope, CacheSwitch, ColumnKey, ColumnKeyCache, ColumnKeyId};
pub use command::EncryptedCommand;
pub use config::EncryptionSettings;
pub use context::{ColumnEncryption, CommandScope};
pub use error::{Error, ErrorKind, Result};
pub use metadata::{
    CipherInfo, ColumnKeyEntry, ColumnKeyValue, DescribeResult, ParameterCipherInfo,
};
pub use metadata_cache::{QueryMetadataCache, SignatureCache};
pub use provider::{
    CertificateStore, CertificateStoreProvider, CspProvider, InMemoryKeyVault, KeyContainerStore,
    KeyStoreProvider, KeyVaultClient, KeyVaultProvider, ProviderRegistry, StoreLocation,
    VaultError, AZURE_KEY_VAULT, MSSQL_CERTIFICATE_STORE, MSSQL_CSP_PROVIDER,
};
pub use resolver::{ParameterEncryptionResolver, ResolvedParameters, ResolverDiagnostics, ResolverState};
pub use transport::{
    BoundParameter, CommandTransport, DescribeRequest, ExecuteRequest, Parameter, ResultColumn,
    ResultSet, RpcHandle, TransportError,
};
pub use trusted_paths::TrustedKeyPaths;
