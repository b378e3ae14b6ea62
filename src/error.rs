use colcrypt_crypto::CryptoError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Classification of errors, so callers never match on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid argument, untrusted path, unknown provider. Never retried.
    Configuration,
    /// Corrupt or mismatched key material or ciphertext. Never retried.
    Integrity,
    /// The operation was cancelled or timed out.
    Cancelled,
    /// A provider or transport failed. Surfaced as-is.
    Transient,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{message} (Parameter '{param}')")]
    NullArgument { param: &'static str, message: String },

    #[error("{message} (Parameter '{param}')")]
    InvalidArgument { param: &'static str, message: String },

    #[error("{prefix}Invalid key encryption algorithm specified: '{algorithm}'. Expected value: 'RSA_OAEP' or 'RSA-OAEP'. (Parameter 'encryptionAlgorithm')")]
    InvalidKeyEncryptionAlgorithm { algorithm: String, prefix: &'static str },

    #[error("Column master key path '{path}' received from server '{server}' is not a trusted key path.")]
    UntrustedKeyPath { path: String, server: String },

    #[error("Invalid key store provider name '{0}'. 'MSSQL_' prefix is reserved for system key store providers.")]
    ReservedProviderName(String),

    #[error("Invalid key store provider name specified. Key store provider names cannot be null or empty.")]
    EmptyProviderName,

    #[error("Duplicate key store provider names '{first}' and '{second}'. Key store provider names are case-insensitive.")]
    DuplicateProviderName { first: String, second: String },

    #[error("Key store providers cannot be set more than once.")]
    ProvidersAlreadyRegistered,

    #[error("Failed to decrypt a column encryption key. Invalid key store provider name: '{name}'. A key store provider name must denote either a system key store provider or a registered custom key store provider. Valid system key store provider names are: {system}. Valid (currently registered) custom key store provider names are: {custom}. Please verify key store provider information in column master key definitions in the database, and verify all custom key store providers used in your application are registered properly.")]
    UnrecognizedProvider {
        name: String,
        system: String,
        custom: String,
    },

    #[error("The server '{0}' does not support column encryption.")]
    ColumnEncryptionNotSupported(String),

    #[error("Failed to decrypt a column encryption key using key store provider: '{provider}'. The last 10 bytes of the encrypted column encryption key are: '{key_tail}'.\n{source}")]
    KeyDecryptionFailed {
        provider: String,
        key_tail: String,
        #[source]
        source: Box<Error>,
    },

    #[error("The signature of the column master key metadata for '{path}' (provider '{provider}') is invalid. The column master key metadata may have been tampered with.")]
    InvalidMasterKeySignature { provider: String, path: String },

    #[error("Invalid encryption metadata received from the server: {0}")]
    InvalidMetadata(String),

    #[error("Encryption algorithm '{algorithm}' for the column in the database is either invalid or corrupted. Valid algorithms are: 'AEAD_AES_256_CBC_HMAC_SHA256'.")]
    UnknownCellAlgorithm { algorithm: String },

    #[error("Command '{0}' is already executing.")]
    CommandBusy(uuid::Uuid),

    #[error("Key store provider '{provider}' failed: {message}")]
    Provider { provider: String, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Operation cancelled by user.")]
    Cancelled,

    #[error("Execution timeout expired after {0:?}.")]
    Timeout(std::time::Duration),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Invalid configuration: {0}")]
    Settings(#[from] serde_json::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NullArgument { .. }
            | Self::InvalidArgument { .. }
            | Self::InvalidKeyEncryptionAlgorithm { .. }
            | Self::UntrustedKeyPath { .. }
            | Self::ReservedProviderName(_)
            | Self::EmptyProviderName
            | Self::DuplicateProviderName { .. }
            | Self::ProvidersAlreadyRegistered
            | Self::UnrecognizedProvider { .. }
            | Self::ColumnEncryptionNotSupported(_)
            | Self::CommandBusy(_)
            | Self::Settings(_) => ErrorKind::Configuration,
            Self::InvalidMasterKeySignature { .. }
            | Self::InvalidMetadata(_)
            | Self::UnknownCellAlgorithm { .. } => ErrorKind::Integrity,
            Self::Crypto(e) if e.is_integrity() => ErrorKind::Integrity,
            Self::Crypto(CryptoError::RngFailed(_)) => ErrorKind::Transient,
            Self::Crypto(_) => ErrorKind::Configuration,
            Self::KeyDecryptionFailed { source, .. } => source.kind(),
            Self::Provider { .. } | Self::Transport(_) => ErrorKind::Transient,
            Self::Cancelled | Self::Timeout(_) => ErrorKind::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    /// Null-argument error. The decrypt path reports these as internal errors
    /// since its inputs come from server metadata, not the caller.
    pub(crate) fn null_argument(param: &'static str, message: &str, system_op: bool) -> Self {
        Self::NullArgument {
            param,
            message: with_internal_prefix(message, system_op),
        }
    }

    pub(crate) fn invalid_algorithm(algorithm: &str, system_op: bool) -> Self {
        Self::InvalidKeyEncryptionAlgorithm {
            algorithm: algorithm.to_string(),
            prefix: if system_op { INTERNAL_ERROR_PREFIX } else { "" },
        }
    }

    pub(crate) fn invalid_argument(param: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            param,
            message: message.into(),
        }
    }

    pub(crate) fn provider(provider: &str, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    /// Wrap a failure from a provider's decrypt with the provider name and the
    /// tail of the encrypted key, preserving the inner kind.
    pub(crate) fn key_decryption_failed(provider: &str, encrypted_key: &[u8], source: Error) -> Self {
        let tail_start = encrypted_key.len().saturating_sub(10);
        let key_tail = encrypted_key[tail_start..]
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect();
        Self::KeyDecryptionFailed {
            provider: provider.to_string(),
            key_tail,
            source: Box::new(source),
        }
    }
}

const INTERNAL_ERROR_PREFIX: &str = "Internal error. ";

pub(crate) fn with_internal_prefix(message: &str, system_op: bool) -> String {
    if system_op {
        format!("{}{}", INTERNAL_ERROR_PREFIX, message)
    } else {
        message.to_string()
    }
}
