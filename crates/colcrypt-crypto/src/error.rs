use thiserror::Error;

use crate::types::MasterKeyKind;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("The column encryption key has been successfully decrypted but it's length: {got} does not match the length: {expected} for algorithm 'AEAD_AES_256_CBC_HMAC_SHA256'. Verify the encrypted value of the column encryption key in the database.")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Specified ciphertext has an invalid size of {got} bytes, which is below the minimum {minimum} bytes required for decryption.")]
    CellTooShort { got: usize, minimum: usize },

    #[error("The specified ciphertext's encryption algorithm version '{actual:02X}' does not match the expected encryption algorithm version '{expected:02X}'.")]
    UnsupportedCellVersion { actual: u8, expected: u8 },

    #[error("Specified ciphertext has an invalid authentication tag.")]
    InvalidAuthenticationTag,

    #[error("Encryption type '{0}' specified for the column in the database is either invalid or corrupted. Valid encryption types for algorithm 'AEAD_AES_256_CBC_HMAC_SHA256' are: 'Deterministic', 'Randomized'.")]
    InvalidEncryptionType(u8),

    #[error("Specified encrypted column encryption key contains an invalid encryption algorithm version '{actual:02X}'. Expected version is '{expected:02X}'.")]
    UnsupportedKeyVersion { actual: u8, expected: u8 },

    #[error("The specified encrypted column encryption key's ciphertext length: {actual} does not match the ciphertext length: {expected} when using column master key ({}) in '{path}'. The encrypted column encryption key may be corrupt, or the specified {} may be incorrect.", kind.key_noun(), kind.path_noun())]
    KeyCiphertextLength {
        actual: usize,
        expected: usize,
        kind: MasterKeyKind,
        path: String,
    },

    #[error("The specified encrypted column encryption key's signature length: {actual} does not match the signature length: {expected} when using column master key ({}) in '{path}'. The encrypted column encryption key may be corrupt, or the specified {} may be incorrect.", kind.key_noun(), kind.path_noun())]
    KeySignatureLength {
        actual: usize,
        expected: usize,
        kind: MasterKeyKind,
        path: String,
    },

    #[error("The specified encrypted column encryption key signature does not match the signature computed with the column master key ({}) in '{path}'. The encrypted column encryption key may be corrupt, or the specified path may be incorrect.", kind.key_noun())]
    KeySignatureMismatch { kind: MasterKeyKind, path: String },

    #[error("Column master key path is too long to encode: {0} bytes")]
    KeyPathTooLong(usize),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("RSA key wrap failed: {0}")]
    WrapFailed(String),

    #[error("RSA key unwrap failed: {0}")]
    UnwrapFailed(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Invalid RSA key: {0}")]
    InvalidRsaKey(String),

    #[error("Random number generation failed: {0}")]
    RngFailed(String),
}

impl CryptoError {
    /// True for failures caused by corrupt or mismatched input rather than by
    /// the caller's configuration or the environment.
    pub fn is_integrity(&self) -> bool {
        !matches!(
            self,
            Self::InvalidEncryptionType(_)
                | Self::KeyPathTooLong(_)
                | Self::InvalidRsaKey(_)
                | Self::RngFailed(_)
                | Self::EncryptionFailed(_)
                | Self::WrapFailed(_)
                | Self::SigningFailed(_)
        )
    }
}
