use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

/// Cell encryption algorithm implemented by [`crate::AeadCellCipher`].
pub const AEAD_AES_256_CBC_HMAC_SHA256: &str = "AEAD_AES_256_CBC_HMAC_SHA256";

/// Wire format version byte for encrypted cells.
///
/// Format: [version=1:1B][auth tag:32B][IV:16B][AES-256-CBC ciphertext]
pub const CELL_FORMAT_VERSION: u8 = 0x01;

/// Wire format version byte for encrypted column encryption keys.
///
/// Format: [version=1:1B][path len:2B LE][ciphertext len:2B LE][path UTF-16LE][ciphertext][signature]
pub const COLUMN_KEY_FORMAT_VERSION: u8 = 0x01;

/// Column encryption key length in bytes (256 bits).
pub const COLUMN_KEY_LENGTH: usize = 32;

/// AES block size, also the CBC IV length.
pub const BLOCK_SIZE: usize = 16;

/// HMAC-SHA256 authentication tag length.
pub const AUTH_TAG_LENGTH: usize = 32;

/// Smallest valid cell: version + tag + IV + one padded block.
pub const MIN_CELL_LENGTH: usize = 1 + AUTH_TAG_LENGTH + BLOCK_SIZE + BLOCK_SIZE;

/// Key encryption algorithm accepted by key store providers.
pub const RSA_OAEP: &str = "RSA_OAEP";

/// Alternate spelling of [`RSA_OAEP`] used by key vault clients.
pub const RSA_OAEP_ALT: &str = "RSA-OAEP";

/// How a column is encrypted.
///
/// Deterministic encryption derives the IV from the plaintext so equal values
/// produce equal ciphertext. Randomized encryption draws a fresh IV per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncryptionType {
    Deterministic,
    Randomized,
}

impl EncryptionType {
    /// Decode the encryption type byte sent by the server (1 or 2).
    pub fn from_wire(value: u8) -> Result<Self, CryptoError> {
        match value {
            1 => Ok(Self::Deterministic),
            2 => Ok(Self::Randomized),
            other => Err(CryptoError::InvalidEncryptionType(other)),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Deterministic => 1,
            Self::Randomized => 2,
        }
    }
}

impl fmt::Display for EncryptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deterministic => f.write_str("Deterministic"),
            Self::Randomized => f.write_str("Randomized"),
        }
    }
}

/// The kind of column master key a provider holds. Only affects error wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterKeyKind {
    /// A certificate in a certificate store.
    Certificate,
    /// An RSA key in a cryptographic service provider key container.
    AsymmetricKey,
    /// A key held by a cloud key vault.
    KeyVaultKey,
}

impl MasterKeyKind {
    /// Noun used for the key itself, e.g. "column master key (certificate)".
    pub fn key_noun(self) -> &'static str {
        match self {
            Self::Certificate => "certificate",
            Self::AsymmetricKey => "asymmetric key",
            Self::KeyVaultKey => "Azure Key Vault key",
        }
    }

    /// Noun used for the path that locates the key.
    pub fn path_noun(self) -> &'static str {
        match self {
            Self::Certificate => "certificate path",
            Self::AsymmetricKey => "Microsoft cryptographic service provider (CSP) path",
            Self::KeyVaultKey => "Azure Key Vault key path",
        }
    }
}

/// Encode a string as UTF-16 little-endian bytes.
pub fn utf16le(value: &str) -> Vec<u8> {
    value.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect()
}
