//! Cell sub-key derivation.
//!
//! The root column encryption key never touches data directly. Three sub-keys
//! are derived from it with HMAC-SHA256 over a UTF-16LE label:
//! `Microsoft SQL Server cell {encryption|MAC|IV} key with encryption
//! algorithm:AEAD_AES_256_CBC_HMAC_SHA256 and key length:256`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::types::{utf16le, AEAD_AES_256_CBC_HMAC_SHA256, COLUMN_KEY_LENGTH};

pub(crate) type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 over the concatenation of `parts`.
pub(crate) fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32], CryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| CryptoError::EncryptionFailed(format!("HMAC init failed: {}", e)))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

fn label(kind: &str) -> Vec<u8> {
    utf16le(&format!(
        "Microsoft SQL Server cell {} key with encryption algorithm:{} and key length:256",
        kind, AEAD_AES_256_CBC_HMAC_SHA256
    ))
}

/// The three sub-keys derived from a column encryption key.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct CellKeys {
    pub(crate) encryption: [u8; COLUMN_KEY_LENGTH],
    pub(crate) mac: [u8; COLUMN_KEY_LENGTH],
    pub(crate) iv: [u8; COLUMN_KEY_LENGTH],
}

impl std::fmt::Debug for CellKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CellKeys([REDACTED])")
    }
}

/// Derive the encryption, MAC and IV sub-keys from a 32-byte root key.
pub fn derive_cell_keys(root_key: &[u8]) -> Result<CellKeys, CryptoError> {
    if root_key.len() != COLUMN_KEY_LENGTH {
        return Err(CryptoError::InvalidKeyLength {
            expected: COLUMN_KEY_LENGTH,
            got: root_key.len(),
        });
    }
    Ok(CellKeys {
        encryption: hmac_sha256(root_key, &[&label("encryption")])?,
        mac: hmac_sha256(root_key, &[&label("MAC")])?,
        iv: hmac_sha256(root_key, &[&label("IV")])?,
    })
}
