//! Encrypted column encryption key envelope.
//!
//! Wire format (all providers share it, so a key sealed by one provider can be
//! opened by any other holding the same RSA key):
//!
//! ```text
//! [version=1:1B][path len:2B LE][ciphertext len:2B LE]
//! [lowercased master key path:UTF-16LE][RSA-OAEP ciphertext][signature]
//! ```
//!
//! The signature is RSA PKCS#1 v1.5 over SHA-256 of everything before it.
//! Ciphertext and signature are both exactly the RSA modulus size.

use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::master_key::{sha256, RsaMasterKey};
use crate::types::{utf16le, MasterKeyKind, COLUMN_KEY_FORMAT_VERSION};

/// Fixed header length: version + two u16 lengths.
pub const ENVELOPE_HEADER_LENGTH: usize = 5;

/// A validated view into an encrypted column encryption key.
#[derive(Debug, Clone, Copy)]
pub struct ColumnKeyEnvelope<'a> {
    /// UTF-16LE master key path as recorded when the key was sealed.
    pub key_path: &'a [u8],
    pub ciphertext: &'a [u8],
    pub signature: &'a [u8],
    signed: &'a [u8],
}

impl ColumnKeyEnvelope<'_> {
    /// SHA-256 of the signed region (header, path and ciphertext).
    pub fn digest(&self) -> [u8; 32] {
        sha256(self.signed)
    }
}

/// Build the signed region of an envelope: header, lowercased path, ciphertext.
pub fn encode_unsigned(master_key_path: &str, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let path = utf16le(&master_key_path.to_lowercase());
    let path_len = u16::try_from(path.len()).map_err(|_| CryptoError::KeyPathTooLong(path.len()))?;
    let cipher_len = u16::try_from(ciphertext.len())
        .map_err(|_| CryptoError::WrapFailed(format!("ciphertext of {} bytes", ciphertext.len())))?;

    let mut out = Vec::with_capacity(ENVELOPE_HEADER_LENGTH + path.len() + ciphertext.len());
    out.push(COLUMN_KEY_FORMAT_VERSION);
    out.extend_from_slice(&path_len.to_le_bytes());
    out.extend_from_slice(&cipher_len.to_le_bytes());
    out.extend_from_slice(&path);
    out.extend_from_slice(ciphertext);
    Ok(out)
}

/// SHA-256 digest that the envelope signature covers.
pub fn unsigned_digest(unsigned: &[u8]) -> [u8; 32] {
    sha256(unsigned)
}

/// Validate the structure of an encrypted key against the expected RSA key size.
///
/// Checks run in order: version byte, ciphertext length, signature length.
/// The signature itself is not verified here.
pub fn parse_envelope<'a>(
    encrypted: &'a [u8],
    key_size: usize,
    kind: MasterKeyKind,
    master_key_path: &str,
) -> Result<ColumnKeyEnvelope<'a>, CryptoError> {
    if let Some(&version) = encrypted.first() {
        if version != COLUMN_KEY_FORMAT_VERSION {
            return Err(CryptoError::UnsupportedKeyVersion {
                actual: version,
                expected: COLUMN_KEY_FORMAT_VERSION,
            });
        }
    }

    if encrypted.len() < ENVELOPE_HEADER_LENGTH {
        return Err(CryptoError::KeyCiphertextLength {
            actual: 0,
            expected: key_size,
            kind,
            path: master_key_path.to_string(),
        });
    }

    let path_len = u16::from_le_bytes([encrypted[1], encrypted[2]]) as usize;
    let cipher_len = u16::from_le_bytes([encrypted[3], encrypted[4]]) as usize;
    if cipher_len != key_size {
        return Err(CryptoError::KeyCiphertextLength {
            actual: cipher_len,
            expected: key_size,
            kind,
            path: master_key_path.to_string(),
        });
    }

    let signed_len = ENVELOPE_HEADER_LENGTH + path_len + cipher_len;
    let signature_len = encrypted.len().saturating_sub(signed_len);
    if signature_len != key_size {
        return Err(CryptoError::KeySignatureLength {
            actual: signature_len,
            expected: key_size,
            kind,
            path: master_key_path.to_string(),
        });
    }

    let path_end = ENVELOPE_HEADER_LENGTH + path_len;
    Ok(ColumnKeyEnvelope {
        key_path: &encrypted[ENVELOPE_HEADER_LENGTH..path_end],
        ciphertext: &encrypted[path_end..signed_len],
        signature: &encrypted[signed_len..],
        signed: &encrypted[..signed_len],
    })
}

/// Wrap and sign a column encryption key with a local RSA master key.
pub fn seal_column_key(
    master_key: &RsaMasterKey,
    master_key_path: &str,
    column_key: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let ciphertext = master_key.wrap_key(column_key)?;
    let mut envelope = encode_unsigned(master_key_path, &ciphertext)?;
    let signature = master_key.sign_digest(&unsigned_digest(&envelope))?;
    envelope.extend_from_slice(&signature);
    Ok(envelope)
}

/// Validate, verify and unwrap an encrypted column encryption key.
pub fn open_column_key(
    master_key: &RsaMasterKey,
    master_key_path: &str,
    encrypted: &[u8],
    kind: MasterKeyKind,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let envelope = parse_envelope(encrypted, master_key.key_size(), kind, master_key_path)?;
    if !master_key.verify_digest(&envelope.digest(), envelope.signature) {
        return Err(CryptoError::KeySignatureMismatch {
            kind,
            path: master_key_path.to_string(),
        });
    }
    master_key.unwrap_key(envelope.ciphertext)
}
