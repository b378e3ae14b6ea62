//! AEAD_AES_256_CBC_HMAC_SHA256 cell encryption.
//!
//! Wire format:
//! [1 byte: version=1][32 bytes: HMAC-SHA256 tag][16 bytes: IV][N bytes: AES-256-CBC ciphertext]
//!
//! The tag covers `version || IV || ciphertext || version_size` where
//! `version_size` is the single byte `0x01`. Deterministic cells use
//! `HMAC-SHA256(iv_key, plaintext)[..16]` as IV, randomized cells a random IV.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::Mac;

use crate::derive::{derive_cell_keys, hmac_sha256, CellKeys, HmacSha256};
use crate::error::CryptoError;
use crate::types::{
    EncryptionType, AUTH_TAG_LENGTH, BLOCK_SIZE, CELL_FORMAT_VERSION, MIN_CELL_LENGTH,
};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Length of the version byte, fed into the tag after the ciphertext.
const VERSION_SIZE: [u8; 1] = [1];

/// Generate a random 16-byte CBC IV.
fn generate_iv() -> Result<[u8; BLOCK_SIZE], CryptoError> {
    let mut iv = [0u8; BLOCK_SIZE];
    getrandom::getrandom(&mut iv).map_err(|e| CryptoError::RngFailed(e.to_string()))?;
    Ok(iv)
}

/// Authenticated cell cipher bound to one column encryption key and one
/// encryption type.
#[derive(Debug)]
pub struct AeadCellCipher {
    keys: CellKeys,
    encryption_type: EncryptionType,
}

impl AeadCellCipher {
    /// Create a cipher from a 32-byte column encryption key.
    pub fn new(column_key: &[u8], encryption_type: EncryptionType) -> Result<Self, CryptoError> {
        Ok(Self {
            keys: derive_cell_keys(column_key)?,
            encryption_type,
        })
    }

    pub fn encryption_type(&self) -> EncryptionType {
        self.encryption_type
    }

    /// Encrypt a cell value.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let iv = match self.encryption_type {
            EncryptionType::Deterministic => {
                let digest = hmac_sha256(&self.keys.iv, &[plaintext])?;
                let mut iv = [0u8; BLOCK_SIZE];
                iv.copy_from_slice(&digest[..BLOCK_SIZE]);
                iv
            }
            EncryptionType::Randomized => generate_iv()?,
        };
        self.encrypt_with_iv(plaintext, &iv)
    }

    fn encrypt_with_iv(&self, plaintext: &[u8], iv: &[u8; BLOCK_SIZE]) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = Aes256CbcEnc::new_from_slices(&self.keys.encryption, iv)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let tag = self.compute_tag(iv, &ciphertext)?;

        let mut cell = Vec::with_capacity(1 + AUTH_TAG_LENGTH + BLOCK_SIZE + ciphertext.len());
        cell.push(CELL_FORMAT_VERSION);
        cell.extend_from_slice(&tag);
        cell.extend_from_slice(iv);
        cell.extend_from_slice(&ciphertext);
        Ok(cell)
    }

    /// Decrypt a cell value. The IV travels in the cell, so one cipher can
    /// decrypt cells of either encryption type.
    pub fn decrypt(&self, cell: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if cell.len() < MIN_CELL_LENGTH {
            return Err(CryptoError::CellTooShort {
                got: cell.len(),
                minimum: MIN_CELL_LENGTH,
            });
        }
        if cell[0] != CELL_FORMAT_VERSION {
            return Err(CryptoError::UnsupportedCellVersion {
                actual: cell[0],
                expected: CELL_FORMAT_VERSION,
            });
        }

        let tag = &cell[1..1 + AUTH_TAG_LENGTH];
        let iv = &cell[1 + AUTH_TAG_LENGTH..1 + AUTH_TAG_LENGTH + BLOCK_SIZE];
        let ciphertext = &cell[1 + AUTH_TAG_LENGTH + BLOCK_SIZE..];

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.keys.mac)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;
        mac.update(&[CELL_FORMAT_VERSION]);
        mac.update(iv);
        mac.update(ciphertext);
        mac.update(&VERSION_SIZE);
        mac.verify_slice(tag)
            .map_err(|_| CryptoError::InvalidAuthenticationTag)?;

        if ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(CryptoError::DecryptionFailed(format!(
                "ciphertext length {} is not a multiple of the block size",
                ciphertext.len()
            )));
        }

        Aes256CbcDec::new_from_slices(&self.keys.encryption, iv)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed("invalid padding".into()))
    }

    fn compute_tag(&self, iv: &[u8], ciphertext: &[u8]) -> Result<[u8; AUTH_TAG_LENGTH], CryptoError> {
        hmac_sha256(
            &self.keys.mac,
            &[&[CELL_FORMAT_VERSION], iv, ciphertext, &VERSION_SIZE],
        )
    }
}
