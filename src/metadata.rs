//! Encryption metadata returned by the server.
//!
//! A describe call yields a table of column encryption keys and, for each
//! parameter that must be encrypted, the key ordinal and cell algorithm to use.
//! Result sets carry the same key table for their encrypted columns.

use std::collections::HashSet;

use colcrypt_crypto::{EncryptionType, AEAD_AES_256_CBC_HMAC_SHA256};

use crate::cache::ColumnKeyId;
use crate::error::{Error, Result};

/// One encrypted copy of a column encryption key. Keys being rotated carry
/// one value per column master key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnKeyValue {
    pub encrypted_key: Vec<u8>,
    pub key_store_provider: String,
    pub master_key_path: String,
    /// Key encryption algorithm, e.g. `RSA_OAEP`.
    pub algorithm: String,
    /// Signature over the column master key metadata, when the server has one.
    pub master_key_signature: Option<Vec<u8>>,
    pub allow_enclave_computations: bool,
}

impl ColumnKeyValue {
    pub fn key_id(&self) -> ColumnKeyId {
        ColumnKeyId {
            master_key_path: self.master_key_path.clone(),
            encrypted_key: self.encrypted_key.clone(),
            algorithm: self.algorithm.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnKeyEntry {
    /// Position referenced by [`CipherInfo::key_ordinal`].
    pub ordinal: u16,
    pub database_id: u32,
    pub key_id: u32,
    pub key_version: u32,
    pub values: Vec<ColumnKeyValue>,
}

/// How one column or parameter is encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherInfo {
    pub key_ordinal: u16,
    pub algorithm_name: String,
    pub encryption_type: EncryptionType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterCipherInfo {
    /// Parameter name as the server reports it, e.g. `@ssn`.
    pub parameter_name: String,
    pub cipher: CipherInfo,
}

/// Result of describing a statement's parameter encryption.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescribeResult {
    pub keys: Vec<ColumnKeyEntry>,
    pub parameters: Vec<ParameterCipherInfo>,
}

impl DescribeResult {
    /// Check that every parameter references a key in the table and that
    /// ordinals are unique and carry at least one value.
    pub fn validate(&self) -> Result<()> {
        let mut ordinals = HashSet::new();
        for entry in &self.keys {
            if !ordinals.insert(entry.ordinal) {
                return Err(Error::InvalidMetadata(format!(
                    "duplicate column encryption key ordinal {}",
                    entry.ordinal
                )));
            }
            if entry.values.is_empty() {
                return Err(Error::InvalidMetadata(format!(
                    "column encryption key {} has no encrypted values",
                    entry.ordinal
                )));
            }
        }
        for parameter in &self.parameters {
            if !ordinals.contains(&parameter.cipher.key_ordinal) {
                return Err(Error::InvalidMetadata(format!(
                    "parameter '{}' references unknown column encryption key {}",
                    parameter.parameter_name, parameter.cipher.key_ordinal
                )));
            }
        }
        Ok(())
    }
}

/// Look up a key table entry by ordinal.
pub(crate) fn key_entry(keys: &[ColumnKeyEntry], ordinal: u16) -> Result<&ColumnKeyEntry> {
    keys.iter().find(|k| k.ordinal == ordinal).ok_or_else(|| {
        Error::InvalidMetadata(format!("unknown column encryption key ordinal {}", ordinal))
    })
}

/// Only one cell algorithm exists; anything else is corrupt metadata.
pub(crate) fn validate_cell_algorithm(name: &str) -> Result<()> {
    if name != AEAD_AES_256_CBC_HMAC_SHA256 {
        return Err(Error::UnknownCellAlgorithm {
            algorithm: name.to_string(),
        });
    }
    Ok(())
}
