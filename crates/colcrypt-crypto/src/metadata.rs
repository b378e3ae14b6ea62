//! Column master key metadata signatures.
//!
//! The signed message is the UTF-16LE encoding of
//! `lowercase(provider_name + master_key_path + "true"|"false")`, hashed with
//! SHA-256 and signed with RSA PKCS#1 v1.5. It binds the enclave flag to the key
//! so a flipped `allow_enclave_computations` is detected.

use crate::error::CryptoError;
use crate::master_key::{sha256, RsaMasterKey};
use crate::types::utf16le;

/// Digest covered by a column master key metadata signature.
pub fn master_key_metadata_digest(
    provider_name: &str,
    master_key_path: &str,
    allow_enclave_computations: bool,
) -> [u8; 32] {
    let message = format!(
        "{}{}{}",
        provider_name, master_key_path, allow_enclave_computations
    )
    .to_lowercase();
    sha256(&utf16le(&message))
}

pub fn sign_master_key_metadata(
    master_key: &RsaMasterKey,
    provider_name: &str,
    master_key_path: &str,
    allow_enclave_computations: bool,
) -> Result<Vec<u8>, CryptoError> {
    let digest = master_key_metadata_digest(provider_name, master_key_path, allow_enclave_computations);
    master_key.sign_digest(&digest)
}

pub fn verify_master_key_metadata(
    master_key: &RsaMasterKey,
    provider_name: &str,
    master_key_path: &str,
    allow_enclave_computations: bool,
    signature: &[u8],
) -> bool {
    let digest = master_key_metadata_digest(provider_name, master_key_path, allow_enclave_computations);
    master_key.verify_digest(&digest, signature)
}
