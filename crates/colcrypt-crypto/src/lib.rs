pub mod aead;
pub mod column_key;
pub mod derive;
pub mod error;
pub mod master_key;
pub mod metadata;
pub mod types;

pub use aead::AeadCellCipher;
pub use column_key::{
    encode_unsigned, open_column_key, parse_envelope, seal_column_key, unsigned_digest,
    ColumnKeyEnvelope,
};
pub use derive::{derive_cell_keys, CellKeys};
pub use error::CryptoError;
pub use master_key::RsaMasterKey;
pub use metadata::{
    master_key_metadata_digest, sign_master_key_metadata, verify_master_key_metadata,
};
pub use types::{
    utf16le, EncryptionType, MasterKeyKind, AEAD_AES_256_CBC_HMAC_SHA256, COLUMN_KEY_LENGTH,
    RSA_OAEP, RSA_OAEP_ALT,
};
