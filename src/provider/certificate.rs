//! Certificate store provider (`MSSQL_CERTIFICATE_STORE`).
//!
//! Master key paths look like `[LocalMachine|CurrentUser]/My/<thumbprint>`.
//! The location may be omitted (defaults to `LocalMachine`), and so may the
//! store. Keys live in an in-process [`CertificateStore`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use colcrypt_crypto::{
    open_column_key, seal_column_key, sign_master_key_metadata, verify_master_key_metadata,
    MasterKeyKind, RsaMasterKey,
};
use parking_lot::RwLock;
use zeroize::Zeroizing;

use super::{
    validate_algorithm, validate_column_key, validate_encrypted_key, validate_signature,
    KeyStoreProvider, MSSQL_CERTIFICATE_STORE,
};
use crate::error::{with_internal_prefix, Error, Result};

const PATH_FORMAT: &str = "Use the following format: <certificate location>/<certificate store>/<certificate thumbprint>, where <certificate location> is either 'LocalMachine' or 'CurrentUser'.";

/// Paths of this many UTF-16 code units or more are rejected.
pub const MAX_CERTIFICATE_PATH_LENGTH: usize = i16::MAX as usize;

/// The only certificate store searched.
pub const CERTIFICATE_STORE_NAME: &str = "My";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreLocation {
    CurrentUser,
    LocalMachine,
}

impl StoreLocation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CurrentUser => "CurrentUser",
            Self::LocalMachine => "LocalMachine",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("CurrentUser") {
            Some(Self::CurrentUser)
        } else if value.eq_ignore_ascii_case("LocalMachine") {
            Some(Self::LocalMachine)
        } else {
            None
        }
    }
}

// ============================================================================
// CertificateStore
// ============================================================================

/// In-process certificate store keyed by location and thumbprint.
#[derive(Debug, Default)]
pub struct CertificateStore {
    /// (location, uppercase thumbprint) → key
    certificates: RwLock<HashMap<(StoreLocation, String), Arc<RsaMasterKey>>>,
}

impl CertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Import a key into `location/My` under its thumbprint. Returns the master
    /// key path that locates it.
    pub fn import(&self, location: StoreLocation, key: RsaMasterKey) -> Result<String> {
        let thumbprint = key.thumbprint()?;
        let path = format!("{}/{}/{}", location.as_str(), CERTIFICATE_STORE_NAME, thumbprint);
        self.certificates
            .write()
            .insert((location, thumbprint), Arc::new(key));
        Ok(path)
    }

    pub fn remove(&self, location: StoreLocation, thumbprint: &str) -> bool {
        self.certificates
            .write()
            .remove(&(location, thumbprint.to_uppercase()))
            .is_some()
    }

    fn find(&self, location: StoreLocation, thumbprint: &str) -> Option<Arc<RsaMasterKey>> {
        self.certificates
            .read()
            .get(&(location, thumbprint.to_uppercase()))
            .cloned()
    }
}

// ============================================================================
// Path parsing
// ============================================================================

fn invalid_path(message: String, system_op: bool) -> Error {
    Error::invalid_argument("masterKeyPath", with_internal_prefix(&message, system_op))
}

/// Split a certificate path into location and thumbprint.
fn parse_certificate_path(path: &str, system_op: bool) -> Result<(StoreLocation, String)> {
    if path.is_empty() {
        return Err(Error::null_argument(
            "masterKeyPath",
            &format!("Certificate path cannot be null. {}", PATH_FORMAT),
            system_op,
        ));
    }
    let length = path.encode_utf16().count();
    if length >= MAX_CERTIFICATE_PATH_LENGTH {
        return Err(invalid_path(
            format!(
                "Specified certificate path has {} bytes, which exceeds maximum length of {} bytes.",
                length, MAX_CERTIFICATE_PATH_LENGTH
            ),
            system_op,
        ));
    }
    if path.trim().is_empty() {
        return Err(invalid_path(
            format!("Invalid certificate path: '{}'. {}", path, PATH_FORMAT),
            system_op,
        ));
    }

    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() > 3 {
        return Err(invalid_path(
            format!("Invalid certificate path: '{}'. {}", path, PATH_FORMAT),
            system_op,
        ));
    }

    let location = if parts.len() == 3 {
        StoreLocation::parse(parts[0]).ok_or_else(|| {
            invalid_path(
                format!(
                    "Invalid certificate location '{}' in certificate path '{}'. {}",
                    parts[0], path, PATH_FORMAT
                ),
                system_op,
            )
        })?
    } else {
        StoreLocation::LocalMachine
    };

    if parts.len() >= 2 {
        let store = parts[parts.len() - 2];
        if !store.eq_ignore_ascii_case(CERTIFICATE_STORE_NAME) {
            return Err(invalid_path(
                format!(
                    "Invalid certificate store '{}' specified in certificate path '{}'. Expected value: '{}'.",
                    store, path, CERTIFICATE_STORE_NAME
                ),
                system_op,
            ));
        }
    }

    let thumbprint = parts[parts.len() - 1];
    if thumbprint.trim().is_empty() {
        return Err(invalid_path(
            format!("Empty certificate thumbprint specified in certificate path '{}'.", path),
            system_op,
        ));
    }

    Ok((location, thumbprint.to_string()))
}

// ============================================================================
// CertificateStoreProvider
// ============================================================================

pub struct CertificateStoreProvider {
    store: Arc<CertificateStore>,
}

impl CertificateStoreProvider {
    pub fn new(store: Arc<CertificateStore>) -> Self {
        Self { store }
    }

    fn key_for_path(&self, path: &str, system_op: bool) -> Result<Arc<RsaMasterKey>> {
        let (location, thumbprint) = parse_certificate_path(path, system_op)?;
        self.store.find(location, &thumbprint).ok_or_else(|| {
            invalid_path(
                format!(
                    "Certificate with thumbprint '{}' not found in certificate store '{}' in certificate location '{}'. Verify the certificate path in the column master key definition in the database is correct, and the certificate has been imported correctly into the certificate location/store.",
                    thumbprint,
                    CERTIFICATE_STORE_NAME,
                    location.as_str()
                ),
                system_op,
            )
        })
    }
}

#[async_trait]
impl KeyStoreProvider for CertificateStoreProvider {
    async fn encrypt_column_encryption_key(
        &self,
        master_key_path: &str,
        algorithm: &str,
        column_key: &[u8],
    ) -> Result<Vec<u8>> {
        parse_certificate_path(master_key_path, false)?;
        validate_column_key(column_key)?;
        validate_algorithm(algorithm, false)?;
        let key = self.key_for_path(master_key_path, false)?;
        Ok(seal_column_key(&key, master_key_path, column_key)?)
    }

    async fn decrypt_column_encryption_key(
        &self,
        master_key_path: &str,
        algorithm: &str,
        encrypted_key: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        parse_certificate_path(master_key_path, true)?;
        validate_encrypted_key(encrypted_key)?;
        validate_algorithm(algorithm, true)?;
        let key = self.key_for_path(master_key_path, true)?;
        Ok(open_column_key(
            &key,
            master_key_path,
            encrypted_key,
            MasterKeyKind::Certificate,
        )?)
    }

    async fn sign_column_master_key_metadata(
        &self,
        master_key_path: &str,
        allow_enclave_computations: bool,
    ) -> Result<Vec<u8>> {
        let key = self.key_for_path(master_key_path, false)?;
        Ok(sign_master_key_metadata(
            &key,
            MSSQL_CERTIFICATE_STORE,
            master_key_path,
            allow_enclave_computations,
        )?)
    }

    async fn verify_column_master_key_metadata(
        &self,
        master_key_path: &str,
        allow_enclave_computations: bool,
        signature: &[u8],
    ) -> Result<bool> {
        validate_signature(signature)?;
        let key = self.key_for_path(master_key_path, false)?;
        Ok(verify_master_key_metadata(
            &key,
            MSSQL_CERTIFICATE_STORE,
            master_key_path,
            allow_enclave_computations,
            signature,
        ))
    }
}
