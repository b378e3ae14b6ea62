//! Cryptographic service provider (`MSSQL_CSP_PROVIDER`).
//!
//! Master key paths look like `<CSP Provider Name>/<Key Identifier>`. Keys live
//! in named key containers of an in-process [`KeyContainerStore`].

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
    KeyStoreProvider, MSSQL_CSP_PROVIDER,
};
use crate::error::{with_internal_prefix, Error, Result};

/// CSP registered in every new [`KeyContainerStore`].
pub const DEFAULT_CSP_NAME: &str = "Microsoft Enhanced RSA and AES Cryptographic Provider";

const PATH_FORMAT: &str = "Use the following format for a key stored in a Microsoft cryptographic service provider (CSP): <CSP Provider Name>/<Key Identifier>.";

/// Named CSPs, each holding named key containers.
#[derive(Debug)]
pub struct KeyContainerStore {
    /// lowercased CSP name → (key identifier → key)
    providers: RwLock<HashMap<String, HashMap<String, Arc<RsaMasterKey>>>>,
}

impl Default for KeyContainerStore {
    fn default() -> Self {
        let store = Self {
            providers: RwLock::new(HashMap::new()),
        };
        store.install_csp(DEFAULT_CSP_NAME);
        store
    }
}

impl KeyContainerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a CSP name known. Idempotent.
    pub fn install_csp(&self, csp_name: &str) {
        self.providers
            .write()
            .entry(csp_name.to_lowercase())
            .or_default();
    }

    /// Store a key in a container, installing the CSP if needed. Returns the
    /// master key path that locates it.
    pub fn import(&self, csp_name: &str, key_identifier: &str, key: RsaMasterKey) -> String {
        self.providers
            .write()
            .entry(csp_name.to_lowercase())
            .or_default()
            .insert(key_identifier.to_string(), Arc::new(key));
        format!("{}/{}", csp_name, key_identifier)
    }

    pub fn remove(&self, csp_name: &str, key_identifier: &str) -> bool {
        self.providers
            .write()
            .get_mut(&csp_name.to_lowercase())
            .is_some_and(|containers| containers.remove(key_identifier).is_some())
    }

    fn lookup(&self, csp_name: &str, key_identifier: &str) -> Option<Option<Arc<RsaMasterKey>>> {
        self.providers
            .read()
            .get(&csp_name.to_lowercase())
            .map(|containers| containers.get(key_identifier).cloned())
    }
}

fn invalid_path(message: String, system_op: bool) -> Error {
    Error::invalid_argument("masterKeyPath", with_internal_prefix(&message, system_op))
}

/// Split a CSP path into provider name and key identifier.
fn parse_csp_path(path: &str, system_op: bool) -> Result<(&str, &str)> {
    if path.is_empty() {
        return Err(Error::null_argument(
            "masterKeyPath",
            &format!("Column master key path cannot be null. {}", PATH_FORMAT),
            system_op,
        ));
    }
    let Some((csp_name, key_identifier)) = path.split_once('/') else {
        return Err(invalid_path(
            format!("Invalid column master key path: '{}'. {}", path, PATH_FORMAT),
            system_op,
        ));
    };
    if csp_name.trim().is_empty() {
        return Err(invalid_path(
            format!(
                "Empty Microsoft cryptographic service provider (CSP) name specified in column master key path: '{}'. {}",
                path, PATH_FORMAT
            ),
            system_op,
        ));
    }
    if key_identifier.trim().is_empty() {
        return Err(invalid_path(
            format!(
                "Empty key identifier specified in column master key path: '{}'. {}",
                path, PATH_FORMAT
            ),
            system_op,
        ));
    }
    Ok((csp_name, key_identifier))
}

pub struct CspProvider {
    store: Arc<KeyContainerStore>,
}

impl CspProvider {
    pub fn new(store: Arc<KeyContainerStore>) -> Self {
        Self { store }
    }

    fn key_for_path(&self, path: &str, system_op: bool) -> Result<Arc<RsaMasterKey>> {
        let (csp_name, key_identifier) = parse_csp_path(path, system_op)?;
        match self.store.lookup(csp_name, key_identifier) {
            None => Err(invalid_path(
                format!(
                    "Invalid Microsoft cryptographic service provider (CSP) name: '{}'. Verify that the CSP provider name in column master key path: '{}' is valid and installed on the machine.",
                    csp_name, path
                ),
                system_op,
            )),
            Some(None) => Err(invalid_path(
                format!(
                    "Key container '{}' does not exist in Microsoft cryptographic service provider (CSP) '{}'. Verify the column master key path: '{}'.",
                    key_identifier, csp_name, path
                ),
                system_op,
            )),
            Some(Some(key)) => Ok(key),
        }
    }
}

#[async_trait]
impl KeyStoreProvider for CspProvider {
    async fn encrypt_column_encryption_key(
        &self,
        master_key_path: &str,
        algorithm: &str,
        column_key: &[u8],
    ) -> Result<Vec<u8>> {
        parse_csp_path(master_key_path, false)?;
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
        parse_csp_path(master_key_path, true)?;
        validate_encrypted_key(encrypted_key)?;
        validate_algorithm(algorithm, true)?;
        let key = self.key_for_path(master_key_path, true)?;
        Ok(open_column_key(
            &key,
            master_key_path,
            encrypted_key,
            MasterKeyKind::AsymmetricKey,
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
            MSSQL_CSP_PROVIDER,
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
            MSSQL_CSP_PROVIDER,
            master_key_path,
            allow_enclave_computations,
            signature,
        ))
    }
}
