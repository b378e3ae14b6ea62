//! Shared fixtures: test keys, sealed key values and a scripted transport.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use colcrypt::crypto::AEAD_AES_256_CBC_HMAC_SHA256;
use colcrypt::{
    CipherInfo, ColumnKeyEntry, ColumnKeyValue, CommandTransport, DescribeRequest, DescribeResult,
    EncryptionType, ExecuteRequest, KeyStoreProvider, ParameterCipherInfo, ResultColumn, ResultSet,
    RpcHandle, RsaMasterKey, TransportError,
};
use tokio::sync::Notify;

pub const SERVER: &str = "sql01.contoso.test";
pub const VAULT_URL: &str = "https://colcrypt-it.vault.azure.net/keys/CMK1/8c1a2d9e";
pub const STATEMENT: &str = "INSERT INTO Patients (SSN, Name) VALUES (@ssn, @name)";

pub fn key_a() -> RsaMasterKey {
    RsaMasterKey::from_pkcs8_pem(include_str!("../../testdata/rsa_2048_a.pem")).unwrap()
}

pub fn key_b() -> RsaMasterKey {
    RsaMasterKey::from_pkcs8_pem(include_str!("../../testdata/rsa_2048_b.pem")).unwrap()
}

/// The column encryption key `[1..32]`.
pub fn cek() -> Vec<u8> {
    (1..=32).collect()
}

/// Encrypt `cek()` with `provider` and describe it as a key table value.
pub async fn sealed_value(
    provider: &dyn KeyStoreProvider,
    provider_name: &str,
    master_key_path: &str,
) -> ColumnKeyValue {
    let encrypted_key = provider
        .encrypt_column_encryption_key(master_key_path, "RSA_OAEP", &cek())
        .await
        .unwrap();
    ColumnKeyValue {
        encrypted_key,
        key_store_provider: provider_name.to_string(),
        master_key_path: master_key_path.to_string(),
        algorithm: "RSA_OAEP".to_string(),
        master_key_signature: None,
        allow_enclave_computations: false,
    }
}

/// Describe result encrypting `@ssn` with key ordinal 1.
pub fn describe_ssn(value: ColumnKeyValue, encryption_type: EncryptionType) -> DescribeResult {
    DescribeResult {
        keys: vec![ColumnKeyEntry {
            ordinal: 1,
            database_id: 5,
            key_id: 1,
            key_version: 1,
            values: vec![value],
        }],
        parameters: vec![ParameterCipherInfo {
            parameter_name: "@ssn".to_string(),
            cipher: CipherInfo {
                key_ordinal: 1,
                algorithm_name: AEAD_AES_256_CBC_HMAC_SHA256.to_string(),
                encryption_type,
            },
        }],
    }
}

pub fn params() -> Vec<colcrypt::Parameter> {
    vec![
        colcrypt::Parameter::new("@ssn", b"795-73-9838".to_vec()),
        colcrypt::Parameter::new("@name", b"Catherine Abel".to_vec()),
    ]
}

// ============================================================================
// ScriptedTransport
// ============================================================================

/// Transport that answers describe calls from a fixed result and echoes bound
/// parameters back as a single result row, the way a table round trip would.
pub struct ScriptedTransport {
    server: String,
    describe: Mutex<DescribeResult>,
    supports_encryption: AtomicBool,
    next_handle: AtomicU64,
    pub describe_calls: AtomicUsize,
    pub executed: Mutex<Vec<ExecuteRequest>>,
    /// While set, `read_describe` parks until `release` is notified.
    pub hold_describe: AtomicBool,
    pub describe_entered: Notify,
    pub release: Notify,
}

impl ScriptedTransport {
    pub fn new(describe: DescribeResult) -> Self {
        Self {
            server: SERVER.to_string(),
            describe: Mutex::new(describe),
            supports_encryption: AtomicBool::new(true),
            next_handle: AtomicU64::new(1),
            describe_calls: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
            hold_describe: AtomicBool::new(false),
            describe_entered: Notify::new(),
            release: Notify::new(),
        }
    }

    pub fn set_supports_encryption(&self, supported: bool) {
        self.supports_encryption.store(supported, Ordering::SeqCst);
    }

    pub fn describe_count(&self) -> usize {
        self.describe_calls.load(Ordering::SeqCst)
    }

    pub fn last_executed(&self) -> ExecuteRequest {
        self.executed.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl CommandTransport for ScriptedTransport {
    fn server(&self) -> &str {
        &self.server
    }

    fn supports_column_encryption(&self) -> bool {
        self.supports_encryption.load(Ordering::SeqCst)
    }

    async fn send_describe(&self, _request: DescribeRequest) -> Result<RpcHandle, TransportError> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(RpcHandle(self.next_handle.fetch_add(1, Ordering::SeqCst)))
    }

    async fn read_describe(&self, _handle: RpcHandle) -> Result<DescribeResult, TransportError> {
        if self.hold_describe.load(Ordering::SeqCst) {
            self.describe_entered.notify_one();
            self.release.notified().await;
        }
        Ok(self.describe.lock().unwrap().clone())
    }

    async fn execute(&self, request: ExecuteRequest) -> Result<ResultSet, TransportError> {
        let describe = self.describe.lock().unwrap().clone();
        let columns = request
            .parameters
            .iter()
            .map(|p| ResultColumn {
                name: p.name.clone(),
                cipher: describe
                    .parameters
                    .iter()
                    .find(|d| p.encrypted && d.parameter_name.eq_ignore_ascii_case(&p.name))
                    .map(|d| d.cipher.clone()),
            })
            .collect();
        let row = request.parameters.iter().map(|p| p.value.clone()).collect();
        self.executed.lock().unwrap().push(request);
        Ok(ResultSet {
            columns,
            keys: describe.keys,
            rows: vec![row],
        })
    }
}
