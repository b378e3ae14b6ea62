//! Encrypted command execution.
//!
//! [`EncryptedCommand::execute_with_encryption`] resolves parameter encryption,
//! encrypts the parameters that need it, runs the statement and decrypts the
//! encrypted columns of the result. One execution runs at a time per command.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use colcrypt_crypto::AeadCellCipher;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::ColumnKeyCache;
use crate::context::{ColumnEncryption, CommandScope};
use crate::error::{Error, Result};
use crate::metadata::{key_entry, validate_cell_algorithm};
use crate::provider::{KeyStoreProvider, ProviderRegistry};
use crate::resolver::{
    until_cancelled, ParameterEncryptionResolver, ResolvedParameters, ResolverDiagnostics,
};
use crate::transport::{BoundParameter, CommandTransport, ExecuteRequest, Parameter, ResultSet};

pub struct EncryptedCommand {
    id: Uuid,
    context: Arc<ColumnEncryption>,
    transport: Arc<dyn CommandTransport>,
    providers: RwLock<Option<ProviderRegistry>>,
    local_keys: ColumnKeyCache,
    resolver: ParameterEncryptionResolver,
    executing: AtomicBool,
    current_token: Mutex<Option<CancellationToken>>,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for EncryptedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedCommand")
            .field("id", &self.id)
            .field("server", &self.transport.server())
            .field("providers", &*self.providers.read())
            .field("state", &self.resolver.state())
            .finish()
    }
}

/// Clears the executing flag and current token when an execution ends,
/// however it ends.
struct ExecutionGuard<'a> {
    command: &'a EncryptedCommand,
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        self.command.current_token.lock().take();
        self.command.executing.store(false, Ordering::Release);
    }
}

impl EncryptedCommand {
    pub fn new(context: Arc<ColumnEncryption>, transport: Arc<dyn CommandTransport>) -> Self {
        Self {
            id: Uuid::new_v4(),
            local_keys: context.new_command_cache(),
            timeout: context.settings().command_timeout(),
            context,
            transport,
            providers: RwLock::new(None),
            resolver: ParameterEncryptionResolver::new(),
            executing: AtomicBool::new(false),
            current_token: Mutex::new(None),
        }
    }

    /// Override the execution timeout from the context settings.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Register providers for this command only. Once set, custom provider
    /// names resolve against these alone and keys go to the command's own cache.
    pub fn register_key_store_providers(
        &self,
        providers: HashMap<String, Arc<dyn KeyStoreProvider>>,
    ) -> Result<()> {
        let registry = ProviderRegistry::custom(providers)?;
        tracing::debug!(command = %self.id, providers = ?registry.names(), "registered command key store providers");
        *self.providers.write() = Some(registry);
        Ok(())
    }

    pub fn has_key_store_providers(&self) -> bool {
        self.providers.read().is_some()
    }

    pub fn local_key_cache(&self) -> &ColumnKeyCache {
        &self.local_keys
    }

    pub fn diagnostics(&self) -> &dyn ResolverDiagnostics {
        &self.resolver
    }

    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::Acquire)
    }

    /// True while an execution holds a cancellation token.
    pub fn has_cancellation_token(&self) -> bool {
        self.current_token.lock().is_some()
    }

    /// Cancel the running execution, if any. Safe to call repeatedly.
    pub fn cancel(&self) {
        if let Some(token) = self.current_token.lock().as_ref() {
            tracing::debug!(command = %self.id, "cancelling command");
            token.cancel();
        }
    }

    pub async fn execute_with_encryption(
        &self,
        statement: &str,
        parameters: Vec<Parameter>,
    ) -> Result<ResultSet> {
        self.execute_with_encryption_cancellable(statement, parameters, CancellationToken::new())
            .await
    }

    /// Like [`Self::execute_with_encryption`], also aborting when `token` is
    /// cancelled.
    pub async fn execute_with_encryption_cancellable(
        &self,
        statement: &str,
        parameters: Vec<Parameter>,
        token: CancellationToken,
    ) -> Result<ResultSet> {
        if self.executing.swap(true, Ordering::AcqRel) {
            return Err(Error::CommandBusy(self.id));
        }
        let _guard = ExecutionGuard { command: self };
        let token = token.child_token();
        *self.current_token.lock() = Some(token.clone());

        let run = self.run(statement, parameters, &token);
        match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, run).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::debug!(command = %self.id, ?timeout, "command timed out");
                    Err(Error::Timeout(timeout))
                }
            },
            None => run.await,
        }
    }

    async fn run(
        &self,
        statement: &str,
        parameters: Vec<Parameter>,
        token: &CancellationToken,
    ) -> Result<ResultSet> {
        let providers = self.providers.read().clone();
        let scope = CommandScope {
            providers: providers.as_ref(),
            cache: &self.local_keys,
        };

        let resolved = self
            .resolver
            .resolve(
                &self.context,
                self.transport.as_ref(),
                statement,
                &parameters,
                &scope,
                token,
            )
            .await?;

        let request = ExecuteRequest {
            statement: statement.to_string(),
            parameters: bind_parameters(parameters, &resolved)?,
        };
        let result = until_cancelled(token, async {
            self.transport.execute(request).await.map_err(Error::from)
        })
        .await?;

        until_cancelled(token, self.decrypt_result(result, &scope)).await
    }

    async fn decrypt_result(&self, mut result: ResultSet, scope: &CommandScope<'_>) -> Result<ResultSet> {
        let server = self.transport.server();
        let mut ciphers: Vec<(usize, AeadCellCipher)> = Vec::new();
        for (index, column) in result.columns.iter().enumerate() {
            let Some(cipher) = &column.cipher else {
                continue;
            };
            validate_cell_algorithm(&cipher.algorithm_name)?;
            let entry = key_entry(&result.keys, cipher.key_ordinal)?;
            let key = self.context.resolve_column_key(server, entry, scope).await?;
            ciphers.push((index, AeadCellCipher::new(key.as_bytes(), cipher.encryption_type)?));
        }

        for row in &mut result.rows {
            for (index, cipher) in &ciphers {
                if let Some(Some(cell)) = row.get_mut(*index) {
                    *cell = cipher.decrypt(cell)?;
                }
            }
        }
        Ok(result)
    }
}

fn bind_parameters(parameters: Vec<Parameter>, resolved: &ResolvedParameters) -> Result<Vec<BoundParameter>> {
    let mut bound = Vec::with_capacity(parameters.len());
    for parameter in parameters {
        let Some(cipher) = resolved.cipher(&parameter.name) else {
            bound.push(BoundParameter {
                name: parameter.name,
                value: parameter.value,
                encrypted: false,
            });
            continue;
        };
        let value = match parameter.value {
            Some(value) => Some(cipher.encrypt(&value)?),
            None => None,
        };
        bound.push(BoundParameter {
            name: parameter.name,
            value,
            encrypted: true,
        });
    }
    Ok(bound)
}
