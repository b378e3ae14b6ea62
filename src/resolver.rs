//! Parameter encryption resolution.
//!
//! Before an encrypted command runs, the server is asked which parameters must
//! be encrypted and with which keys. The resolver walks
//! `Idle → FetchingParameterEncryptionInfo → AwaitingDescribeRpcResults →
//! ResolvingKeys → Ready`, and lands in `Cancelled` or `Faulted` otherwise.
//! However the run ends, including by its future being dropped, the in-flight
//! flag and pending RPC count are reset so the command can run again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use colcrypt_crypto::AeadCellCipher;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::cache::ColumnKey;
use crate::context::{ColumnEncryption, CommandScope};
use crate::error::{Error, Result};
use crate::metadata::{key_entry, validate_cell_algorithm, DescribeResult};
use crate::transport::{CommandTransport, DescribeRequest, Parameter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverState {
    Idle,
    FetchingParameterEncryptionInfo,
    AwaitingDescribeRpcResults,
    ResolvingKeys,
    Ready,
    Cancelled,
    Faulted,
}

impl ResolverState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Cancelled | Self::Faulted)
    }
}

/// Read-only view of a resolver's transient state.
pub trait ResolverDiagnostics {
    fn is_in_flight(&self) -> bool;
    fn pending_rpc_count(&self) -> usize;
    fn state(&self) -> ResolverState;
}

/// Ciphers for the parameters that must be encrypted, by lowercased name.
#[derive(Debug, Default, Clone)]
pub struct ResolvedParameters {
    ciphers: HashMap<String, Arc<AeadCellCipher>>,
}

impl ResolvedParameters {
    pub(crate) fn from_ciphers(ciphers: impl IntoIterator<Item = (String, AeadCellCipher)>) -> Self {
        Self {
            ciphers: ciphers
                .into_iter()
                .map(|(name, cipher)| (name.to_lowercase(), Arc::new(cipher)))
                .collect(),
        }
    }

    pub fn cipher(&self, parameter_name: &str) -> Option<&AeadCellCipher> {
        self.ciphers
            .get(&parameter_name.to_lowercase())
            .map(Arc::as_ref)
    }

    pub fn len(&self) -> usize {
        self.ciphers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ciphers.is_empty()
    }
}

/// Run `future` unless `token` is cancelled first.
pub(crate) async fn until_cancelled<T>(
    token: &CancellationToken,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        result = future => result,
    }
}

// ============================================================================
// ParameterEncryptionResolver
// ============================================================================

#[derive(Debug)]
pub struct ParameterEncryptionResolver {
    state: Mutex<ResolverState>,
    in_flight: AtomicBool,
    pending_rpcs: AtomicUsize,
}

impl Default for ParameterEncryptionResolver {
    fn default() -> Self {
        Self {
            state: Mutex::new(ResolverState::Idle),
            in_flight: AtomicBool::new(false),
            pending_rpcs: AtomicUsize::new(0),
        }
    }
}

impl ResolverDiagnostics for ParameterEncryptionResolver {
    fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn pending_rpc_count(&self) -> usize {
        self.pending_rpcs.load(Ordering::Acquire)
    }

    fn state(&self) -> ResolverState {
        *self.state.lock()
    }
}

/// Resets transient state when a run ends. A run that never reached
/// [`RunGuard::finish`] had its future dropped and counts as cancelled.
struct RunGuard<'a> {
    resolver: &'a ParameterEncryptionResolver,
    finished: bool,
}

impl<'a> RunGuard<'a> {
    fn start(resolver: &'a ParameterEncryptionResolver) -> Self {
        resolver.in_flight.store(true, Ordering::Release);
        resolver.pending_rpcs.store(0, Ordering::Release);
        resolver.transition(ResolverState::Idle);
        Self {
            resolver,
            finished: false,
        }
    }

    fn finish(mut self, state: ResolverState) {
        self.finished = true;
        self.resolver.reset(state);
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!("parameter encryption resolution abandoned");
            self.resolver.reset(ResolverState::Cancelled);
        }
    }
}

impl ParameterEncryptionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn transition(&self, next: ResolverState) {
        let mut state = self.state.lock();
        tracing::trace!(from = ?*state, to = ?next, "resolver state");
        *state = next;
    }

    fn reset(&self, terminal: ResolverState) {
        self.pending_rpcs.store(0, Ordering::Release);
        self.in_flight.store(false, Ordering::Release);
        self.transition(terminal);
    }

    /// Work out which parameters need encryption and build their ciphers.
    ///
    /// Cancelling `token` aborts at the next suspension point with
    /// [`Error::Cancelled`].
    pub async fn resolve(
        &self,
        ctx: &ColumnEncryption,
        transport: &dyn CommandTransport,
        statement: &str,
        parameters: &[Parameter],
        scope: &CommandScope<'_>,
        token: &CancellationToken,
    ) -> Result<ResolvedParameters> {
        let guard = RunGuard::start(self);
        let result = until_cancelled(
            token,
            self.run(ctx, transport, statement, parameters, scope),
        )
        .await;

        match &result {
            Ok(resolved) => {
                tracing::debug!(encrypted = resolved.len(), "parameter encryption resolved");
                guard.finish(ResolverState::Ready);
            }
            Err(e) if e.is_cancelled() => {
                tracing::debug!("parameter encryption resolution cancelled");
                guard.finish(ResolverState::Cancelled);
            }
            Err(e) => {
                tracing::debug!(error = %e, "parameter encryption resolution failed");
                guard.finish(ResolverState::Faulted);
            }
        }
        result
    }

    async fn run(
        &self,
        ctx: &ColumnEncryption,
        transport: &dyn CommandTransport,
        statement: &str,
        parameters: &[Parameter],
        scope: &CommandScope<'_>,
    ) -> Result<ResolvedParameters> {
        if parameters.is_empty() {
            return Ok(ResolvedParameters::default());
        }
        let server = transport.server();
        if !transport.supports_column_encryption() {
            return Err(Error::ColumnEncryptionNotSupported(server.to_string()));
        }

        let cached = ctx.query_metadata_cache().get(server, statement);
        let from_cache = cached.is_some();
        let describe = match cached {
            Some(describe) => {
                tracing::debug!(server, "query metadata cache hit");
                describe
            }
            None => Arc::new(self.describe(transport, statement, parameters).await?),
        };

        self.transition(ResolverState::ResolvingKeys);
        match resolve_ciphers(ctx, server, &describe, parameters, scope).await {
            Ok(resolved) => {
                if !from_cache {
                    ctx.query_metadata_cache().insert(server, statement, describe);
                }
                Ok(resolved)
            }
            Err(e) => {
                if from_cache && !e.is_cancelled() {
                    ctx.query_metadata_cache().invalidate(server, statement);
                }
                Err(e)
            }
        }
    }

    async fn describe(
        &self,
        transport: &dyn CommandTransport,
        statement: &str,
        parameters: &[Parameter],
    ) -> Result<DescribeResult> {
        self.transition(ResolverState::FetchingParameterEncryptionInfo);
        self.pending_rpcs.fetch_add(1, Ordering::AcqRel);
        let handle = transport
            .send_describe(DescribeRequest {
                statement: statement.to_string(),
                parameter_names: parameters.iter().map(|p| p.name.clone()).collect(),
            })
            .await?;

        self.transition(ResolverState::AwaitingDescribeRpcResults);
        let describe = transport.read_describe(handle).await?;
        self.pending_rpcs.fetch_sub(1, Ordering::AcqRel);

        describe.validate()?;
        Ok(describe)
    }
}

async fn resolve_ciphers(
    ctx: &ColumnEncryption,
    server: &str,
    describe: &DescribeResult,
    parameters: &[Parameter],
    scope: &CommandScope<'_>,
) -> Result<ResolvedParameters> {
    let mut keys: HashMap<u16, ColumnKey> = HashMap::new();
    let mut ciphers = HashMap::new();

    for described in &describe.parameters {
        let name = described.parameter_name.to_lowercase();
        if !parameters.iter().any(|p| p.name.to_lowercase() == name) {
            return Err(Error::InvalidMetadata(format!(
                "parameter '{}' was described by the server but not supplied",
                described.parameter_name
            )));
        }
        validate_cell_algorithm(&described.cipher.algorithm_name)?;

        let ordinal = described.cipher.key_ordinal;
        let key = match keys.get(&ordinal) {
            Some(key) => key.clone(),
            None => {
                let entry = key_entry(&describe.keys, ordinal)?;
                let key = ctx.resolve_column_key(server, entry, scope).await?;
                keys.insert(ordinal, key.clone());
                key
            }
        };

        let cipher = AeadCellCipher::new(key.as_bytes(), described.cipher.encryption_type)?;
        ciphers.insert(name, Arc::new(cipher));
    }

    Ok(ResolvedParameters { ciphers })
}
