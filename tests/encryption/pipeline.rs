//! End-to-end encrypted command execution.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use colcrypt::{
    ColumnEncryption, EncryptedCommand, EncryptionSettings, EncryptionType, Error, ErrorKind,
    InMemoryKeyVault, KeyStoreProvider, KeyVaultProvider, ResolverState, StoreLocation,
    AZURE_KEY_VAULT, MSSQL_CERTIFICATE_STORE,
};
use tokio_util::sync::CancellationToken;

use crate::support::{describe_ssn, key_a, params, sealed_value, ScriptedTransport, SERVER, STATEMENT, VAULT_URL};

// ============================================================================
// Helpers
// ============================================================================

/// Context with `key_a` in the certificate store and a transport describing
/// `@ssn` under it.
async fn certificate_setup(
    settings: EncryptionSettings,
    encryption_type: EncryptionType,
) -> (Arc<ColumnEncryption>, Arc<ScriptedTransport>) {
    let ctx = Arc::new(ColumnEncryption::new(settings));
    let path = ctx
        .certificate_store()
        .import(StoreLocation::CurrentUser, key_a())
        .unwrap();
    let provider = ctx.system_providers().get(MSSQL_CERTIFICATE_STORE).unwrap();
    let value = sealed_value(provider.as_ref(), MSSQL_CERTIFICATE_STORE, &path).await;
    let transport = Arc::new(ScriptedTransport::new(describe_ssn(value, encryption_type)));
    (ctx, transport)
}

fn vault_with_key() -> Arc<InMemoryKeyVault> {
    let vault = Arc::new(InMemoryKeyVault::new());
    vault.import(VAULT_URL, key_a());
    vault
}

fn vault_providers(vault: Arc<InMemoryKeyVault>) -> HashMap<String, Arc<dyn KeyStoreProvider>> {
    let mut map: HashMap<String, Arc<dyn KeyStoreProvider>> = HashMap::new();
    map.insert(AZURE_KEY_VAULT.to_string(), Arc::new(KeyVaultProvider::new(vault)));
    map
}

fn assert_reset(command: &EncryptedCommand) {
    let diagnostics = command.diagnostics();
    assert!(!diagnostics.is_in_flight());
    assert_eq!(diagnostics.pending_rpc_count(), 0);
    assert!(!command.has_cancellation_token());
    assert!(!command.is_executing());
}

// ============================================================================
// Execution
// ============================================================================

#[tokio::test]
async fn parameters_are_encrypted_and_results_decrypted() {
    let (ctx, transport) = certificate_setup(EncryptionSettings::default(), EncryptionType::Randomized).await;
    let command = EncryptedCommand::new(ctx.clone(), transport.clone());

    let result = command.execute_with_encryption(STATEMENT, params()).await.unwrap();

    let sent = transport.last_executed();
    assert!(sent.parameters[0].encrypted);
    assert_ne!(sent.parameters[0].value.as_deref(), Some(&b"795-73-9838"[..]));
    assert!(!sent.parameters[1].encrypted);

    assert_eq!(result.rows[0][0].as_deref(), Some(&b"795-73-9838"[..]));
    assert_eq!(result.rows[0][1].as_deref(), Some(&b"Catherine Abel"[..]));
    assert_eq!(command.diagnostics().state(), ResolverState::Ready);
    assert_eq!(ctx.global_key_cache().len(), 1);
    assert!(command.local_key_cache().is_empty());
    assert_reset(&command);
}

#[tokio::test]
async fn provider_names_from_metadata_ignore_case() {
    let ctx = Arc::new(ColumnEncryption::default());
    let path = ctx
        .certificate_store()
        .import(StoreLocation::CurrentUser, key_a())
        .unwrap();
    let provider = ctx.system_providers().get(MSSQL_CERTIFICATE_STORE).unwrap();
    let value = sealed_value(provider.as_ref(), "mssql_certificate_store", &path).await;
    let transport = Arc::new(ScriptedTransport::new(describe_ssn(value, EncryptionType::Randomized)));
    let command = EncryptedCommand::new(ctx.clone(), transport);

    let result = command.execute_with_encryption(STATEMENT, params()).await.unwrap();
    assert_eq!(result.rows[0][0].as_deref(), Some(&b"795-73-9838"[..]));
    assert_eq!(ctx.global_key_cache().len(), 1);
}

#[tokio::test]
async fn deterministic_parameters_encrypt_identically_and_reuse_metadata() {
    let (ctx, transport) = certificate_setup(EncryptionSettings::default(), EncryptionType::Deterministic).await;
    let command = EncryptedCommand::new(ctx, transport.clone());

    command.execute_with_encryption(STATEMENT, params()).await.unwrap();
    let first = transport.last_executed();
    command.execute_with_encryption(STATEMENT, params()).await.unwrap();
    let second = transport.last_executed();

    assert_eq!(first.parameters[0].value, second.parameters[0].value);
    assert_eq!(transport.describe_count(), 1);
}

#[tokio::test]
async fn disabled_metadata_cache_describes_every_execution() {
    let settings = EncryptionSettings {
        query_metadata_cache_enabled: false,
        ..Default::default()
    };
    let (ctx, transport) = certificate_setup(settings, EncryptionType::Randomized).await;
    let command = EncryptedCommand::new(ctx, transport.clone());

    command.execute_with_encryption(STATEMENT, params()).await.unwrap();
    command.execute_with_encryption(STATEMENT, params()).await.unwrap();
    assert_eq!(transport.describe_count(), 2);
}

#[tokio::test]
async fn statement_without_parameters_skips_describe() {
    let (ctx, transport) = certificate_setup(EncryptionSettings::default(), EncryptionType::Randomized).await;
    let command = EncryptedCommand::new(ctx, transport.clone());

    let result = command
        .execute_with_encryption("SELECT COUNT(*) FROM Patients", Vec::new())
        .await
        .unwrap();
    assert!(result.rows[0].is_empty());
    assert_eq!(transport.describe_count(), 0);
}

#[tokio::test]
async fn server_without_column_encryption_is_configuration_error() {
    let (ctx, transport) = certificate_setup(EncryptionSettings::default(), EncryptionType::Randomized).await;
    transport.set_supports_encryption(false);
    let command = EncryptedCommand::new(ctx, transport.clone());

    let err = command.execute_with_encryption(STATEMENT, params()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(command.diagnostics().state(), ResolverState::Faulted);
    assert!(transport.executed.lock().unwrap().is_empty());
    assert_reset(&command);
}

// ============================================================================
// Cache scopes
// ============================================================================

#[tokio::test]
async fn command_providers_never_fall_back_to_the_global_cache() {
    let ctx = Arc::new(ColumnEncryption::default());
    let good_vault = vault_with_key();
    ctx.register_key_store_providers(vault_providers(good_vault.clone()))
        .unwrap();

    let provider = KeyVaultProvider::new(good_vault.clone());
    let value = sealed_value(&provider, AZURE_KEY_VAULT, VAULT_URL).await;
    let transport = Arc::new(ScriptedTransport::new(describe_ssn(value, EncryptionType::Randomized)));

    let global_command = EncryptedCommand::new(ctx.clone(), transport.clone());
    global_command.execute_with_encryption(STATEMENT, params()).await.unwrap();
    assert_eq!(ctx.global_key_cache().len(), 1);
    assert_eq!(good_vault.unwrap_count(), 1);

    // Same provider name, but credentials that no longer work.
    let revoked_vault = vault_with_key();
    revoked_vault.revoke_access();
    let isolated = EncryptedCommand::new(ctx.clone(), transport.clone());
    isolated
        .register_key_store_providers(vault_providers(revoked_vault))
        .unwrap();

    let err = isolated.execute_with_encryption(STATEMENT, params()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert!(err.to_string().starts_with(
        "Failed to decrypt a column encryption key using key store provider: 'AZURE_KEY_VAULT'."
    ));
    assert!(isolated.local_key_cache().is_empty());
    assert_eq!(ctx.global_key_cache().len(), 1);

    // The global command still hits its cache.
    global_command.execute_with_encryption(STATEMENT, params()).await.unwrap();
    assert_eq!(good_vault.unwrap_count(), 1);
}

#[tokio::test]
async fn command_cache_serves_repeat_executions() {
    let ctx = Arc::new(ColumnEncryption::default());
    let vault = vault_with_key();
    let value = sealed_value(&KeyVaultProvider::new(vault.clone()), AZURE_KEY_VAULT, VAULT_URL).await;
    let transport = Arc::new(ScriptedTransport::new(describe_ssn(value, EncryptionType::Randomized)));

    let command = EncryptedCommand::new(ctx.clone(), transport);
    command
        .register_key_store_providers(vault_providers(vault.clone()))
        .unwrap();
    command.execute_with_encryption(STATEMENT, params()).await.unwrap();
    command.execute_with_encryption(STATEMENT, params()).await.unwrap();

    assert_eq!(vault.unwrap_count(), 1);
    assert_eq!(command.local_key_cache().len(), 1);
    assert!(ctx.global_key_cache().is_empty());
}

#[tokio::test]
async fn command_cache_outlives_provider_swap() {
    let ctx = Arc::new(ColumnEncryption::default());
    let good_vault = vault_with_key();
    let value = sealed_value(&KeyVaultProvider::new(good_vault.clone()), AZURE_KEY_VAULT, VAULT_URL).await;
    let transport = Arc::new(ScriptedTransport::new(describe_ssn(value, EncryptionType::Randomized)));

    let command = EncryptedCommand::new(ctx.clone(), transport);
    command
        .register_key_store_providers(vault_providers(good_vault.clone()))
        .unwrap();
    command.execute_with_encryption(STATEMENT, params()).await.unwrap();
    let unwraps = good_vault.unwrap_count();
    assert_eq!(command.local_key_cache().len(), 1);

    // Credentials stop working, but the key is already in the command cache.
    let revoked_vault = vault_with_key();
    revoked_vault.revoke_access();
    command
        .register_key_store_providers(vault_providers(revoked_vault.clone()))
        .unwrap();

    let result = command.execute_with_encryption(STATEMENT, params()).await.unwrap();
    assert_eq!(result.rows[0][0].as_deref(), Some(&b"795-73-9838"[..]));
    assert_eq!(good_vault.unwrap_count(), unwraps);
    assert_eq!(revoked_vault.unwrap_count(), 0);
    assert!(ctx.global_key_cache().is_empty());
}

#[tokio::test]
async fn disabled_key_cache_decrypts_on_every_execution() {
    let ctx = Arc::new(ColumnEncryption::default());
    ctx.set_column_key_cache_enabled(false);
    let vault = vault_with_key();
    ctx.register_key_store_providers(vault_providers(vault.clone())).unwrap();
    let value = sealed_value(&KeyVaultProvider::new(vault.clone()), AZURE_KEY_VAULT, VAULT_URL).await;
    let transport = Arc::new(ScriptedTransport::new(describe_ssn(value, EncryptionType::Randomized)));

    let command = EncryptedCommand::new(ctx.clone(), transport);
    command.execute_with_encryption(STATEMENT, params()).await.unwrap();
    command.execute_with_encryption(STATEMENT, params()).await.unwrap();

    // One unwrap for the parameter and one for the result column, per execution.
    assert_eq!(vault.unwrap_count(), 4);
    assert!(ctx.global_key_cache().is_empty());
}

// ============================================================================
// Trusted key paths
// ============================================================================

#[tokio::test]
async fn empty_trusted_list_rejects_before_any_provider_call() {
    let mut trusted = HashMap::new();
    trusted.insert(SERVER.to_uppercase(), Vec::new());
    let ctx = Arc::new(ColumnEncryption::new(EncryptionSettings {
        trusted_master_key_paths: trusted,
        ..Default::default()
    }));
    let vault = vault_with_key();
    ctx.register_key_store_providers(vault_providers(vault.clone())).unwrap();
    let value = sealed_value(&KeyVaultProvider::new(vault.clone()), AZURE_KEY_VAULT, VAULT_URL).await;
    let transport = Arc::new(ScriptedTransport::new(describe_ssn(value, EncryptionType::Randomized)));

    let command = EncryptedCommand::new(ctx.clone(), transport);
    let err = command.execute_with_encryption(STATEMENT, params()).await.unwrap_err();
    assert!(matches!(err, Error::UntrustedKeyPath { .. }));
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(vault.unwrap_count(), 0);

    ctx.trusted_key_paths().set(SERVER, [VAULT_URL]);
    command.execute_with_encryption(STATEMENT, params()).await.unwrap();
    assert!(vault.unwrap_count() > 0);
}

#[tokio::test]
async fn failure_on_cached_metadata_invalidates_it() {
    let (ctx, transport) = certificate_setup(EncryptionSettings::default(), EncryptionType::Randomized).await;
    let command = EncryptedCommand::new(ctx.clone(), transport.clone());
    command.execute_with_encryption(STATEMENT, params()).await.unwrap();
    assert_eq!(ctx.query_metadata_cache().len(), 1);

    ctx.trusted_key_paths().set(SERVER, Vec::<&str>::new());
    assert!(command.execute_with_encryption(STATEMENT, params()).await.is_err());
    assert!(ctx.query_metadata_cache().is_empty());
    assert_eq!(transport.describe_count(), 1);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn cancel_during_describe_resets_and_command_is_reusable() {
    let (ctx, transport) = certificate_setup(EncryptionSettings::default(), EncryptionType::Randomized).await;
    transport.hold_describe.store(true, Ordering::SeqCst);
    let command = EncryptedCommand::new(ctx, transport.clone());

    let (result, ()) = tokio::join!(
        command.execute_with_encryption(STATEMENT, params()),
        async {
            transport.describe_entered.notified().await;
            let diagnostics = command.diagnostics();
            assert!(diagnostics.is_in_flight());
            assert_eq!(diagnostics.pending_rpc_count(), 1);
            assert_eq!(diagnostics.state(), ResolverState::AwaitingDescribeRpcResults);
            command.cancel();
            command.cancel();
        }
    );

    let err = result.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(command.diagnostics().state(), ResolverState::Cancelled);
    assert_reset(&command);
    assert!(transport.executed.lock().unwrap().is_empty());

    transport.hold_describe.store(false, Ordering::SeqCst);
    let result = command.execute_with_encryption(STATEMENT, params()).await.unwrap();
    assert_eq!(result.rows[0][0].as_deref(), Some(&b"795-73-9838"[..]));
    assert_eq!(command.diagnostics().state(), ResolverState::Ready);
}

#[tokio::test]
async fn cancel_without_execution_is_a_no_op() {
    let (ctx, transport) = certificate_setup(EncryptionSettings::default(), EncryptionType::Randomized).await;
    let command = EncryptedCommand::new(ctx, transport);
    command.cancel();
    command.cancel();
    assert_eq!(command.diagnostics().state(), ResolverState::Idle);
    assert_reset(&command);
    assert!(command.execute_with_encryption(STATEMENT, params()).await.is_ok());
}

#[tokio::test]
async fn external_token_cancels_execution() {
    let (ctx, transport) = certificate_setup(EncryptionSettings::default(), EncryptionType::Randomized).await;
    let command = EncryptedCommand::new(ctx, transport.clone());
    let token = CancellationToken::new();
    token.cancel();

    let err = command
        .execute_with_encryption_cancellable(STATEMENT, params(), token)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(command.diagnostics().state(), ResolverState::Cancelled);
    assert_reset(&command);
    assert_eq!(transport.describe_count(), 0);
}

#[tokio::test]
async fn timeout_is_reported_as_cancellation() {
    let settings = EncryptionSettings {
        command_timeout_secs: Some(30),
        ..Default::default()
    };
    let (ctx, transport) = certificate_setup(settings, EncryptionType::Randomized).await;
    transport.hold_describe.store(true, Ordering::SeqCst);
    let command = EncryptedCommand::new(ctx, transport.clone()).with_timeout(Some(Duration::from_millis(50)));

    let err = command.execute_with_encryption(STATEMENT, params()).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(command.diagnostics().state(), ResolverState::Cancelled);
    assert_reset(&command);
}

#[tokio::test]
async fn concurrent_execution_on_one_command_is_rejected() {
    let (ctx, transport) = certificate_setup(EncryptionSettings::default(), EncryptionType::Randomized).await;
    transport.hold_describe.store(true, Ordering::SeqCst);
    let command = EncryptedCommand::new(ctx, transport.clone());

    let (first, ()) = tokio::join!(
        command.execute_with_encryption(STATEMENT, params()),
        async {
            transport.describe_entered.notified().await;
            let err = command
                .execute_with_encryption(STATEMENT, params())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::CommandBusy(id) if id == command.id()));
            transport.release.notify_one();
        }
    );

    assert!(first.is_ok());
    assert_reset(&command);
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_commands_share_the_global_cache() {
    let ctx = Arc::new(ColumnEncryption::default());
    let vault = vault_with_key();
    ctx.register_key_store_providers(vault_providers(vault.clone())).unwrap();
    let value = sealed_value(&KeyVaultProvider::new(vault.clone()), AZURE_KEY_VAULT, VAULT_URL).await;
    let transport = Arc::new(ScriptedTransport::new(describe_ssn(value, EncryptionType::Randomized)));

    let run_batch = |count: usize| {
        (0..count)
            .map(|_| {
                let ctx = ctx.clone();
                let transport = transport.clone();
                tokio::spawn(async move {
                    let command = EncryptedCommand::new(ctx, transport);
                    let result = command.execute_with_encryption(STATEMENT, params()).await;
                    result
                })
            })
            .collect::<Vec<_>>()
    };

    for task in run_batch(8) {
        let result = task.await.unwrap().unwrap();
        assert_eq!(result.rows[0][0].as_deref(), Some(&b"795-73-9838"[..]));
    }
    assert_eq!(ctx.global_key_cache().len(), 1);
    let cold_unwraps = vault.unwrap_count();
    assert!((1..=16).contains(&cold_unwraps));

    // Warm cache: no further unwraps however many commands run at once.
    for task in run_batch(16) {
        task.await.unwrap().unwrap();
    }
    assert_eq!(vault.unwrap_count(), cold_unwraps);
    assert_eq!(ctx.global_key_cache().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_from_another_task_resets_the_command() {
    let (ctx, transport) = certificate_setup(EncryptionSettings::default(), EncryptionType::Randomized).await;
    transport.hold_describe.store(true, Ordering::SeqCst);
    let command = Arc::new(EncryptedCommand::new(ctx, transport.clone()));

    let canceller = {
        let command = command.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            transport.describe_entered.notified().await;
            command.cancel();
        })
    };

    let err = command.execute_with_encryption(STATEMENT, params()).await.unwrap_err();
    canceller.await.unwrap();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(command.diagnostics().state(), ResolverState::Cancelled);
    assert_reset(&command);

    transport.hold_describe.store(false, Ordering::SeqCst);
    assert!(command.execute_with_encryption(STATEMENT, params()).await.is_ok());
}
