//! The exposed engine API.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{EngineConfig, MasterSecret};
use keyledger_audit::{AuditRecorder, AuditStats, TracingAlertHandler};
use keyledger_common::{
    AuditEvent, AuditEventKind, Error, KeyId, ObserverSet, Operation, RequestContext, Result,
    TransactionId, UserId,
};
use keyledger_crypto::{DataKey, EncryptionEngine, Envelope};
use keyledger_keys::{KeyConfig, KeyLifecycleManager};
use keyledger_ledger::{spawn_reaper, LedgerConfig, LedgerStats, Reaper, TransactionLedger};
use keyledger_store::{
    KeyInfo, KeyStatus, KeyStore, TransactionRecord, TransactionRepository, TransactionStatus,
};

/// Failure reason recorded when authenticated decryption fails.
pub const DECRYPTION_FAILED_REASON: &str = "decryption_failed";

/// Combined operator statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub ledger: LedgerStats,
    pub audit: AuditStats,
}

/// Key lifecycle, transactions and the encryption engine behind one API.
///
/// The audit recorder is registered as an observer of the lifecycle manager,
/// the ledger and the service itself.
pub struct E2eeService {
    keys: Arc<KeyLifecycleManager>,
    ledger: Arc<TransactionLedger>,
    recorder: Arc<AuditRecorder>,
    engine: EncryptionEngine,
    observers: ObserverSet,
}

impl E2eeService {
    /// Wire the components around an opened key store.
    ///
    /// Must be called inside a tokio runtime (the recorder is already running).
    pub fn assemble(
        store: Arc<KeyStore>,
        transactions: Arc<dyn TransactionRepository>,
        key_config: KeyConfig,
        ledger_config: LedgerConfig,
        recorder: Arc<AuditRecorder>,
    ) -> Result<Self> {
        let mut keys = KeyLifecycleManager::new(store, key_config)?;
        keys.register_observer(recorder.clone());
        let keys = Arc::new(keys);

        let mut ledger = TransactionLedger::new(transactions, keys.clone(), ledger_config)?;
        ledger.register_observer(recorder.clone());

        let mut observers = ObserverSet::new();
        observers.register(recorder.clone());

        Ok(Self {
            keys,
            ledger: Arc::new(ledger),
            recorder,
            engine: EncryptionEngine::new(),
            observers,
        })
    }

    /// Open the configured store, start the audit recorder and wire everything.
    ///
    /// # Errors
    /// - `Config` if the configuration is inconsistent
    /// - `NotPermitted` if the master secret does not match the store
    pub async fn open(config: &EngineConfig, secret: MasterSecret) -> Result<Self> {
        config.validate()?;
        let repos = config.store.open()?;

        let store = match secret {
            MasterSecret::Key(master) => KeyStore::open(repos.keys, master).await?,
            MasterSecret::Passphrase { passphrase, kdf } => {
                KeyStore::open_with_passphrase(repos.keys, passphrase.as_bytes(), &kdf).await?
            }
        };

        let recorder = AuditRecorder::new(
            &config.audit,
            config.audit.sink.build(),
            Arc::new(TracingAlertHandler),
        )?;

        info!(store = ?config.store, "engine opened");
        Self::assemble(
            Arc::new(store),
            repos.transactions,
            config.key.clone(),
            config.ledger.clone(),
            Arc::new(recorder),
        )
    }

    pub fn keys(&self) -> &Arc<KeyLifecycleManager> {
        &self.keys
    }

    pub fn ledger(&self) -> &Arc<TransactionLedger> {
        &self.ledger
    }

    pub fn recorder(&self) -> &Arc<AuditRecorder> {
        &self.recorder
    }

    /// Start the background reaper at the configured interval.
    pub fn spawn_reaper(&self) -> (Reaper, JoinHandle<()>) {
        spawn_reaper(self.ledger.clone(), self.ledger.config().reaper_interval())
    }

    // Keys

    /// Generate a key with the configured algorithm and make it active.
    pub async fn generate_key(&self) -> Result<KeyId> {
        let config = self.keys.config();
        self.keys
            .generate_key(config.algorithm, config.key_length_bits)
            .await
    }

    pub async fn ensure_active_key(&self) -> Result<KeyId> {
        self.keys.ensure_active_key().await
    }

    pub async fn rotate(&self) -> Result<KeyId> {
        self.keys.rotate().await
    }

    pub async fn rotate_if_needed(&self) -> Result<Option<KeyId>> {
        self.keys.rotate_if_needed().await
    }

    pub async fn revoke(&self, key_id: &KeyId) -> Result<()> {
        self.keys.revoke(key_id).await
    }

    pub async fn get_key_status(&self, key_id: &KeyId) -> Result<KeyStatus> {
        self.keys.get_key_status(key_id).await
    }

    pub async fn list_keys(&self) -> Result<Vec<KeyInfo>> {
        self.keys.list_keys().await
    }

    // Transactions

    pub async fn start_transaction(
        &self,
        user_id: UserId,
        operation: Operation,
        context: RequestContext,
    ) -> Result<TransactionId> {
        self.ledger.start(user_id, operation, context).await
    }

    /// Start a transaction bound to a named key, e.g. to decrypt a payload
    /// tagged with a rotating key.
    pub async fn start_transaction_with_key(
        &self,
        user_id: UserId,
        operation: Operation,
        context: RequestContext,
        key_id: &KeyId,
    ) -> Result<TransactionId> {
        self.ledger
            .start_with_key(user_id, operation, context, key_id)
            .await
    }

    pub async fn complete_transaction(&self, id: &TransactionId) -> Result<()> {
        self.ledger.complete(id).await
    }

    pub async fn fail_transaction(&self, id: &TransactionId, reason: &str) -> Result<()> {
        self.ledger.fail(id, reason).await
    }

    pub async fn get_transaction(&self, id: &TransactionId) -> Result<TransactionRecord> {
        self.ledger.get(id).await
    }

    pub async fn reap_expired(&self) -> Result<Vec<TransactionId>> {
        self.ledger.reap_expired(Utc::now()).await
    }

    // Crypto

    /// Encrypt under the key bound to `id`.
    ///
    /// The transaction stays pending; the caller completes it.
    ///
    /// # Errors
    /// - `InvalidInput` if the transaction is not a pending encrypt
    /// - `TransactionTimeout` if it was reaped
    /// - `Crypto` if the cipher fails; the transaction is failed
    pub async fn encrypt(&self, id: &TransactionId, plaintext: &[u8]) -> Result<Envelope> {
        let (_, key) = self.bound(id, Operation::Encrypt).await?;

        match self.engine.encrypt(plaintext, &key) {
            Ok(envelope) => Ok(envelope),
            Err(e) => {
                self.fail_quietly(id, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Decrypt with the key bound to `id`.
    ///
    /// # Errors
    /// - `InvalidInput` if the transaction is not a pending decrypt
    /// - `TransactionTimeout` if it was reaped
    /// - `DecryptionFailed` on any authentication failure; the transaction is
    ///   failed and a security event is recorded
    pub async fn decrypt(&self, id: &TransactionId, envelope: &Envelope) -> Result<Vec<u8>> {
        let (record, key) = self.bound(id, Operation::Decrypt).await?;

        match self.engine.decrypt(envelope, &key) {
            Ok(plaintext) => Ok(plaintext),
            Err(e) => {
                warn!(
                    transaction_id = %id,
                    key_id = %key.id(),
                    envelope_key_id = %envelope.key_id,
                    "decryption failed"
                );
                self.observers.emit(
                    AuditEvent::transaction(
                        AuditEventKind::SecurityDecryptionFailed,
                        id,
                        key.id(),
                        Operation::Decrypt,
                        TransactionStatus::Failed.as_str(),
                        &record.user_id,
                    )
                    .with_detail(format!("envelope key {}", envelope.key_id)),
                );
                self.fail_quietly(id, DECRYPTION_FAILED_REASON).await;
                Err(e)
            }
        }
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        Ok(EngineStats {
            ledger: self.ledger.stats().await?,
            audit: self.recorder.stats(),
        })
    }

    async fn bound(
        &self,
        id: &TransactionId,
        operation: Operation,
    ) -> Result<(TransactionRecord, Arc<DataKey>)> {
        let record = self.ledger.get(id).await?;
        if record.timed_out() {
            return Err(Error::TransactionTimeout(id.to_string()));
        }
        if record.status != TransactionStatus::Pending {
            return Err(Error::InvalidInput(format!(
                "transaction {} is {}",
                id, record.status
            )));
        }
        if record.operation != operation {
            return Err(Error::InvalidInput(format!(
                "transaction {} is a {} transaction",
                id, record.operation
            )));
        }

        let key = self.ledger.bound_key(id).await?;
        Ok((record, key))
    }

    /// Fail a transaction after a crypto error, keeping the original error.
    async fn fail_quietly(&self, id: &TransactionId, reason: &str) {
        if let Err(e) = self.ledger.fail(id, reason).await {
            warn!(transaction_id = %id, error = %e, "could not fail transaction");
        }
    }
}
