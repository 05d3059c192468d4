//! Transaction ledger.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::config::LedgerConfig;
use keyledger_common::{
    AuditEvent, AuditEventKind, Error, EventObserver, KeyId, ObserverSet, Operation,
    RequestContext, Result, TransactionId, UserId,
};
use keyledger_crypto::DataKey;
use keyledger_keys::KeyLifecycleManager;
use keyledger_store::{
    TransactionCounts, TransactionRecord, TransactionRepository, TransactionStatus, Transition,
    TransitionOutcome, TIMEOUT_REASON,
};

/// Key material captured for one pending transaction.
struct Binding {
    key: Arc<DataKey>,
    started_at: DateTime<Utc>,
}

/// Operator view of the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub counts: TransactionCounts,
    /// Pending transactions holding captured key material in this process.
    pub in_flight: usize,
}

/// Records the lifecycle of every encryption transaction.
///
/// Key material is captured by value when a transaction starts and kept in
/// an in-flight table until the transaction becomes terminal, so rotation or
/// revocation never changes the key a running transaction uses.
pub struct TransactionLedger {
    repo: Arc<dyn TransactionRepository>,
    keys: Arc<KeyLifecycleManager>,
    config: LedgerConfig,
    bindings: Mutex<HashMap<TransactionId, Binding>>,
    observers: ObserverSet,
}

impl TransactionLedger {
    /// Create a ledger.
    ///
    /// # Errors
    /// - `Config` if `config` is inconsistent
    pub fn new(
        repo: Arc<dyn TransactionRepository>,
        keys: Arc<KeyLifecycleManager>,
        config: LedgerConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            repo,
            keys,
            config,
            bindings: Mutex::new(HashMap::new()),
            observers: ObserverSet::new(),
        })
    }

    /// Register an observer for transaction events.
    pub fn register_observer(&mut self, observer: Arc<dyn EventObserver>) {
        self.observers.register(observer);
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Start a transaction bound to the current active key.
    ///
    /// # Postconditions
    /// - A `pending` record is persisted with the active key's id
    /// - The key material is captured for the transaction's lifetime
    ///
    /// # Errors
    /// - `NoActiveKey` if no key is active
    /// - `KeyUnavailable` if the active key was retired by another process and
    ///   no usable replacement is active
    pub async fn start(
        &self,
        user_id: UserId,
        operation: Operation,
        context: RequestContext,
    ) -> Result<TransactionId> {
        let key = self.keys.get_active_key().await?;
        match self
            .begin(user_id.clone(), operation, context.clone(), key)
            .await
        {
            // The cached key was revoked or expired elsewhere; reload once.
            Err(Error::KeyUnavailable { key_id, .. }) => {
                warn!(key_id = %key_id, "cached active key no longer usable, reloading");
                self.keys.invalidate_cached_key();
                let key = self.keys.get_active_key().await?;
                self.begin(user_id, operation, context, key).await
            }
            other => other,
        }
    }

    /// Start a transaction bound to an explicitly named key.
    ///
    /// # Errors
    /// - `KeyUnavailable` if the key is expired or revoked
    /// - `NotFound` if the key does not exist
    pub async fn start_with_key(
        &self,
        user_id: UserId,
        operation: Operation,
        context: RequestContext,
        key_id: &KeyId,
    ) -> Result<TransactionId> {
        let key = self.keys.key_for_decrypt(key_id).await?;
        self.begin(user_id, operation, context, key).await
    }

    async fn begin(
        &self,
        user_id: UserId,
        operation: Operation,
        context: RequestContext,
        key: Arc<DataKey>,
    ) -> Result<TransactionId> {
        let id = TransactionId::generate();
        let record = TransactionRecord::pending(
            id.clone(),
            user_id,
            key.id().clone(),
            operation,
            key.algorithm(),
            context,
            Utc::now(),
        );

        self.repo.insert_transaction(record.clone()).await?;
        self.bind(&id, key, record.started_at);

        debug!(
            transaction_id = %id,
            key_id = %record.key_id,
            operation = %operation,
            "transaction started"
        );
        self.emit(AuditEventKind::TransactionStarted, &record, None);
        Ok(id)
    }

    /// Mark a transaction completed. Completing twice is a no-op.
    ///
    /// # Errors
    /// - `TransactionTimeout` if the reaper already failed it
    /// - `InvalidTransition` if it already failed for another reason
    /// - `NotFound` if it does not exist
    pub async fn complete(&self, id: &TransactionId) -> Result<()> {
        let (record, outcome) = self
            .settle(id, &Transition::Complete { at: Utc::now() })
            .await?;

        if outcome == TransitionOutcome::Applied {
            debug!(
                transaction_id = %id,
                duration_ms = record.metadata.duration_ms.unwrap_or_default(),
                "transaction completed"
            );
            let detail = record.metadata.duration_ms.map(|ms| format!("{}ms", ms));
            self.emit(AuditEventKind::TransactionCompleted, &record, detail);
        }
        Ok(())
    }

    /// Mark a transaction failed with `reason`.
    ///
    /// Failing an already failed transaction only replaces its reason.
    ///
    /// # Errors
    /// - `InvalidTransition` if it already completed
    /// - `NotFound` if it does not exist
    pub async fn fail(&self, id: &TransactionId, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        let (record, outcome) = self
            .settle(
                id,
                &Transition::Fail {
                    reason: reason.clone(),
                    at: Utc::now(),
                },
            )
            .await?;

        match outcome {
            TransitionOutcome::Applied => {
                info!(transaction_id = %id, reason = %reason, "transaction failed");
                self.emit(AuditEventKind::TransactionFailed, &record, Some(reason));
            }
            TransitionOutcome::ReasonUpdated => {
                debug!(transaction_id = %id, reason = %reason, "failure reason updated");
            }
            TransitionOutcome::Unchanged => {}
        }
        Ok(())
    }

    /// Key material captured when the transaction started.
    ///
    /// A pending transaction started by another process (or before a restart)
    /// has no captured material here; its key is reloaded by id and must
    /// still be usable.
    ///
    /// # Errors
    /// - `InvalidInput` if the transaction is no longer pending
    /// - `TransactionTimeout` if the reaper failed it
    /// - `NotFound` if it does not exist
    pub async fn bound_key(&self, id: &TransactionId) -> Result<Arc<DataKey>> {
        // The stored record is authoritative: another process may have
        // settled or reaped the transaction since it was bound here.
        let record = self.get(id).await?;
        if record.status != TransactionStatus::Pending {
            self.release(id);
            if record.timed_out() {
                return Err(Error::TransactionTimeout(id.to_string()));
            }
            return Err(Error::InvalidInput(format!(
                "transaction {} is {}",
                id, record.status
            )));
        }

        if let Some(key) = self.lookup_binding(id) {
            return Ok(key);
        }

        let key = self.keys.key_for_decrypt(&record.key_id).await?;
        self.bind(id, key.clone(), record.started_at);
        Ok(key)
    }

    /// Get a transaction record.
    pub async fn get(&self, id: &TransactionId) -> Result<TransactionRecord> {
        self.repo
            .get_transaction(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Transaction not found: {}", id)))
    }

    /// Fail every transaction still pending `timeout` after it started.
    ///
    /// Only pending records are touched, so concurrent sweeps mark each
    /// transaction once; the returned ids are those this call reaped.
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<TransactionId>> {
        let cutoff = now - self.config.transaction_timeout();
        let candidates = self.repo.pending_started_before(cutoff).await?;
        let mut reaped = Vec::new();

        for candidate in candidates {
            let (record, outcome) = match self
                .repo
                .apply_transition(&candidate.id, &Transition::Reap { at: now })
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    warn!(transaction_id = %candidate.id, error = %e, "failed to reap transaction");
                    continue;
                }
            };

            if outcome != TransitionOutcome::Applied {
                continue;
            }

            self.release(&record.id);
            warn!(
                transaction_id = %record.id,
                started_at = %record.started_at,
                "pending transaction timed out"
            );
            self.emit(
                AuditEventKind::TransactionReaped,
                &record,
                Some(TIMEOUT_REASON.to_string()),
            );
            reaped.push(record.id);
        }

        // Bindings for transactions settled elsewhere never come back through
        // a sweep; anything this old is past its timeout either way.
        let dropped = self.release_started_before(cutoff);
        if dropped > 0 {
            debug!(count = dropped, "released stale key bindings");
        }

        if !reaped.is_empty() {
            info!(count = reaped.len(), "reaper failed timed-out transactions");
        }
        Ok(reaped)
    }

    pub async fn stats(&self) -> Result<LedgerStats> {
        let counts = self.repo.count_by_status().await?;
        let in_flight = self
            .bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        Ok(LedgerStats { counts, in_flight })
    }

    /// Apply a terminal transition. The binding is released whenever the
    /// stored record ends up terminal, including when it already was.
    async fn settle(
        &self,
        id: &TransactionId,
        transition: &Transition,
    ) -> Result<(TransactionRecord, TransitionOutcome)> {
        match self.repo.apply_transition(id, transition).await {
            Ok(result) => {
                self.release(id);
                Ok(result)
            }
            Err(e @ (Error::TransactionTimeout(_) | Error::InvalidTransition(_))) => {
                self.release(id);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn bind(&self, id: &TransactionId, key: Arc<DataKey>, started_at: DateTime<Utc>) {
        self.bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), Binding { key, started_at });
    }

    fn lookup_binding(&self, id: &TransactionId) -> Option<Arc<DataKey>> {
        self.bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|binding| binding.key.clone())
    }

    fn release_started_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut bindings = self.bindings.lock().unwrap_or_else(PoisonError::into_inner);
        let before = bindings.len();
        bindings.retain(|_, binding| binding.started_at >= cutoff);
        before - bindings.len()
    }

    fn release(&self, id: &TransactionId) {
        self.bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    fn emit(&self, kind: AuditEventKind, record: &TransactionRecord, detail: Option<String>) {
        let mut event = AuditEvent::transaction(
            kind,
            &record.id,
            &record.key_id,
            record.operation,
            record.status.as_str(),
            &record.user_id,
        );
        if let Some(detail) = detail {
            event = event.with_detail(detail);
        }
        self.observers.emit(event);
    }
}
