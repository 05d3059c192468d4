//! In-memory repository for testing and ephemeral deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::records::{
    KeyRecord, KeyStatus, TransactionCounts, TransactionRecord, Transition, TransitionOutcome,
};
use crate::repository::{
    require_bindable, KeyRepository, PredecessorUpdate, TransactionRepository, META_REPLACED_BY,
    META_ROTATED_FROM,
};
use keyledger_common::{Error, KeyId, Result, TransactionId};

/// In-memory repository.
///
/// Keys sit behind one `RwLock`; each transaction has its own `Mutex`, so
/// transitions on different transactions never contend.
#[derive(Default)]
pub struct MemoryRepository {
    keys: RwLock<HashMap<KeyId, KeyRecord>>,
    meta: RwLock<HashMap<String, Vec<u8>>>,
    transactions: RwLock<HashMap<TransactionId, Arc<Mutex<TransactionRecord>>>>,
}

impl MemoryRepository {
    /// Create a new empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    fn row(&self, id: &TransactionId) -> Result<Option<Arc<Mutex<TransactionRecord>>>> {
        let transactions = self
            .transactions
            .read()
            .map_err(|_| Error::lock_poisoned("transactions"))?;
        Ok(transactions.get(id).cloned())
    }
}

#[async_trait]
impl KeyRepository for MemoryRepository {
    fn name(&self) -> &str {
        "memory"
    }

    async fn activate(
        &self,
        mut key: KeyRecord,
        predecessor: Option<PredecessorUpdate>,
    ) -> Result<()> {
        if key.status != KeyStatus::Active {
            return Err(Error::InvalidInput(format!(
                "key {} must be active to activate, is {}",
                key.id, key.status
            )));
        }

        let mut keys = self.keys.write().map_err(|_| Error::lock_poisoned("keys"))?;

        if keys.contains_key(&key.id) {
            return Err(Error::AlreadyExists(format!("Key already exists: {}", key.id)));
        }

        let active: Vec<&KeyId> = keys
            .values()
            .filter(|k| k.status == KeyStatus::Active)
            .map(|k| &k.id)
            .collect();

        let Some(update) = predecessor else {
            if let Some(existing) = active.first() {
                return Err(Error::Conflict(format!("key {} is already active", existing)));
            }
            keys.insert(key.id.clone(), key);
            return Ok(());
        };

        if active.iter().any(|id| **id != update.id) {
            return Err(Error::Conflict(format!(
                "another key than {} is active",
                update.id
            )));
        }

        // Stage the predecessor change on a copy so a failure leaves no trace.
        let mut previous = keys
            .get(&update.id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Key not found: {}", update.id)))?;

        if previous.version != update.expected_version || previous.status != KeyStatus::Active {
            return Err(Error::Conflict(format!(
                "key {} changed (version {}, status {})",
                previous.id, previous.version, previous.status
            )));
        }

        previous.transition(update.status, update.at)?;
        previous
            .metadata
            .insert(META_REPLACED_BY.to_string(), key.id.to_string());
        key.metadata
            .insert(META_ROTATED_FROM.to_string(), previous.id.to_string());

        keys.insert(key.id.clone(), key);
        keys.insert(previous.id.clone(), previous);
        Ok(())
    }

    async fn get_key(&self, id: &KeyId) -> Result<Option<KeyRecord>> {
        let keys = self.keys.read().map_err(|_| Error::lock_poisoned("keys"))?;
        Ok(keys.get(id).cloned())
    }

    async fn active_keys(&self) -> Result<Vec<KeyRecord>> {
        let keys = self.keys.read().map_err(|_| Error::lock_poisoned("keys"))?;
        Ok(keys
            .values()
            .filter(|k| k.status == KeyStatus::Active)
            .cloned()
            .collect())
    }

    async fn list_keys(&self) -> Result<Vec<KeyRecord>> {
        let keys = self.keys.read().map_err(|_| Error::lock_poisoned("keys"))?;
        let mut records: Vec<KeyRecord> = keys.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn update_key_status(
        &self,
        id: &KeyId,
        expected_version: u64,
        status: KeyStatus,
        at: DateTime<Utc>,
    ) -> Result<KeyRecord> {
        let mut keys = self.keys.write().map_err(|_| Error::lock_poisoned("keys"))?;
        let record = keys
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Key not found: {}", id)))?;

        if record.version != expected_version {
            return Err(Error::Conflict(format!(
                "key {} is at version {}, expected {}",
                id, record.version, expected_version
            )));
        }

        record.transition(status, at)?;
        Ok(record.clone())
    }

    async fn get_meta(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let meta = self.meta.read().map_err(|_| Error::lock_poisoned("meta"))?;
        Ok(meta.get(name).cloned())
    }

    async fn put_meta(&self, name: &str, value: Vec<u8>) -> Result<()> {
        let mut meta = self.meta.write().map_err(|_| Error::lock_poisoned("meta"))?;
        meta.insert(name.to_string(), value);
        Ok(())
    }
}

#[async_trait]
impl TransactionRepository for MemoryRepository {
    fn name(&self) -> &str {
        "memory"
    }

    async fn insert_transaction(&self, record: TransactionRecord) -> Result<()> {
        // Held across the insert so a concurrent revoke cannot slip in between.
        let keys = self.keys.read().map_err(|_| Error::lock_poisoned("keys"))?;
        require_bindable(&record.key_id, keys.get(&record.key_id).map(|k| k.status))?;

        let mut transactions = self
            .transactions
            .write()
            .map_err(|_| Error::lock_poisoned("transactions"))?;

        if transactions.contains_key(&record.id) {
            return Err(Error::AlreadyExists(format!(
                "Transaction already exists: {}",
                record.id
            )));
        }
        transactions.insert(record.id.clone(), Arc::new(Mutex::new(record)));
        Ok(())
    }

    async fn get_transaction(&self, id: &TransactionId) -> Result<Option<TransactionRecord>> {
        match self.row(id)? {
            Some(row) => {
                let record = row.lock().map_err(|_| Error::lock_poisoned("transaction"))?;
                Ok(Some(record.clone()))
            }
            None => Ok(None),
        }
    }

    async fn apply_transition(
        &self,
        id: &TransactionId,
        transition: &Transition,
    ) -> Result<(TransactionRecord, TransitionOutcome)> {
        let row = self
            .row(id)?
            .ok_or_else(|| Error::NotFound(format!("Transaction not found: {}", id)))?;

        let mut record = row.lock().map_err(|_| Error::lock_poisoned("transaction"))?;
        let outcome = record.apply(transition)?;
        Ok((record.clone(), outcome))
    }

    async fn pending_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TransactionRecord>> {
        let rows: Vec<Arc<Mutex<TransactionRecord>>> = {
            let transactions = self
                .transactions
                .read()
                .map_err(|_| Error::lock_poisoned("transactions"))?;
            transactions.values().cloned().collect()
        };

        let mut results = Vec::new();
        for row in rows {
            let record = row.lock().map_err(|_| Error::lock_poisoned("transaction"))?;
            if record.status.is_terminal() || record.started_at >= cutoff {
                continue;
            }
            results.push(record.clone());
        }
        results.sort_by_key(|r| r.started_at);
        Ok(results)
    }

    async fn count_by_status(&self) -> Result<TransactionCounts> {
        let rows: Vec<Arc<Mutex<TransactionRecord>>> = {
            let transactions = self
                .transactions
                .read()
                .map_err(|_| Error::lock_poisoned("transactions"))?;
            transactions.values().cloned().collect()
        };

        let mut counts = TransactionCounts::default();
        for row in rows {
            let record = row.lock().map_err(|_| Error::lock_poisoned("transaction"))?;
            counts.add(record.status, 1);
        }
        Ok(counts)
    }
}
