//! Repository traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::records::{
    KeyRecord, KeyStatus, TransactionCounts, TransactionRecord, Transition, TransitionOutcome,
};
use keyledger_common::{Error, KeyId, Result, TransactionId};

/// Compare-and-swap on the predecessor of a newly activated key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredecessorUpdate {
    pub id: KeyId,
    /// Version the caller read; the update fails if the stored one differs.
    pub expected_version: u64,
    /// `Rotating` for a rotation, `Revoked` for an emergency replacement.
    pub status: KeyStatus,
    pub at: DateTime<Utc>,
}

/// Persistence of key records.
///
/// Implementations must keep exactly one `active` key once bootstrapped.
/// The only way a record becomes active is [`KeyRepository::activate`].
#[async_trait]
pub trait KeyRepository: Send + Sync {
    /// Backend name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Persist `key` as the active key.
    ///
    /// # Preconditions
    /// - `key.status` is `Active`
    /// - With `predecessor = None`, no key is active yet (bootstrap)
    ///
    /// # Postconditions
    /// - The new record is written, then the predecessor is moved to
    ///   `predecessor.status` with its version bumped; both or neither persist
    /// - `replaced_by` / `rotated_from` metadata links the two records
    ///
    /// # Errors
    /// - `Conflict` if the predecessor's version or status changed, or if a
    ///   bootstrap finds an active key already present
    /// - `AlreadyExists` if `key.id` is taken
    /// - `NotFound` if the predecessor does not exist
    async fn activate(&self, key: KeyRecord, predecessor: Option<PredecessorUpdate>)
        -> Result<()>;

    /// Get a key record.
    async fn get_key(&self, id: &KeyId) -> Result<Option<KeyRecord>>;

    /// All keys currently marked active. More than one is a broken invariant.
    async fn active_keys(&self) -> Result<Vec<KeyRecord>>;

    /// All keys, oldest first.
    async fn list_keys(&self) -> Result<Vec<KeyRecord>>;

    /// Move a key to a non-active status if its version still matches.
    ///
    /// # Errors
    /// - `Conflict` on version mismatch
    /// - `InvalidTransition` if the edge is not allowed
    /// - `NotFound` if the key does not exist
    async fn update_key_status(
        &self,
        id: &KeyId,
        expected_version: u64,
        status: KeyStatus,
        at: DateTime<Utc>,
    ) -> Result<KeyRecord>;

    /// Read a store-level metadata value.
    async fn get_meta(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Write a store-level metadata value.
    async fn put_meta(&self, name: &str, value: Vec<u8>) -> Result<()>;
}

/// Persistence of transaction records.
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    fn name(&self) -> &str;

    /// Insert a new pending transaction.
    ///
    /// The bound key's status is checked in the same step as the insert, so a
    /// revocation by any process sharing the store blocks new transactions.
    ///
    /// # Errors
    /// - `AlreadyExists` if the id is taken
    /// - `KeyUnavailable` if the bound key is expired or revoked
    /// - `NotFound` if the bound key does not exist
    async fn insert_transaction(&self, record: TransactionRecord) -> Result<()>;

    async fn get_transaction(&self, id: &TransactionId) -> Result<Option<TransactionRecord>>;

    /// Apply a transition under a lock on this single record.
    ///
    /// Returns the record as stored afterwards.
    ///
    /// # Errors
    /// - `NotFound` if the transaction does not exist
    /// - Whatever [`TransactionRecord::apply`] rejects
    async fn apply_transition(
        &self,
        id: &TransactionId,
        transition: &Transition,
    ) -> Result<(TransactionRecord, TransitionOutcome)>;

    /// Pending transactions started strictly before `cutoff`.
    async fn pending_started_before(&self, cutoff: DateTime<Utc>)
        -> Result<Vec<TransactionRecord>>;

    async fn count_by_status(&self) -> Result<TransactionCounts>;
}

/// Metadata keys linking a rotation pair.
pub(crate) const META_REPLACED_BY: &str = "replaced_by";
pub(crate) const META_ROTATED_FROM: &str = "rotated_from";

/// Check that a transaction may be bound to `key_id` given its stored status.
pub(crate) fn require_bindable(key_id: &KeyId, status: Option<KeyStatus>) -> Result<()> {
    match status {
        Some(status) if status.is_usable() => Ok(()),
        Some(status) => Err(Error::KeyUnavailable {
            key_id: key_id.to_string(),
            status: status.to_string(),
        }),
        None => Err(Error::NotFound(format!("Key not found: {}", key_id))),
    }
}
