//! Persisted key and transaction records and their state machines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use keyledger_common::{Error, KeyId, Operation, RequestContext, Result, TransactionId, UserId};
use keyledger_crypto::Algorithm;

/// Failure reason written by the timeout reaper.
pub const TIMEOUT_REASON: &str = "timeout";

/// Lifecycle status of an encryption key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Rotating,
    Expired,
    Revoked,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Rotating => "rotating",
            KeyStatus::Expired => "expired",
            KeyStatus::Revoked => "revoked",
        }
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, KeyStatus::Expired | KeyStatus::Revoked)
    }

    /// Whether material of a key in this status may still be handed out.
    pub fn is_usable(&self) -> bool {
        matches!(self, KeyStatus::Active | KeyStatus::Rotating)
    }

    /// Whether `self -> to` is an edge of the key state machine.
    ///
    /// `active` is never a target: keys enter it only through activation.
    pub fn can_transition_to(&self, to: KeyStatus) -> bool {
        matches!(
            (self, to),
            (KeyStatus::Active, KeyStatus::Rotating)
                | (KeyStatus::Active, KeyStatus::Revoked)
                | (KeyStatus::Rotating, KeyStatus::Expired)
                | (KeyStatus::Rotating, KeyStatus::Revoked)
        )
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(KeyStatus::Active),
            "rotating" => Ok(KeyStatus::Rotating),
            "expired" => Ok(KeyStatus::Expired),
            "revoked" => Ok(KeyStatus::Revoked),
            other => Err(Error::Serialization(format!("Unknown key status: {}", other))),
        }
    }
}

/// A stored encryption key.
///
/// `sealed_material` is the data-key material encrypted under the master key.
/// It is opened only by [`crate::KeyStore`].
#[derive(Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub id: KeyId,
    pub algorithm: Algorithm,
    /// Key length in bits.
    pub key_length: u32,
    pub sealed_material: Vec<u8>,
    pub status: KeyStatus,
    /// Optimistic-concurrency counter, bumped on every status change.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, String>,
}

impl KeyRecord {
    /// Move the record to `status`, stamping the matching timestamp.
    ///
    /// # Errors
    /// - Returns `InvalidTransition` if the edge is not in the state machine
    pub fn transition(&mut self, status: KeyStatus, at: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(status) {
            return Err(Error::InvalidTransition(format!(
                "key {} cannot move from {} to {}",
                self.id, self.status, status
            )));
        }

        match status {
            KeyStatus::Rotating => self.rotated_at = Some(at),
            KeyStatus::Revoked => self.revoked_at = Some(at),
            KeyStatus::Expired => self.expired_at = Some(at),
            KeyStatus::Active => {}
        }
        self.status = status;
        self.version += 1;
        Ok(())
    }

    /// Material-free view of this record.
    pub fn info(&self) -> KeyInfo {
        KeyInfo {
            id: self.id.clone(),
            algorithm: self.algorithm,
            key_length: self.key_length,
            status: self.status,
            version: self.version,
            created_at: self.created_at,
            expires_at: self.expires_at,
            rotated_at: self.rotated_at,
            revoked_at: self.revoked_at,
            expired_at: self.expired_at,
            metadata: self.metadata.clone(),
        }
    }
}

impl fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRecord")
            .field("id", &self.id)
            .field("algorithm", &self.algorithm)
            .field("status", &self.status)
            .field("version", &self.version)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Key metadata safe to show to operators and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub id: KeyId,
    pub algorithm: Algorithm,
    pub key_length: u32,
    pub status: KeyStatus,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, String>,
}

/// Lifecycle status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "completed" => Ok(TransactionStatus::Completed),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(Error::Serialization(format!(
                "Unknown transaction status: {}",
                other
            ))),
        }
    }
}

/// Why a transaction failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Error,
    Timeout,
}

/// Typed transaction metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

/// A requested transaction state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Complete { at: DateTime<Utc> },
    Fail { reason: String, at: DateTime<Utc> },
    /// Timeout sweep. Only ever applies to pending records.
    Reap { at: DateTime<Utc> },
}

/// What applying a [`Transition`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The status changed.
    Applied,
    /// Nothing changed (repeat of an already applied transition).
    Unchanged,
    /// The transaction was already failed; only its reason changed.
    ReasonUpdated,
}

/// One row of the transaction ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: TransactionId,
    pub user_id: UserId,
    /// Lookup reference to the bound key.
    pub key_id: KeyId,
    pub operation: Operation,
    pub status: TransactionStatus,
    pub algorithm: Algorithm,
    pub started_at: DateTime<Utc>,
    pub context: RequestContext,
    pub metadata: TransactionMetadata,
}

impl TransactionRecord {
    /// Create a pending transaction.
    pub fn pending(
        id: TransactionId,
        user_id: UserId,
        key_id: KeyId,
        operation: Operation,
        algorithm: Algorithm,
        context: RequestContext,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            key_id,
            operation,
            status: TransactionStatus::Pending,
            algorithm,
            started_at,
            context,
            metadata: TransactionMetadata::default(),
        }
    }

    /// Whether the reaper failed this transaction.
    pub fn timed_out(&self) -> bool {
        self.status == TransactionStatus::Failed
            && self.metadata.failure_kind == Some(FailureKind::Timeout)
    }

    /// Apply a transition in place.
    ///
    /// Status only ever moves out of `pending`. Repeating `complete` is a
    /// no-op; repeating `fail` replaces the reason; crossing between the two
    /// terminal states is rejected.
    ///
    /// # Errors
    /// - `TransactionTimeout` when completing a transaction the reaper failed
    /// - `InvalidTransition` when crossing terminal states
    pub fn apply(&mut self, transition: &Transition) -> Result<TransitionOutcome> {
        match (self.status, transition) {
            (TransactionStatus::Pending, Transition::Complete { at }) => {
                self.status = TransactionStatus::Completed;
                self.finish(*at);
                Ok(TransitionOutcome::Applied)
            }
            (TransactionStatus::Pending, Transition::Fail { reason, at }) => {
                self.status = TransactionStatus::Failed;
                self.metadata.reason = Some(reason.clone());
                self.metadata.failure_kind = Some(FailureKind::Error);
                self.finish(*at);
                Ok(TransitionOutcome::Applied)
            }
            (TransactionStatus::Pending, Transition::Reap { at }) => {
                self.status = TransactionStatus::Failed;
                self.metadata.reason = Some(TIMEOUT_REASON.to_string());
                self.metadata.failure_kind = Some(FailureKind::Timeout);
                self.finish(*at);
                Ok(TransitionOutcome::Applied)
            }
            (TransactionStatus::Completed, Transition::Complete { .. }) => {
                Ok(TransitionOutcome::Unchanged)
            }
            (TransactionStatus::Failed, Transition::Complete { .. }) if self.timed_out() => {
                Err(Error::TransactionTimeout(self.id.to_string()))
            }
            (TransactionStatus::Failed, Transition::Complete { .. }) => {
                Err(Error::InvalidTransition(format!(
                    "transaction {} already failed",
                    self.id
                )))
            }
            (TransactionStatus::Failed, Transition::Fail { reason, .. }) => {
                if self.metadata.reason.as_deref() == Some(reason.as_str()) {
                    return Ok(TransitionOutcome::Unchanged);
                }
                self.metadata.reason = Some(reason.clone());
                Ok(TransitionOutcome::ReasonUpdated)
            }
            (TransactionStatus::Completed, Transition::Fail { .. }) => {
                Err(Error::InvalidTransition(format!(
                    "transaction {} already completed",
                    self.id
                )))
            }
            (_, Transition::Reap { .. }) => Ok(TransitionOutcome::Unchanged),
        }
    }

    fn finish(&mut self, at: DateTime<Utc>) {
        self.metadata.finished_at = Some(at);
        self.metadata.duration_ms = Some((at - self.started_at).num_milliseconds().max(0));
    }
}

/// Transaction counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionCounts {
    pub pending: u64,
    pub completed: u64,
    pub failed: u64,
}

impl TransactionCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.completed + self.failed
    }

    pub(crate) fn add(&mut self, status: TransactionStatus, n: u64) {
        match status {
            TransactionStatus::Pending => self.pending += n,
            TransactionStatus::Completed => self.completed += n,
            TransactionStatus::Failed => self.failed += n,
        }
    }
}
