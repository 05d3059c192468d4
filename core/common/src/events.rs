//! Audit events published by key and transaction components.
//!
//! Components do not talk to a global event bus. Each one owns an
//! [`ObserverSet`] and observers are registered explicitly at wiring time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::types::{KeyId, Operation, TransactionId, UserId};

/// Kind of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    KeyGenerated,
    KeyRotated,
    KeyRevoked,
    KeyExpired,
    TransactionStarted,
    TransactionCompleted,
    TransactionFailed,
    TransactionReaped,
    /// Authentication failure during decryption, logged as a security event.
    SecurityDecryptionFailed,
}

impl AuditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventKind::KeyGenerated => "key_generated",
            AuditEventKind::KeyRotated => "key_rotated",
            AuditEventKind::KeyRevoked => "key_revoked",
            AuditEventKind::KeyExpired => "key_expired",
            AuditEventKind::TransactionStarted => "transaction_started",
            AuditEventKind::TransactionCompleted => "transaction_completed",
            AuditEventKind::TransactionFailed => "transaction_failed",
            AuditEventKind::TransactionReaped => "transaction_reaped",
            AuditEventKind::SecurityDecryptionFailed => "security_decryption_failed",
        }
    }

    /// Whether the event concerns a key rather than a transaction.
    pub fn is_key_event(&self) -> bool {
        matches!(
            self,
            AuditEventKind::KeyGenerated
                | AuditEventKind::KeyRotated
                | AuditEventKind::KeyRevoked
                | AuditEventKind::KeyExpired
        )
    }
}

impl fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single append-only audit record.
///
/// Carries identifiers and statuses only. Key material, plaintext and
/// ciphertext never appear here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub kind: AuditEventKind,
    pub transaction_id: Option<TransactionId>,
    pub key_id: Option<KeyId>,
    pub operation: Option<Operation>,
    pub status: String,
    pub actor_id: Option<UserId>,
    pub timestamp: DateTime<Utc>,
    pub detail: Option<String>,
}

impl AuditEvent {
    /// Event about a key status change.
    pub fn key(kind: AuditEventKind, key_id: &KeyId, status: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            transaction_id: None,
            key_id: Some(key_id.clone()),
            operation: None,
            status: status.into(),
            actor_id: None,
            timestamp: Utc::now(),
            detail: None,
        }
    }

    /// Event about a transaction status change.
    pub fn transaction(
        kind: AuditEventKind,
        transaction_id: &TransactionId,
        key_id: &KeyId,
        operation: Operation,
        status: impl Into<String>,
        actor_id: &UserId,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            transaction_id: Some(transaction_id.clone()),
            key_id: Some(key_id.clone()),
            operation: Some(operation),
            status: status.into(),
            actor_id: Some(actor_id.clone()),
            timestamp: Utc::now(),
            detail: None,
        }
    }

    /// Attach a short human-readable detail.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Receiver of lifecycle events.
///
/// `notify` is called on the critical path and must not block: implementations
/// queue the event and return.
pub trait EventObserver: Send + Sync {
    fn notify(&self, event: &AuditEvent);
}

/// Explicitly registered observers of one component.
#[derive(Clone, Default)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn EventObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer.
    pub fn register(&mut self, observer: Arc<dyn EventObserver>) {
        self.observers.push(observer);
    }

    /// Deliver an event to every observer.
    pub fn emit(&self, event: AuditEvent) {
        tracing::debug!(kind = %event.kind, status = %event.status, "emitting audit event");
        for observer in &self.observers {
            observer.notify(&event);
        }
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObserverSet({} observers)", self.observers.len())
    }
}
