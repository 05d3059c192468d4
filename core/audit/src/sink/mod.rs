//! Audit sink trait and implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use crate::error::AuditSinkError;
use keyledger_common::AuditEvent;

mod jsonl;
mod memory;
mod tracing;

pub use self::tracing::TracingSink;
pub use jsonl::JsonLinesSink;
pub use memory::MemorySink;

/// Append-only destination for audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Unique name for this sink (used in logs and alerts).
    fn name(&self) -> &str;

    /// Append one event.
    async fn write(&self, event: &AuditEvent) -> Result<(), AuditSinkError>;

    /// Remove events older than `older_than`, returning how many were removed.
    ///
    /// Sinks that cannot delete (e.g. log forwarding) keep the default no-op.
    async fn prune(&self, _older_than: DateTime<Utc>) -> Result<u64, AuditSinkError> {
        Ok(0)
    }
}
