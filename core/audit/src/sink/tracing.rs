use async_trait::async_trait;
use tracing::info;

use super::{AuditSink, AuditSinkError};
use keyledger_common::AuditEvent;

/// Forwards audit events to the `tracing` pipeline under the `audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TracingSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuditSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn write(&self, event: &AuditEvent) -> Result<(), AuditSinkError> {
        info!(
            target: "audit",
            event_id = %event.id,
            kind = %event.kind,
            status = %event.status,
            transaction_id = event.transaction_id.as_ref().map(|id| id.as_str()),
            key_id = event.key_id.as_ref().map(|id| id.as_str()),
            operation = event.operation.map(|op| op.as_str()),
            actor_id = event.actor_id.as_ref().map(|id| id.as_str()),
            detail = event.detail.as_deref(),
            "audit event"
        );
        Ok(())
    }
}
