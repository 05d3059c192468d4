use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, PoisonError};

use super::{AuditSink, AuditSinkError};
use keyledger_common::AuditEvent;

/// In-memory sink for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn write(&self, event: &AuditEvent) -> Result<(), AuditSinkError> {
        self.events
            .lock()
            .map_err(|_| AuditSinkError::Permanent("memory sink lock poisoned".to_string()))?
            .push(event.clone());
        Ok(())
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64, AuditSinkError> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| AuditSinkError::Permanent("memory sink lock poisoned".to_string()))?;
        let before = events.len();
        events.retain(|e| e.timestamp >= older_than);
        Ok((before - events.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use keyledger_common::{AuditEventKind, KeyId};

    #[tokio::test]
    async fn test_prune_drops_old_events() {
        let sink = MemorySink::new();
        let key = KeyId::new("k1").unwrap();

        let mut old = AuditEvent::key(AuditEventKind::KeyGenerated, &key, "active");
        old.timestamp = Utc::now() - Duration::days(10);
        sink.write(&old).await.unwrap();
        sink.write(&AuditEvent::key(AuditEventKind::KeyRotated, &key, "rotating"))
            .await
            .unwrap();

        let removed = sink.prune(Utc::now() - Duration::days(1)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(sink.events()[0].kind, AuditEventKind::KeyRotated);
    }
}
