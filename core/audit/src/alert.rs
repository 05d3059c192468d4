//! Escalation of persistent audit failures.

use serde::Serialize;
use tracing::error;

/// What went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Consecutive events could not be written after retries.
    PersistentFailure,
    /// The queue was full and an event was dropped.
    QueueOverflow,
}

/// An escalation raised by the recorder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditAlert {
    pub kind: AlertKind,
    pub sink: String,
    pub consecutive_failures: u64,
    pub message: String,
}

/// Receiver of audit alerts (paging, metrics, logs).
///
/// Called from the recorder worker or from `record`; must not block.
pub trait AlertHandler: Send + Sync {
    fn alert(&self, alert: &AuditAlert);
}

/// Default handler: logs at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertHandler;

impl AlertHandler for TracingAlertHandler {
    fn alert(&self, alert: &AuditAlert) {
        error!(
            kind = ?alert.kind,
            sink = %alert.sink,
            consecutive_failures = alert.consecutive_failures,
            "AUDIT ALERT: {}",
            alert.message
        );
    }
}
