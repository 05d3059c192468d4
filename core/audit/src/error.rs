//! Audit sink errors.

use thiserror::Error;

/// Failure reported by an [`crate::AuditSink`].
///
/// Only `Transient` failures are retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuditSinkError {
    #[error("transient error: {0}")]
    Transient(String),

    #[error("permanent error: {0}")]
    Permanent(String),
}

impl AuditSinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AuditSinkError::Transient(_))
    }
}
