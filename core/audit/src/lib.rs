//! Append-only audit recording for KeyLedger.
//!
//! The [`AuditRecorder`] is registered as an observer on the key lifecycle
//! manager and the transaction ledger. Recording only enqueues; a background
//! worker writes to the configured [`AuditSink`], retrying transient failures
//! with backoff and escalating persistent ones through an [`AlertHandler`].
//! Audit failures never reach the caller of a crypto operation.

pub mod alert;
pub mod config;
pub mod error;
pub mod recorder;
pub mod retry;
pub mod sink;

pub use alert::{AlertHandler, AlertKind, AuditAlert, TracingAlertHandler};
pub use config::{AuditConfig, AuditRetention, SinkConfig};
pub use error::AuditSinkError;
pub use recorder::{AuditRecorder, AuditStats};
pub use retry::{RetryConfig, RetryExecutor};
pub use sink::{AuditSink, JsonLinesSink, MemorySink, TracingSink};
