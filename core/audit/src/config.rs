//! Audit configuration.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::retry::RetryConfig;
use crate::sink::{AuditSink, JsonLinesSink, MemorySink, TracingSink};
use keyledger_common::{Error, Result};

/// Retention of audit records, independent of operational data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRetention {
    pub days: u32,
}

impl Default for AuditRetention {
    fn default() -> Self {
        // Seven years.
        Self { days: 7 * 365 }
    }
}

impl AuditRetention {
    /// Events older than this instant are out of retention.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(i64::from(self.days))
    }
}

/// Where audit events are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkConfig {
    Memory,
    Tracing,
    JsonLines { path: PathBuf },
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig::Tracing
    }
}

impl SinkConfig {
    pub fn build(&self) -> Arc<dyn AuditSink> {
        match self {
            SinkConfig::Memory => Arc::new(MemorySink::new()),
            SinkConfig::Tracing => Arc::new(TracingSink::new()),
            SinkConfig::JsonLines { path } => Arc::new(JsonLinesSink::new(path.clone())),
        }
    }
}

/// Audit recorder settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Bounded queue between `record` and the writer.
    pub queue_capacity: usize,
    pub retry: RetryConfig,
    /// Consecutive failed events before an alert is raised.
    pub escalation_threshold: u32,
    pub retention: AuditRetention,
    pub sink: SinkConfig,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            retry: RetryConfig::default(),
            escalation_threshold: 3,
            retention: AuditRetention::default(),
            sink: SinkConfig::default(),
        }
    }
}

impl AuditConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::Config("audit queue_capacity must be positive".to_string()));
        }
        if self.escalation_threshold == 0 {
            return Err(Error::Config(
                "audit escalation_threshold must be positive".to_string(),
            ));
        }
        if self.retention.days == 0 {
            return Err(Error::Config("audit retention days must be positive".to_string()));
        }
        if self.retry.attempts == 0 {
            return Err(Error::Config("audit retry attempts must be positive".to_string()));
        }
        Ok(())
    }
}
