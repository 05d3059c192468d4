//! Bounded retry for audit sink writes.
//!
//! Delays double from `base_delay_ms` up to `max_delay_ms`. With jitter on,
//! each delay is drawn uniformly from `[delay / 2, delay]` so writers that
//! failed together do not retry together.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per event, including the first.
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl RetryConfig {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts,
            base_delay_ms: 50,
            max_delay_ms: 5_000,
            jitter: true,
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `retry` (0-based), before jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        let millis = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    fn sleep_for(&self, retry: u32) -> Duration {
        let ceiling = self.backoff(retry);
        if !self.jitter || ceiling.is_zero() {
            return ceiling;
        }
        let ceiling_ms = ceiling.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(ceiling_ms / 2..=ceiling_ms))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(4)
    }
}

/// Runs one fallible write under a [`RetryConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `operation` until it succeeds, `is_transient` rejects the error, or
    /// attempts run out. The last error is returned.
    pub async fn execute<F, Fut, T, E, C>(&self, operation: F, is_transient: C) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        C: Fn(&E) -> bool,
    {
        let attempts = self.config.attempts.max(1);
        let mut attempt = 1;

        loop {
            let err = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "audit write recovered");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !is_transient(&err) {
                return Err(err);
            }
            if attempt >= attempts {
                warn!(attempts, error = %err, "audit write gave up");
                return Err(err);
            }

            let delay = self.config.sleep_for(attempt - 1);
            warn!(attempt, ?delay, error = %err, "audit write failed, retrying");
            sleep(delay).await;
            attempt += 1;
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuditSinkError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(attempts: u32) -> RetryExecutor {
        RetryExecutor::new(
            RetryConfig::new(attempts)
                .with_base_delay(Duration::from_millis(1))
                .with_jitter(false),
        )
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let config = RetryConfig::new(8)
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1_000));

        assert_eq!(config.backoff(0), Duration::from_millis(100));
        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(800));
        assert_eq!(config.backoff(4), Duration::from_millis(1_000));
        assert_eq!(config.backoff(200), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jittered_sleep_stays_under_ceiling() {
        let config = RetryConfig::new(3).with_base_delay(Duration::from_millis(400));
        for _ in 0..50 {
            let delay = config.sleep_for(1);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(800));
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let calls = AtomicU32::new(0);

        let result = quick(4)
            .execute(
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(AuditSinkError::Transient("disk busy".to_string()))
                    } else {
                        Ok("written")
                    }
                },
                AuditSinkError::is_transient,
            )
            .await;

        assert_eq!(result.unwrap(), "written");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_stops_immediately() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = quick(4)
            .execute(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(AuditSinkError::Permanent("bad record".to_string()))
                },
                AuditSinkError::is_transient,
            )
            .await;

        assert!(matches!(result, Err(AuditSinkError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = quick(3)
            .execute(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(AuditSinkError::Transient("still down".to_string()))
                },
                AuditSinkError::is_transient,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
