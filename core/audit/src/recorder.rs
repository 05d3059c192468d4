//! Asynchronous audit recorder.

use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::alert::{AlertHandler, AlertKind, AuditAlert};
use crate::config::{AuditConfig, AuditRetention};
use crate::retry::RetryExecutor;
use crate::sink::{AuditSink, AuditSinkError};
use keyledger_common::{AuditEvent, Error, EventObserver, Result};

enum Command {
    Record(AuditEvent),
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct Counters {
    recorded: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Recorder counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuditStats {
    /// Events accepted onto the queue.
    pub recorded: u64,
    /// Events the sink stored.
    pub written: u64,
    /// Events given up on after retries.
    pub failed: u64,
    /// Events rejected because the queue was full or closed.
    pub dropped: u64,
}

/// Append-only audit recorder.
///
/// [`AuditRecorder::record`] never waits on the sink. Must be created inside
/// a tokio runtime; the writer task stops once the recorder is dropped and
/// the queue drains.
pub struct AuditRecorder {
    tx: mpsc::Sender<Command>,
    sink: Arc<dyn AuditSink>,
    alerts: Arc<dyn AlertHandler>,
    retention: AuditRetention,
    counters: Arc<Counters>,
}

impl AuditRecorder {
    /// Start a recorder writing to `sink`.
    ///
    /// # Errors
    /// - `Config` if `config` is inconsistent
    pub fn new(
        config: &AuditConfig,
        sink: Arc<dyn AuditSink>,
        alerts: Arc<dyn AlertHandler>,
    ) -> Result<Self> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let counters = Arc::new(Counters::default());

        tokio::spawn(Self::background_task(
            rx,
            sink.clone(),
            RetryExecutor::new(config.retry.clone()),
            u64::from(config.escalation_threshold),
            alerts.clone(),
            counters.clone(),
        ));

        Ok(Self {
            tx,
            sink,
            alerts,
            retention: config.retention,
            counters,
        })
    }

    async fn background_task(
        mut rx: mpsc::Receiver<Command>,
        sink: Arc<dyn AuditSink>,
        retry: RetryExecutor,
        escalation_threshold: u64,
        alerts: Arc<dyn AlertHandler>,
        counters: Arc<Counters>,
    ) {
        let mut consecutive_failures = 0u64;

        while let Some(command) = rx.recv().await {
            let event = match command {
                Command::Flush(done) => {
                    let _ = done.send(());
                    continue;
                }
                Command::Record(event) => event,
            };

            let result = retry
                .execute(|| sink.write(&event), AuditSinkError::is_transient)
                .await;

            match result {
                Ok(()) => {
                    counters.written.fetch_add(1, Ordering::Relaxed);
                    consecutive_failures = 0;
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    consecutive_failures += 1;
                    warn!(
                        sink = sink.name(),
                        event_id = %event.id,
                        kind = %event.kind,
                        error = %e,
                        "audit write failed"
                    );

                    if consecutive_failures % escalation_threshold == 0 {
                        alerts.alert(&AuditAlert {
                            kind: AlertKind::PersistentFailure,
                            sink: sink.name().to_string(),
                            consecutive_failures,
                            message: format!(
                                "{} consecutive audit events could not be written: {}",
                                consecutive_failures, e
                            ),
                        });
                    }
                }
            }
        }

        debug!(sink = sink.name(), "audit writer stopped");
    }

    /// Queue an event for writing.
    ///
    /// Returns `false` if the event was dropped (queue full or closed).
    pub fn record(&self, event: AuditEvent) -> bool {
        match self.tx.try_send(Command::Record(event)) {
            Ok(()) => {
                self.counters.recorded.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                self.alerts.alert(&AuditAlert {
                    kind: AlertKind::QueueOverflow,
                    sink: self.sink.name().to_string(),
                    consecutive_failures: 0,
                    message: format!("audit queue full, {} events dropped so far", dropped),
                });
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                error!("audit writer is not running, event dropped");
                false
            }
        }
    }

    /// Wait until every event queued before this call has been processed.
    ///
    /// # Errors
    /// - `AuditWriteFailure` if the writer task is gone
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(done_tx))
            .await
            .map_err(|_| Error::AuditWriteFailure("audit writer is not running".to_string()))?;
        done_rx
            .await
            .map_err(|_| Error::AuditWriteFailure("audit writer stopped".to_string()))
    }

    pub fn stats(&self) -> AuditStats {
        AuditStats {
            recorded: self.counters.recorded.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn sink(&self) -> &Arc<dyn AuditSink> {
        &self.sink
    }

    /// Apply the retention policy to the sink.
    ///
    /// # Errors
    /// - `AuditWriteFailure` if the sink fails to prune
    pub async fn prune_expired(&self) -> Result<u64> {
        let cutoff = self.retention.cutoff(Utc::now());
        let removed = self
            .sink
            .prune(cutoff)
            .await
            .map_err(|e| Error::AuditWriteFailure(e.to_string()))?;
        if removed > 0 {
            debug!(sink = self.sink.name(), removed, "pruned audit events past retention");
        }
        Ok(removed)
    }
}

impl EventObserver for AuditRecorder {
    fn notify(&self, event: &AuditEvent) {
        self.record(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use crate::sink::MemorySink;
    use async_trait::async_trait;
    use keyledger_common::{AuditEventKind, KeyId};
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct CollectingAlerts(Mutex<Vec<AuditAlert>>);

    impl AlertHandler for CollectingAlerts {
        fn alert(&self, alert: &AuditAlert) {
            self.0.lock().unwrap().push(alert.clone());
        }
    }

    /// Fails the first `failures` writes transiently, then succeeds.
    struct FlakySink {
        failures: u32,
        calls: AtomicU32,
        inner: MemorySink,
    }

    #[async_trait]
    impl AuditSink for FlakySink {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn write(&self, event: &AuditEvent) -> std::result::Result<(), AuditSinkError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(AuditSinkError::Transient("disk busy".to_string()));
            }
            self.inner.write(event).await
        }
    }

    struct BrokenSink;

    #[async_trait]
    impl AuditSink for BrokenSink {
        fn name(&self) -> &str {
            "broken"
        }

        async fn write(&self, _event: &AuditEvent) -> std::result::Result<(), AuditSinkError> {
            Err(AuditSinkError::Permanent("read-only".to_string()))
        }
    }

    fn config() -> AuditConfig {
        AuditConfig {
            retry: RetryConfig::new(3)
                .with_base_delay(Duration::from_millis(1))
                .with_jitter(false),
            ..Default::default()
        }
    }

    fn event() -> AuditEvent {
        AuditEvent::key(AuditEventKind::KeyGenerated, &KeyId::new("k1").unwrap(), "active")
    }

    #[tokio::test]
    async fn test_record_reaches_sink() {
        let sink = Arc::new(MemorySink::new());
        let recorder =
            AuditRecorder::new(&config(), sink.clone(), Arc::new(CollectingAlerts::default()))
                .unwrap();

        assert!(recorder.record(event()));
        recorder.notify(&event());
        recorder.flush().await.unwrap();

        assert_eq!(sink.len(), 2);
        let stats = recorder.stats();
        assert_eq!(stats.recorded, 2);
        assert_eq!(stats.written, 2);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let sink = Arc::new(FlakySink {
            failures: 2,
            calls: AtomicU32::new(0),
            inner: MemorySink::new(),
        });
        let recorder =
            AuditRecorder::new(&config(), sink.clone(), Arc::new(CollectingAlerts::default()))
                .unwrap();

        recorder.record(event());
        recorder.flush().await.unwrap();

        assert_eq!(sink.inner.len(), 1);
        assert_eq!(recorder.stats().failed, 0);
    }

    #[tokio::test]
    async fn test_persistent_failure_escalates() {
        let alerts = Arc::new(CollectingAlerts::default());
        let recorder = AuditRecorder::new(&config(), Arc::new(BrokenSink), alerts.clone()).unwrap();

        for _ in 0..3 {
            recorder.record(event());
        }
        recorder.flush().await.unwrap();

        assert_eq!(recorder.stats().failed, 3);
        let raised = alerts.0.lock().unwrap();
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].kind, AlertKind::PersistentFailure);
        assert_eq!(raised[0].consecutive_failures, 3);
    }

    #[tokio::test]
    async fn test_queue_overflow_drops_and_alerts() {
        let alerts = Arc::new(CollectingAlerts::default());
        let config = AuditConfig {
            queue_capacity: 1,
            ..config()
        };
        let sink = Arc::new(MemorySink::new());
        let recorder = AuditRecorder::new(&config, sink, alerts.clone()).unwrap();

        // The writer task has not run yet on this single-threaded runtime.
        assert!(recorder.record(event()));
        assert!(!recorder.record(event()));

        assert_eq!(recorder.stats().dropped, 1);
        assert_eq!(alerts.0.lock().unwrap()[0].kind, AlertKind::QueueOverflow);
        recorder.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_prune_applies_retention() {
        let sink = Arc::new(MemorySink::new());
        let recorder =
            AuditRecorder::new(&config(), sink.clone(), Arc::new(CollectingAlerts::default()))
                .unwrap();

        let mut ancient = event();
        ancient.timestamp = Utc::now() - chrono::Duration::days(8 * 365);
        recorder.record(ancient);
        recorder.record(event());
        recorder.flush().await.unwrap();

        assert_eq!(recorder.prune_expired().await.unwrap(), 1);
        assert_eq!(sink.len(), 1);
    }
}
