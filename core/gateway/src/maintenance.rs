//! Periodic maintenance: key expiry and audit retention.
//!
//! Rotation is not scheduled here; an external scheduler calls
//! `rotate_if_needed`.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::service::E2eeService;
use keyledger_common::{Error, KeyId, Result};

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Rotating keys whose grace period ended.
    pub expired: Vec<KeyId>,
    /// Audit events removed by retention.
    pub pruned: u64,
}

/// Run one pass against `service`.
///
/// Expiry runs even if pruning fails; the first error is returned after both.
pub async fn run_maintenance(service: &E2eeService) -> Result<MaintenanceReport> {
    let expired = service.keys().expire_due().await;
    let pruned = service.recorder().prune_expired().await;

    let report = MaintenanceReport {
        expired: expired?,
        pruned: pruned?,
    };
    if !report.expired.is_empty() || report.pruned > 0 {
        info!(
            expired = report.expired.len(),
            pruned = report.pruned,
            "maintenance pass complete"
        );
    }
    Ok(report)
}

/// Requests accepted by the maintenance task.
#[derive(Debug)]
pub enum MaintenanceRequest {
    RunNow,
    Shutdown,
}

type Reply = oneshot::Sender<Result<MaintenanceReport>>;

/// Control side of a running maintenance loop.
#[derive(Clone)]
pub struct Maintenance {
    request_tx: mpsc::Sender<(MaintenanceRequest, Reply)>,
}

impl Maintenance {
    pub fn new(service: Arc<E2eeService>, every: Duration) -> (Self, MaintenanceHandle) {
        let (request_tx, request_rx) = mpsc::channel(8);
        (
            Self { request_tx },
            MaintenanceHandle {
                service,
                every,
                request_rx,
            },
        )
    }

    /// Run a pass immediately.
    pub async fn run_now(&self) -> Result<MaintenanceReport> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send((MaintenanceRequest::RunNow, reply_tx))
            .await
            .map_err(|_| Error::InvalidInput("Maintenance not running".to_string()))?;

        reply_rx
            .await
            .map_err(|_| Error::InvalidInput("Maintenance stopped before replying".to_string()))?
    }

    pub async fn shutdown(&self) {
        let (reply_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((MaintenanceRequest::Shutdown, reply_tx))
            .await;
    }
}

/// Handle for the maintenance background task.
pub struct MaintenanceHandle {
    service: Arc<E2eeService>,
    every: Duration,
    request_rx: mpsc::Receiver<(MaintenanceRequest, Reply)>,
}

impl MaintenanceHandle {
    /// Run until shutdown. Spawn this in a tokio task.
    pub async fn run(mut self) {
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval_secs = self.every.as_secs(), "Maintenance started");

        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    match request {
                        Some((MaintenanceRequest::RunNow, reply)) => {
                            debug!("Processing maintenance request");
                            let _ = reply.send(run_maintenance(&self.service).await);
                        }
                        Some((MaintenanceRequest::Shutdown, _)) | None => {
                            info!("Maintenance shutting down");
                            break;
                        }
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = run_maintenance(&self.service).await {
                        error!("Periodic maintenance failed: {}", e);
                    }
                }
            }
        }
    }
}

/// Spawn the maintenance loop on the current runtime.
pub fn spawn_maintenance(
    service: Arc<E2eeService>,
    every: Duration,
) -> (Maintenance, JoinHandle<()>) {
    let (maintenance, handle) = Maintenance::new(service, every);
    (maintenance, tokio::spawn(handle.run()))
}
