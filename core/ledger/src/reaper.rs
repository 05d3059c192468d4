//! Background reaper for timed-out transactions.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::ledger::TransactionLedger;
use keyledger_common::{Error, Result, TransactionId};

/// Requests accepted by the reaper task.
#[derive(Debug)]
pub enum ReaperRequest {
    /// Sweep now instead of waiting for the next tick.
    Sweep,
    /// Stop the task.
    Shutdown,
}

type Reply = oneshot::Sender<Result<Vec<TransactionId>>>;

/// Control side of a running reaper.
#[derive(Clone)]
pub struct Reaper {
    request_tx: mpsc::Sender<(ReaperRequest, Reply)>,
}

impl Reaper {
    /// Create a reaper and the handle that runs it.
    pub fn new(ledger: Arc<TransactionLedger>, every: Duration) -> (Self, ReaperHandle) {
        let (request_tx, request_rx) = mpsc::channel(16);
        (
            Self { request_tx },
            ReaperHandle {
                ledger,
                every,
                request_rx,
            },
        )
    }

    /// Run a sweep immediately and return the ids it reaped.
    pub async fn sweep_now(&self) -> Result<Vec<TransactionId>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send((ReaperRequest::Sweep, reply_tx))
            .await
            .map_err(|_| Error::InvalidInput("Reaper not running".to_string()))?;

        reply_rx
            .await
            .map_err(|_| Error::InvalidInput("Reaper stopped before replying".to_string()))?
    }

    /// Stop the reaper task.
    pub async fn shutdown(&self) {
        let (reply_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((ReaperRequest::Shutdown, reply_tx))
            .await;
    }
}

/// Handle for the reaper background task.
pub struct ReaperHandle {
    ledger: Arc<TransactionLedger>,
    every: Duration,
    request_rx: mpsc::Receiver<(ReaperRequest, Reply)>,
}

impl ReaperHandle {
    /// Run the sweep loop until shutdown. Spawn this in a tokio task.
    pub async fn run(mut self) {
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval_secs = self.every.as_secs(), "Transaction reaper started");

        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    match request {
                        Some((ReaperRequest::Sweep, reply)) => {
                            debug!("Processing sweep request");
                            let _ = reply.send(self.ledger.reap_expired(Utc::now()).await);
                        }
                        Some((ReaperRequest::Shutdown, _)) | None => {
                            info!("Transaction reaper shutting down");
                            break;
                        }
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.ledger.reap_expired(Utc::now()).await {
                        error!("Periodic reap failed: {}", e);
                    }
                }
            }
        }
    }
}

/// Spawn a reaper on the current runtime.
pub fn spawn_reaper(ledger: Arc<TransactionLedger>, every: Duration) -> (Reaper, JoinHandle<()>) {
    let (reaper, handle) = Reaper::new(ledger, every);
    (reaper, tokio::spawn(handle.run()))
}
