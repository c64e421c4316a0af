//! Sync scheduling - manual and periodic modes.
//!
//! Requests are funnelled through one channel and handled one at a time,
//! so sync rounds never overlap.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use anchorsync_common::{Error, RecordKey, Result};

/// Sync mode configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Sync only when requested.
    Manual,
    /// Also sync at regular intervals.
    Periodic { interval: Duration },
}

impl SyncMode {
    fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Manual => None,
            SyncMode::Periodic { interval } => Some(*interval),
        }
    }
}

/// Sync request types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRequest {
    /// File sync only.
    Files,
    /// Record sync only; `full` re-pulls the whole history.
    Records { full: bool },
    /// Records, then files.
    All,
    /// Shutdown the scheduler.
    Shutdown,
}

/// Sync result from the engine.
#[derive(Debug, Default)]
pub struct SyncResult {
    pub files_uploaded: usize,
    pub files_downloaded: usize,
    pub files_deleted: usize,
    pub records_uploaded: usize,
    pub fragments_pulled: usize,
    /// Whether a record upload was refused as stale.
    pub record_conflict: bool,
    /// Unconfirmed record fragments dropped after a refused upload.
    pub records_discarded: usize,
    /// Records changed by the round.
    pub touched: BTreeSet<RecordKey>,
    /// Why the file step failed after records were synced.
    pub files_error: Option<Error>,
    pub duration: Duration,
}

type Responder = oneshot::Sender<Result<SyncResult>>;

/// Scheduler for managing sync timing and requests.
pub struct SyncScheduler {
    mode: Arc<RwLock<SyncMode>>,
    request_tx: mpsc::Sender<(SyncRequest, Responder)>,
}

impl SyncScheduler {
    /// Create a new scheduler with the given mode.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let mode = Arc::new(RwLock::new(mode));

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
        };
        let handle = SyncSchedulerHandle { mode, request_rx };

        (scheduler, handle)
    }

    /// Request a sync and wait for its result.
    pub async fn request(&self, request: SyncRequest) -> Result<SyncResult> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((request, response_tx))
            .await
            .map_err(|_| Error::InvalidInput("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::InvalidInput("Scheduler stopped before replying".to_string()))?
    }

    /// Request a sync of records and files.
    pub async fn request_sync(&self) -> Result<SyncResult> {
        self.request(SyncRequest::All).await
    }

    /// Change the sync mode.
    pub async fn set_mode(&self, mode: SyncMode) {
        *self.mode.write().await = mode;
    }

    /// Get current sync mode.
    pub async fn get_mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    /// Shutdown the scheduler.
    pub async fn shutdown(&self) {
        let (response_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((SyncRequest::Shutdown, response_tx))
            .await;
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    mode: Arc<RwLock<SyncMode>>,
    request_rx: mpsc::Receiver<(SyncRequest, Responder)>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler background task.
    ///
    /// This should be spawned in a tokio task. The `sync_fn` is called
    /// for every request and on every periodic tick. The task ends on a
    /// shutdown request or when every scheduler has been dropped.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn(SyncRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<SyncResult>> + Send,
    {
        let mut current = self.mode.read().await.interval();
        let mut ticker = current.map(periodic);

        info!("Sync scheduler started");

        loop {
            tokio::select! {
                received = self.request_rx.recv() => {
                    let Some((request, response_tx)) = received else {
                        info!("All schedulers dropped, stopping");
                        break;
                    };
                    if request == SyncRequest::Shutdown {
                        info!("Received shutdown request");
                        break;
                    }

                    debug!("Processing sync request: {:?}", request);
                    let _ = response_tx.send(sync_fn(request).await);
                }

                _ = wait_for_tick(&mut ticker) => {
                    debug!("Triggering periodic sync");
                    match sync_fn(SyncRequest::All).await {
                        Ok(SyncResult { files_error: Some(e), .. }) => {
                            error!("Periodic file sync failed: {}", e)
                        }
                        Ok(result) => info!(
                            "Periodic sync completed: {} file(s) moved, {} fragment(s) pulled",
                            result.files_uploaded + result.files_downloaded + result.files_deleted,
                            result.fragments_pulled
                        ),
                        Err(e) => error!("Periodic sync failed: {}", e),
                    }
                }
            }

            // Recreate the ticker if the mode changed.
            let expected = self.mode.read().await.interval();
            if expected != current {
                current = expected;
                ticker = current.map(periodic);
            }
        }
    }
}

fn periodic(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn wait_for_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
