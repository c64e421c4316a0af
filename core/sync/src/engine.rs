//! Core sync engine that orchestrates file and record sync.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{info, warn};

use anchorsync_common::Result;
use anchorsync_storage::{LocalStore, RemoteStore};

use crate::config::SyncConfig;
use crate::files::FileSyncEngine;
use crate::record_sync::{RecordSyncEngine, RecordSyncReport};
use crate::records::RecordStore;
use crate::scheduler::{SyncRequest, SyncResult, SyncScheduler, SyncSchedulerHandle};
use crate::state::FileSyncReport;

/// Facade over the file and record engines sharing one local store.
pub struct SyncEngine<S: LocalStore + ?Sized, R: RemoteStore + ?Sized> {
    files: FileSyncEngine<S, R>,
    records: RecordStore<S>,
    record_sync: RecordSyncEngine<S, R>,
    /// Held for the duration of a round.
    round: Mutex<()>,
    scheduler: Option<SyncScheduler>,
    config: SyncConfig,
}

impl<S: LocalStore + ?Sized, R: RemoteStore + ?Sized> SyncEngine<S, R> {
    /// Create a new sync engine.
    pub fn new(store: Arc<S>, remote: Arc<R>, config: SyncConfig) -> Self {
        Self {
            files: FileSyncEngine::new(store.clone(), remote.clone(), &config),
            records: RecordStore::new(store.clone(), &config),
            record_sync: RecordSyncEngine::new(store, remote, &config),
            round: Mutex::new(()),
            scheduler: None,
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn files(&self) -> &FileSyncEngine<S, R> {
        &self.files
    }

    pub fn records(&self) -> &RecordStore<S> {
        &self.records
    }

    pub fn record_sync(&self) -> &RecordSyncEngine<S, R> {
        &self.record_sync
    }

    /// Initialize the scheduler and return a handle for running it.
    pub fn init_scheduler(&mut self) -> SyncSchedulerHandle {
        let (scheduler, handle) = SyncScheduler::new(self.config.sync_mode.clone());
        self.scheduler = Some(scheduler);
        handle
    }

    /// Get the scheduler for requesting syncs.
    pub fn scheduler(&self) -> Option<&SyncScheduler> {
        self.scheduler.as_ref()
    }

    /// Compute the file status against the remote and execute it.
    pub async fn sync_files(&self) -> Result<FileSyncReport> {
        let _round = self.round.lock().await;
        let entries = self.files.status(true).await?;
        self.files.sync(&entries).await
    }

    /// Run a record sync round.
    pub async fn sync_records(&self, full: bool) -> Result<RecordSyncReport> {
        let _round = self.round.lock().await;
        if full {
            self.record_sync.sync_full().await
        } else {
            self.record_sync.sync().await
        }
    }

    /// Sync records, then files.
    ///
    /// Only a failed record round is an error. A failed file step is
    /// carried in [`SyncResult::files_error`] so the touched records still
    /// reach the caller.
    pub async fn sync_all(&self) -> Result<SyncResult> {
        let start = Instant::now();
        let records = self.sync_records(false).await?;

        let result = match self.sync_files().await {
            Ok(files) => merge(Some(&files), Some(&records), start),
            Err(e) => {
                warn!("File sync failed after record sync: {}", e);
                let mut result = merge(None, Some(&records), start);
                result.files_error = Some(e);
                result
            }
        };

        info!(
            "Sync completed in {:?}: {} record(s) touched",
            result.duration,
            result.touched.len()
        );
        Ok(result)
    }

    /// Process a sync request (for scheduler).
    pub async fn process_request(&self, request: SyncRequest) -> Result<SyncResult> {
        let start = Instant::now();
        match request {
            SyncRequest::Files => {
                let files = self.sync_files().await?;
                Ok(merge(Some(&files), None, start))
            }
            SyncRequest::Records { full } => {
                let records = self.sync_records(full).await?;
                Ok(merge(None, Some(&records), start))
            }
            SyncRequest::All => self.sync_all().await,
            SyncRequest::Shutdown => Ok(SyncResult::default()),
        }
    }
}

fn merge(files: Option<&FileSyncReport>, records: Option<&RecordSyncReport>, start: Instant) -> SyncResult {
    let mut result = SyncResult::default();
    if let Some(files) = files {
        result.files_uploaded = files.uploaded;
        result.files_downloaded = files.downloaded;
        result.files_deleted = files.deleted_remote + files.removed_local;
    }
    if let Some(records) = records {
        result.records_uploaded = records.uploaded;
        result.fragments_pulled = records.fragments;
        result.record_conflict = records.conflict;
        result.records_discarded = records.discarded;
        result.touched = records.touched.clone();
    }
    result.duration = start.elapsed();
    result
}
