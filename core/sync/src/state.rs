//! Per-path sync state and the outcome of a sync round.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use anchorsync_common::Digest;

/// Direction-specific work carried by a push or pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transfer {
    /// Copy content to the other side.
    Copy,
    /// Remove the path on the other side.
    Remove,
}

/// Why a path cannot be reconciled automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictKind {
    /// Local and remote both diverged from the last synced content.
    BothModified,
    /// Local changed while the remote copy was deleted.
    DeletedRemotely,
    /// Local was deleted while the remote copy changed.
    DeletedLocally,
}

/// Action required to reconcile one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncAction {
    /// Both sides agree.
    Noop,
    /// Local is ahead of the remote.
    Push(Transfer),
    /// Remote is ahead of local.
    Pull(Transfer),
    /// Both sides diverged; user intervention required.
    Conflict(ConflictKind),
}

impl SyncAction {
    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncAction::Conflict(_))
    }

    /// Short label used in status listings.
    pub fn label(&self) -> &'static str {
        match self {
            SyncAction::Noop => "ok",
            SyncAction::Push(Transfer::Copy) => "push",
            SyncAction::Push(Transfer::Remove) => "push-delete",
            SyncAction::Pull(Transfer::Copy) => "pull",
            SyncAction::Pull(Transfer::Remove) => "pull-delete",
            SyncAction::Conflict(_) => "conflict",
        }
    }
}

/// Three-way state of a single path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEntry {
    /// Path of the file.
    pub path: String,
    /// Local digest (`None` if deleted locally or never stored).
    pub local: Option<Digest>,
    /// Digest at the last successful sync.
    pub marker: Option<Digest>,
    /// Remote digest (`None` if absent remotely).
    pub remote: Option<Digest>,
    /// Remote size, when the remote was consulted.
    pub remote_size: Option<u64>,
    /// Reconciling action.
    pub action: SyncAction,
}

/// Counts of a status listing by action.
pub fn count_by_action(entries: &[SyncEntry]) -> HashMap<SyncAction, usize> {
    let mut counts = HashMap::new();
    for entry in entries {
        *counts.entry(entry.action).or_insert(0) += 1;
    }
    counts
}

/// Paths that are in conflict, in listing order.
pub fn conflicted_paths(entries: &[SyncEntry]) -> Vec<String> {
    entries
        .iter()
        .filter(|e| e.action.is_conflict())
        .map(|e| e.path.clone())
        .collect()
}

/// What happened to a single path during a sync round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Uploaded,
    DeletedRemote,
    Downloaded,
    RemovedLocal,
    Unchanged,
}

/// Summary of a file sync round.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileSyncReport {
    pub uploaded: usize,
    pub deleted_remote: usize,
    pub downloaded: usize,
    pub removed_local: usize,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration: Duration,
}

impl FileSyncReport {
    pub(crate) fn record(&mut self, outcome: FileOutcome) {
        match outcome {
            FileOutcome::Uploaded => self.uploaded += 1,
            FileOutcome::DeletedRemote => self.deleted_remote += 1,
            FileOutcome::Downloaded => self.downloaded += 1,
            FileOutcome::RemovedLocal => self.removed_local += 1,
            FileOutcome::Unchanged => {}
        }
    }

    /// Number of paths that changed on either side.
    pub fn total(&self) -> usize {
        self.uploaded + self.deleted_remote + self.downloaded + self.removed_local
    }
}
