//! File store and file sync engine.
//!
//! Files live in three local collections: metadata in [`FILES`], content
//! in [`FILES_BLOB`] and the digest at the last successful sync in
//! [`FILES_SYNC_MARKER`]. A deletion leaves a tombstone (metadata without
//! a digest) until it has been pushed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use anchorsync_common::{Digest, Error, Result};
use anchorsync_crypto::ContentHasher;
use anchorsync_storage::local::decode;
use anchorsync_storage::{KeyRange, LocalStore, LocalStoreExt, RemoteStore, Transaction};

use crate::batch::run_batched;
use crate::config::SyncConfig;
use crate::conflict::classify;
use crate::schema::{FILES, FILES_BLOB, FILES_SYNC_MARKER};
use crate::state::{conflicted_paths, FileOutcome, FileSyncReport, SyncAction, SyncEntry};

/// Metadata of a stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub path: String,
    pub size: u64,
    /// `None` marks a local deletion not yet pushed.
    pub digest: Option<Digest>,
    pub mtime: DateTime<Utc>,
}

impl File {
    pub fn is_tombstone(&self) -> bool {
        self.digest.is_none()
    }
}

/// A file together with its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub file: File,
    pub data: Vec<u8>,
}

/// Local file store with three-way sync against a remote.
pub struct FileSyncEngine<S: LocalStore + ?Sized, R: RemoteStore + ?Sized> {
    store: Arc<S>,
    remote: Arc<R>,
    hasher: ContentHasher,
    concurrency: usize,
}

impl<S: LocalStore + ?Sized, R: RemoteStore + ?Sized> FileSyncEngine<S, R> {
    pub fn new(store: Arc<S>, remote: Arc<R>, config: &SyncConfig) -> Self {
        Self {
            store,
            remote,
            hasher: ContentHasher::new().with_chunk_size(config.chunk_size),
            concurrency: config.concurrency.max(1),
        }
    }

    /// Store a file locally.
    ///
    /// # Errors
    /// - `InvalidInput` for an empty path
    pub async fn save(&self, path: &str, data: Vec<u8>) -> Result<File> {
        if path.is_empty() {
            return Err(Error::InvalidInput("File path is empty".to_string()));
        }

        let file = File {
            path: path.to_string(),
            size: data.len() as u64,
            digest: Some(self.hasher.digest_bytes(&data)),
            mtime: Utc::now(),
        };

        let mut tx = Transaction::new(&[FILES, FILES_BLOB]);
        tx.put_json(FILES, path, &file)?;
        tx.put(FILES_BLOB, path, data);
        self.store.commit(tx).await?;

        debug!("Saved {} ({} bytes)", path, file.size);
        Ok(file)
    }

    /// Load a file; `None` if absent or deleted.
    pub async fn load(&self, path: &str) -> Result<Option<FileContent>> {
        let file: Option<File> = self.store.get_json(FILES, path).await?;
        let file = match file {
            Some(file) if !file.is_tombstone() => file,
            _ => return Ok(None),
        };

        Ok(self
            .store
            .get(FILES_BLOB, path)
            .await?
            .map(|data| FileContent { file, data }))
    }

    /// Delete a file locally, leaving a tombstone to push.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let tombstone = File {
            path: path.to_string(),
            size: 0,
            digest: None,
            mtime: Utc::now(),
        };

        let mut tx = Transaction::new(&[FILES, FILES_BLOB]);
        tx.put_json(FILES, path, &tombstone)?;
        tx.delete(FILES_BLOB, path);
        self.store.commit(tx).await?;

        debug!("Deleted {}", path);
        Ok(())
    }

    /// Every live local file, by path.
    pub async fn list(&self) -> Result<Vec<File>> {
        Ok(self
            .store
            .scan_json::<File>(FILES, KeyRange::All)
            .await?
            .into_iter()
            .map(|(_, file)| file)
            .filter(|file| !file.is_tombstone())
            .collect())
    }

    /// Compute the three-way state of every known path.
    ///
    /// Without `include_remote` the remote is assumed to still hold the
    /// marker content, which lists purely local changes while offline.
    pub async fn status(&self, include_remote: bool) -> Result<Vec<SyncEntry>> {
        let local: BTreeMap<String, Option<Digest>> = self
            .store
            .scan_json::<File>(FILES, KeyRange::All)
            .await?
            .into_iter()
            .map(|(path, file)| (path, file.digest))
            .collect();

        let markers: BTreeMap<String, Digest> = self
            .store
            .scan_json::<Digest>(FILES_SYNC_MARKER, KeyRange::All)
            .await?
            .into_iter()
            .collect();

        let remote: BTreeMap<String, (Digest, Option<u64>)> = if include_remote {
            self.remote
                .list_files()
                .await?
                .into_iter()
                .map(|f| (f.path, (f.digest, Some(f.size))))
                .collect()
        } else {
            markers
                .iter()
                .map(|(path, digest)| (path.clone(), (*digest, None)))
                .collect()
        };

        let paths: BTreeSet<&String> = local.keys().chain(markers.keys()).chain(remote.keys()).collect();

        let entries: Vec<SyncEntry> = paths
            .into_iter()
            .map(|path| {
                let local_digest = local.get(path).copied().flatten();
                let marker = markers.get(path).copied();
                let (remote_digest, remote_size) = match remote.get(path) {
                    Some((digest, size)) => (Some(*digest), *size),
                    None => (None, None),
                };
                SyncEntry {
                    path: path.clone(),
                    local: local_digest,
                    marker,
                    remote: remote_digest,
                    remote_size,
                    action: classify(local_digest, marker, remote_digest, local.contains_key(path)),
                }
            })
            .collect();

        debug!("Status computed for {} path(s)", entries.len());
        Ok(entries)
    }

    /// Execute the actions of a status listing.
    ///
    /// Refuses to start while any entry is in conflict. Transfers run in
    /// batches of the configured width; a failed batch stops the round.
    ///
    /// # Errors
    /// - `UnresolvedConflicts` if any entry is in conflict
    /// - `PartialFailure` listing each failed path
    pub async fn sync(&self, entries: &[SyncEntry]) -> Result<FileSyncReport> {
        let conflicts = conflicted_paths(entries);
        if !conflicts.is_empty() {
            warn!("Refusing to sync with {} conflict(s)", conflicts.len());
            return Err(Error::UnresolvedConflicts(conflicts));
        }

        let start = Instant::now();
        let actionable: Vec<&SyncEntry> = entries
            .iter()
            .filter(|e| e.action != SyncAction::Noop)
            .collect();
        let paths: Vec<String> = actionable.iter().map(|e| e.path.clone()).collect();

        info!("Starting file sync of {} path(s)", actionable.len());

        let results = run_batched(actionable, self.concurrency, |entry| self.execute(entry)).await;

        let mut report = FileSyncReport::default();
        let mut failures = Vec::new();
        for (path, result) in paths.into_iter().zip(results) {
            match result {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    warn!("Sync of {} failed: {}", path, e);
                    failures.push((path, e));
                }
            }
        }

        if !failures.is_empty() {
            return Err(Error::PartialFailure { failures });
        }

        report.duration = start.elapsed();
        report.finished_at = Some(Utc::now());
        info!(
            "File sync completed: {} uploaded, {} downloaded, {} deleted remotely, {} removed locally",
            report.uploaded, report.downloaded, report.deleted_remote, report.removed_local
        );
        Ok(report)
    }

    async fn execute(&self, entry: &SyncEntry) -> Result<FileOutcome> {
        match entry.action {
            SyncAction::Noop => Ok(FileOutcome::Unchanged),
            SyncAction::Push(_) => self.push(entry).await,
            SyncAction::Pull(_) => self.pull(entry).await,
            SyncAction::Conflict(_) => Err(Error::UnresolvedConflicts(vec![entry.path.clone()])),
        }
    }

    /// Current metadata of a path, raw and decoded.
    ///
    /// Fails with `Conflict` if the local digest is no longer the one the
    /// status listing saw; the action was computed for a different file.
    async fn observe(&self, entry: &SyncEntry) -> Result<(Option<Vec<u8>>, Option<File>)> {
        let path = entry.path.as_str();
        let raw = self.store.get(FILES, path).await?;
        let file: Option<File> = match &raw {
            Some(bytes) => Some(decode(FILES, path, bytes)?),
            None => None,
        };

        if file.as_ref().and_then(|f| f.digest) != entry.local {
            return Err(Error::Conflict(format!(
                "{} changed locally since its status was computed",
                path
            )));
        }
        Ok((raw, file))
    }

    /// Make the remote match local.
    async fn push(&self, entry: &SyncEntry) -> Result<FileOutcome> {
        let path = entry.path.as_str();
        let (before, file) = self.observe(entry).await?;

        if file.and_then(|f| f.digest).is_none() {
            self.remote.delete_file(path, entry.remote).await?;
            self.forget(path, before).await?;

            debug!("Pushed deletion of {}", path);
            return Ok(FileOutcome::DeletedRemote);
        }

        let data = self
            .store
            .get(FILES_BLOB, path)
            .await?
            .ok_or_else(|| Error::Storage(format!("Content of {} is missing", path)))?;
        let digest = self.hasher.digest_bytes(&data);
        if Some(digest) != entry.local {
            return Err(Error::Conflict(format!("{} changed while being read", path)));
        }

        self.remote.upload_file(path, data, entry.remote).await?;

        let mut tx = Transaction::new(&[FILES_SYNC_MARKER]);
        tx.put_json(FILES_SYNC_MARKER, path, &digest)?;
        self.store.commit(tx).await?;

        debug!("Pushed {}", path);
        Ok(FileOutcome::Uploaded)
    }

    /// Make local match the remote.
    async fn pull(&self, entry: &SyncEntry) -> Result<FileOutcome> {
        let path = entry.path.as_str();
        let (before, _) = self.observe(entry).await?;

        if entry.remote.is_none() {
            self.forget(path, before).await?;
            debug!("Removed {} after remote deletion", path);
            return Ok(FileOutcome::RemovedLocal);
        }

        let data = self.remote.download_file(path).await?;
        let digest = self.hasher.digest_bytes(&data);

        let file = File {
            path: path.to_string(),
            size: data.len() as u64,
            digest: Some(digest),
            mtime: Utc::now(),
        };

        // Local edits made while downloading must not be overwritten.
        let mut tx = Transaction::new(&[FILES, FILES_BLOB, FILES_SYNC_MARKER]);
        tx.expect(FILES, path, before);
        tx.put_json(FILES, path, &file)?;
        tx.put(FILES_BLOB, path, data);
        tx.put_json(FILES_SYNC_MARKER, path, &digest)?;
        self.store.commit(tx).await?;

        debug!("Pulled {}", path);
        Ok(FileOutcome::Downloaded)
    }

    /// Remove every local trace of a path, provided its metadata still
    /// reads `before`.
    async fn forget(&self, path: &str, before: Option<Vec<u8>>) -> Result<()> {
        let mut tx = Transaction::new(&[FILES, FILES_BLOB, FILES_SYNC_MARKER]);
        tx.expect(FILES, path, before);
        tx.delete(FILES, path);
        tx.delete(FILES_BLOB, path);
        tx.delete(FILES_SYNC_MARKER, path);
        self.store.commit(tx).await
    }

    /// Digest of a path at its last successful sync.
    pub async fn marker(&self, path: &str) -> Result<Option<Digest>> {
        self.store.get_json(FILES_SYNC_MARKER, path).await
    }
}
