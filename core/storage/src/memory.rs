//! In-memory remote store for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use anchorsync_common::{Digest, Error, RecordKey, Result};
use anchorsync_crypto::ContentHasher;

use crate::provider::{
    ColumnInfo, RemoteFile, RemoteFragment, RemoteRecord, RemoteStore, UploadFragment, UploadRecord,
};

#[derive(Debug, Clone)]
struct StoredFile {
    data: Vec<u8>,
    digest: Digest,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    zone: Option<String>,
    sequence: i64,
    fragments: Vec<RemoteFragment>,
}

impl StoredRecord {
    fn version(&self) -> u64 {
        self.fragments.last().map(|f| f.version).unwrap_or(0)
    }

    fn is_deleted(&self) -> bool {
        self.fragments.last().is_some_and(|f| f.page.is_none())
    }
}

#[derive(Default)]
struct State {
    files: BTreeMap<String, StoredFile>,
    records: HashMap<RecordKey, StoredRecord>,
    /// Columns by table, then by column key.
    columns: BTreeMap<String, BTreeMap<String, ColumnInfo>>,
    /// Last column appended to each table's chain.
    column_tails: HashMap<String, String>,
    last_anchor: i64,
    last_sequence: i64,
}

impl State {
    fn next_anchor(&mut self) -> i64 {
        self.last_anchor += 1;
        self.last_anchor
    }

    fn register_columns(&mut self, table: &str, page: &str, fields: impl Iterator<Item = String>) {
        for field in fields {
            let key = format!("{}/{}", page, field);
            if self
                .columns
                .get(table)
                .is_some_and(|columns| columns.contains_key(&key))
            {
                continue;
            }

            let tail = self.column_tails.get(table).cloned();
            let anchor = self.next_anchor();
            let columns = self.columns.entry(table.to_string()).or_default();

            if let Some(prev) = tail.as_ref().and_then(|t| columns.get_mut(t)) {
                prev.after = Some(key.clone());
                prev.anchor = anchor;
            }
            columns.insert(
                key.clone(),
                ColumnInfo {
                    table: table.to_string(),
                    page: page.to_string(),
                    field,
                    variant: None,
                    before: tail,
                    after: None,
                    anchor,
                },
            );
            self.column_tails.insert(table.to_string(), key);
        }
    }
}

fn same_fragment(stored: &RemoteFragment, upload: &UploadFragment) -> bool {
    stored.page == upload.page && stored.mtime == upload.mtime && stored.values == upload.values
}

/// In-memory remote store.
///
/// Behaves like the authoritative server: it assigns anchors and
/// sequence numbers, rejects stale writes with a conflict, and registers
/// columns for newly seen fields. Useful for testing and development.
pub struct MemoryRemote {
    hasher: ContentHasher,
    state: Mutex<State>,
    offline: AtomicBool,
}

impl MemoryRemote {
    /// Create a new empty remote.
    pub fn new() -> Self {
        Self {
            hasher: ContentHasher::new(),
            state: Mutex::new(State::default()),
            offline: AtomicBool::new(false),
        }
    }

    /// Simulate connectivity loss: every call fails with `Error::Network`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Write a file directly, as another client would.
    pub fn put_file(&self, path: &str, data: Vec<u8>) -> Digest {
        let digest = self.hasher.digest_bytes(&data);
        self.state
            .lock()
            .files
            .insert(path.to_string(), StoredFile { data, digest });
        digest
    }

    /// Remove a file directly, as another client would.
    pub fn remove_file(&self, path: &str) {
        self.state.lock().files.remove(path);
    }

    /// Current remote content of a file.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(path).map(|f| f.data.clone())
    }

    /// Latest accepted version of a record (0 if unknown).
    pub fn record_version(&self, key: &RecordKey) -> u64 {
        self.state
            .lock()
            .records
            .get(key)
            .map(StoredRecord::version)
            .unwrap_or(0)
    }

    /// Highest anchor handed out so far.
    pub fn last_anchor(&self) -> i64 {
        self.state.lock().last_anchor
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Network("Remote unreachable".to_string()));
        }
        Ok(())
    }

    fn check_upload(state: &State, upload: &UploadRecord) -> Result<()> {
        let key = RecordKey::new(upload.table.clone(), upload.id.clone());
        let Some(stored) = state.records.get(&key) else {
            let mut expected = 1;
            for fragment in &upload.fragments {
                if fragment.version != expected {
                    return Err(Error::Conflict(format!("{} expects version {}", key, expected)));
                }
                expected += 1;
            }
            return Ok(());
        };

        if stored.zone != upload.zone {
            return Err(Error::RemoteRejected {
                status: 403,
                message: format!("Record {} belongs to another zone", key),
            });
        }

        let mut version = stored.version();
        let mut deleted = stored.is_deleted();
        for fragment in &upload.fragments {
            if fragment.version <= stored.version() {
                // Already accepted earlier; only an identical resend is fine.
                let previous = stored
                    .fragments
                    .iter()
                    .find(|f| f.version == fragment.version);
                if !previous.is_some_and(|p| same_fragment(p, fragment)) {
                    return Err(Error::Conflict(format!(
                        "{} version {} was superseded",
                        key, fragment.version
                    )));
                }
                continue;
            }
            if deleted || fragment.version != version + 1 {
                return Err(Error::Conflict(format!(
                    "{} expects version {}",
                    key,
                    version + 1
                )));
            }
            version = fragment.version;
            deleted = fragment.page.is_none();
        }

        Ok(())
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list_files(&self) -> Result<Vec<RemoteFile>> {
        self.check_online()?;
        let state = self.state.lock();
        Ok(state
            .files
            .iter()
            .map(|(path, file)| RemoteFile {
                path: path.clone(),
                size: file.data.len() as u64,
                digest: file.digest,
            })
            .collect())
    }

    async fn download_file(&self, path: &str) -> Result<Vec<u8>> {
        self.check_online()?;
        self.file(path)
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", path)))
    }

    async fn upload_file(&self, path: &str, data: Vec<u8>, expected: Option<Digest>) -> Result<()> {
        self.check_online()?;
        let digest = self.hasher.digest_bytes(&data);

        let mut state = self.state.lock();
        let current = state.files.get(path).map(|f| f.digest);
        if current != expected {
            return Err(Error::Conflict(format!("File {} changed remotely", path)));
        }
        state
            .files
            .insert(path.to_string(), StoredFile { data, digest });
        Ok(())
    }

    async fn delete_file(&self, path: &str, expected: Option<Digest>) -> Result<()> {
        self.check_online()?;
        let mut state = self.state.lock();
        let Some(current) = state.files.get(path).map(|f| f.digest) else {
            return Ok(());
        };
        if expected.is_some_and(|e| e != current) {
            return Err(Error::Conflict(format!("File {} changed remotely", path)));
        }
        state.files.remove(path);
        Ok(())
    }

    async fn sync_records(&self, uploads: Vec<UploadRecord>) -> Result<()> {
        self.check_online()?;
        let mut state = self.state.lock();

        // All or nothing: validate the whole batch before applying any of it.
        for upload in &uploads {
            Self::check_upload(&state, upload)?;
        }

        for upload in uploads {
            let key = RecordKey::new(upload.table.clone(), upload.id.clone());
            if !state.records.contains_key(&key) {
                state.last_sequence += 1;
                let sequence = state.last_sequence;
                state.records.insert(
                    key.clone(),
                    StoredRecord {
                        zone: upload.zone.clone(),
                        sequence,
                        fragments: Vec::new(),
                    },
                );
            }

            for fragment in upload.fragments {
                let current = state.records.get(&key).map(StoredRecord::version).unwrap_or(0);
                if fragment.version <= current {
                    continue;
                }
                if let Some(page) = &fragment.page {
                    state.register_columns(&upload.table, page, fragment.values.keys().cloned());
                }
                let anchor = state.next_anchor();
                if let Some(record) = state.records.get_mut(&key) {
                    record.fragments.push(RemoteFragment {
                        mtime: fragment.mtime,
                        version: fragment.version,
                        page: fragment.page,
                        username: fragment.username,
                        complete: fragment.complete,
                        values: fragment.values,
                        anchor,
                    });
                }
            }
        }

        Ok(())
    }

    async fn load_columns(&self, anchor: i64) -> Result<Vec<ColumnInfo>> {
        self.check_online()?;
        let state = self.state.lock();
        let mut columns: Vec<ColumnInfo> = state
            .columns
            .values()
            .flat_map(|table| table.values())
            .filter(|c| c.anchor > anchor)
            .cloned()
            .collect();
        columns.sort_by_key(|c| c.anchor);
        Ok(columns)
    }

    async fn load_records(&self, anchor: i64) -> Result<Vec<RemoteRecord>> {
        self.check_online()?;
        let state = self.state.lock();

        let mut records: Vec<RemoteRecord> = state
            .records
            .iter()
            .filter_map(|(key, record)| {
                let fragments: Vec<RemoteFragment> = record
                    .fragments
                    .iter()
                    .filter(|f| f.anchor > anchor)
                    .cloned()
                    .collect();
                if fragments.is_empty() {
                    return None;
                }
                Some(RemoteRecord {
                    table: key.table.clone(),
                    id: key.id.clone(),
                    zone: record.zone.clone(),
                    sequence: Some(record.sequence),
                    fragments,
                })
            })
            .collect();
        records.sort_by_key(|r| r.fragments.last().map(|f| f.anchor).unwrap_or(0));
        Ok(records)
    }
}
