//! Versioned record store.
//!
//! Each save appends one fragment and bumps the record's entry in the
//! same local transaction. Saves are optimistic: the caller passes back
//! the version it loaded, and a stale version is refused.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;
use ulid::Generator;

use anchorsync_common::{zone_matches, Error, RecordKey, Result};
use anchorsync_storage::{ColumnInfo, KeyRange, LocalStore, LocalStoreExt, Transaction};

use crate::columns::ColumnRegistry;
use crate::config::SyncConfig;
use crate::fragment::{expand, RecordFragment, UNCONFIRMED_ANCHOR};
use crate::schema::{
    entry_key, fragment_key, fragment_prefix, table_prefix, RECORDS_COLUMNS, RECORDS_ENTRIES,
    RECORDS_FRAGMENTS,
};

/// Latest known version of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEntry {
    pub table: String,
    pub id: String,
    pub zone: Option<String>,
    pub version: u64,
    /// Remote-assigned sequence number, once known.
    #[serde(default)]
    pub sequence: Option<i64>,
}

/// In-memory view of a record at one version.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub table: String,
    pub id: String,
    pub zone: Option<String>,
    /// Version this view was built from; 0 for a record never saved.
    pub version: u64,
    pub sequence: Option<i64>,
    pub mtime: Option<DateTime<Utc>>,
    /// Completion flag per page.
    pub complete: BTreeMap<String, bool>,
    pub values: BTreeMap<String, Value>,
}

impl Record {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.table.clone(), self.id.clone())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// Whether a page has been validated.
    pub fn is_complete(&self, page: &str) -> bool {
        self.complete.get(page).copied().unwrap_or(false)
    }

    fn from_fragments(entry: &RecordEntry, fragments: &[RecordFragment], version: Option<u64>) -> Option<Self> {
        let view = expand(fragments, version)?;
        Some(Self {
            table: entry.table.clone(),
            id: entry.id.clone(),
            zone: entry.zone.clone(),
            version: view.version,
            sequence: entry.sequence,
            mtime: Some(view.mtime),
            complete: view.complete,
            values: view.values,
        })
    }
}

/// Local store of versioned records, scoped to an optional zone.
pub struct RecordStore<S: LocalStore + ?Sized> {
    store: Arc<S>,
    zone: Option<String>,
    username: String,
    columns: ColumnRegistry<S>,
    ids: Mutex<Generator>,
}

impl<S: LocalStore + ?Sized> RecordStore<S> {
    pub fn new(store: Arc<S>, config: &SyncConfig) -> Self {
        Self {
            columns: ColumnRegistry::new(store.clone()),
            store,
            zone: config.zone.clone(),
            username: config.username.clone(),
            ids: Mutex::new(Generator::new()),
        }
    }

    pub fn zone(&self) -> Option<&str> {
        self.zone.as_deref()
    }

    pub fn columns(&self) -> &ColumnRegistry<S> {
        &self.columns
    }

    /// A new, unsaved record in the current zone.
    pub fn create(&self, table: &str) -> Result<Record> {
        let id = self
            .ids
            .lock()
            .generate()
            .map_err(|e| Error::Storage(format!("Failed to generate record id: {}", e)))?;

        Ok(Record {
            table: table.to_string(),
            id: id.to_string(),
            zone: self.zone.clone(),
            version: 0,
            sequence: None,
            mtime: None,
            complete: BTreeMap::new(),
            values: BTreeMap::new(),
        })
    }

    fn check_zone(&self, key: &RecordKey, zone: Option<&str>) -> Result<()> {
        if zone_matches(self.zone.as_deref(), zone) {
            return Ok(());
        }
        Err(Error::ZoneMismatch {
            key: key.to_string(),
            expected: self.zone.clone(),
            found: zone.map(str::to_string),
        })
    }

    async fn read_entry(&self, key: &RecordKey) -> Result<Option<(Vec<u8>, RecordEntry)>> {
        let entry_key = entry_key(&key.table, &key.id);
        match self.store.get(RECORDS_ENTRIES, &entry_key).await? {
            Some(bytes) => {
                let entry = anchorsync_storage::local::decode(RECORDS_ENTRIES, &entry_key, &bytes)?;
                Ok(Some((bytes, entry)))
            }
            None => Ok(None),
        }
    }

    async fn read_fragments(&self, table: &str, id: &str) -> Result<Vec<RecordFragment>> {
        Ok(self
            .store
            .scan_json::<RecordFragment>(RECORDS_FRAGMENTS, KeyRange::prefix(fragment_prefix(table, id)))
            .await?
            .into_iter()
            .map(|(_, fragment)| fragment)
            .collect())
    }

    /// Save the values of one page as a new version.
    ///
    /// `record.version` must equal the stored version (0 for a new record).
    ///
    /// # Errors
    /// - `ZoneMismatch` if the record belongs to another zone
    /// - `VersionConflict` if the record was saved since it was loaded
    /// - `NotFound` if the record has been deleted
    pub async fn save(
        &self,
        record: &Record,
        page: &str,
        fields: BTreeMap<String, Value>,
        complete: bool,
    ) -> Result<Record> {
        if page.is_empty() {
            return Err(Error::InvalidInput("Page name is empty".to_string()));
        }

        let key = record.key();
        self.check_zone(&key, record.zone.as_deref())?;

        let stored = self.read_entry(&key).await?;
        let (raw, mut entry) = match stored {
            Some((raw, entry)) => {
                self.check_zone(&key, entry.zone.as_deref())?;
                (Some(raw), entry)
            }
            None => (
                None,
                RecordEntry {
                    table: record.table.clone(),
                    id: record.id.clone(),
                    zone: record.zone.clone(),
                    version: 0,
                    sequence: None,
                },
            ),
        };

        if record.version != entry.version {
            return Err(Error::VersionConflict {
                key: key.to_string(),
                expected: record.version,
                found: entry.version,
            });
        }

        let mut fragments = self.read_fragments(&key.table, &key.id).await?;
        if fragments.last().is_some_and(RecordFragment::is_tombstone) {
            return Err(Error::NotFound(format!("Record {} has been deleted", key)));
        }

        let field_names: Vec<String> = fields.keys().cloned().collect();
        entry.version += 1;
        let fragment = RecordFragment {
            table: entry.table.clone(),
            id: entry.id.clone(),
            zone: entry.zone.clone(),
            version: entry.version,
            page: Some(page.to_string()),
            username: self.username.clone(),
            mtime: Utc::now(),
            anchor: UNCONFIRMED_ANCHOR,
            complete,
            values: fields,
        };

        let mut tx = Transaction::new(&[RECORDS_ENTRIES, RECORDS_FRAGMENTS, RECORDS_COLUMNS]);
        tx.expect(RECORDS_ENTRIES, entry_key(&key.table, &key.id), raw);
        tx.put_json(RECORDS_ENTRIES, entry_key(&key.table, &key.id), &entry)?;
        tx.put_json(
            RECORDS_FRAGMENTS,
            fragment_key(&key.table, &key.id, entry.version),
            &fragment,
        )?;
        self.columns
            .register_fields(&mut tx, &key.table, page, &field_names)
            .await?;

        self.commit_versioned(&key, record.version, tx).await?;
        debug!("Saved {} page {} as version {}", key, page, entry.version);

        fragments.push(fragment);
        Record::from_fragments(&entry, &fragments, None)
            .ok_or_else(|| Error::Storage(format!("Record {} has no visible version", key)))
    }

    /// Save a page and mark it complete.
    pub async fn validate(
        &self,
        record: &Record,
        page: &str,
        fields: BTreeMap<String, Value>,
    ) -> Result<Record> {
        self.save(record, page, fields, true).await
    }

    /// Commit a versioned write, mapping a lost race to `VersionConflict`.
    async fn commit_versioned(&self, key: &RecordKey, expected: u64, tx: Transaction) -> Result<()> {
        match self.store.commit(tx).await {
            Err(Error::Conflict(_)) => {
                let found = self
                    .read_entry(key)
                    .await?
                    .map(|(_, entry)| entry.version)
                    .unwrap_or(0);
                Err(Error::VersionConflict {
                    key: key.to_string(),
                    expected,
                    found,
                })
            }
            other => other,
        }
    }

    /// Delete a record by appending a tombstone.
    ///
    /// # Errors
    /// - `NotFound` if the record does not exist or is already deleted
    /// - `ZoneMismatch` if the record belongs to another zone
    pub async fn delete(&self, table: &str, id: &str) -> Result<()> {
        let key = RecordKey::new(table, id);
        let Some((raw, mut entry)) = self.read_entry(&key).await? else {
            return Err(Error::NotFound(format!("Record {} not found", key)));
        };
        self.check_zone(&key, entry.zone.as_deref())?;

        let fragments = self.read_fragments(table, id).await?;
        if fragments.last().is_some_and(RecordFragment::is_tombstone) {
            return Err(Error::NotFound(format!("Record {} has been deleted", key)));
        }

        let expected = entry.version;
        entry.version += 1;
        let tombstone = RecordFragment {
            table: table.to_string(),
            id: id.to_string(),
            zone: entry.zone.clone(),
            version: entry.version,
            page: None,
            username: self.username.clone(),
            mtime: Utc::now(),
            anchor: UNCONFIRMED_ANCHOR,
            complete: false,
            values: BTreeMap::new(),
        };

        let mut tx = Transaction::new(&[RECORDS_ENTRIES, RECORDS_FRAGMENTS]);
        tx.expect(RECORDS_ENTRIES, entry_key(table, id), Some(raw));
        tx.put_json(RECORDS_ENTRIES, entry_key(table, id), &entry)?;
        tx.put_json(RECORDS_FRAGMENTS, fragment_key(table, id, entry.version), &tombstone)?;
        self.commit_versioned(&key, expected, tx).await?;

        debug!("Deleted {} at version {}", key, entry.version);
        Ok(())
    }

    /// Load a record at `version`, or at its latest version.
    ///
    /// Returns `None` if the record is unknown, deleted, or has no
    /// fragment at or below the requested version.
    ///
    /// # Errors
    /// - `ZoneMismatch` if the record belongs to another zone
    pub async fn load(&self, table: &str, id: &str, version: Option<u64>) -> Result<Option<Record>> {
        let key = RecordKey::new(table, id);
        let Some((_, entry)) = self.read_entry(&key).await? else {
            return Ok(None);
        };
        self.check_zone(&key, entry.zone.as_deref())?;

        let fragments = self.read_fragments(table, id).await?;
        Ok(Record::from_fragments(&entry, &fragments, version))
    }

    /// Every live record of a table visible in the current zone.
    pub async fn load_all(&self, table: &str) -> Result<Vec<Record>> {
        let prefix = table_prefix(table);
        let entries = self
            .store
            .scan_json::<RecordEntry>(RECORDS_ENTRIES, KeyRange::prefix(prefix.clone()))
            .await?;

        let mut fragments: HashMap<String, Vec<RecordFragment>> = HashMap::new();
        for (_, fragment) in self
            .store
            .scan_json::<RecordFragment>(RECORDS_FRAGMENTS, KeyRange::prefix(prefix))
            .await?
        {
            fragments.entry(fragment.id.clone()).or_default().push(fragment);
        }

        let records: Vec<Record> = entries
            .into_iter()
            .map(|(_, entry)| entry)
            .filter(|entry| zone_matches(self.zone.as_deref(), entry.zone.as_deref()))
            .filter_map(|entry| {
                let history = fragments.get(&entry.id)?;
                Record::from_fragments(&entry, history, None)
            })
            .collect();

        debug!("Loaded {} record(s) from {}", records.len(), table);
        Ok(records)
    }

    /// Raw column metadata of a table.
    pub async fn list_columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        self.columns.list(table).await
    }

    /// Latest entry of a record, if known.
    pub async fn entry(&self, table: &str, id: &str) -> Result<Option<RecordEntry>> {
        self.store.get_json(RECORDS_ENTRIES, &entry_key(table, id)).await
    }
}
