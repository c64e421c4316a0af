//! Record sync engine.
//!
//! A round uploads every unconfirmed fragment of the zone in one request,
//! then pulls column metadata and fragments newer than the local
//! watermark. Pulled fragments, their entries and the new watermark are
//! written in a single local transaction.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use anchorsync_common::{zone_matches, Error, RecordKey, Result};
use anchorsync_storage::{KeyRange, LocalStore, LocalStoreExt, RemoteStore, Transaction, UploadRecord};

use crate::columns::ColumnRegistry;
use crate::config::SyncConfig;
use crate::fragment::RecordFragment;
use crate::records::RecordEntry;
use crate::schema::{
    anchor_key, entry_key, fragment_key, fragment_prefix, RECORDS_ANCHOR, RECORDS_ENTRIES,
    RECORDS_FRAGMENTS,
};

/// Summary of a record sync round.
#[derive(Debug, Clone, Default)]
pub struct RecordSyncReport {
    /// Records whose pending fragments were submitted.
    pub uploaded: usize,
    /// Whether the remote refused the upload as stale.
    pub conflict: bool,
    /// Unconfirmed local fragments dropped because the remote moved past
    /// the version they were written on.
    pub discarded: usize,
    /// Column entries received.
    pub columns: usize,
    /// Fragments received.
    pub fragments: usize,
    /// Records changed by this round, uploaded or pulled.
    pub touched: BTreeSet<RecordKey>,
    /// Watermark after the round.
    pub watermark: i64,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration: Duration,
}

/// Synchronizes local records with the remote.
pub struct RecordSyncEngine<S: LocalStore + ?Sized, R: RemoteStore + ?Sized> {
    store: Arc<S>,
    remote: Arc<R>,
    columns: ColumnRegistry<S>,
    zone: Option<String>,
}

impl<S: LocalStore + ?Sized, R: RemoteStore + ?Sized> RecordSyncEngine<S, R> {
    pub fn new(store: Arc<S>, remote: Arc<R>, config: &SyncConfig) -> Self {
        Self {
            columns: ColumnRegistry::new(store.clone()),
            store,
            remote,
            zone: config.zone.clone(),
        }
    }

    /// Current pull watermark of the zone.
    pub async fn watermark(&self) -> Result<i64> {
        Ok(self
            .store
            .get_json::<i64>(RECORDS_ANCHOR, &anchor_key(self.zone.as_deref()))
            .await?
            .unwrap_or(0))
    }

    /// Upload pending fragments and pull everything past the watermark.
    ///
    /// A conflict on upload is reported, not raised; the pull still runs
    /// so the caller can re-apply its edits on fresh versions.
    pub async fn sync(&self) -> Result<RecordSyncReport> {
        let watermark = self.watermark().await?;
        self.round(watermark).await
    }

    /// Like [`sync`](Self::sync), but pull the whole history again.
    pub async fn sync_full(&self) -> Result<RecordSyncReport> {
        self.round(0).await
    }

    async fn round(&self, watermark: i64) -> Result<RecordSyncReport> {
        let start = Instant::now();
        let mut report = RecordSyncReport::default();

        info!("Starting record sync from anchor {}", watermark);

        let uploads = self.pending_uploads().await?;
        let mut accepted: HashSet<RecordKey> = HashSet::new();
        if !uploads.is_empty() {
            let keys: Vec<RecordKey> = uploads
                .iter()
                .map(|u| RecordKey::new(u.table.clone(), u.id.clone()))
                .collect();

            match self.remote.sync_records(uploads).await {
                Ok(()) => {
                    report.uploaded = keys.len();
                    report.touched.extend(keys.iter().cloned());
                    accepted.extend(keys);
                }
                Err(Error::Conflict(message)) => {
                    warn!("Record upload refused as stale: {}", message);
                    report.conflict = true;
                }
                Err(e) => return Err(e),
            }
        }

        let columns = self.remote.load_columns(watermark).await?;
        report.columns = self.columns.upsert(columns).await?;

        let records = self.remote.load_records(watermark).await?;
        let mut tx = Transaction::new(&[RECORDS_ENTRIES, RECORDS_FRAGMENTS, RECORDS_ANCHOR]);
        let mut max_anchor = watermark.max(self.watermark().await?);

        for record in records {
            let key = RecordKey::new(record.table.clone(), record.id.clone());
            if !zone_matches(self.zone.as_deref(), record.zone.as_deref()) {
                warn!("Skipping {} from zone {:?}", key, record.zone);
                continue;
            }

            let mut fragments = record.fragments;
            fragments.sort_by_key(|f| f.anchor);
            let Some(latest) = fragments.iter().map(|f| f.version).max() else {
                continue;
            };

            // Local edits not yet confirmed. If the remote now holds one of
            // their versions and the upload was not ours, they were written
            // on a superseded base and the whole chain is dropped.
            let (raw_entry, pending) = self.local_pending(&record.table, &record.id).await?;
            let superseded = !accepted.contains(&key) && pending.iter().any(|v| *v <= latest);
            let kept = if superseded {
                for version in &pending {
                    tx.delete(RECORDS_FRAGMENTS, fragment_key(&record.table, &record.id, *version));
                }
                warn!(
                    "Discarding {} unconfirmed fragment(s) of {} superseded by remote version {}",
                    pending.len(),
                    key,
                    latest
                );
                report.discarded += pending.len();
                None
            } else {
                pending.iter().copied().max()
            };

            for fragment in fragments {
                max_anchor = max_anchor.max(fragment.anchor);
                let fragment =
                    RecordFragment::from_remote(&record.table, &record.id, record.zone.clone(), fragment);
                tx.put_json(
                    RECORDS_FRAGMENTS,
                    fragment_key(&record.table, &record.id, fragment.version),
                    &fragment,
                )?;
                report.fragments += 1;
            }

            let entry = RecordEntry {
                table: record.table.clone(),
                id: record.id.clone(),
                zone: record.zone.clone(),
                version: latest.max(kept.unwrap_or(0)),
                sequence: record.sequence,
            };
            // A save racing this round fails the commit instead of being
            // shadowed by an older entry.
            tx.expect(RECORDS_ENTRIES, entry_key(&record.table, &record.id), raw_entry);
            tx.put_json(RECORDS_ENTRIES, entry_key(&record.table, &record.id), &entry)?;
            report.touched.insert(key);
        }

        tx.put_json(RECORDS_ANCHOR, anchor_key(self.zone.as_deref()), &max_anchor)?;
        self.store.commit(tx).await?;

        report.watermark = max_anchor;
        report.duration = start.elapsed();
        report.finished_at = Some(Utc::now());
        info!(
            "Record sync completed: {} uploaded, {} fragment(s) pulled, watermark {}",
            report.uploaded, report.fragments, report.watermark
        );
        Ok(report)
    }

    /// Raw local entry and versions of unconfirmed fragments of one record.
    async fn local_pending(&self, table: &str, id: &str) -> Result<(Option<Vec<u8>>, Vec<u64>)> {
        let raw = self.store.get(RECORDS_ENTRIES, &entry_key(table, id)).await?;
        let pending = self
            .store
            .scan_json::<RecordFragment>(RECORDS_FRAGMENTS, KeyRange::prefix(fragment_prefix(table, id)))
            .await?
            .into_iter()
            .filter(|(_, fragment)| !fragment.is_confirmed())
            .map(|(_, fragment)| fragment.version)
            .collect();
        Ok((raw, pending))
    }

    /// Unconfirmed fragments of the zone, grouped per record in version order.
    async fn pending_uploads(&self) -> Result<Vec<UploadRecord>> {
        let pending = self
            .store
            .scan_json::<RecordFragment>(RECORDS_FRAGMENTS, KeyRange::All)
            .await?;

        let mut uploads: Vec<UploadRecord> = Vec::new();
        let mut index: HashMap<RecordKey, usize> = HashMap::new();

        for (_, fragment) in pending {
            if fragment.is_confirmed() || !zone_matches(self.zone.as_deref(), fragment.zone.as_deref()) {
                continue;
            }

            let key = RecordKey::new(fragment.table.clone(), fragment.id.clone());
            let slot = *index.entry(key).or_insert_with(|| {
                uploads.push(UploadRecord {
                    table: fragment.table.clone(),
                    id: fragment.id.clone(),
                    zone: fragment.zone.clone(),
                    fragments: Vec::new(),
                });
                uploads.len() - 1
            });
            uploads[slot].fragments.push(fragment.to_upload());
        }

        debug!("{} record(s) with pending fragments", uploads.len());
        Ok(uploads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::RecordStore;
    use anchorsync_storage::{MemoryRemote, MemoryStore};
    use serde_json::{json, Value};
    use std::collections::BTreeMap;

    struct Replica {
        records: RecordStore<MemoryStore>,
        sync: RecordSyncEngine<MemoryStore, MemoryRemote>,
    }

    fn replica(remote: &Arc<MemoryRemote>, zone: Option<&str>) -> Replica {
        let mut config = SyncConfig::default().with_username("ana");
        config.zone = zone.map(str::to_string);
        let store = Arc::new(MemoryStore::new());
        Replica {
            records: RecordStore::new(store.clone(), &config),
            sync: RecordSyncEngine::new(store, remote.clone(), &config),
        }
    }

    fn values(value: Value) -> BTreeMap<String, Value> {
        match value {
            Value::Object(map) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_upload_confirms_fragments() {
        let remote = Arc::new(MemoryRemote::new());
        let a = replica(&remote, None);

        let record = a.records.create("visits").unwrap();
        let v1 = a
            .records
            .save(&record, "intro", values(json!({"age": 1})), false)
            .await
            .unwrap();
        a.records
            .save(&v1, "details", values(json!({"name": "x"})), true)
            .await
            .unwrap();

        let report = a.sync.sync().await.unwrap();
        assert_eq!(report.uploaded, 1);
        assert!(!report.conflict);
        assert_eq!(report.discarded, 0);
        assert_eq!(remote.record_version(&record.key()), 2);
        assert!(report.touched.contains(&record.key()));
        assert_eq!(report.watermark, remote.last_anchor());

        // Nothing left to upload.
        assert!(a.sync.pending_uploads().await.unwrap().is_empty());
        let entry = a.records.entry("visits", &record.id).await.unwrap().unwrap();
        assert_eq!(entry.sequence, Some(1));
    }

    #[tokio::test]
    async fn test_pull_reaches_other_replica() {
        let remote = Arc::new(MemoryRemote::new());
        let a = replica(&remote, None);
        let b = replica(&remote, None);

        let record = a.records.create("visits").unwrap();
        a.records
            .save(&record, "intro", values(json!({"age": 7})), false)
            .await
            .unwrap();
        a.sync.sync().await.unwrap();

        let report = b.sync.sync().await.unwrap();
        assert_eq!(report.fragments, 1);
        assert!(report.columns >= 1);

        let loaded = b.records.load("visits", &record.id, None).await.unwrap().unwrap();
        assert_eq!(loaded.get("age"), Some(&json!(7)));
        assert_eq!(b.records.list_columns("visits").await.unwrap().len(), 1);

        // Second round fetches nothing new.
        let report = b.sync.sync().await.unwrap();
        assert_eq!(report.fragments, 0);
        assert!(report.touched.is_empty());
    }

    #[tokio::test]
    async fn test_stale_upload_is_reported_and_pull_continues() {
        let remote = Arc::new(MemoryRemote::new());
        let a = replica(&remote, None);
        let b = replica(&remote, None);

        let record = a.records.create("visits").unwrap();
        a.records
            .save(&record, "intro", values(json!({"age": 1})), false)
            .await
            .unwrap();
        a.sync.sync().await.unwrap();
        b.sync.sync().await.unwrap();

        let on_a = a.records.load("visits", &record.id, None).await.unwrap().unwrap();
        let on_b = b.records.load("visits", &record.id, None).await.unwrap().unwrap();
        a.records
            .save(&on_a, "intro", values(json!({"age": 2})), false)
            .await
            .unwrap();
        b.records
            .save(&on_b, "intro", values(json!({"age": 3})), false)
            .await
            .unwrap();

        a.sync.sync().await.unwrap();
        let report = b.sync.sync().await.unwrap();
        assert!(report.conflict);

        // B now holds A's version 2.
        let loaded = b.records.load("visits", &record.id, None).await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.get("age"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_stale_chain_is_discarded_on_conflict() {
        let remote = Arc::new(MemoryRemote::new());
        let a = replica(&remote, None);
        let b = replica(&remote, None);

        let record = a.records.create("visits").unwrap();
        a.records
            .save(&record, "intro", values(json!({"age": 1})), false)
            .await
            .unwrap();
        a.sync.sync().await.unwrap();
        b.sync.sync().await.unwrap();

        let on_a = a.records.load("visits", &record.id, None).await.unwrap().unwrap();
        a.records
            .save(&on_a, "intro", values(json!({"age": 2})), false)
            .await
            .unwrap();

        // B stacks two edits on version 1.
        let on_b = b.records.load("visits", &record.id, None).await.unwrap().unwrap();
        let v2 = b
            .records
            .save(&on_b, "intro", values(json!({"age": 3})), false)
            .await
            .unwrap();
        b.records
            .save(&v2, "extra", values(json!({"b_only": true})), false)
            .await
            .unwrap();

        a.sync.sync().await.unwrap();
        let report = b.sync.sync().await.unwrap();
        assert!(report.conflict);
        assert_eq!(report.discarded, 2);
        assert!(report.touched.contains(&record.key()));

        let entry = b.records.entry("visits", &record.id).await.unwrap().unwrap();
        let loaded = b.records.load("visits", &record.id, None).await.unwrap().unwrap();
        assert_eq!(entry.version, 2);
        assert_eq!(loaded.version, entry.version);
        assert_eq!(loaded.get("age"), Some(&json!(2)));
        assert_eq!(loaded.get("b_only"), None);
        assert!(b.sync.pending_uploads().await.unwrap().is_empty());

        // Re-applying on the fresh view goes through as version 3.
        b.records
            .save(&loaded, "extra", values(json!({"b_only": true})), false)
            .await
            .unwrap();
        let report = b.sync.sync().await.unwrap();
        assert_eq!(report.uploaded, 1);
        assert!(!report.conflict);
        assert_eq!(remote.record_version(&record.key()), 3);
    }

    #[tokio::test]
    async fn test_refused_batch_keeps_edits_on_current_base() {
        let remote = Arc::new(MemoryRemote::new());
        let a = replica(&remote, None);
        let b = replica(&remote, None);

        let kept = a.records.create("visits").unwrap();
        let lost = a.records.create("visits").unwrap();
        for record in [&kept, &lost] {
            a.records
                .save(record, "intro", values(json!({"age": 1})), false)
                .await
                .unwrap();
        }
        a.sync.sync().await.unwrap();
        b.sync.sync().await.unwrap();

        let on_a = a.records.load("visits", &lost.id, None).await.unwrap().unwrap();
        a.records
            .save(&on_a, "intro", values(json!({"age": 2})), false)
            .await
            .unwrap();
        a.sync.sync().await.unwrap();

        for record in [&kept, &lost] {
            let on_b = b.records.load("visits", &record.id, None).await.unwrap().unwrap();
            b.records
                .save(&on_b, "intro", values(json!({"age": 9})), false)
                .await
                .unwrap();
        }

        // The batch is refused because of `lost`; a full pull returns
        // version 1 of `kept`, below B's pending version 2.
        let report = b.sync.sync_full().await.unwrap();
        assert!(report.conflict);
        assert_eq!(report.discarded, 1);

        let entry = b.records.entry("visits", &kept.id).await.unwrap().unwrap();
        assert_eq!(entry.version, 2);
        let loaded = b.records.load("visits", &kept.id, None).await.unwrap().unwrap();
        assert_eq!(loaded.get("age"), Some(&json!(9)));

        let report = b.sync.sync().await.unwrap();
        assert_eq!(report.uploaded, 1);
        assert_eq!(remote.record_version(&kept.key()), 2);
        assert_eq!(remote.record_version(&lost.key()), 2);
    }

    #[tokio::test]
    async fn test_offline_round_fails_and_keeps_pending() {
        let remote = Arc::new(MemoryRemote::new());
        let a = replica(&remote, None);

        let record = a.records.create("visits").unwrap();
        a.records
            .save(&record, "intro", values(json!({"age": 1})), false)
            .await
            .unwrap();

        remote.set_offline(true);
        assert!(matches!(a.sync.sync().await, Err(Error::Network(_))));
        assert_eq!(a.sync.pending_uploads().await.unwrap().len(), 1);

        remote.set_offline(false);
        assert_eq!(a.sync.sync().await.unwrap().uploaded, 1);
    }

    #[tokio::test]
    async fn test_other_zones_are_not_uploaded() {
        let remote = Arc::new(MemoryRemote::new());
        let store = Arc::new(MemoryStore::new());
        let north = RecordStore::new(store.clone(), &SyncConfig::default().with_zone("north"));
        let south_sync = RecordSyncEngine::new(
            store,
            remote.clone(),
            &SyncConfig::default().with_zone("south"),
        );

        let record = north.create("visits").unwrap();
        north
            .save(&record, "intro", values(json!({"age": 1})), false)
            .await
            .unwrap();

        let report = south_sync.sync().await.unwrap();
        assert_eq!(report.uploaded, 0);
        assert_eq!(remote.record_version(&record.key()), 0);
    }

    #[tokio::test]
    async fn test_full_sync_repulls_history() {
        let remote = Arc::new(MemoryRemote::new());
        let a = replica(&remote, None);

        let record = a.records.create("visits").unwrap();
        a.records
            .save(&record, "intro", values(json!({"age": 1})), false)
            .await
            .unwrap();
        let first = a.sync.sync().await.unwrap();

        let full = a.sync.sync_full().await.unwrap();
        assert_eq!(full.fragments, 1);
        assert_eq!(full.watermark, first.watermark);
    }
}
