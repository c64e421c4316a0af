//! End-to-end sync rounds between replicas sharing one remote.

use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

use anchorsync_common::{Digest, Error};
use anchorsync_storage::{LocalStore, MemoryRemote, MemoryStore, SqliteStore};
use anchorsync_sync::{classify, SyncAction, SyncConfig, SyncEngine, Transfer};

fn values(value: Value) -> BTreeMap<String, Value> {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        _ => BTreeMap::new(),
    }
}

fn replica<S: LocalStore>(store: S, remote: &Arc<MemoryRemote>, user: &str) -> SyncEngine<S, MemoryRemote> {
    SyncEngine::new(
        Arc::new(store),
        remote.clone(),
        SyncConfig::default().with_username(user),
    )
}

#[tokio::test]
async fn remote_change_is_pulled_into_sqlite_replica() {
    let temp_dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let engine = replica(
        SqliteStore::open(temp_dir.path().join("local.db")).unwrap(),
        &remote,
        "ana",
    );

    engine.files().save("a.txt", b"first".to_vec()).await.unwrap();
    engine.sync_files().await.unwrap();

    let d2 = remote.put_file("a.txt", b"second".to_vec());
    let status = engine.files().status(true).await.unwrap();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].action, SyncAction::Pull(Transfer::Copy));
    assert_eq!(status[0].remote, Some(d2));

    engine.files().sync(&status).await.unwrap();
    let loaded = engine.files().load("a.txt").await.unwrap().unwrap();
    assert_eq!(loaded.data, b"second");
    assert_eq!(engine.files().marker("a.txt").await.unwrap(), Some(d2));
}

#[tokio::test]
async fn second_round_is_a_noop() {
    let remote = Arc::new(MemoryRemote::new());
    let engine = replica(MemoryStore::new(), &remote, "ana");

    for i in 0..25 {
        engine
            .files()
            .save(&format!("docs/{:02}.txt", i), vec![i as u8; 16])
            .await
            .unwrap();
    }
    let first = engine.sync_files().await.unwrap();
    assert_eq!(first.uploaded, 25);

    let status = engine.files().status(true).await.unwrap();
    assert!(status.iter().all(|e| e.action == SyncAction::Noop));
    let second = engine.files().sync(&status).await.unwrap();
    assert_eq!(second.total(), 0);
}

#[tokio::test]
async fn files_converge_between_replicas() {
    let remote = Arc::new(MemoryRemote::new());
    let a = replica(MemoryStore::new(), &remote, "ana");
    let b = replica(MemoryStore::new(), &remote, "rui");

    a.files().save("shared.txt", b"from a".to_vec()).await.unwrap();
    a.sync_files().await.unwrap();
    assert_eq!(b.sync_files().await.unwrap().downloaded, 1);

    b.files().delete("shared.txt").await.unwrap();
    assert_eq!(b.sync_files().await.unwrap().deleted_remote, 1);
    assert_eq!(a.sync_files().await.unwrap().removed_local, 1);

    assert!(a.files().list().await.unwrap().is_empty());
    assert!(remote.file("shared.txt").is_none());
}

#[tokio::test]
async fn concurrent_edits_surface_as_conflict() {
    let remote = Arc::new(MemoryRemote::new());
    let a = replica(MemoryStore::new(), &remote, "ana");
    let b = replica(MemoryStore::new(), &remote, "rui");

    a.files().save("notes.txt", b"v1".to_vec()).await.unwrap();
    a.sync_files().await.unwrap();
    b.sync_files().await.unwrap();

    a.files().save("notes.txt", b"a edit".to_vec()).await.unwrap();
    b.files().save("notes.txt", b"b edit".to_vec()).await.unwrap();
    a.sync_files().await.unwrap();

    match b.sync_files().await {
        Err(Error::UnresolvedConflicts(paths)) => assert_eq!(paths, vec!["notes.txt".to_string()]),
        other => panic!("Expected UnresolvedConflicts, got {:?}", other),
    }
    assert_eq!(remote.file("notes.txt"), Some(b"a edit".to_vec()));
}

#[tokio::test]
async fn record_versions_stay_monotonic_across_replicas() {
    let remote = Arc::new(MemoryRemote::new());
    let a = replica(MemoryStore::new(), &remote, "ana");
    let b = replica(MemoryStore::new(), &remote, "rui");

    let record = a.records().create("visits").unwrap();
    let mut current = a
        .records()
        .save(&record, "intro", values(json!({"age": 30})), false)
        .await
        .unwrap();
    for age in 31..35 {
        current = a
            .records()
            .save(&current, "intro", values(json!({"age": age})), false)
            .await
            .unwrap();
    }
    assert_eq!(current.version, 5);

    a.sync_records(false).await.unwrap();
    b.sync_records(false).await.unwrap();

    let on_b = b.records().load("visits", &record.id, None).await.unwrap().unwrap();
    assert_eq!(on_b.version, 5);
    assert_eq!(on_b.get("age"), Some(&json!(34)));

    let v3 = b.records().load("visits", &record.id, Some(3)).await.unwrap().unwrap();
    assert_eq!(v3.get("age"), Some(&json!(32)));
    assert_eq!(remote.record_version(&record.key()), 5);
}

#[tokio::test]
async fn deletion_is_terminal_everywhere() {
    let remote = Arc::new(MemoryRemote::new());
    let a = replica(MemoryStore::new(), &remote, "ana");
    let b = replica(MemoryStore::new(), &remote, "rui");

    let record = a.records().create("visits").unwrap();
    a.records()
        .save(&record, "intro", values(json!({"age": 1})), false)
        .await
        .unwrap();
    a.sync_records(false).await.unwrap();
    b.sync_records(false).await.unwrap();
    let on_b = b.records().load("visits", &record.id, None).await.unwrap().unwrap();

    a.records().delete("visits", &record.id).await.unwrap();
    a.sync_records(false).await.unwrap();
    let report = b.sync_records(false).await.unwrap();
    assert!(report.touched.contains(&record.key()));

    assert!(b.records().load("visits", &record.id, None).await.unwrap().is_none());
    assert!(b.records().load_all("visits").await.unwrap().is_empty());

    let mut stale = on_b.clone();
    stale.version = 2;
    assert!(matches!(
        b.records().save(&stale, "intro", BTreeMap::new(), false).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn watermark_never_moves_backwards() {
    let remote = Arc::new(MemoryRemote::new());
    let a = replica(MemoryStore::new(), &remote, "ana");
    let b = replica(MemoryStore::new(), &remote, "rui");

    let mut last = 0;
    for round in 0..4 {
        let record = a.records().create("visits").unwrap();
        a.records()
            .save(&record, "intro", values(json!({"round": round})), false)
            .await
            .unwrap();
        a.sync_records(false).await.unwrap();

        let report = b.sync_records(false).await.unwrap();
        assert!(report.watermark >= last);
        assert_eq!(report.fragments, 1);
        last = report.watermark;
    }

    // An empty round keeps the watermark.
    assert_eq!(b.sync_records(false).await.unwrap().watermark, last);
    assert_eq!(b.records().load_all("visits").await.unwrap().len(), 4);
}

#[tokio::test]
async fn offline_edits_sync_after_reconnect() {
    let remote = Arc::new(MemoryRemote::new());
    let engine = replica(MemoryStore::new(), &remote, "ana");
    remote.set_offline(true);

    engine.files().save("draft.txt", b"offline".to_vec()).await.unwrap();
    let record = engine.records().create("visits").unwrap();
    engine
        .records()
        .save(&record, "intro", values(json!({"age": 9})), true)
        .await
        .unwrap();

    let offline_status = engine.files().status(false).await.unwrap();
    assert_eq!(offline_status[0].action, SyncAction::Push(Transfer::Copy));
    assert!(engine.sync_all().await.is_err());

    remote.set_offline(false);
    let result = engine.sync_all().await.unwrap();
    assert_eq!(result.files_uploaded, 1);
    assert_eq!(result.records_uploaded, 1);
}

fn digest() -> impl Strategy<Value = Option<Digest>> {
    prop::option::of((0u8..4).prop_map(|b| Digest::from_bytes([b; 32])))
}

proptest! {
    #[test]
    fn conflict_classification_is_symmetric(a in digest(), b in digest(), marker in digest()) {
        prop_assume!(a.is_some() && b.is_some());
        let forward = classify(a, marker, b, true);
        let backward = classify(b, marker, a, true);
        prop_assert_eq!(forward.is_conflict(), backward.is_conflict());
    }

    #[test]
    fn synced_state_needs_no_action(d in digest()) {
        prop_assert_eq!(classify(d, d, d, true), SyncAction::Noop);
    }
}
