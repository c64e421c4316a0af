//! In-memory local store for testing.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use anchorsync_common::{Error, Result};

use super::{KeyRange, LocalStore, Transaction, WriteOp};

type Collection = BTreeMap<String, Vec<u8>>;

/// In-memory local store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop.
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
        }
    }

    /// Number of keys stored in a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn scan_collection(collection: &Collection, range: &KeyRange) -> Vec<(String, Vec<u8>)> {
    let entries: Box<dyn Iterator<Item = (&String, &Vec<u8>)> + '_> = match range {
        KeyRange::All => Box::new(collection.iter()),
        KeyRange::Prefix(prefix) => Box::new(
            collection
                .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
                .take_while(move |(key, _)| key.starts_with(prefix.as_str())),
        ),
        KeyRange::Between { start, end } => {
            if start > end {
                return Vec::new();
            }
            Box::new(
                collection.range::<str, _>((Bound::Included(start.as_str()), Bound::Excluded(end.as_str()))),
            )
        }
    };

    entries.map(|(k, v)| (k.clone(), v.clone())).collect()
}

#[async_trait]
impl LocalStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|c| c.get(key))
            .cloned())
    }

    async fn scan(&self, collection: &str, range: KeyRange) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(|c| scan_collection(c, &range))
            .unwrap_or_default())
    }

    async fn commit(&self, tx: Transaction) -> Result<()> {
        tx.validate()?;

        let mut collections = self.collections.write();

        for precondition in tx.preconditions() {
            let current = collections
                .get(&precondition.collection)
                .and_then(|c| c.get(&precondition.key));
            if current != precondition.value.as_ref() {
                return Err(Error::Conflict(format!(
                    "Precondition failed on {}/{}",
                    precondition.collection, precondition.key
                )));
            }
        }

        for op in tx.ops() {
            match op {
                WriteOp::Put {
                    collection,
                    key,
                    value,
                } => {
                    collections
                        .entry(collection.clone())
                        .or_default()
                        .insert(key.clone(), value.clone());
                }
                WriteOp::Delete { collection, key } => {
                    if let Some(c) = collections.get_mut(collection) {
                        c.remove(key);
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalStoreExt;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();

        let mut tx = Transaction::new(&["files"]);
        tx.put("files", "a.txt", b"one".to_vec());
        store.commit(tx).await.unwrap();
        assert_eq!(store.get("files", "a.txt").await.unwrap(), Some(b"one".to_vec()));

        let mut tx = Transaction::new(&["files"]);
        tx.delete("files", "a.txt");
        store.commit(tx).await.unwrap();
        assert_eq!(store.get("files", "a.txt").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scan_is_ordered_and_bounded() {
        let store = MemoryStore::new();
        let mut tx = Transaction::new(&["records_fragments"]);
        for key in ["t:b@0002", "t:a@0002", "t:a@0001", "u:a@0001", "t:a@0010"] {
            tx.put("records_fragments", key, key.as_bytes().to_vec());
        }
        store.commit(tx).await.unwrap();

        let keys: Vec<String> = store
            .scan("records_fragments", KeyRange::prefix("t:a@"))
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["t:a@0001", "t:a@0002", "t:a@0010"]);

        let between = store
            .scan("records_fragments", KeyRange::between("t:b", "u"))
            .await
            .unwrap();
        assert_eq!(between.len(), 1);

        let backwards = store
            .scan("records_fragments", KeyRange::between("u", "t"))
            .await
            .unwrap();
        assert!(backwards.is_empty());
    }

    #[tokio::test]
    async fn test_failed_precondition_writes_nothing() {
        let store = MemoryStore::new();

        let mut tx = Transaction::new(&["records_entries", "records_fragments"]);
        tx.expect("records_entries", "t:1", Some(b"stale".to_vec()));
        tx.put("records_entries", "t:1", b"new".to_vec());
        tx.put("records_fragments", "t:1@0001", b"frag".to_vec());

        let result = store.commit(tx).await;
        assert!(matches!(result, Err(Error::Conflict(_))));
        assert_eq!(store.len("records_entries"), 0);
        assert_eq!(store.len("records_fragments"), 0);
    }

    #[tokio::test]
    async fn test_absent_precondition() {
        let store = MemoryStore::new();

        let mut tx = Transaction::new(&["records_entries"]);
        tx.expect("records_entries", "t:1", None);
        tx.put_json("records_entries", "t:1", &42u64).unwrap();
        store.commit(tx).await.unwrap();

        let value: Option<u64> = store.get_json("records_entries", "t:1").await.unwrap();
        assert_eq!(value, Some(42));

        let mut tx = Transaction::new(&["records_entries"]);
        tx.expect("records_entries", "t:1", None);
        assert!(store.commit(tx).await.is_err());
    }

    #[tokio::test]
    async fn test_undeclared_collection_rejected() {
        let store = MemoryStore::new();
        let mut tx = Transaction::new(&["files"]);
        tx.put("files_blob", "a.txt", vec![0]);
        assert!(matches!(store.commit(tx).await, Err(Error::InvalidInput(_))));
        assert_eq!(store.len("files_blob"), 0);
    }
}
