//! Transactional local key-value store.
//!
//! The store is organised in named collections of ordered string keys.
//! Reads are point lookups or ordered range scans; every write goes
//! through a [`Transaction`] that names the collections it touches and is
//! applied all-or-nothing.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;

use anchorsync_common::{Error, Result};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Key range for ordered scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRange {
    /// Every key in the collection.
    All,
    /// Keys starting with the given prefix.
    Prefix(String),
    /// Keys in `[start, end)`.
    Between { start: String, end: String },
}

impl KeyRange {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    pub fn between(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self::Between {
            start: start.into(),
            end: end.into(),
        }
    }

    /// Check whether a key falls inside the range.
    pub fn contains(&self, key: &str) -> bool {
        match self {
            KeyRange::All => true,
            KeyRange::Prefix(prefix) => key.starts_with(prefix.as_str()),
            KeyRange::Between { start, end } => key >= start.as_str() && key < end.as_str(),
        }
    }
}

/// A single write inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put {
        collection: String,
        key: String,
        value: Vec<u8>,
    },
    Delete {
        collection: String,
        key: String,
    },
}

impl WriteOp {
    pub fn collection(&self) -> &str {
        match self {
            WriteOp::Put { collection, .. } | WriteOp::Delete { collection, .. } => collection,
        }
    }
}

/// Expected current value of a key, checked atomically at commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Precondition {
    pub collection: String,
    pub key: String,
    /// `None` means the key must be absent.
    pub value: Option<Vec<u8>>,
}

/// Atomic multi-collection write batch.
///
/// Writes are applied in insertion order, so a later write to the same
/// key wins. If any precondition does not hold at commit time, nothing
/// is written and the commit fails with [`Error::Conflict`].
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    collections: BTreeSet<String>,
    ops: Vec<WriteOp>,
    preconditions: Vec<Precondition>,
}

impl Transaction {
    /// Start a transaction over the named collections.
    pub fn new(collections: &[&str]) -> Self {
        Self {
            collections: collections.iter().map(|c| c.to_string()).collect(),
            ops: Vec::new(),
            preconditions: Vec::new(),
        }
    }

    pub fn put(&mut self, collection: &str, key: impl Into<String>, value: Vec<u8>) {
        self.ops.push(WriteOp::Put {
            collection: collection.to_string(),
            key: key.into(),
            value,
        });
    }

    /// Serialize a value as JSON and put it.
    pub fn put_json<T: Serialize>(
        &mut self,
        collection: &str,
        key: impl Into<String>,
        value: &T,
    ) -> Result<()> {
        let key = key.into();
        let bytes = serde_json::to_vec(value)
            .map_err(|e| Error::Serialization(format!("{}/{}: {}", collection, key, e)))?;
        self.put(collection, key, bytes);
        Ok(())
    }

    pub fn delete(&mut self, collection: &str, key: impl Into<String>) {
        self.ops.push(WriteOp::Delete {
            collection: collection.to_string(),
            key: key.into(),
        });
    }

    /// Require `key` to still hold `value` (or be absent) when committing.
    pub fn expect(&mut self, collection: &str, key: impl Into<String>, value: Option<Vec<u8>>) {
        self.preconditions.push(Precondition {
            collection: collection.to_string(),
            key: key.into(),
            value,
        });
    }

    pub fn collections(&self) -> &BTreeSet<String> {
        &self.collections
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn preconditions(&self) -> &[Precondition] {
        &self.preconditions
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Check that every write and precondition targets a declared collection.
    pub fn validate(&self) -> Result<()> {
        let undeclared = self
            .ops
            .iter()
            .map(WriteOp::collection)
            .chain(self.preconditions.iter().map(|p| p.collection.as_str()))
            .find(|c| !self.collections.contains(*c));

        match undeclared {
            Some(collection) => Err(Error::InvalidInput(format!(
                "Transaction touches undeclared collection '{}'",
                collection
            ))),
            None => Ok(()),
        }
    }
}

/// Transactional key-value persistence layer.
///
/// # Invariants
/// - `scan` returns keys in ascending byte order
/// - `commit` is all-or-nothing and immediately visible to later reads
/// - A failed precondition leaves the store untouched
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Get the store name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Point lookup.
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Ordered range scan.
    async fn scan(&self, collection: &str, range: KeyRange) -> Result<Vec<(String, Vec<u8>)>>;

    /// Apply a transaction atomically.
    ///
    /// # Errors
    /// - `InvalidInput` if the transaction touches an undeclared collection
    /// - `Conflict` if a precondition does not hold
    async fn commit(&self, tx: Transaction) -> Result<()>;
}

/// Typed JSON helpers on top of any [`LocalStore`].
#[async_trait]
pub trait LocalStoreExt: LocalStore {
    async fn get_json<T: DeserializeOwned + Send>(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<T>>;

    async fn scan_json<T: DeserializeOwned + Send>(
        &self,
        collection: &str,
        range: KeyRange,
    ) -> Result<Vec<(String, T)>>;
}

#[async_trait]
impl<S: LocalStore + ?Sized> LocalStoreExt for S {
    async fn get_json<T: DeserializeOwned + Send>(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<T>> {
        match self.get(collection, key).await? {
            Some(bytes) => decode(collection, key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn scan_json<T: DeserializeOwned + Send>(
        &self,
        collection: &str,
        range: KeyRange,
    ) -> Result<Vec<(String, T)>> {
        self.scan(collection, range)
            .await?
            .into_iter()
            .map(|(key, bytes)| {
                let value = decode(collection, &key, &bytes)?;
                Ok((key, value))
            })
            .collect()
    }
}

/// Decode a JSON value stored under `collection/key`.
pub fn decode<T: DeserializeOwned>(collection: &str, key: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::Serialization(format!("{}/{}: {}", collection, key, e)))
}
