//! Column registry.
//!
//! Columns of a table form a doubly linked chain through their
//! `before`/`after` keys. The chain is advisory: a listing in chain order
//! tolerates dangling links and cycles.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use anchorsync_common::Result;
use anchorsync_storage::{ColumnInfo, KeyRange, LocalStore, LocalStoreExt, Transaction};

use crate::fragment::UNCONFIRMED_ANCHOR;
use crate::schema::{column_key, table_prefix, RECORDS_COLUMNS};

/// Per-table column metadata.
pub struct ColumnRegistry<S: LocalStore + ?Sized> {
    store: Arc<S>,
}

impl<S: LocalStore + ?Sized> Clone for ColumnRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: LocalStore + ?Sized> ColumnRegistry<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Insert or replace columns, keyed by table and column key.
    pub async fn upsert(&self, columns: Vec<ColumnInfo>) -> Result<usize> {
        if columns.is_empty() {
            return Ok(0);
        }

        let count = columns.len();
        let mut tx = Transaction::new(&[RECORDS_COLUMNS]);
        for column in &columns {
            tx.put_json(RECORDS_COLUMNS, column_key(&column.table, &column.key()), column)?;
        }
        self.store.commit(tx).await?;

        debug!("Upserted {} column(s)", count);
        Ok(count)
    }

    /// Columns of a table in key order.
    pub async fn list(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        Ok(self
            .store
            .scan_json::<ColumnInfo>(RECORDS_COLUMNS, KeyRange::prefix(table_prefix(table)))
            .await?
            .into_iter()
            .map(|(_, column)| column)
            .collect())
    }

    /// Columns of a table in chain order.
    pub async fn ordered(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        Ok(chain_order(self.list(table).await?))
    }

    /// Stage chain entries for fields of `page` not yet known in `table`.
    ///
    /// New columns are appended after the current tail, in the order
    /// given. `tx` must declare [`RECORDS_COLUMNS`].
    pub async fn register_fields(
        &self,
        tx: &mut Transaction,
        table: &str,
        page: &str,
        fields: &[String],
    ) -> Result<usize> {
        let ordered = self.ordered(table).await?;
        let known: HashSet<String> = ordered.iter().map(ColumnInfo::key).collect();
        let mut tail = ordered.last().cloned();
        let mut added = 0;

        for field in fields {
            let mut column = ColumnInfo {
                table: table.to_string(),
                page: page.to_string(),
                field: field.clone(),
                variant: None,
                before: None,
                after: None,
                anchor: UNCONFIRMED_ANCHOR,
            };
            let key = column.key();
            if known.contains(&key) {
                continue;
            }

            if let Some(mut prev) = tail.take() {
                prev.after = Some(key.clone());
                column.before = Some(prev.key());
                tx.put_json(RECORDS_COLUMNS, column_key(table, &prev.key()), &prev)?;
            }
            tx.put_json(RECORDS_COLUMNS, column_key(table, &key), &column)?;
            tail = Some(column);
            added += 1;
        }

        Ok(added)
    }
}

/// Order columns along their chain.
///
/// Heads are columns without a resolvable `before`, walked in key order.
/// Columns left over (members of a cycle) follow in key order, each
/// starting a walk of its own.
pub fn chain_order(columns: Vec<ColumnInfo>) -> Vec<ColumnInfo> {
    let by_key: BTreeMap<String, ColumnInfo> =
        columns.into_iter().map(|c| (c.key(), c)).collect();

    let heads: Vec<&String> = by_key
        .iter()
        .filter(|(_, c)| c.before.as_ref().is_none_or(|b| !by_key.contains_key(b)))
        .map(|(key, _)| key)
        .collect();

    let mut visited: HashSet<&str> = HashSet::new();
    let mut ordered = Vec::with_capacity(by_key.len());

    let starts = heads.into_iter().chain(by_key.keys());
    for start in starts {
        let mut current = by_key.get(start);
        while let Some(column) = current {
            let Some((key, _)) = by_key.get_key_value(&column.key()) else {
                break;
            };
            if !visited.insert(key.as_str()) {
                break;
            }
            ordered.push(column.clone());
            current = column.after.as_ref().and_then(|next| by_key.get(next));
        }
    }

    ordered
}
