//! SQLite-backed local store.
//!
//! Every collection lives in one `kv` table keyed by `(collection, key)`;
//! each commit runs inside a single SQLite transaction. Statements run on
//! the blocking pool, one at a time behind the connection lock.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use anchorsync_common::{Error, Result};

use super::{KeyRange, LocalStore, Transaction, WriteOp};

fn sql_err(e: rusqlite::Error) -> Error {
    Error::Storage(format!("SQLite: {}", e))
}

/// Persistent local store using SQLite.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(sql_err)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                collection TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (collection, key)
            ) WITHOUT ROWID;
            "#,
        )
        .map_err(sql_err)?;

        info!("Local store opened at {}", db_path.as_ref().display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Run `f` on the connection without blocking the async runtime.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || f(&mut *conn.lock()))
            .await
            .map_err(|e| Error::Storage(format!("SQLite task failed: {}", e)))?
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let (collection, key) = (collection.to_string(), key.to_string());
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM kv WHERE collection = ?1 AND key = ?2",
                params![collection, key],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)
        })
        .await
    }

    async fn scan(&self, collection: &str, range: KeyRange) -> Result<Vec<(String, Vec<u8>)>> {
        let (sql, args): (&'static str, Vec<String>) = match range {
            KeyRange::All => (
                "SELECT key, value FROM kv WHERE collection = ?1 ORDER BY key",
                vec![collection.to_string()],
            ),
            KeyRange::Prefix(prefix) => (
                "SELECT key, value FROM kv WHERE collection = ?1 AND key >= ?2
                 AND substr(key, 1, length(?2)) = ?2 ORDER BY key",
                vec![collection.to_string(), prefix],
            ),
            KeyRange::Between { start, end } => (
                "SELECT key, value FROM kv WHERE collection = ?1 AND key >= ?2 AND key < ?3
                 ORDER BY key",
                vec![collection.to_string(), start, end],
            ),
        };

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(sql).map_err(sql_err)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
                })
                .map_err(sql_err)?;

            let entries = rows
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            Ok(entries)
        })
        .await
    }

    async fn commit(&self, tx: Transaction) -> Result<()> {
        tx.validate()?;
        self.with_conn(move |conn| apply(conn, &tx)).await
    }
}

fn apply(conn: &mut Connection, tx: &Transaction) -> Result<()> {
    let sql_tx = conn.transaction().map_err(sql_err)?;

    for precondition in tx.preconditions() {
        let current: Option<Vec<u8>> = sql_tx
            .query_row(
                "SELECT value FROM kv WHERE collection = ?1 AND key = ?2",
                params![precondition.collection, precondition.key],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        if current != precondition.value {
            // Dropping the transaction rolls it back.
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
                sql_tx
                    .execute(
                        "INSERT OR REPLACE INTO kv (collection, key, value) VALUES (?1, ?2, ?3)",
                        params![collection, key, value],
                    )
                    .map_err(sql_err)?;
            }
            WriteOp::Delete { collection, key } => {
                sql_tx
                    .execute(
                        "DELETE FROM kv WHERE collection = ?1 AND key = ?2",
                        params![collection, key],
                    )
                    .map_err(sql_err)?;
            }
        }
    }

    sql_tx.commit().map_err(sql_err)?;
    debug!("Committed {} write(s)", tx.ops().len());
    Ok(())
}
