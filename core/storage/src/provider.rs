//! Remote store trait definition.
//!
//! The remote store is the authoritative replica. Its contract is the
//! JSON-shaped HTTP API below; framing and transport are left to the
//! implementation.
//!
//! | Operation | Request |
//! |---|---|
//! | [`RemoteStore::list_files`] | `GET files.json` |
//! | [`RemoteStore::download_file`] | `GET <path>` |
//! | [`RemoteStore::upload_file`] | `PUT <path>?digest=<expected>` |
//! | [`RemoteStore::delete_file`] | `DELETE <path>?digest=<expected>` |
//! | [`RemoteStore::sync_records`] | `POST records/sync` |
//! | [`RemoteStore::load_columns`] | `GET records/columns?anchor=<n>` |
//! | [`RemoteStore::load_records`] | `GET records/load?anchor=<n>` |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use anchorsync_common::{Digest, Result};

/// Remote state of one file, as listed by `files.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub path: String,
    pub size: u64,
    pub digest: Digest,
}

/// One fragment submitted to `records/sync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadFragment {
    pub version: u64,
    /// `None` marks a deletion.
    pub page: Option<String>,
    pub username: String,
    pub mtime: DateTime<Utc>,
    pub complete: bool,
    pub values: BTreeMap<String, serde_json::Value>,
}

/// All unconfirmed fragments of one record, in version order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub table: String,
    pub id: String,
    pub zone: Option<String>,
    pub fragments: Vec<UploadFragment>,
}

/// One fragment returned by `records/load`, stamped with its anchor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFragment {
    pub mtime: DateTime<Utc>,
    pub version: u64,
    pub page: Option<String>,
    #[serde(default)]
    pub username: String,
    pub complete: bool,
    #[serde(default)]
    pub values: BTreeMap<String, serde_json::Value>,
    pub anchor: i64,
}

/// A record with the fragments newer than the requested anchor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub table: String,
    pub id: String,
    pub zone: Option<String>,
    #[serde(default)]
    pub sequence: Option<i64>,
    pub fragments: Vec<RemoteFragment>,
}

/// Column ordering metadata.
///
/// `before`/`after` hold the [`ColumnInfo::key`] of the neighbouring
/// columns in the same table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub table: String,
    pub page: String,
    pub field: String,
    /// Per-option key of a multi-valued field.
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub anchor: i64,
}

impl ColumnInfo {
    /// Key identifying the column within its table.
    pub fn key(&self) -> String {
        match &self.variant {
            Some(variant) => format!("{}/{}/{}", self.page, self.field, variant),
            None => format!("{}/{}", self.page, self.field),
        }
    }
}

/// Remote store trait for the authoritative replica.
///
/// All operations are async. Implementations map transport failures to
/// `Error::Network`, non-success statuses to `Error::RemoteRejected`, and
/// conflict answers (HTTP 409) to `Error::Conflict`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Get the remote name (e.g., "http", "memory").
    fn name(&self) -> &str;

    /// List every file known remotely.
    async fn list_files(&self) -> Result<Vec<RemoteFile>>;

    /// Download a file.
    ///
    /// # Errors
    /// - `NotFound` if the file does not exist remotely
    async fn download_file(&self, path: &str) -> Result<Vec<u8>>;

    /// Upload a file.
    ///
    /// `expected` is the digest the caller believes the remote holds
    /// (`None` if it believes the file is absent). The remote may refuse
    /// the write if that belief is stale.
    async fn upload_file(&self, path: &str, data: Vec<u8>, expected: Option<Digest>) -> Result<()>;

    /// Delete a file. Deleting an absent file succeeds.
    async fn delete_file(&self, path: &str, expected: Option<Digest>) -> Result<()>;

    /// Submit unconfirmed record fragments.
    ///
    /// # Errors
    /// - `Conflict` if any record was concurrently modified remotely
    async fn sync_records(&self, uploads: Vec<UploadRecord>) -> Result<()>;

    /// Column metadata with an anchor greater than `anchor`.
    async fn load_columns(&self, anchor: i64) -> Result<Vec<ColumnInfo>>;

    /// Records having fragments with an anchor greater than `anchor`.
    async fn load_records(&self, anchor: i64) -> Result<Vec<RemoteRecord>>;
}
