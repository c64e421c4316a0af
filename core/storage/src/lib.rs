//! Local persistence and remote store abstractions for AnchorSync.
//!
//! This module provides the two collaborators every sync engine is built on:
//! - [`LocalStore`]: a transactional key-value store with named collections
//!   and ordered range scans (in-memory and SQLite implementations)
//! - [`RemoteStore`]: the authoritative remote, reached over HTTP or emulated
//!   in memory for tests
//!
//! # Design Principles
//! - All mutation of local state goes through a [`Transaction`] naming the
//!   collections it touches
//! - Async operations: all I/O operations are async
//! - Unified error semantics: remote statuses map onto the common error taxonomy

pub mod http;
pub mod local;
pub mod memory;
pub mod provider;

pub use http::HttpRemote;
pub use local::{KeyRange, LocalStore, LocalStoreExt, MemoryStore, SqliteStore, Transaction};
pub use memory::MemoryRemote;
pub use provider::{
    ColumnInfo, RemoteFile, RemoteFragment, RemoteRecord, RemoteStore, UploadFragment, UploadRecord,
};
