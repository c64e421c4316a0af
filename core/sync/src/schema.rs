//! Local collections and key layout.
//!
//! Key components are percent-escaped so the `:` and `@` separators only
//! ever appear between components, which keeps prefix scans exact.

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

/// File metadata, one [`crate::files::File`]-shaped entry per path.
pub const FILES: &str = "files";
/// Raw file content keyed by path.
pub const FILES_BLOB: &str = "files_blob";
/// Digest of each path at its last successful sync.
pub const FILES_SYNC_MARKER: &str = "files_sync_marker";

/// Latest version of every record, keyed by `table:id`.
pub const RECORDS_ENTRIES: &str = "records_entries";
/// Record fragments, keyed by `table:id@version`.
pub const RECORDS_FRAGMENTS: &str = "records_fragments";
/// Column metadata, keyed by `table:column`.
pub const RECORDS_COLUMNS: &str = "records_columns";
/// Pull watermark per zone.
pub const RECORDS_ANCHOR: &str = "records_anchor";

/// Characters escaped inside a key component.
const KEY_COMPONENT: &AsciiSet = &CONTROLS.add(b'%').add(b':').add(b'@');

fn escape(component: &str) -> String {
    utf8_percent_encode(component, KEY_COMPONENT).to_string()
}

pub fn entry_key(table: &str, id: &str) -> String {
    format!("{}:{}", escape(table), escape(id))
}

/// Prefix shared by every entry, fragment and column of a table.
pub fn table_prefix(table: &str) -> String {
    format!("{}:", escape(table))
}

/// Fragment key; the zero-padded version keeps scans in version order.
pub fn fragment_key(table: &str, id: &str, version: u64) -> String {
    format!("{}@{:016}", entry_key(table, id), version)
}

/// Prefix shared by every fragment of a record.
pub fn fragment_prefix(table: &str, id: &str) -> String {
    format!("{}@", entry_key(table, id))
}

pub fn column_key(table: &str, column: &str) -> String {
    format!("{}:{}", escape(table), escape(column))
}

/// Watermark key for a zone scope.
pub fn anchor_key(zone: Option<&str>) -> String {
    match zone {
        Some(zone) => format!("zone:{}", zone),
        None => "zone:*".to_string(),
    }
}
