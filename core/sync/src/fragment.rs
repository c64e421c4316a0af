//! Record fragments and their expansion into a record view.
//!
//! A record is stored as an append-only list of fragments, one per saved
//! page. The view at version `V` takes each page from the newest fragment
//! at or below `V` that touched it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

use anchorsync_storage::{RemoteFragment, UploadFragment};

/// Anchor of a fragment the remote has not confirmed yet.
pub const UNCONFIRMED_ANCHOR: i64 = -1;

/// One immutable, versioned delta of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordFragment {
    pub table: String,
    pub id: String,
    pub zone: Option<String>,
    pub version: u64,
    /// Page written by this fragment; `None` marks a deletion.
    pub page: Option<String>,
    pub username: String,
    pub mtime: DateTime<Utc>,
    /// Remote-assigned position, [`UNCONFIRMED_ANCHOR`] until confirmed.
    pub anchor: i64,
    pub complete: bool,
    /// Present keys are set (a JSON null included); missing keys are unset.
    pub values: BTreeMap<String, Value>,
}

impl RecordFragment {
    pub fn is_tombstone(&self) -> bool {
        self.page.is_none()
    }

    pub fn is_confirmed(&self) -> bool {
        self.anchor >= 0
    }

    /// Build a local fragment from one returned by the remote.
    pub fn from_remote(table: &str, id: &str, zone: Option<String>, fragment: RemoteFragment) -> Self {
        Self {
            table: table.to_string(),
            id: id.to_string(),
            zone,
            version: fragment.version,
            page: fragment.page,
            username: fragment.username,
            mtime: fragment.mtime,
            anchor: fragment.anchor,
            complete: fragment.complete,
            values: fragment.values,
        }
    }

    pub fn to_upload(&self) -> UploadFragment {
        UploadFragment {
            version: self.version,
            page: self.page.clone(),
            username: self.username.clone(),
            mtime: self.mtime,
            complete: self.complete,
            values: self.values.clone(),
        }
    }
}

/// Merged view of a record's fragments.
#[derive(Debug, Clone, PartialEq)]
pub struct Expanded {
    /// Version of the newest fragment included.
    pub version: u64,
    /// Modification time of the newest fragment included.
    pub mtime: DateTime<Utc>,
    /// Completion flag per page.
    pub complete: BTreeMap<String, bool>,
    pub values: BTreeMap<String, Value>,
}

/// Expand `fragments` (ascending by version) into the view at `version`,
/// or at the latest version when `None`.
///
/// Returns `None` when no fragment is at or below the requested version,
/// or when the newest one is a deletion.
pub fn expand(fragments: &[RecordFragment], version: Option<u64>) -> Option<Expanded> {
    let limit = version.unwrap_or(u64::MAX);
    let mut visible = fragments.iter().rev().filter(|f| f.version <= limit);

    let newest = visible.next()?;
    let newest_page = newest.page.as_ref()?;

    let mut expanded = Expanded {
        version: newest.version,
        mtime: newest.mtime,
        complete: BTreeMap::new(),
        values: newest.values.clone(),
    };
    expanded.complete.insert(newest_page.clone(), newest.complete);

    let mut claimed: HashSet<&str> = HashSet::new();
    claimed.insert(newest_page.as_str());

    for fragment in visible {
        let Some(page) = fragment.page.as_deref() else {
            continue;
        };
        if !claimed.insert(page) {
            continue;
        }

        expanded.complete.insert(page.to_string(), fragment.complete);
        for (key, value) in &fragment.values {
            expanded
                .values
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }

    Some(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fragment(version: u64, page: Option<&str>, values: Value) -> RecordFragment {
        let values = match values {
            Value::Object(map) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        };
        RecordFragment {
            table: "visits".to_string(),
            id: "r1".to_string(),
            zone: None,
            version,
            page: page.map(str::to_string),
            username: "ana".to_string(),
            mtime: Utc::now(),
            anchor: UNCONFIRMED_ANCHOR,
            complete: version % 2 == 0,
            values,
        }
    }

    fn history() -> Vec<RecordFragment> {
        vec![
            fragment(1, Some("A"), json!({"x": 1})),
            fragment(2, Some("B"), json!({"y": 2})),
            fragment(3, Some("A"), json!({"x": 9})),
        ]
    }

    #[test]
    fn test_latest_takes_newest_page_values() {
        let view = expand(&history(), None).unwrap();
        assert_eq!(view.version, 3);
        assert_eq!(view.values["x"], json!(9));
        assert_eq!(view.values["y"], json!(2));
        assert_eq!(view.complete["A"], false);
        assert_eq!(view.complete["B"], true);
    }

    #[test]
    fn test_historical_version() {
        let view = expand(&history(), Some(2)).unwrap();
        assert_eq!(view.version, 2);
        assert_eq!(view.values["x"], json!(1));
        assert_eq!(view.values["y"], json!(2));

        let view = expand(&history(), Some(1)).unwrap();
        assert_eq!(view.values.len(), 1);
    }

    #[test]
    fn test_newer_page_hides_stale_keys() {
        // Page A dropped "z" in version 2; the older value must not leak back.
        let fragments = vec![
            fragment(1, Some("A"), json!({"x": 1, "z": 5})),
            fragment(2, Some("A"), json!({"x": 2})),
        ];
        let view = expand(&fragments, None).unwrap();
        assert_eq!(view.values.get("z"), None);
    }

    #[test]
    fn test_null_is_distinct_from_missing() {
        let fragments = vec![
            fragment(1, Some("A"), json!({"x": 1})),
            fragment(2, Some("B"), json!({"x": null})),
        ];
        let view = expand(&fragments, None).unwrap();
        assert_eq!(view.values.get("x"), Some(&Value::Null));
    }

    #[test]
    fn test_tombstone_hides_record() {
        let mut fragments = history();
        fragments.push(fragment(4, None, json!({})));

        assert!(expand(&fragments, None).is_none());
        assert!(expand(&fragments, Some(3)).is_some());
    }

    #[test]
    fn test_no_visible_fragment() {
        assert!(expand(&[], None).is_none());
        assert!(expand(&history(), Some(0)).is_none());
    }
}
