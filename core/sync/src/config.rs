//! Sync configuration.

use serde::{Deserialize, Serialize};

use anchorsync_crypto::DEFAULT_CHUNK_SIZE;

use crate::scheduler::SyncMode;

/// Configuration for the sync engines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Zone this replica is scoped to. `None` sees every zone.
    pub zone: Option<String>,
    /// Author stamped on record fragments.
    pub username: String,
    /// Maximum number of file transfers in flight per batch.
    pub concurrency: usize,
    /// Chunk size used when hashing streamed content.
    pub chunk_size: usize,
    /// Sync mode.
    pub sync_mode: SyncMode,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            zone: None,
            username: String::new(),
            concurrency: 10,
            chunk_size: DEFAULT_CHUNK_SIZE,
            sync_mode: SyncMode::Manual,
        }
    }
}

impl SyncConfig {
    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.concurrency, 10);
        assert!(config.zone.is_none());
        assert!(matches!(config.sync_mode, SyncMode::Manual));
    }

    #[test]
    fn test_partial_json() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"zone": "north", "username": "ana"}"#).unwrap();
        assert_eq!(config.zone.as_deref(), Some("north"));
        assert_eq!(config.concurrency, 10);
    }

    #[test]
    fn test_concurrency_floor() {
        assert_eq!(SyncConfig::default().with_concurrency(0).concurrency, 1);
    }
}
