//! Client configuration file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use anchorsync_sync::SyncConfig;

/// Settings read from the `--config` JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the remote store.
    pub remote_url: String,
    /// Path of the local SQLite database.
    pub database: PathBuf,
    pub sync: SyncConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            remote_url: "http://localhost:8080/".to_string(),
            database: PathBuf::from("anchorsync.db"),
            sync: SyncConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load a configuration file; missing fields keep their defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_partial_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("client.json");
        tokio::fs::write(
            &path,
            r#"{"remote_url": "https://sync.example.org/", "sync": {"zone": "north"}}"#,
        )
        .await
        .unwrap();

        let config = ClientConfig::load(&path).await.unwrap();
        assert_eq!(config.remote_url, "https://sync.example.org/");
        assert_eq!(config.database, PathBuf::from("anchorsync.db"));
        assert_eq!(config.sync.zone.as_deref(), Some("north"));
        assert_eq!(config.sync.concurrency, 10);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        assert!(ClientConfig::load(&temp_dir.path().join("nope.json")).await.is_err());
    }
}
