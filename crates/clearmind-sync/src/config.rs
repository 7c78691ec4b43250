//! Engine configuration
//!
//! Everything has a usable default so embedding hosts can start from
//! `EngineConfig::new(data_dir)` and override what they need. The CLI can
//! also load a JSON file with the same field names.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Default bound on queued outbox entries before the oldest are dropped.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 10_000;

/// Which local persistence backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// Embedded database if it can be opened, document file otherwise
    #[default]
    Auto,
    /// Embedded database only
    Embedded,
    /// Serialized JSON document only
    Document,
}

/// Argon2id cost parameters used for every locally stored password hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashingParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for HashingParams {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl HashingParams {
    /// Cheapest parameters Argon2 accepts. Only for throwaway stores.
    pub fn minimal() -> Self {
        Self {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the database (or document) file
    pub data_dir: PathBuf,
    pub backend: BackendPreference,
    /// Base URL of the journal API, e.g. `https://host/api`
    pub api_base_url: String,
    /// Upper bound on any single remote call
    pub request_timeout_secs: u64,
    pub outbox_capacity: usize,
    /// Periodic drain while online, in addition to reconnect-triggered drains
    pub drain_interval_secs: u64,
    /// How often the reachability probe runs
    pub probe_interval_secs: u64,
    pub hashing: HashingParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            backend: BackendPreference::Auto,
            api_base_url: "http://localhost:8000/api".to_string(),
            request_timeout_secs: 10,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            drain_interval_secs: 300,
            probe_interval_secs: 15,
            hashing: HashingParams::default(),
        }
    }
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.outbox_capacity == 0 {
            return Err(SyncError::Config("outbox_capacity must be at least 1".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(SyncError::Config("request_timeout_secs must be positive".into()));
        }
        if self.drain_interval_secs == 0 || self.probe_interval_secs == 0 {
            return Err(SyncError::Config("intervals must be positive".into()));
        }
        reqwest::Url::parse(&self.api_base_url)
            .map_err(|e| SyncError::Config(format!("api_base_url: {}", e)))?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("clearmind.redb")
    }

    pub fn document_path(&self) -> PathBuf {
        self.data_dir.join("clearmind.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::new("/tmp/clearmind");
        assert!(config.validate().is_ok());
        assert_eq!(config.outbox_capacity, DEFAULT_OUTBOX_CAPACITY);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(
            config.database_path(),
            PathBuf::from("/tmp/clearmind/clearmind.redb")
        );
    }

    #[test]
    fn test_load_fills_missing_fields() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"api_base_url": "https://journal.example/api", "backend": "document"}"#,
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.api_base_url, "https://journal.example/api");
        assert_eq!(config.backend, BackendPreference::Document);
        assert_eq!(config.outbox_capacity, DEFAULT_OUTBOX_CAPACITY);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = EngineConfig {
            outbox_capacity: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }
}
