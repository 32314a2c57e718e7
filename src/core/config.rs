//! Engine configuration from YAML

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of resume consumer partitions (one worker each)
    pub partitions: usize,

    /// Retry policy for persistence-layer failures
    pub persistence: PersistenceConfig,

    /// How often the timeout monitor looks for expired nodes
    pub timeout_tick_ms: u64,

    /// SQLite database file (defaults to the platform data dir)
    pub database_path: Option<PathBuf>,
}

/// Bounded backoff for persistence-layer failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,

    /// Delay before the second attempt; doubled for every following one
    pub base_delay_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
        }
    }
}

impl PersistenceConfig {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(1 << attempt.min(16)))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            persistence: PersistenceConfig::default(),
            timeout_tick_ms: 1000,
            database_path: None,
        }
    }
}

impl EngineConfig {
    /// Load engine configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse engine configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            anyhow::bail!("partitions must be at least 1");
        }
        if self.persistence.max_attempts == 0 {
            anyhow::bail!("persistence.max_attempts must be at least 1");
        }
        if self.timeout_tick_ms == 0 {
            anyhow::bail!("timeout_tick_ms must be greater than 0");
        }
        Ok(())
    }

    pub fn timeout_tick(&self) -> Duration {
        Duration::from_millis(self.timeout_tick_ms)
    }

    /// Resolve the database path, falling back to the local data dir
    pub fn database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("orchestrator")
                .join("executions.db")
        })
    }
}
