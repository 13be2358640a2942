use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, TccError};
use crate::serializer::SerializerKind;

/// Settings of the recovery scheduler.
///
/// All delays are in milliseconds so they can be written as plain numbers in
/// a config file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Pause between the end of one recovery cycle and the start of the next.
    pub scheduled_delay_ms: u64,
    /// Grace period after process start before the first cycle runs.
    pub initial_delay_ms: u64,
    /// How long a record must sit untouched before it is considered for
    /// recovery. Also the unit of the participant deferral window.
    pub recovery_delay_ms: u64,
    /// Compensation attempts allowed before a record is left for an operator.
    pub retry_max: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            scheduled_delay_ms: 60_000,
            initial_delay_ms: 30_000,
            recovery_delay_ms: 60_000,
            retry_max: 3,
        }
    }
}

impl RecoveryConfig {
    pub fn scheduled_delay(&self) -> Duration {
        Duration::from_millis(self.scheduled_delay_ms)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }

    /// Length of the window during which a participant-role record defers to
    /// its initiator: `retry_max * recovery_delay`.
    pub fn participant_grace_ms(&self) -> u64 {
        (self.retry_max as u64).saturating_mul(self.recovery_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduled_delay_ms == 0 {
            return Err(TccError::Config(
                "scheduled_delay_ms must be greater than zero".to_string(),
            ));
        }
        if self.recovery_delay_ms == 0 {
            return Err(TccError::Config(
                "recovery_delay_ms must be greater than zero".to_string(),
            ));
        }
        if self.retry_max == 0 {
            return Err(TccError::Config("retry_max must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Settings shared by the repository backends.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Base directory for the file backend and, unless `rocks_path` is set,
    /// for the RocksDB backend.
    pub root: PathBuf,
    pub serializer: SerializerKind,
    /// Explicit RocksDB directory, overriding the one derived from `root`.
    pub rocks_path: Option<PathBuf>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("tcc"),
            serializer: SerializerKind::default(),
            rocks_path: None,
        }
    }
}

/// Top-level coordinator configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TccConfig {
    /// Application name. Scopes the directory, node path or table every
    /// backend writes to, so several applications can share one store.
    pub namespace: String,
    pub repository: RepositoryConfig,
    pub recovery: RecoveryConfig,
}

impl Default for TccConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            repository: RepositoryConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl TccConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: TccConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(TccError::Config("namespace must not be empty".to_string()));
        }
        self.recovery.validate()
    }
}
