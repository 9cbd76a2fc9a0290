use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

pub const CONFIG_FILE: &str = "engine.json";

/// Default location for the audit database and overflow files.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("capability-engine")
}

/// Engine configuration. Every field has a default so a partial (or absent)
/// `engine.json` is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,
    pub audit: AuditConfig,
    pub runner: RunnerConfig,
    /// Capacity of the broadcast channel the UI layer subscribes to.
    pub event_capacity: usize,
    /// Seconds the consent provider waits for a decision before denying.
    pub elevation_prompt_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub database_file: String,
    /// Subdirectory of the data dir holding spilled stdout/stderr.
    pub overflow_dir: String,
    /// Streams larger than this are written to an overflow file.
    pub spill_threshold_bytes: usize,
    /// Inline preview kept in the record when a stream spills.
    pub preview_bytes: usize,
    pub writer_capacity: usize,
    /// Age after which records are pruned. Unset keeps history forever.
    pub retention_days: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Window between SIGTERM and SIGKILL on timeout or cancellation.
    pub termination_grace_ms: u64,
    /// Upper bound on stdout/stderr kept in memory per stream.
    pub max_capture_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            audit: AuditConfig::default(),
            runner: RunnerConfig::default(),
            event_capacity: 256,
            elevation_prompt_timeout_secs: 60,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            database_file: "audit.db".into(),
            overflow_dir: "output".into(),
            spill_threshold_bytes: 10 * 1024,
            preview_bytes: 2 * 1024,
            writer_capacity: 256,
            retention_days: None,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            termination_grace_ms: 500,
            max_capture_bytes: 8 * 1024 * 1024,
        }
    }
}

impl AuditConfig {
    pub fn retention(&self) -> Option<chrono::Duration> {
        self.retention_days.map(|days| chrono::Duration::days(i64::from(days)))
    }
}

impl RunnerConfig {
    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }
}

impl EngineConfig {
    /// Load `engine.json` from the data directory, falling back to defaults
    /// when the file does not exist.
    pub fn load(data_dir: &Path) -> EngineResult<Self> {
        let path = data_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            serde_json::from_str::<EngineConfig>(&data)?
        } else {
            EngineConfig::default()
        };
        config.data_dir = data_dir.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    pub fn with_data_dir(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.audit.preview_bytes > self.audit.spill_threshold_bytes {
            return Err(EngineError::Config(format!(
                "audit.preview_bytes ({}) must not exceed audit.spill_threshold_bytes ({})",
                self.audit.preview_bytes, self.audit.spill_threshold_bytes
            )));
        }
        if self.event_capacity == 0 || self.audit.writer_capacity == 0 {
            return Err(EngineError::Config("channel capacities must be positive".into()));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.audit.database_file)
    }

    pub fn overflow_path(&self) -> PathBuf {
        self.data_dir.join(&self.audit.overflow_dir)
    }
}
