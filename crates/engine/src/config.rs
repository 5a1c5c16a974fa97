//! Engine configuration.
//!
//! Stored as pretty JSON, by default at:
//! - Linux: `$XDG_CONFIG_HOME/cloudxfer/config.json` (or `~/.config/...`)
//! - Windows: `%APPDATA%/cloudxfer/config.json`
//!
//! Credentials are never part of the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use cloudxfer_client::{Endpoint, RetryPolicy};
use cloudxfer_protocol::ProviderKind;
use cloudxfer_transfer::DEFAULT_CHUNK_SIZE;

use crate::EngineError;

/// Smallest part size providers accept for every part but the last.
const PROVIDER_MIN_PART: u64 = 5 * 1024 * 1024;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub provider: ProviderKind,
    /// `scheme://host[:port]` of the provider endpoint.
    pub endpoint: String,
    /// Address buckets in the path instead of the host name.
    pub path_style: bool,
    pub region: String,
    /// Default part size for new tasks, in bytes.
    pub chunk_size: u64,
    /// Parts in flight per task.
    pub part_concurrency: usize,
    /// Tasks running at once.
    pub max_concurrent_tasks: usize,
    pub progress_interval_ms: u64,
    pub retry: RetryConfig,
    pub request_timeout_secs: u64,
    /// Root of the durable task records.
    pub state_dir: PathBuf,
}

/// Part retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 200,
            max_delay_ms: 5000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            ..RetryPolicy::default()
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::S3,
            endpoint: "https://s3.us-east-1.amazonaws.com".into(),
            path_style: false,
            region: "us-east-1".into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            part_concurrency: 3,
            max_concurrent_tasks: 2,
            progress_interval_ms: 250,
            retry: RetryConfig::default(),
            request_timeout_secs: 120,
            state_dir: default_state_dir(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from `path`, or returns the defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        if !path.exists() {
            debug!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Saves the configuration to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Platform-specific configuration file path.
    pub fn default_path() -> Option<PathBuf> {
        config_dir().map(|d| d.join("cloudxfer").join("config.json"))
    }

    /// Checks value ranges and the endpoint syntax.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.chunk_size == 0 {
            return Err(EngineError::Config("chunk_size must be greater than zero".into()));
        }
        if self.part_concurrency == 0 {
            return Err(EngineError::Config("part_concurrency must be at least 1".into()));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(EngineError::Config(
                "max_concurrent_tasks must be at least 1".into(),
            ));
        }
        if self.progress_interval_ms == 0 {
            return Err(EngineError::Config(
                "progress_interval_ms must be greater than zero".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.region.is_empty() {
            return Err(EngineError::Config("region must not be empty".into()));
        }
        Endpoint::new(&self.endpoint, self.path_style)
            .map_err(|e| EngineError::Config(e.to_string()))?;

        if self.chunk_size < PROVIDER_MIN_PART {
            warn!(
                chunk_size = self.chunk_size,
                "chunk_size below the 5 MiB multipart minimum; real providers will reject multi-part uploads"
            );
        }
        Ok(())
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn endpoint(&self) -> Result<Endpoint, EngineError> {
        Endpoint::new(&self.endpoint, self.path_style).map_err(|e| EngineError::Config(e.to_string()))
    }
}

/// Default root for task records.
fn default_state_dir() -> PathBuf {
    data_dir()
        .map(|d| d.join("cloudxfer"))
        .unwrap_or_else(|| PathBuf::from(".cloudxfer"))
}

fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }
}

fn data_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("LOCALAPPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("XDG_DATA_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".local").join("share"))
            })
    }
}
