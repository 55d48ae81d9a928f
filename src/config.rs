// Logger Configuration and Constants

use crate::error::{LoggerError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8008;
pub const DEFAULT_LOG_FILE: &str = "agent-traffic.jsonl";
pub const DEFAULT_UPSTREAM_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_TARGET_HOST: &str = "api.anthropic.com";
pub const DEFAULT_CONFIG_FILE: &str = "agentlog.toml";

/// Top-level configuration, handed to each component at construction time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub writer: WriterConfig,
    pub capture: CaptureConfig,
    pub proxy: ProxyConfig,
    pub consumer: ConsumerConfig,
    pub project: ProjectInfo,
    pub redaction: RedactionConfig,
    /// Verbose logging
    pub debug: bool,
}

/// On-disk layout of the log file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageFormat {
    /// One JSON object per line
    #[default]
    Jsonl,
    /// Legacy single JSON array
    JsonArray,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub log_file: PathBuf,
    pub format: StorageFormat,
    /// Queue length that forces an immediate flush
    pub max_queue_size: usize,
    pub flush_interval_ms: u64,
    /// Attempts per flush before the batch goes back on the queue
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            format: StorageFormat::Jsonl,
            max_queue_size: 100,
            flush_interval_ms: 1_000,
            max_retries: 3,
            retry_delay_ms: 100,
        }
    }
}

impl WriterConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Window for ordinary responses
    pub response_timeout_ms: u64,
    /// Window for declared streaming responses
    pub stream_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 120_000,
            stream_timeout_ms: 600_000,
        }
    }
}

impl CaptureConfig {
    pub fn timeout_for(&self, streaming: bool) -> Duration {
        if streaming {
            Duration::from_millis(self.stream_timeout_ms)
        } else {
            Duration::from_millis(self.response_timeout_ms)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub port: u16,
    pub upstream_url: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Only records sent to this host are application records
    pub target_host: String,
    /// Characters kept in collapsed previews
    pub preview_chars: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            target_host: DEFAULT_TARGET_HOST.to_string(),
            preview_chars: 100,
        }
    }
}

/// Per-run identifying metadata stamped onto every record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectInfo {
    pub name: String,
    pub version: String,
}

impl Default for ProjectInfo {
    fn default() -> Self {
        let name = std::env::current_dir()
            .ok()
            .and_then(|dir| dir.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            name,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// User-supplied redaction rules, applied after the builtin ones
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    /// Regular expressions
    pub patterns: Vec<String>,
    /// Literal, case-insensitive keywords
    pub keywords: Vec<String>,
}

impl AppConfig {
    /// Load configuration: defaults, then the TOML file, then `AGENTLOG_` env overrides.
    ///
    /// Nested keys use a double underscore, e.g. `AGENTLOG_WRITER__MAX_QUEUE_SIZE=50`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Toml},
            Figment,
        };

        let file = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let config: AppConfig = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("AGENTLOG_").split("__"))
            .extract()
            .map_err(|e| LoggerError::Config(format!("failed to load configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.writer.max_queue_size == 0 {
            return Err(LoggerError::Config(
                "writer.max_queue_size must be at least 1".to_string(),
            ));
        }
        if self.writer.max_retries == 0 {
            return Err(LoggerError::Config(
                "writer.max_retries must be at least 1".to_string(),
            ));
        }
        if self.writer.flush_interval_ms == 0 {
            return Err(LoggerError::Config(
                "writer.flush_interval_ms must be positive".to_string(),
            ));
        }
        if self.capture.response_timeout_ms == 0 || self.capture.stream_timeout_ms == 0 {
            return Err(LoggerError::Config(
                "capture timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
