// Pipeline and warehouse configuration

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Secret holding the MotherDuck access token
pub const MOTHERDUCK_TOKEN: &str = "motherduck_token";

/// Secret holding the MotherDuck database name
pub const MOTHERDUCK_DATABASE: &str = "motherdb";

/// Tuning knobs for one ingestion run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Rows per committed batch
    pub batch_size: usize,

    /// Rows sampled for schema validation
    pub sample_size: usize,

    /// Commit attempts per batch, first attempt included
    pub max_attempts: u32,

    /// Base of the exponential commit backoff
    pub retry_base_delay_secs: u64,

    /// Joins nested keys when flattening
    pub separator: char,

    /// Literal prefix removed from flattened column names
    pub strip_prefix: String,

    /// HTTP connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// HTTP read timeout in seconds
    pub read_timeout_secs: u64,

    /// Records buffered between the archive reader and the pipeline
    pub channel_capacity: usize,

    /// Draw progress bars
    pub show_progress: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            batch_size: 150_000,
            sample_size: 500,
            max_attempts: 3,
            retry_base_delay_secs: 3,
            separator: '.',
            strip_prefix: "object_data.".to_string(),
            connect_timeout_secs: 15,
            read_timeout_secs: 30,
            channel_capacity: 256,
            show_progress: true,
        }
    }
}

impl PipelineConfig {
    /// Create new config with builder pattern
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_secs(self.retry_base_delay_secs),
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("Batch size must be greater than 0".to_string());
        }

        if self.sample_size == 0 {
            return Err("Sample size must be greater than 0".to_string());
        }

        if self.max_attempts == 0 {
            return Err("Max attempts must be at least 1".to_string());
        }

        if self.connect_timeout_secs == 0 || self.read_timeout_secs == 0 {
            return Err("Timeouts must be greater than 0".to_string());
        }

        if self.channel_capacity == 0 {
            return Err("Channel capacity must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Builder for PipelineConfig
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    batch_size: Option<usize>,
    sample_size: Option<usize>,
    max_attempts: Option<u32>,
    retry_base_delay_secs: Option<u64>,
    separator: Option<char>,
    strip_prefix: Option<String>,
    connect_timeout_secs: Option<u64>,
    read_timeout_secs: Option<u64>,
    channel_capacity: Option<usize>,
    show_progress: Option<bool>,
}

impl PipelineConfigBuilder {
    pub fn batch_size(mut self, rows: usize) -> Self {
        self.batch_size = Some(rows);
        self
    }

    pub fn sample_size(mut self, rows: usize) -> Self {
        self.sample_size = Some(rows);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn retry_base_delay_secs(mut self, secs: u64) -> Self {
        self.retry_base_delay_secs = Some(secs);
        self
    }

    pub fn separator(mut self, separator: char) -> Self {
        self.separator = Some(separator);
        self
    }

    pub fn strip_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.strip_prefix = Some(prefix.into());
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = Some(secs);
        self
    }

    pub fn read_timeout_secs(mut self, secs: u64) -> Self {
        self.read_timeout_secs = Some(secs);
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = Some(capacity);
        self
    }

    pub fn show_progress(mut self, show: bool) -> Self {
        self.show_progress = Some(show);
        self
    }

    pub fn build(self) -> PipelineConfig {
        let default = PipelineConfig::default();

        PipelineConfig {
            batch_size: self.batch_size.unwrap_or(default.batch_size),
            sample_size: self.sample_size.unwrap_or(default.sample_size),
            max_attempts: self.max_attempts.unwrap_or(default.max_attempts),
            retry_base_delay_secs: self
                .retry_base_delay_secs
                .unwrap_or(default.retry_base_delay_secs),
            separator: self.separator.unwrap_or(default.separator),
            strip_prefix: self.strip_prefix.unwrap_or(default.strip_prefix),
            connect_timeout_secs: self
                .connect_timeout_secs
                .unwrap_or(default.connect_timeout_secs),
            read_timeout_secs: self.read_timeout_secs.unwrap_or(default.read_timeout_secs),
            channel_capacity: self.channel_capacity.unwrap_or(default.channel_capacity),
            show_progress: self.show_progress.unwrap_or(default.show_progress),
        }
    }
}

// ============================================================================
// Environment Variable Support
// ============================================================================

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Unset or unparsable values fall back to the defaults.
    pub fn from_env() -> Self {
        let default = PipelineConfig::default();

        PipelineConfig {
            batch_size: env_parse("INGEST_BATCH_SIZE").unwrap_or(default.batch_size),
            sample_size: env_parse("INGEST_SAMPLE_SIZE").unwrap_or(default.sample_size),
            max_attempts: env_parse("INGEST_MAX_ATTEMPTS").unwrap_or(default.max_attempts),
            retry_base_delay_secs: env_parse("INGEST_RETRY_BASE_DELAY_SECS")
                .unwrap_or(default.retry_base_delay_secs),
            separator: env_parse("INGEST_FIELD_SEPARATOR").unwrap_or(default.separator),
            strip_prefix: std::env::var("INGEST_STRIP_PREFIX").unwrap_or(default.strip_prefix),
            connect_timeout_secs: env_parse("INGEST_CONNECT_TIMEOUT_SECS")
                .unwrap_or(default.connect_timeout_secs),
            read_timeout_secs: env_parse("INGEST_READ_TIMEOUT_SECS")
                .unwrap_or(default.read_timeout_secs),
            channel_capacity: env_parse("INGEST_CHANNEL_CAPACITY")
                .unwrap_or(default.channel_capacity),
            show_progress: env_parse("INGEST_SHOW_PROGRESS").unwrap_or(default.show_progress),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

// ============================================================================
// Warehouse Configuration
// ============================================================================

/// Where batches are loaded
#[derive(Clone, PartialEq, Eq)]
pub enum WarehouseTarget {
    /// Hosted MotherDuck database
    MotherDuck { database: String, token: String },
    /// Local DuckDB file
    Local(PathBuf),
    /// Throwaway in-process database
    InMemory,
}

impl fmt::Debug for WarehouseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WarehouseTarget::MotherDuck { database, .. } => f
                .debug_struct("MotherDuck")
                .field("database", database)
                .field("token", &"<redacted>")
                .finish(),
            WarehouseTarget::Local(path) => f.debug_tuple("Local").field(path).finish(),
            WarehouseTarget::InMemory => f.write_str("InMemory"),
        }
    }
}

impl fmt::Display for WarehouseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WarehouseTarget::MotherDuck { database, .. } => write!(f, "md:{}", database),
            WarehouseTarget::Local(path) => write!(f, "{}", path.display()),
            WarehouseTarget::InMemory => write!(f, ":memory:"),
        }
    }
}

/// Connection settings for the destination gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehouseConfig {
    pub target: WarehouseTarget,
}

impl WarehouseConfig {
    /// MotherDuck target from a secret mapping carrying
    /// [`MOTHERDUCK_TOKEN`] and [`MOTHERDUCK_DATABASE`]
    pub fn from_secrets(secrets: &HashMap<String, String>) -> Result<Self, String> {
        let lookup = |name: &str| {
            secrets
                .get(name)
                .filter(|v| !v.trim().is_empty())
                .cloned()
                .ok_or_else(|| format!("Secret '{}' is missing", name))
        };

        Ok(Self {
            target: WarehouseTarget::MotherDuck {
                database: lookup(MOTHERDUCK_DATABASE)?,
                token: lookup(MOTHERDUCK_TOKEN)?,
            },
        })
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            target: WarehouseTarget::Local(path.into()),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            target: WarehouseTarget::InMemory,
        }
    }

    /// DuckDB open string; `None` for an in-memory database
    pub fn connection_string(&self) -> Option<String> {
        match &self.target {
            WarehouseTarget::MotherDuck { database, token } => {
                Some(format!("md:{}?motherduck_token={}", database, token))
            },
            WarehouseTarget::Local(path) => Some(path.display().to_string()),
            WarehouseTarget::InMemory => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
