//! Configuration loading and types for chunkstore.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs one part of the system: the
//! shared connector core, each backend family, and logging.  Backend
//! clients themselves (credentials, sessions) are built by the host; only
//! the S3 client builder reads [`S3Settings`].

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Settings shared by every connector.
    #[serde(default)]
    pub connector: ConnectorConfig,

    /// Object store backend settings.
    #[serde(default)]
    pub object: ObjectStoreConfig,

    /// Document store backend settings.
    #[serde(default)]
    pub document: DocumentConfig,

    /// Log broker backend settings.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connector core settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectorConfig {
    /// Wrap the connector in the caching decorator.
    #[serde(default)]
    pub caching: bool,

    /// Override the backend's maximum blob size in bytes.  Values above the
    /// backend's own limit are clamped to it.
    #[serde(default)]
    pub max_blob_size: Option<u64>,
}

/// Object store settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObjectStoreConfig {
    /// Byte capacity of the in-process store (0 = unlimited).
    #[serde(default)]
    pub memory_max_size_bytes: u64,

    /// S3 client settings, when talking to S3 or a compatible service.
    #[serde(default)]
    pub s3: Option<S3Settings>,
}

/// S3 client settings.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Settings {
    /// AWS region.
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom S3-compatible endpoint (e.g. MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: String,
    /// Force path-style URL addressing.
    #[serde(default)]
    pub use_path_style: bool,
    /// Explicit AWS access key (falls back to env/credential chain).
    #[serde(default)]
    pub access_key_id: String,
    /// Explicit AWS secret key (falls back to env/credential chain).
    #[serde(default)]
    pub secret_access_key: String,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: String::new(),
            use_path_style: false,
            access_key_id: String::new(),
            secret_access_key: String::new(),
        }
    }
}

/// Document store settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DocumentConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_document_path")]
    pub path: String,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            path: default_document_path(),
        }
    }
}

/// Log broker settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Consecutive empty polls tolerated before a read or index rebuild fails.
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,

    /// Timeout of a single poll in milliseconds.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Topic holding the file-system index.
    #[serde(default = "default_files_topic")]
    pub files_topic: String,

    /// Partitions per topic for the in-process broker.
    #[serde(default = "default_partitions")]
    pub partitions: u32,
}

impl BrokerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            poll_attempts: default_poll_attempts(),
            poll_timeout_ms: default_poll_timeout_ms(),
            files_topic: default_files_topic(),
            partitions: default_partitions(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_document_path() -> String {
    "./data/documents.db".to_string()
}

fn default_poll_attempts() -> u32 {
    3
}

fn default_poll_timeout_ms() -> u64 {
    3000
}

fn default_files_topic() -> String {
    "__chunkstore_files".to_string()
}

fn default_partitions() -> u32 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Load configuration from a YAML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    if config.connector.max_blob_size == Some(0) {
        anyhow::bail!("connector.max_blob_size must be at least 1");
    }
    if config.broker.poll_attempts == 0 {
        anyhow::bail!("broker.poll_attempts must be at least 1");
    }
    Ok(config)
}
