//! Configuration for the WebDAV ingest server

use crate::context::{DEFAULT_CHUNK_TTL, DEFAULT_MAX_UPLOAD_SIZE};
use crate::dav::ServiceOptions;
use crate::storage::ViewOptions;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address to listen on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Root directory holding `{user}/files` and `{user}/uploads`
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Hard ceiling for a single entity in bytes
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,

    /// Per-user quota in bytes. When unset, the free space of the disk
    /// holding `data_dir` is used.
    #[serde(default)]
    pub quota_bytes: Option<u64>,

    /// Write uploads to a `.part` file and rename on success.
    /// Disable only on filesystems where rename is not atomic anyway.
    #[serde(default = "default_staging_writes")]
    pub staging_writes: bool,

    /// Seconds before an unfinished chunked transfer is discarded
    #[serde(default = "default_chunk_ttl_secs")]
    pub chunk_ttl_secs: u64,

    /// Per-user metadata cache capacity
    #[serde(default = "default_metadata_cache_entries")]
    pub metadata_cache_entries: u64,

    /// Log level filter string.
    /// Set via config file or WDI_LOG_LEVEL env var. Overridden by RUST_LOG.
    /// Default: "webdav_ingest=debug,tower_http=debug"
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_max_upload_size() -> u64 {
    DEFAULT_MAX_UPLOAD_SIZE
}

fn default_staging_writes() -> bool {
    true
}

fn default_chunk_ttl_secs() -> u64 {
    DEFAULT_CHUNK_TTL.as_secs()
}

fn default_metadata_cache_entries() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "webdav_ingest=debug,tower_http=debug".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            data_dir: default_data_dir(),
            max_upload_size: default_max_upload_size(),
            quota_bytes: None,
            staging_writes: default_staging_writes(),
            chunk_ttl_secs: default_chunk_ttl_secs(),
            metadata_cache_entries: default_metadata_cache_entries(),
            log_level: default_log_level(),
        }
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from `WDI_*` variables returned by `lookup`.
    /// Unparseable values are ignored and leave the default in place.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("WDI_LISTEN_ADDR").and_then(|v| v.parse().ok()) {
            config.listen_addr = addr;
        }
        if let Some(dir) = lookup("WDI_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(size) = lookup("WDI_MAX_UPLOAD_SIZE").and_then(|v| v.parse().ok()) {
            config.max_upload_size = size;
        }
        if let Some(quota) = lookup("WDI_QUOTA_BYTES").and_then(|v| v.parse().ok()) {
            config.quota_bytes = Some(quota);
        }
        if let Some(staging) = lookup("WDI_STAGING_WRITES") {
            config.staging_writes = parse_bool(&staging);
        }
        if let Some(ttl) = lookup("WDI_CHUNK_TTL_SECS").and_then(|v| v.parse().ok()) {
            config.chunk_ttl_secs = ttl;
        }
        if let Some(entries) = lookup("WDI_METADATA_CACHE_ENTRIES").and_then(|v| v.parse().ok()) {
            config.metadata_cache_entries = entries;
        }
        if let Some(level) = lookup("WDI_LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }

    /// Load configuration from file if it exists, otherwise from environment
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("WDI_CONFIG") {
            match Self::from_file(&path) {
                Ok(config) => return config,
                Err(e) => eprintln!("Warning: ignoring config {}: {}", path, e),
            }
        }

        for path in &["webdav_ingest.toml", "/etc/webdav_ingest/config.toml"] {
            if std::path::Path::new(path).exists() {
                if let Ok(config) = Self::from_file(path) {
                    return config;
                }
            }
        }

        Self::from_env()
    }

    pub fn chunk_ttl(&self) -> Duration {
        Duration::from_secs(self.chunk_ttl_secs)
    }

    /// Settings for the DAV service built from this config
    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            data_dir: self.data_dir.clone(),
            view: ViewOptions {
                quota_bytes: self.quota_bytes,
                staging_writes: self.staging_writes,
                cache_entries: self.metadata_cache_entries,
            },
            max_upload_size: self.max_upload_size,
            chunk_ttl: self.chunk_ttl(),
        }
    }

    /// Serialize config to a TOML string.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
