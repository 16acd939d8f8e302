use std::path::Path;
use std::time::Duration;

use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use crate::error::{ConfigurationError, Result};

/// Largest accepted chunk size (64 MiB)
pub const MAX_CHUNK_SIZE: u32 = 64 * 1024 * 1024;

/// Configuration for a synchronization node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// File chunking settings
    #[serde(default)]
    pub file: FileConfig,

    /// Direct download settings
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,
}

/// File chunking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    /// Bytes per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,

    /// Maximum file size accepted for upload (in bytes)
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Name of the directory below the node root holding per-chunk temporaries
    #[serde(default = "default_temp_dir_name")]
    pub temp_dir_name: String,
}

/// Direct download configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Bound on the wait for one chunk response (milliseconds)
    #[serde(default = "default_direct_download_timeout_ms")]
    pub direct_download_timeout_ms: u64,

    /// Number of chunk sub-processes a download runs at once
    #[serde(default = "default_max_parallel_chunks")]
    pub max_parallel_chunks: usize,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address to listen on for incoming connections
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Transport-level request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_connection_timeout_secs")]
    pub idle_connection_timeout_secs: u64,
}

fn default_chunk_size() -> u32 { 1024 * 1024 } // 1 MiB
fn default_max_file_size() -> u64 { 100 * 1024 * 1024 } // 100 MiB
fn default_temp_dir_name() -> String { ".p2p-sync-tmp".to_string() }
fn default_direct_download_timeout_ms() -> u64 { 30_000 }
fn default_max_parallel_chunks() -> usize { 4 }
fn default_listen_addr() -> String { "/ip4/0.0.0.0/tcp/0".to_string() }
fn default_request_timeout_secs() -> u64 { 60 }
fn default_idle_connection_timeout_secs() -> u64 { 30 }

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_file_size: default_max_file_size(),
            temp_dir_name: default_temp_dir_name(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            direct_download_timeout_ms: default_direct_download_timeout_ms(),
            max_parallel_chunks: default_max_parallel_chunks(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            request_timeout_secs: default_request_timeout_secs(),
            idle_connection_timeout_secs: default_idle_connection_timeout_secs(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file and validate it
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).await.map_err(|_| {
            ConfigurationError::FileNotFound {
                path: path.to_path_buf(),
            }
        })?;

        let config = Self::from_toml_str(&content)?;
        info!("Configuration loaded from: {}", path.display());
        Ok(config)
    }

    /// Parse configuration from TOML text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigurationError::InvalidFormat {
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.file.chunk_size == 0 || self.file.chunk_size > MAX_CHUNK_SIZE {
            return Err(invalid(
                "file.chunk_size",
                format!("must be between 1 and {} bytes", MAX_CHUNK_SIZE),
            ));
        }
        if self.file.max_file_size == 0 {
            return Err(invalid("file.max_file_size", "must be greater than 0"));
        }
        if self.file.temp_dir_name.is_empty() || self.file.temp_dir_name.contains(['/', '\\']) {
            return Err(invalid(
                "file.temp_dir_name",
                "must be a plain directory name",
            ));
        }
        if self.transfer.direct_download_timeout_ms == 0 {
            return Err(invalid(
                "transfer.direct_download_timeout_ms",
                "must be greater than 0",
            ));
        }
        if self.transfer.max_parallel_chunks == 0 {
            return Err(invalid(
                "transfer.max_parallel_chunks",
                "must be greater than 0",
            ));
        }
        if let Err(e) = self.network.listen_addr.parse::<Multiaddr>() {
            return Err(invalid("network.listen_addr", e.to_string()));
        }
        if self.network.request_timeout_secs == 0 {
            return Err(invalid(
                "network.request_timeout_secs",
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Chunk size as `usize`
    pub fn chunk_size(&self) -> usize {
        self.file.chunk_size as usize
    }

    /// Bound on a single chunk request wait
    pub fn direct_download_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer.direct_download_timeout_ms)
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> crate::error::SyncError {
    ConfigurationError::ValidationFailed {
        key: key.to_string(),
        reason: reason.into(),
    }
    .into()
}
