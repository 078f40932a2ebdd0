//! Daemon configuration loaded from TOML

use crate::{CoreError, CoreResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

/// POP3 ingestion and scheduling
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FetchConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Deadline for the connect and login phases
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Deadline for index and retrieval phases
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
    /// UIDLs shorter than this are not trusted as dedup keys
    #[serde(default = "default_min_uidl_len")]
    pub min_uidl_len: usize,
    /// How long done/error progress stays visible
    #[serde(default = "default_progress_expiry_secs")]
    pub progress_expiry_secs: u64,
}

/// Re-delivery targets
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeliveryConfig {
    #[serde(default = "default_imap_host")]
    pub imap_host: String,
    #[serde(default = "default_imap_port")]
    pub imap_port: u16,
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    /// Value of the `X-Fetched-By` header on re-injected mail
    #[serde(default = "default_agent")]
    pub agent: String,
    #[serde(default = "default_target_folder")]
    pub target_folder: String,
}

/// IMAP cache reconciliation
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// UIDs per metadata UID FETCH
    #[serde(default = "default_metadata_batch_size")]
    pub metadata_batch_size: usize,
    /// UIDs per cache DELETE statement
    #[serde(default = "default_delete_chunk_size")]
    pub delete_chunk_size: usize,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("mailbridge.db")
}

fn default_interval_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_transfer_timeout_secs() -> u64 {
    120
}

fn default_min_uidl_len() -> usize {
    3
}

fn default_progress_expiry_secs() -> u64 {
    5
}

fn default_imap_host() -> String {
    "127.0.0.1".to_string()
}

fn default_imap_port() -> u16 {
    993
}

fn default_smtp_host() -> String {
    "127.0.0.1".to_string()
}

fn default_smtp_port() -> u16 {
    25
}

fn default_agent() -> String {
    "mailbridge-pop3-fetcher".to_string()
}

fn default_target_folder() -> String {
    "INBOX".to_string()
}

fn default_metadata_batch_size() -> usize {
    500
}

fn default_delete_chunk_size() -> usize {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            fetch: FetchConfig::default(),
            delivery: DeliveryConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            transfer_timeout_secs: default_transfer_timeout_secs(),
            min_uidl_len: default_min_uidl_len(),
            progress_expiry_secs: default_progress_expiry_secs(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            imap_host: default_imap_host(),
            imap_port: default_imap_port(),
            smtp_host: default_smtp_host(),
            smtp_port: default_smtp_port(),
            agent: default_agent(),
            target_folder: default_target_folder(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            metadata_batch_size: default_metadata_batch_size(),
            delete_chunk_size: default_delete_chunk_size(),
        }
    }
}

impl Config {
    /// Read and parse a TOML file
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CoreError::ConfigError(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> CoreResult<Self> {
        toml::from_str(contents).map_err(|e| CoreError::ConfigError(e.to_string()))
    }
}

impl FetchConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn progress_expiry(&self) -> Duration {
        Duration::from_secs(self.progress_expiry_secs)
    }
}
