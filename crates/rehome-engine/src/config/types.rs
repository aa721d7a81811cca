//! Job YAML configuration types.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level job configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub version: String,
    pub job: JobSection,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub layout: LayoutConfig,
    pub origin: EndpointConfig,
    pub destination: EndpointConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSection {
    pub name: String,
    /// Lease name guarding the job. Defaults to the job name.
    pub lock_name: Option<String>,
    #[serde(default = "default_min_hold_secs")]
    pub min_hold_secs: u64,
    #[serde(default = "default_max_hold_secs")]
    pub max_hold_secs: u64,
}

impl JobSection {
    #[must_use]
    pub fn lock_name(&self) -> &str {
        self.lock_name.as_deref().unwrap_or(&self.name)
    }

    #[must_use]
    pub fn min_hold(&self) -> Duration {
        Duration::from_secs(self.min_hold_secs)
    }

    #[must_use]
    pub fn max_hold(&self) -> Duration {
        Duration::from_secs(self.max_hold_secs)
    }
}

fn default_min_hold_secs() -> u64 {
    60
}
fn default_max_hold_secs() -> u64 {
    3600
}

/// Chunking, parallelism, and fault-tolerance limits for reorganisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Skipped items tolerated across the run before it fails.
    #[serde(default = "default_skip_limit")]
    pub skip_limit: u64,
    /// Extra tries per item after the first transient failure.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    /// Page size used by the pending-record reader.
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_chunk_size() -> usize {
    100
}
fn default_workers() -> usize {
    20
}
fn default_skip_limit() -> u64 {
    5
}
fn default_retry_limit() -> u32 {
    3
}
fn default_prefetch() -> usize {
    100
}
fn default_retry_backoff_ms() -> u64 {
    500
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            workers: default_workers(),
            skip_limit: default_skip_limit(),
            retry_limit: default_retry_limit(),
            prefetch: default_prefetch(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

/// Destination partitioning: `depth` directory levels of `width` characters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LayoutConfig {
    #[serde(default = "default_depth")]
    pub depth: usize,
    #[serde(default = "default_width")]
    pub width: usize,
}

fn default_depth() -> usize {
    3
}
fn default_width() -> usize {
    2
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            depth: default_depth(),
            width: default_width(),
        }
    }
}

/// One SFTP endpoint and the pool in front of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub private_key: Option<PathBuf>,
    pub passphrase: Option<String>,
    /// Destination root for reorganised files; on the origin, the root that
    /// relative source paths are resolved against.
    pub base_dir: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_port() -> u16 {
    22
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_pool_size() -> usize {
    10
}
fn default_acquire_timeout_secs() -> u64 {
    30
}
fn default_buffer_size() -> usize {
    8192
}

/// Origin deletion after reorganisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,
    /// Only files reorganised within this many days are deleted.
    #[serde(default = "default_safety_window_days")]
    pub safety_window_days: u32,
    #[serde(default = "default_cleanup_workers")]
    pub workers: usize,
    #[serde(default = "default_cleanup_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_deleted_by")]
    pub deleted_by: String,
}

fn default_cleanup_enabled() -> bool {
    true
}
fn default_safety_window_days() -> u32 {
    90
}
fn default_cleanup_workers() -> usize {
    10
}
fn default_cleanup_chunk_size() -> usize {
    500
}
fn default_deleted_by() -> String {
    "cleanup-step".to_string()
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: default_cleanup_enabled(),
            safety_window_days: default_safety_window_days(),
            workers: default_cleanup_workers(),
            chunk_size: default_cleanup_chunk_size(),
            deleted_by: default_deleted_by(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackendKind {
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_backend")]
    pub backend: StateBackendKind,
    /// Sqlite file path or postgres connection string.
    pub connection: Option<String>,
}

fn default_backend() -> StateBackendKind {
    StateBackendKind::Sqlite
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            connection: None,
        }
    }
}
