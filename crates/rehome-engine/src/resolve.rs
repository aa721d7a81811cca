//! Turns a validated [`JobConfig`] into live state, sessions, and settings.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rehome_remote::sftp::{SftpAuth, SftpEndpoint, SftpSessionFactory};
use rehome_remote::{PoolConfig, SessionPool};
use rehome_state::{PostgresStateBackend, SqliteStateBackend, StateBackend};

use crate::cleanup::CleanupSettings;
use crate::config::types::{EndpointConfig, JobConfig, StateBackendKind, StateConfig};
use crate::layout::PathResolver;
use crate::lock::LockPolicy;
use crate::orchestrator::{JobContext, JobSettings};
use crate::reorganize::MigrationSettings;

pub const ORIGIN: &str = "origin";
pub const DESTINATION: &str = "destination";

/// Default sqlite location when the job names none.
#[must_use]
pub fn default_state_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".rehome").join("state.db")
}

/// Open the configured state backend.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or initialised.
pub fn create_state_backend(config: &StateConfig) -> Result<Arc<dyn StateBackend>> {
    match config.backend {
        StateBackendKind::Sqlite => {
            let backend = if let Some(path) = &config.connection {
                SqliteStateBackend::open(Path::new(path)).context("Failed to open state DB")?
            } else {
                SqliteStateBackend::open(&default_state_path())
                    .context("Failed to open default state DB")?
            };
            Ok(Arc::new(backend) as Arc<dyn StateBackend>)
        }
        StateBackendKind::Postgres => {
            let connstr = config
                .connection
                .as_deref()
                .context("postgres state backend requires a connection string")?;
            let backend = PostgresStateBackend::open(connstr)
                .map_err(|e| anyhow::anyhow!("failed to open Postgres state backend: {e}"))?;
            Ok(Arc::new(backend) as Arc<dyn StateBackend>)
        }
    }
}

/// SFTP connection settings for one endpoint.
///
/// # Errors
///
/// Returns an error unless exactly one of password or private key is set.
pub fn sftp_endpoint(name: &str, config: &EndpointConfig) -> Result<SftpEndpoint> {
    let auth = match (&config.password, &config.private_key) {
        (Some(password), None) => SftpAuth::Password(password.clone()),
        (None, Some(key)) => SftpAuth::PrivateKey {
            path: key.clone(),
            passphrase: config.passphrase.clone(),
        },
        (Some(_), Some(_)) => {
            anyhow::bail!("{name}: set either password or private_key, not both")
        }
        (None, None) => anyhow::bail!("{name}: password or private_key is required"),
    };
    Ok(SftpEndpoint {
        name: name.to_string(),
        host: config.host.clone(),
        port: config.port,
        user: config.user.clone(),
        auth,
        timeout: Duration::from_secs(config.timeout_secs),
    })
}

#[must_use]
pub fn pool_config(config: &EndpointConfig) -> PoolConfig {
    PoolConfig {
        max_size: config.pool_size.max(1),
        acquire_timeout: Duration::from_secs(config.acquire_timeout_secs),
        buffer_size: config.buffer_size.max(1),
    }
}

/// A lazily connecting SFTP pool. No connection is opened until first use.
///
/// # Errors
///
/// Returns an error if the endpoint credentials are inconsistent.
pub fn sftp_pool(name: &str, config: &EndpointConfig) -> Result<SessionPool> {
    let factory = SftpSessionFactory::new(sftp_endpoint(name, config)?);
    Ok(SessionPool::new(Arc::new(factory), pool_config(config)))
}

/// Assemble a [`JobContext`] around an already opened store and pools.
///
/// # Errors
///
/// Returns an error if the destination has no `base_dir`.
pub fn build_job_context(
    config: &JobConfig,
    store: Arc<dyn StateBackend>,
    origin: SessionPool,
    destination: SessionPool,
) -> Result<JobContext> {
    let destination_base = config
        .destination
        .base_dir
        .clone()
        .context("destination: base_dir is required")?;
    let batch = &config.batch;
    let cleanup = config.cleanup.enabled.then(|| CleanupSettings {
        safety_window: chrono::Duration::days(i64::from(config.cleanup.safety_window_days)),
        workers: config.cleanup.workers,
        chunk_size: config.cleanup.chunk_size,
        deleted_by: config.cleanup.deleted_by.clone(),
    });

    Ok(JobContext {
        job: JobSettings {
            name: config.job.name.clone(),
            lock_name: config.job.lock_name().to_string(),
            lock_policy: LockPolicy {
                min_hold: config.job.min_hold(),
                max_hold: config.job.max_hold(),
            },
        },
        store,
        origin,
        destination,
        resolver: PathResolver::new(config.layout.depth, config.layout.width),
        origin_base: config.origin.base_dir.clone(),
        destination_base,
        migration: MigrationSettings {
            chunk_size: batch.chunk_size,
            workers: batch.workers,
            skip_limit: batch.skip_limit,
            prefetch: batch.prefetch,
        },
        retry_limit: batch.retry_limit,
        retry_backoff: Duration::from_millis(batch.retry_backoff_ms),
        cleanup,
    })
}

/// Open everything a job needs from its configuration.
///
/// # Errors
///
/// Returns an error if the state backend cannot be opened or an endpoint
/// is misconfigured.
pub fn resolve_job(config: &JobConfig) -> Result<JobContext> {
    let store = create_state_backend(&config.state)?;
    let origin = sftp_pool(ORIGIN, &config.origin)?;
    let destination = sftp_pool(DESTINATION, &config.destination)?;
    tracing::debug!(
        job = config.job.name,
        origin = %config.origin.host,
        destination = %config.destination.host,
        "Resolved job"
    );
    build_job_context(config, store, origin, destination)
}

pub(crate) fn check_state_backend(config: &StateConfig) -> bool {
    match create_state_backend(config) {
        Ok(_) => {
            tracing::info!("State backend: OK");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "State backend: FAILED");
            false
        }
    }
}
