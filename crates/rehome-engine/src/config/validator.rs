//! Semantic validation for parsed job configuration values.

use anyhow::{bail, Result};

use crate::config::types::{EndpointConfig, JobConfig, StateBackendKind};
use crate::lock::MAX_HOLD;

fn validate_endpoint(endpoint: &EndpointConfig, context: &str, errors: &mut Vec<String>) {
    if endpoint.host.trim().is_empty() {
        errors.push(format!("{context}: host must not be empty"));
    }
    if endpoint.port == 0 {
        errors.push(format!("{context}: port must be > 0"));
    }
    if endpoint.user.trim().is_empty() {
        errors.push(format!("{context}: user must not be empty"));
    }
    match (&endpoint.password, &endpoint.private_key) {
        (None, None) => errors.push(format!(
            "{context}: either password or private_key is required"
        )),
        (Some(_), Some(_)) => errors.push(format!(
            "{context}: password and private_key are mutually exclusive"
        )),
        _ => {}
    }
    if endpoint.timeout_secs == 0 {
        errors.push(format!("{context}: timeout_secs must be > 0"));
    }
    if endpoint.pool_size == 0 {
        errors.push(format!("{context}: pool_size must be at least 1"));
    }
    if endpoint.acquire_timeout_secs == 0 {
        errors.push(format!("{context}: acquire_timeout_secs must be > 0"));
    }
    if endpoint.buffer_size == 0 {
        errors.push(format!("{context}: buffer_size must be at least 1"));
    }
}

/// Validate a parsed job configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the job config.
pub fn validate_job(config: &JobConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported job version '{}', expected '1.0'",
            config.version
        ));
    }

    if config.job.name.trim().is_empty() {
        errors.push("Job name must not be empty".to_string());
    }
    if config
        .job
        .lock_name
        .as_deref()
        .is_some_and(|n| n.trim().is_empty())
    {
        errors.push("lock_name must not be empty when set".to_string());
    }
    if config.job.max_hold_secs == 0 {
        errors.push("max_hold_secs must be > 0".to_string());
    }
    if config.job.max_hold_secs > MAX_HOLD.as_secs() {
        errors.push(format!(
            "max_hold_secs ({}) must not exceed {}",
            config.job.max_hold_secs,
            MAX_HOLD.as_secs()
        ));
    }
    if config.job.min_hold_secs > config.job.max_hold_secs {
        errors.push(format!(
            "min_hold_secs ({}) must not exceed max_hold_secs ({})",
            config.job.min_hold_secs, config.job.max_hold_secs
        ));
    }

    if config.batch.chunk_size == 0 {
        errors.push("batch.chunk_size must be at least 1".to_string());
    }
    if config.batch.workers == 0 {
        errors.push("batch.workers must be at least 1".to_string());
    }
    if config.batch.prefetch == 0 {
        errors.push("batch.prefetch must be at least 1".to_string());
    }

    if config.layout.depth == 0 {
        errors.push("layout.depth must be at least 1".to_string());
    }
    if config.layout.width == 0 {
        errors.push("layout.width must be at least 1".to_string());
    }

    validate_endpoint(&config.origin, "origin", &mut errors);
    validate_endpoint(&config.destination, "destination", &mut errors);
    if config
        .destination
        .base_dir
        .as_deref()
        .map_or(true, |d| d.trim().is_empty())
    {
        errors.push("destination: base_dir is required".to_string());
    }

    if config.cleanup.enabled {
        if config.cleanup.workers == 0 {
            errors.push("cleanup.workers must be at least 1".to_string());
        }
        if config.cleanup.chunk_size == 0 {
            errors.push("cleanup.chunk_size must be at least 1".to_string());
        }
        if config.cleanup.safety_window_days == 0 {
            errors.push("cleanup.safety_window_days must be at least 1".to_string());
        }
        if config.cleanup.deleted_by.trim().is_empty() {
            errors.push("cleanup.deleted_by must not be empty".to_string());
        }
    }

    if config.state.backend == StateBackendKind::Postgres
        && config
            .state
            .connection
            .as_deref()
            .map_or(true, |c| c.trim().is_empty())
    {
        errors.push("state: postgres backend requires a connection string".to_string());
    }

    if !errors.is_empty() {
        bail!("Job validation failed:\n  - {}", errors.join("\n  - "));
    }

    Ok(())
}
