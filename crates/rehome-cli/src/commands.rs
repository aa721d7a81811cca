pub mod audit;
pub mod check;
pub mod import;
pub mod run;

use std::path::Path;

use anyhow::{Context, Result};
use rehome_engine::config::parser;
use rehome_engine::config::types::JobConfig;
use rehome_engine::config::validator;

/// Parse and validate a job file.
pub fn load_job(job_path: &Path) -> Result<JobConfig> {
    let config = parser::parse_job(job_path)
        .with_context(|| format!("Failed to parse job: {}", job_path.display()))?;
    validator::validate_job(&config)?;
    Ok(config)
}
