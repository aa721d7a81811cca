use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use rehome_engine::{resolve_job, Orchestrator, RunError, RunReport};
use rehome_types::ExecutionStatus;

/// Parse a `KEY=VALUE` run parameter.
pub fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

/// Execute the `run` command: parse, validate, trigger, and wait for a job.
pub async fn execute(
    job_path: &Path,
    job_name: Option<&str>,
    params: Vec<(String, String)>,
) -> Result<()> {
    let config = super::load_job(job_path)?;

    tracing::info!(
        job = config.job.name,
        lock = config.job.lock_name(),
        origin = config.origin.host,
        destination = config.destination.host,
        cleanup = config.cleanup.enabled,
        "Job validated"
    );

    let ctx = tokio::task::block_in_place(|| resolve_job(&config))?;
    let orchestrator = Orchestrator::new(ctx);
    let parameters: BTreeMap<String, String> = params.into_iter().collect();

    let (receipt, handle) = match orchestrator.trigger(job_name, parameters).await {
        Ok(started) => started,
        Err(RunError::AlreadyRunning { lock_name }) => {
            println!("Job '{lock_name}' is already running; nothing to do.");
            return Ok(());
        }
        Err(e) => anyhow::bail!("Failed to start job: {}", e.trace()),
    };
    println!("{}", serde_json::to_string_pretty(&receipt)?);

    let report = handle
        .await
        .context("run task panicked")?
        .map_err(|e| anyhow::anyhow!("{}", e.trace()))?;
    print_report(&report);

    if report.status == ExecutionStatus::Failed {
        anyhow::bail!(
            "Job failed: {}",
            report.audit.error_description.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    let audit = &report.audit;
    println!("Job '{}' finished: {}", audit.job_name, report.status);
    println!("  Execution:        {}", report.execution_id);
    println!("  Audit:            {}", audit.audit_id);
    println!(
        "  Duration:         {}",
        audit.duration_formatted.as_deref().unwrap_or("-")
    );
    println!("  Files processed:  {}", audit.counters.files_processed);
    println!("  Reorganized:      {}", audit.counters.files_reorganized);
    println!("  Skipped:          {}", audit.counters.files_skipped);
    println!("  Failed:           {}", audit.counters.files_failed);
    println!("  Origin deleted:   {}", audit.counters.files_deleted);
    println!("  Deletion failed:  {}", audit.counters.files_deletion_failed);
    if let Some(rate) = audit.files_per_second {
        println!("  Throughput:       {rate:.1} files/sec");
    }
    for step in &audit.steps {
        println!(
            "  [{}] {} read={} written={} skipped={} ({})",
            step.stage_name,
            step.status,
            step.read_count,
            step.write_count,
            step.skip_count,
            step.duration
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param() {
        assert_eq!(
            parse_param("ticket=OPS-1"),
            Ok(("ticket".to_string(), "OPS-1".to_string()))
        );
        assert_eq!(
            parse_param("query=a=b"),
            Ok(("query".to_string(), "a=b".to_string()))
        );
        assert_eq!(parse_param("empty="), Ok(("empty".to_string(), String::new())));
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=x").is_err());
    }
}
