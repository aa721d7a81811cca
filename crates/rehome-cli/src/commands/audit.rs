use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use rehome_engine::resolve::create_state_backend;
use rehome_state::AuditQuery;
use rehome_types::{ExecutionId, ExecutionStatus};

#[derive(Subcommand)]
pub enum AuditCommand {
    /// Most recent audits, newest first
    Latest {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Audits of one job
    Job { name: String },
    /// Audits in one status (STARTED, COMPLETED, COMPLETED_WITH_SKIPS, FAILED)
    Status {
        #[arg(value_parser = parse_status)]
        status: ExecutionStatus,
    },
    /// The audit of one execution
    Execution { execution_id: ExecutionId },
    /// Audits started inside a time range (RFC 3339)
    Range {
        #[arg(long)]
        from: DateTime<Utc>,
        #[arg(long)]
        to: DateTime<Utc>,
    },
    /// Audit counts per status
    Stats {
        #[arg(long)]
        job: Option<String>,
    },
}

fn parse_status(raw: &str) -> Result<ExecutionStatus, String> {
    ExecutionStatus::parse(&raw.to_ascii_uppercase())
        .ok_or_else(|| format!("unknown status '{raw}'"))
}

/// Execute the `audit` command: print matching audits as JSON.
pub fn execute(job_path: &Path, command: &AuditCommand) -> Result<()> {
    let config = super::load_job(job_path)?;
    let store = create_state_backend(&config.state)?;

    let query = match command {
        AuditCommand::Latest { limit } => AuditQuery::latest(*limit),
        AuditCommand::Job { name } => AuditQuery::by_job(name.clone()),
        AuditCommand::Status { status } => AuditQuery::by_status(*status),
        AuditCommand::Range { from, to } => {
            if from > to {
                anyhow::bail!("--from must not be after --to");
            }
            AuditQuery::started_between(*from, *to)
        }
        AuditCommand::Execution { execution_id } => {
            let audit = store
                .find_audit(execution_id)
                .context("Failed to query audits")?
                .with_context(|| format!("No audit for execution {execution_id}"))?;
            println!("{}", serde_json::to_string_pretty(&audit)?);
            return Ok(());
        }
        AuditCommand::Stats { job } => {
            let counts = store
                .count_audits_by_status(job.as_deref())
                .context("Failed to count audits")?;
            let stats: serde_json::Map<String, serde_json::Value> = counts
                .into_iter()
                .map(|(status, count)| (status.as_str().to_string(), count.into()))
                .collect();
            println!("{}", serde_json::to_string_pretty(&stats)?);
            return Ok(());
        }
    };

    let audits = store.list_audits(&query).context("Failed to query audits")?;
    println!("{}", serde_json::to_string_pretty(&audits)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_is_case_insensitive() {
        assert_eq!(parse_status("failed"), Ok(ExecutionStatus::Failed));
        assert_eq!(
            parse_status("COMPLETED_WITH_SKIPS"),
            Ok(ExecutionStatus::CompletedWithSkips)
        );
        assert!(parse_status("done").is_err());
    }
}
