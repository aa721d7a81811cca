//! Per-run audit ledger.
//!
//! `begin` persists a `STARTED` document before any stage runs; `finalize`
//! rewrites that same document (same audit id) with the outcome. Finalize
//! never inserts, so a run has exactly one audit document.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rehome_state::StateBackend;
use rehome_types::audit::{format_duration, truncate_detail};
use rehome_types::{AuditCounters, AuditId, ExecutionAudit, ExecutionId, ExecutionStatus};

use crate::lock::hostname;
use crate::result::RunOutcome;

/// Error detail persisted on an audit is cut to this many characters.
pub const MAX_ERROR_DETAIL: usize = 2000;

/// What a run is, known before it starts.
#[derive(Debug, Clone)]
pub struct RunMetadata {
    pub job_name: String,
    pub execution_id: ExecutionId,
    pub parameters: BTreeMap<String, String>,
}

/// Returned by [`AuditLedger::begin`]; needed to finalize the same document.
#[derive(Debug, Clone)]
pub struct AuditHandle {
    audit: ExecutionAudit,
    started: Instant,
}

impl AuditHandle {
    #[must_use]
    pub fn audit_id(&self) -> &AuditId {
        &self.audit.audit_id
    }

    #[must_use]
    pub fn execution_id(&self) -> ExecutionId {
        self.audit.execution_id
    }

    /// The document as persisted by `begin`.
    #[must_use]
    pub fn started_audit(&self) -> &ExecutionAudit {
        &self.audit
    }
}

/// Instance identity: `HOSTNAME` when set (container name), else the OS
/// hostname.
fn instance_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(hostname)
}

/// Reorganised files per second, or `None` when nothing was reorganised or
/// no time elapsed.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn throughput(counters: &AuditCounters, elapsed_secs: f64) -> Option<f64> {
    if counters.files_reorganized == 0 || elapsed_secs <= 0.0 {
        return None;
    }
    Some(counters.files_reorganized as f64 / elapsed_secs)
}

fn exit_description(status: ExecutionStatus, outcome: &RunOutcome) -> String {
    match (status, outcome.first_error()) {
        (ExecutionStatus::Failed, Some(e)) => truncate_detail(&e.to_string(), MAX_ERROR_DETAIL),
        (ExecutionStatus::Failed, None) => "Job failed".to_string(),
        (ExecutionStatus::CompletedWithSkips, _) => "Job completed with skipped items".to_string(),
        _ => "Job completed successfully".to_string(),
    }
}

pub struct AuditLedger {
    store: Arc<dyn StateBackend>,
    service_name: String,
    hostname: String,
    instance_id: String,
}

impl AuditLedger {
    #[must_use]
    pub fn new(store: Arc<dyn StateBackend>, service_name: impl Into<String>) -> Self {
        Self {
            store,
            service_name: service_name.into(),
            hostname: hostname(),
            instance_id: instance_id(),
        }
    }

    fn started_document(&self, meta: &RunMetadata, now: DateTime<Utc>) -> ExecutionAudit {
        ExecutionAudit {
            audit_id: AuditId::for_run(&meta.job_name, &meta.execution_id),
            execution_id: meta.execution_id,
            service_name: self.service_name.clone(),
            job_name: meta.job_name.clone(),
            status: ExecutionStatus::Started,
            start_time: now,
            end_time: None,
            duration_ms: None,
            duration_formatted: None,
            exit_code: None,
            exit_description: None,
            counters: AuditCounters::default(),
            files_per_second: None,
            error_description: None,
            error_trace: None,
            failure_count: 0,
            job_parameters: meta.parameters.clone(),
            hostname: self.hostname.clone(),
            instance_id: self.instance_id.clone(),
            steps: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Persist the `STARTED` audit for a run.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be stored.
    pub async fn begin(&self, meta: &RunMetadata) -> anyhow::Result<AuditHandle> {
        let audit = self.started_document(meta, Utc::now());
        let store = Arc::clone(&self.store);
        let doc = audit.clone();
        tokio::task::spawn_blocking(move || store.insert_audit(&doc))
            .await
            .context("audit insert task panicked")?
            .with_context(|| format!("Failed to record start of run {}", audit.audit_id))?;
        tracing::info!(
            audit_id = %audit.audit_id,
            execution_id = %audit.execution_id,
            job = %audit.job_name,
            "Audit started"
        );
        Ok(AuditHandle {
            audit,
            started: Instant::now(),
        })
    }

    /// Build the final document for `handle` from `outcome`.
    #[must_use]
    pub fn finalized_document(&self, handle: &AuditHandle, outcome: &RunOutcome) -> ExecutionAudit {
        let elapsed = handle.started.elapsed();
        let end = Utc::now();
        let status = outcome.status();
        let counters = outcome.counters();
        let error = outcome.first_error();

        let mut audit = handle.audit.clone();
        audit.status = status;
        audit.end_time = Some(end);
        audit.duration_ms = Some(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        audit.duration_formatted = Some(format_duration(elapsed));
        audit.exit_code = Some(status.exit_code().to_string());
        audit.exit_description = Some(exit_description(status, outcome));
        audit.counters = counters;
        audit.files_per_second = throughput(&counters, elapsed.as_secs_f64());
        audit.error_description = error.map(|e| truncate_detail(&e.to_string(), MAX_ERROR_DETAIL));
        audit.error_trace = error.map(|e| truncate_detail(&e.trace(), MAX_ERROR_DETAIL));
        audit.failure_count = u32::from(status == ExecutionStatus::Failed);
        audit.steps = outcome.summaries();
        audit.updated_at = end;
        audit
    }

    /// Update the run's audit in place with its outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if the started document cannot be found or updated.
    pub async fn finalize(
        &self,
        handle: &AuditHandle,
        outcome: &RunOutcome,
    ) -> anyhow::Result<ExecutionAudit> {
        let audit = self.finalized_document(handle, outcome);
        let store = Arc::clone(&self.store);
        let doc = audit.clone();
        tokio::task::spawn_blocking(move || store.update_audit(&doc))
            .await
            .context("audit update task panicked")?
            .with_context(|| format!("Failed to finalize audit {}", audit.audit_id))?;

        if audit.status == ExecutionStatus::Failed {
            tracing::error!(
                audit_id = %audit.audit_id,
                status = %audit.status,
                error = audit.error_description.as_deref().unwrap_or(""),
                "Audit finalized"
            );
        } else {
            tracing::info!(
                audit_id = %audit.audit_id,
                status = %audit.status,
                reorganized = audit.counters.files_reorganized,
                deleted = audit.counters.files_deleted,
                duration = audit.duration_formatted.as_deref().unwrap_or(""),
                "Audit finalized"
            );
        }
        Ok(audit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use rehome_state::SqliteStateBackend;

    use crate::errors::RunError;
    use crate::result::{StageCounts, StageReport, CLEANUP_STAGE, REORGANIZE_STAGE};

    fn meta() -> RunMetadata {
        RunMetadata {
            job_name: "reorg".into(),
            execution_id: ExecutionId::generate(),
            parameters: BTreeMap::from([("requested_by".to_string(), "ops".to_string())]),
        }
    }

    fn stage(name: &'static str, counts: StageCounts) -> StageReport {
        StageReport {
            stage_name: name,
            counts,
            elapsed: Duration::from_millis(1500),
            error: None,
        }
    }

    #[tokio::test]
    async fn begin_persists_started_document() {
        let store: Arc<dyn StateBackend> = Arc::new(SqliteStateBackend::in_memory().unwrap());
        let ledger = AuditLedger::new(Arc::clone(&store), "rehome");
        let meta = meta();
        let handle = ledger.begin(&meta).await.unwrap();

        let stored = store.find_audit(&meta.execution_id).unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Started);
        assert_eq!(&stored.audit_id, handle.audit_id());
        assert!(stored.audit_id.as_str().starts_with("reorg-"));
        assert_eq!(stored.job_parameters["requested_by"], "ops");
        assert_eq!(stored.service_name, "rehome");
        assert!(stored.end_time.is_none());
    }

    #[tokio::test]
    async fn finalize_updates_in_place() {
        let store: Arc<dyn StateBackend> = Arc::new(SqliteStateBackend::in_memory().unwrap());
        let ledger = AuditLedger::new(Arc::clone(&store), "rehome");
        let meta = meta();
        let handle = ledger.begin(&meta).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let outcome = RunOutcome {
            reorganize: Some(stage(REORGANIZE_STAGE, StageCounts { read: 4, written: 4, ..Default::default() })),
            cleanup: Some(stage(CLEANUP_STAGE, StageCounts { read: 4, written: 3, failed: 1, ..Default::default() })),
            error: None,
        };
        let audit = ledger.finalize(&handle, &outcome).await.unwrap();
        assert_eq!(audit.status, ExecutionStatus::CompletedWithSkips);
        assert_eq!(audit.exit_code.as_deref(), Some("COMPLETED"));
        assert_eq!(audit.counters.files_reorganized, 4);
        assert_eq!(audit.counters.files_deleted, 3);
        assert_eq!(audit.counters.files_deletion_failed, 1);
        assert!(audit.files_per_second.unwrap() > 0.0);
        assert_eq!(audit.steps.len(), 2);
        assert_eq!(audit.step("cleanup").unwrap().write_count, 3);
        assert_eq!(audit.created_at, handle.started_audit().created_at);

        let all = store.list_audits(&rehome_state::AuditQuery::default()).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].audit_id, audit.audit_id);
        assert_eq!(all[0].status, ExecutionStatus::CompletedWithSkips);
        assert_eq!(all[0].steps, audit.steps);
    }

    #[tokio::test]
    async fn failed_outcome_records_truncated_error() {
        let store: Arc<dyn StateBackend> = Arc::new(SqliteStateBackend::in_memory().unwrap());
        let ledger = AuditLedger::new(Arc::clone(&store), "rehome");
        let handle = ledger.begin(&meta()).await.unwrap();

        let outcome = RunOutcome::aborted(RunError::Stage {
            stage: "reorganize".into(),
            message: "x".repeat(5000),
        });
        let audit = ledger.finalize(&handle, &outcome).await.unwrap();
        assert_eq!(audit.status, ExecutionStatus::Failed);
        assert_eq!(audit.failure_count, 1);
        let description = audit.error_description.unwrap();
        assert_eq!(description.chars().count(), MAX_ERROR_DETAIL);
        assert!(description.ends_with("..."));
        assert!(audit.files_per_second.is_none());
    }

    #[tokio::test]
    async fn finalize_without_begin_fails() {
        let store: Arc<dyn StateBackend> = Arc::new(SqliteStateBackend::in_memory().unwrap());
        let ledger = AuditLedger::new(Arc::clone(&store), "rehome");
        let orphan = AuditHandle {
            audit: ledger.started_document(&meta(), Utc::now()),
            started: Instant::now(),
        };
        assert!(ledger.finalize(&orphan, &RunOutcome::default()).await.is_err());
        assert!(store.list_audits(&rehome_state::AuditQuery::default()).unwrap().is_empty());
    }

    #[test]
    fn throughput_needs_work_and_time() {
        let mut counters = AuditCounters::default();
        assert_eq!(throughput(&counters, 10.0), None);
        counters.files_reorganized = 30;
        assert_eq!(throughput(&counters, 0.0), None);
        assert_eq!(throughput(&counters, 10.0), Some(3.0));
    }
}
