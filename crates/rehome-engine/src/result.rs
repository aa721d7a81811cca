//! Stage and run result types.

use std::time::Duration;

use rehome_types::{AuditCounters, AuditId, ExecutionAudit, ExecutionId, ExecutionStatus, StageSummary};
use serde::Serialize;

use crate::errors::RunError;

pub const REORGANIZE_STAGE: &str = "reorganize";
pub const CLEANUP_STAGE: &str = "cleanup";

/// Item counts for one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageCounts {
    /// Items handed to the stage by its reader.
    pub read: u64,
    /// Items the stage completed (reorganised or deleted).
    pub written: u64,
    /// Items given up on after transient failures, or rejected by validation.
    pub skipped: u64,
    /// Items that failed permanently.
    pub failed: u64,
    /// Items dropped before processing because they could not be mapped.
    pub filtered: u64,
}

impl StageCounts {
    fn absorb(&mut self, other: &StageCounts) {
        self.read += other.read;
        self.written += other.written;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.filtered += other.filtered;
    }
}

/// Result of running one stage. A stage always produces a report, even when
/// it stops early; `error` then says why.
#[derive(Debug)]
pub struct StageReport {
    pub stage_name: &'static str,
    pub counts: StageCounts,
    pub elapsed: Duration,
    pub error: Option<RunError>,
}

impl StageReport {
    pub(crate) fn new(stage_name: &'static str) -> Self {
        Self {
            stage_name,
            counts: StageCounts::default(),
            elapsed: Duration::ZERO,
            error: None,
        }
    }

    pub(crate) fn add_chunk(&mut self, chunk: &StageCounts) {
        self.counts.absorb(chunk);
    }

    /// `FAILED` if the stage stopped on an error, `COMPLETED_WITH_SKIPS` if
    /// any item was not completed, otherwise `COMPLETED`.
    #[must_use]
    pub fn status(&self) -> ExecutionStatus {
        if self.error.is_some() {
            ExecutionStatus::Failed
        } else if self.counts.skipped > 0 || self.counts.failed > 0 {
            ExecutionStatus::CompletedWithSkips
        } else {
            ExecutionStatus::Completed
        }
    }

    #[must_use]
    pub fn summary(&self) -> StageSummary {
        StageSummary::new(
            self.stage_name,
            self.status(),
            self.counts.read,
            self.counts.written,
            self.counts.skipped,
            self.elapsed,
        )
    }
}

/// What the stages of one run produced, handed to the audit ledger.
#[derive(Debug, Default)]
pub struct RunOutcome {
    pub reorganize: Option<StageReport>,
    pub cleanup: Option<StageReport>,
    /// Failure outside any stage (task panic, wiring).
    pub error: Option<RunError>,
}

impl RunOutcome {
    pub(crate) fn aborted(error: RunError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    fn stages(&self) -> impl Iterator<Item = &StageReport> {
        self.reorganize.iter().chain(self.cleanup.iter())
    }

    /// Worst status across stages, or `FAILED` on a run-level error.
    #[must_use]
    pub fn status(&self) -> ExecutionStatus {
        if self.error.is_some() {
            return ExecutionStatus::Failed;
        }
        self.stages()
            .map(StageReport::status)
            .fold(ExecutionStatus::Completed, ExecutionStatus::combine)
    }

    /// The first error that ended the run.
    #[must_use]
    pub fn first_error(&self) -> Option<&RunError> {
        self.error
            .as_ref()
            .or_else(|| self.stages().find_map(|s| s.error.as_ref()))
    }

    #[must_use]
    pub fn summaries(&self) -> Vec<StageSummary> {
        self.stages().map(StageReport::summary).collect()
    }

    /// Reorganisation and cleanup counters, kept in separate fields.
    #[must_use]
    pub fn counters(&self) -> AuditCounters {
        let mut counters = AuditCounters::default();
        if let Some(reorg) = &self.reorganize {
            counters.files_processed = reorg.counts.read;
            counters.files_reorganized = reorg.counts.written;
            counters.files_skipped = reorg.counts.skipped;
            counters.files_failed = reorg.counts.failed;
        }
        if let Some(cleanup) = &self.cleanup {
            counters.files_deleted = cleanup.counts.written;
            counters.files_deletion_failed = cleanup.counts.failed;
        }
        counters
    }
}

/// Returned by a trigger as soon as the run has started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerReceipt {
    pub execution_id: ExecutionId,
    pub audit_id: AuditId,
    pub status: &'static str,
}

impl TriggerReceipt {
    pub(crate) fn accepted(execution_id: ExecutionId, audit_id: AuditId) -> Self {
        Self {
            execution_id,
            audit_id,
            status: "ACCEPTED",
        }
    }
}

/// Final state of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub audit: ExecutionAudit,
}

/// Connectivity check for a job's state backend and endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub state_ok: bool,
    pub origin_ok: bool,
    pub destination_ok: bool,
}

impl CheckResult {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.state_ok && self.origin_ok && self.destination_ok
    }
}
