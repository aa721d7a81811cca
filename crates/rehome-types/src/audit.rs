//! Execution audit model.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identity of one run. Returned to the trigger caller immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    /// A fresh random execution id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for ExecutionId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Storage identity of an audit document (`<job>-<8 hex chars>`).
///
/// Assigned once by `begin`; `finalize` updates the document under the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditId(String);

impl AuditId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive an audit id for a run of `job_name`.
    #[must_use]
    pub fn for_run(job_name: &str, execution_id: &ExecutionId) -> Self {
        let simple = execution_id.as_uuid().simple().to_string();
        Self(format!("{job_name}-{}", &simple[..8]))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AuditId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Status of a run or of one of its stages.
///
/// Stages never report `Started`; it only exists between `begin` and
/// `finalize` of the audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Started,
    Completed,
    CompletedWithSkips,
    Failed,
}

impl ExecutionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Completed => "COMPLETED",
            Self::CompletedWithSkips => "COMPLETED_WITH_SKIPS",
            Self::Failed => "FAILED",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STARTED" => Some(Self::Started),
            "COMPLETED" => Some(Self::Completed),
            "COMPLETED_WITH_SKIPS" => Some(Self::CompletedWithSkips),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Worst-of combination used to fold stage statuses into a run status.
    #[must_use]
    pub fn combine(self, other: Self) -> Self {
        fn rank(s: ExecutionStatus) -> u8 {
            match s {
                ExecutionStatus::Completed => 0,
                ExecutionStatus::CompletedWithSkips => 1,
                ExecutionStatus::Started => 2,
                ExecutionStatus::Failed => 3,
            }
        }
        if rank(other) > rank(self) {
            other
        } else {
            self
        }
    }

    /// Exit code string persisted with the final audit.
    #[must_use]
    pub fn exit_code(self) -> &'static str {
        match self {
            Self::Started => "UNKNOWN",
            Self::Completed | Self::CompletedWithSkips => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Stage summary
// ---------------------------------------------------------------------------

/// Immutable per-stage metrics, appended to the audit in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage_name: String,
    pub status: ExecutionStatus,
    pub read_count: u64,
    pub write_count: u64,
    pub skip_count: u64,
    pub duration_ms: u64,
    pub duration: String,
}

impl StageSummary {
    #[must_use]
    pub fn new(
        stage_name: impl Into<String>,
        status: ExecutionStatus,
        read_count: u64,
        write_count: u64,
        skip_count: u64,
        elapsed: Duration,
    ) -> Self {
        Self {
            stage_name: stage_name.into(),
            status,
            read_count,
            write_count,
            skip_count,
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            duration: format_duration(elapsed),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionAudit
// ---------------------------------------------------------------------------

/// Aggregate file counters. Reorganisation and cleanup stay in separate
/// fields; nothing adds them together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditCounters {
    pub files_processed: u64,
    pub files_reorganized: u64,
    pub files_skipped: u64,
    pub files_failed: u64,
    pub files_deleted: u64,
    pub files_deletion_failed: u64,
}

/// One audit document per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionAudit {
    pub audit_id: AuditId,
    pub execution_id: ExecutionId,
    pub service_name: String,
    pub job_name: String,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub duration_formatted: Option<String>,
    pub exit_code: Option<String>,
    pub exit_description: Option<String>,
    pub counters: AuditCounters,
    pub files_per_second: Option<f64>,
    pub error_description: Option<String>,
    pub error_trace: Option<String>,
    pub failure_count: u32,
    pub job_parameters: BTreeMap<String, String>,
    pub hostname: String,
    pub instance_id: String,
    pub steps: Vec<StageSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionAudit {
    /// Look up a stage summary by name.
    #[must_use]
    pub fn step(&self, stage_name: &str) -> Option<&StageSummary> {
        self.steps.iter().find(|s| s.stage_name == stage_name)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Human-readable duration: `1h 2m 3s`, `2m 3s`, or `3s`.
#[must_use]
pub fn format_duration(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Bound `detail` to `max_chars` characters, marking the cut with `...`.
#[must_use]
pub fn truncate_detail(detail: &str, max_chars: usize) -> String {
    if detail.chars().count() <= max_chars {
        return detail.to_owned();
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = detail.chars().take(keep).collect();
    out.push_str("...");
    out
}
