//! Mapping between domain types and their persisted document shape.
//!
//! Both backends store the same flat column layout. The functions here are
//! pure: they never touch a connection, and domain types never learn about
//! columns. Timestamps are stored as fixed-width RFC 3339 strings in UTC so
//! that range predicates and ordering work lexicographically in any dialect.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use rehome_types::{
    AuditCounters, AuditId, BusinessMetadata, CleanupCandidate, CleanupState, ExecutionAudit,
    ExecutionId, ExecutionStatus, FileRecord, IndexingState, IndexingStatus, LeaseRecord,
    RecordId, ReorgState, ReorgStatus, StageSummary,
};

use crate::error::{self, StateError};

/// Canonical persisted form of a timestamp.
#[must_use]
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(id: &str, field: &str, raw: &str) -> error::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StateError::corrupt(id, format!("bad {field} '{raw}': {e}")))
}

fn parse_opt_ts(id: &str, field: &str, raw: Option<&str>) -> error::Result<Option<DateTime<Utc>>> {
    raw.map(|r| parse_ts(id, field, r)).transpose()
}

#[allow(clippy::cast_possible_wrap)]
fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

#[allow(clippy::cast_sign_loss)]
fn to_u64(v: i64) -> u64 {
    v.max(0) as u64
}

// ---------------------------------------------------------------------------
// FileRecord
// ---------------------------------------------------------------------------

/// Flat persisted shape of a [`FileRecord`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDocument {
    pub id: String,
    pub source_path: String,
    pub file_name: String,
    pub extension: Option<String>,
    pub file_size: Option<i64>,
    pub last_modified: Option<String>,
    pub document_type: Option<String>,
    pub customer_code: Option<String>,
    pub business_year: Option<i64>,
    pub business_month: Option<i64>,
    pub indexing_status: String,
    pub indexed_at: Option<String>,
    pub indexing_error: Option<String>,
    pub reorg_status: String,
    pub reorg_destination_path: Option<String>,
    pub reorg_completed_at: Option<String>,
    pub reorg_job_execution_id: Option<String>,
    pub reorg_duration_ms: Option<i64>,
    pub reorg_attempts: i64,
    pub reorg_error: Option<String>,
    pub reorg_last_attempt_at: Option<String>,
    pub deleted_from_source: bool,
    pub source_deletion_date: Option<String>,
    pub deleted_by: Option<String>,
}

/// Column list shared by every record query, in [`RecordDocument`] order.
pub const RECORD_COLUMNS: &str = "id, source_path, file_name, extension, file_size, last_modified, \
     document_type, customer_code, business_year, business_month, \
     indexing_status, indexed_at, indexing_error, \
     reorg_status, reorg_destination_path, reorg_completed_at, reorg_job_execution_id, \
     reorg_duration_ms, reorg_attempts, reorg_error, reorg_last_attempt_at, \
     deleted_from_source, source_deletion_date, deleted_by";

#[must_use]
pub fn record_to_document(record: &FileRecord) -> RecordDocument {
    let business = record.business.clone().unwrap_or_default();
    RecordDocument {
        id: record.id.as_str().to_owned(),
        source_path: record.source_path.clone(),
        file_name: record.file_name.clone(),
        extension: record.extension.clone(),
        file_size: record.file_size.map(to_i64),
        last_modified: record.last_modified.map(format_ts),
        document_type: business.document_type,
        customer_code: business.customer_code,
        business_year: business.year.map(i64::from),
        business_month: business.month.map(i64::from),
        indexing_status: record.indexing.status.as_str().to_owned(),
        indexed_at: record.indexing.indexed_at.map(format_ts),
        indexing_error: record.indexing.error.clone(),
        reorg_status: record.reorg.status.as_str().to_owned(),
        reorg_destination_path: record.reorg.destination_path.clone(),
        reorg_completed_at: record.reorg.completed_at.map(format_ts),
        reorg_job_execution_id: record.reorg.job_execution_id.map(|e| e.to_string()),
        reorg_duration_ms: record.reorg.duration_ms.map(to_i64),
        reorg_attempts: i64::from(record.reorg.attempts),
        reorg_error: record.reorg.last_error.clone(),
        reorg_last_attempt_at: record.reorg.last_attempt_at.map(format_ts),
        deleted_from_source: record.cleanup.deleted_from_source,
        source_deletion_date: record.cleanup.deleted_at.map(format_ts),
        deleted_by: record.cleanup.deleted_by.clone(),
    }
}

/// Map a stored document back to the domain.
///
/// # Errors
///
/// Returns [`StateError::CorruptDocument`] for unknown status values,
/// unparseable timestamps or ids, or an empty source path.
pub fn record_from_document(doc: RecordDocument) -> error::Result<FileRecord> {
    let id = doc.id.as_str();
    if doc.source_path.is_empty() {
        return Err(StateError::corrupt(id, "empty source path"));
    }
    let indexing_status = IndexingStatus::parse(&doc.indexing_status).ok_or_else(|| {
        StateError::corrupt(id, format!("unknown indexing status '{}'", doc.indexing_status))
    })?;
    let reorg_status = ReorgStatus::parse(&doc.reorg_status).ok_or_else(|| {
        StateError::corrupt(id, format!("unknown reorg status '{}'", doc.reorg_status))
    })?;
    let job_execution_id = doc
        .reorg_job_execution_id
        .as_deref()
        .map(|raw| {
            raw.parse::<ExecutionId>()
                .map_err(|e| StateError::corrupt(id, format!("bad execution id '{raw}': {e}")))
        })
        .transpose()?;

    let business = BusinessMetadata {
        document_type: doc.document_type,
        customer_code: doc.customer_code,
        year: doc.business_year.and_then(|y| i32::try_from(y).ok()),
        month: doc.business_month.and_then(|m| u32::try_from(m).ok()),
    };

    Ok(FileRecord {
        extension: doc.extension,
        file_size: doc.file_size.map(to_u64),
        last_modified: parse_opt_ts(id, "last_modified", doc.last_modified.as_deref())?,
        business: (!business.is_empty()).then_some(business),
        indexing: IndexingState {
            status: indexing_status,
            indexed_at: parse_opt_ts(id, "indexed_at", doc.indexed_at.as_deref())?,
            error: doc.indexing_error,
        },
        reorg: ReorgState {
            status: reorg_status,
            destination_path: doc.reorg_destination_path,
            completed_at: parse_opt_ts(id, "reorg_completed_at", doc.reorg_completed_at.as_deref())?,
            job_execution_id,
            duration_ms: doc.reorg_duration_ms.map(to_u64),
            attempts: u32::try_from(doc.reorg_attempts.max(0)).unwrap_or(u32::MAX),
            last_error: doc.reorg_error,
            last_attempt_at: parse_opt_ts(
                id,
                "reorg_last_attempt_at",
                doc.reorg_last_attempt_at.as_deref(),
            )?,
        },
        cleanup: CleanupState {
            deleted_from_source: doc.deleted_from_source,
            deleted_at: parse_opt_ts(id, "source_deletion_date", doc.source_deletion_date.as_deref())?,
            deleted_by: doc.deleted_by,
        },
        id: RecordId::new(doc.id.clone()),
        source_path: doc.source_path,
        file_name: doc.file_name,
    })
}

/// Persisted projection read by the cleanup selection query.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateDocument {
    pub id: String,
    pub source_path: Option<String>,
    pub destination_path: Option<String>,
    pub completed_at: Option<String>,
    pub file_size: Option<i64>,
    pub last_modified: Option<String>,
}

pub const CANDIDATE_COLUMNS: &str =
    "id, source_path, reorg_destination_path, reorg_completed_at, file_size, last_modified";

/// Map a candidate projection. Unparseable timestamps become `None` so the
/// cleanup validator rejects the candidate instead of aborting the page.
#[must_use]
pub fn candidate_from_document(doc: CandidateDocument) -> CleanupCandidate {
    let lenient = |raw: Option<String>| {
        raw.and_then(|r| DateTime::parse_from_rfc3339(&r).ok())
            .map(|dt| dt.with_timezone(&Utc))
    };
    CleanupCandidate {
        id: RecordId::new(doc.id),
        source_path: doc.source_path.filter(|p| !p.is_empty()),
        destination_path: doc.destination_path.filter(|p| !p.is_empty()),
        completed_at: lenient(doc.completed_at),
        file_size: doc.file_size.map(to_u64),
        last_modified: lenient(doc.last_modified),
    }
}

// ---------------------------------------------------------------------------
// ExecutionAudit
// ---------------------------------------------------------------------------

/// Flat persisted shape of an [`ExecutionAudit`]. Stage summaries and job
/// parameters are stored as JSON text.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditDocument {
    pub audit_id: String,
    pub execution_id: String,
    pub service_name: String,
    pub job_name: String,
    pub status: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub duration_ms: Option<i64>,
    pub duration_formatted: Option<String>,
    pub exit_code: Option<String>,
    pub exit_description: Option<String>,
    pub files_processed: i64,
    pub files_reorganized: i64,
    pub files_skipped: i64,
    pub files_failed: i64,
    pub files_deleted: i64,
    pub files_deletion_failed: i64,
    pub files_per_second: Option<f64>,
    pub error_description: Option<String>,
    pub error_trace: Option<String>,
    pub failure_count: i64,
    pub job_parameters: String,
    pub hostname: String,
    pub instance_id: String,
    pub steps: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Column list shared by every audit query, in [`AuditDocument`] order.
pub const AUDIT_COLUMNS: &str = "audit_id, execution_id, service_name, job_name, status, \
     start_time, end_time, duration_ms, duration_formatted, exit_code, exit_description, \
     files_processed, files_reorganized, files_skipped, files_failed, files_deleted, \
     files_deletion_failed, files_per_second, error_description, error_trace, failure_count, \
     job_parameters, hostname, instance_id, steps, created_at, updated_at";

/// # Errors
///
/// Returns [`StateError::Json`] if the stage list or parameters cannot be
/// encoded.
pub fn audit_to_document(audit: &ExecutionAudit) -> error::Result<AuditDocument> {
    let c = &audit.counters;
    Ok(AuditDocument {
        audit_id: audit.audit_id.as_str().to_owned(),
        execution_id: audit.execution_id.to_string(),
        service_name: audit.service_name.clone(),
        job_name: audit.job_name.clone(),
        status: audit.status.as_str().to_owned(),
        start_time: format_ts(audit.start_time),
        end_time: audit.end_time.map(format_ts),
        duration_ms: audit.duration_ms.map(to_i64),
        duration_formatted: audit.duration_formatted.clone(),
        exit_code: audit.exit_code.clone(),
        exit_description: audit.exit_description.clone(),
        files_processed: to_i64(c.files_processed),
        files_reorganized: to_i64(c.files_reorganized),
        files_skipped: to_i64(c.files_skipped),
        files_failed: to_i64(c.files_failed),
        files_deleted: to_i64(c.files_deleted),
        files_deletion_failed: to_i64(c.files_deletion_failed),
        files_per_second: audit.files_per_second,
        error_description: audit.error_description.clone(),
        error_trace: audit.error_trace.clone(),
        failure_count: i64::from(audit.failure_count),
        job_parameters: serde_json::to_string(&audit.job_parameters)?,
        hostname: audit.hostname.clone(),
        instance_id: audit.instance_id.clone(),
        steps: serde_json::to_string(&audit.steps)?,
        created_at: format_ts(audit.created_at),
        updated_at: format_ts(audit.updated_at),
    })
}

/// # Errors
///
/// Returns [`StateError::CorruptDocument`] for unknown statuses, bad ids or
/// timestamps, or undecodable JSON columns.
pub fn audit_from_document(doc: AuditDocument) -> error::Result<ExecutionAudit> {
    let id = doc.audit_id.as_str();
    let status = ExecutionStatus::parse(&doc.status)
        .ok_or_else(|| StateError::corrupt(id, format!("unknown status '{}'", doc.status)))?;
    let execution_id = doc
        .execution_id
        .parse::<ExecutionId>()
        .map_err(|e| StateError::corrupt(id, format!("bad execution id: {e}")))?;
    let steps: Vec<StageSummary> = serde_json::from_str(&doc.steps)
        .map_err(|e| StateError::corrupt(id, format!("bad steps: {e}")))?;
    let job_parameters: BTreeMap<String, String> = serde_json::from_str(&doc.job_parameters)
        .map_err(|e| StateError::corrupt(id, format!("bad job parameters: {e}")))?;

    Ok(ExecutionAudit {
        execution_id,
        service_name: doc.service_name,
        job_name: doc.job_name,
        status,
        start_time: parse_ts(id, "start_time", &doc.start_time)?,
        end_time: parse_opt_ts(id, "end_time", doc.end_time.as_deref())?,
        duration_ms: doc.duration_ms.map(to_u64),
        duration_formatted: doc.duration_formatted,
        exit_code: doc.exit_code,
        exit_description: doc.exit_description,
        counters: AuditCounters {
            files_processed: to_u64(doc.files_processed),
            files_reorganized: to_u64(doc.files_reorganized),
            files_skipped: to_u64(doc.files_skipped),
            files_failed: to_u64(doc.files_failed),
            files_deleted: to_u64(doc.files_deleted),
            files_deletion_failed: to_u64(doc.files_deletion_failed),
        },
        files_per_second: doc.files_per_second,
        error_description: doc.error_description,
        error_trace: doc.error_trace,
        failure_count: u32::try_from(doc.failure_count.max(0)).unwrap_or(u32::MAX),
        job_parameters,
        hostname: doc.hostname,
        instance_id: doc.instance_id,
        steps,
        created_at: parse_ts(id, "created_at", &doc.created_at)?,
        updated_at: parse_ts(id, "updated_at", &doc.updated_at)?,
        audit_id: AuditId::new(doc.audit_id.clone()),
    })
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// # Errors
///
/// Returns [`StateError::CorruptDocument`] for unparseable timestamps.
pub fn lease_from_row(
    name: String,
    holder: String,
    acquired_at: &str,
    locked_until: &str,
) -> error::Result<LeaseRecord> {
    Ok(LeaseRecord {
        acquired_at: parse_ts(&name, "acquired_at", acquired_at)?,
        locked_until: parse_ts(&name, "locked_until", locked_until)?,
        name,
        holder,
    })
}
