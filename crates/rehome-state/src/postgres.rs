//! `PostgreSQL`-backed implementation of the record, audit, and lease stores.
//!
//! Uses the sync `postgres` crate with a single `Mutex<Client>` for
//! thread safety. The `postgres` crate manages its own internal tokio
//! runtime, so this works from any thread, including `spawn_blocking`.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use postgres::types::ToSql;
use postgres::{Client, NoTls, Row};
use rehome_types::{
    CleanupCandidate, ExecutionAudit, ExecutionId, ExecutionStatus, FileRecord, LeaseRecord,
    RecordId, ReorgStatus,
};

use crate::backend::{
    AuditQuery, AuditStore, BulkUpdateReport, CandidateFilter, CleanupUpdate, LeaseStore,
    PendingRecord, RecordStore, ReorgUpdate,
};
use crate::document::{
    self, AuditDocument, CandidateDocument, RecordDocument, AUDIT_COLUMNS, CANDIDATE_COLUMNS,
    RECORD_COLUMNS,
};
use crate::error::{self, StateError};

/// Idempotent DDL for state tables (`PostgreSQL` dialect).
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS file_records (
    seq BIGSERIAL PRIMARY KEY,
    id TEXT NOT NULL UNIQUE,
    source_path TEXT NOT NULL,
    file_name TEXT NOT NULL,
    extension TEXT,
    file_size BIGINT,
    last_modified TEXT,
    document_type TEXT,
    customer_code TEXT,
    business_year BIGINT,
    business_month BIGINT,
    indexing_status TEXT NOT NULL DEFAULT 'PENDING',
    indexed_at TEXT,
    indexing_error TEXT,
    reorg_status TEXT NOT NULL DEFAULT 'PENDING',
    reorg_destination_path TEXT,
    reorg_completed_at TEXT,
    reorg_job_execution_id TEXT,
    reorg_duration_ms BIGINT,
    reorg_attempts BIGINT NOT NULL DEFAULT 0,
    reorg_error TEXT,
    reorg_last_attempt_at TEXT,
    deleted_from_source BOOLEAN NOT NULL DEFAULT FALSE,
    source_deletion_date TEXT,
    deleted_by TEXT
);

CREATE INDEX IF NOT EXISTS idx_file_records_reorg ON file_records (reorg_status, seq);
CREATE INDEX IF NOT EXISTS idx_file_records_cleanup
    ON file_records (reorg_status, deleted_from_source, reorg_completed_at);

CREATE TABLE IF NOT EXISTS execution_audits (
    audit_id TEXT PRIMARY KEY,
    execution_id TEXT NOT NULL UNIQUE,
    service_name TEXT NOT NULL,
    job_name TEXT NOT NULL,
    status TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT,
    duration_ms BIGINT,
    duration_formatted TEXT,
    exit_code TEXT,
    exit_description TEXT,
    files_processed BIGINT NOT NULL DEFAULT 0,
    files_reorganized BIGINT NOT NULL DEFAULT 0,
    files_skipped BIGINT NOT NULL DEFAULT 0,
    files_failed BIGINT NOT NULL DEFAULT 0,
    files_deleted BIGINT NOT NULL DEFAULT 0,
    files_deletion_failed BIGINT NOT NULL DEFAULT 0,
    files_per_second DOUBLE PRECISION,
    error_description TEXT,
    error_trace TEXT,
    failure_count BIGINT NOT NULL DEFAULT 0,
    job_parameters TEXT NOT NULL,
    hostname TEXT NOT NULL,
    instance_id TEXT NOT NULL,
    steps TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audits_job_start ON execution_audits (job_name, start_time);
CREATE INDEX IF NOT EXISTS idx_audits_status_start ON execution_audits (status, start_time);

CREATE TABLE IF NOT EXISTS execution_leases (
    name TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    locked_until TEXT NOT NULL
);
";

/// `PostgreSQL`-backed state storage.
///
/// Create with [`PostgresStateBackend::open`] providing a libpq-style
/// connection string (e.g. `"host=localhost dbname=rehome user=postgres"`).
pub struct PostgresStateBackend {
    client: Mutex<Client>,
}

impl PostgresStateBackend {
    /// Connect to a `PostgreSQL` database and initialize state tables.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Backend`] if connection or DDL execution fails.
    pub fn open(connstr: &str) -> error::Result<Self> {
        let mut client = Client::connect(connstr, NoTls).map_err(StateError::backend)?;
        client
            .batch_execute(CREATE_TABLES)
            .map_err(|e| StateError::backend_context("create tables", e))?;
        Ok(Self {
            client: Mutex::new(client),
        })
    }

    /// Acquire the client lock.
    fn lock_client(&self) -> error::Result<MutexGuard<'_, Client>> {
        self.client.lock().map_err(|_| StateError::LockPoisoned)
    }
}

fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("${i}")).collect::<Vec<_>>().join(", ")
}

fn limit_param(limit: Option<usize>) -> Option<i64> {
    limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX))
}

fn record_doc_from_row(row: &Row, offset: usize) -> RecordDocument {
    let col = |i: usize| offset + i;
    RecordDocument {
        id: row.get(col(0)),
        source_path: row.get(col(1)),
        file_name: row.get(col(2)),
        extension: row.get(col(3)),
        file_size: row.get(col(4)),
        last_modified: row.get(col(5)),
        document_type: row.get(col(6)),
        customer_code: row.get(col(7)),
        business_year: row.get(col(8)),
        business_month: row.get(col(9)),
        indexing_status: row.get(col(10)),
        indexed_at: row.get(col(11)),
        indexing_error: row.get(col(12)),
        reorg_status: row.get(col(13)),
        reorg_destination_path: row.get(col(14)),
        reorg_completed_at: row.get(col(15)),
        reorg_job_execution_id: row.get(col(16)),
        reorg_duration_ms: row.get(col(17)),
        reorg_attempts: row.get(col(18)),
        reorg_error: row.get(col(19)),
        reorg_last_attempt_at: row.get(col(20)),
        deleted_from_source: row.get(col(21)),
        source_deletion_date: row.get(col(22)),
        deleted_by: row.get(col(23)),
    }
}

fn record_params(doc: &RecordDocument) -> [&(dyn ToSql + Sync); 24] {
    [
        &doc.id,
        &doc.source_path,
        &doc.file_name,
        &doc.extension,
        &doc.file_size,
        &doc.last_modified,
        &doc.document_type,
        &doc.customer_code,
        &doc.business_year,
        &doc.business_month,
        &doc.indexing_status,
        &doc.indexed_at,
        &doc.indexing_error,
        &doc.reorg_status,
        &doc.reorg_destination_path,
        &doc.reorg_completed_at,
        &doc.reorg_job_execution_id,
        &doc.reorg_duration_ms,
        &doc.reorg_attempts,
        &doc.reorg_error,
        &doc.reorg_last_attempt_at,
        &doc.deleted_from_source,
        &doc.source_deletion_date,
        &doc.deleted_by,
    ]
}

fn audit_doc_from_row(row: &Row) -> AuditDocument {
    AuditDocument {
        audit_id: row.get(0),
        execution_id: row.get(1),
        service_name: row.get(2),
        job_name: row.get(3),
        status: row.get(4),
        start_time: row.get(5),
        end_time: row.get(6),
        duration_ms: row.get(7),
        duration_formatted: row.get(8),
        exit_code: row.get(9),
        exit_description: row.get(10),
        files_processed: row.get(11),
        files_reorganized: row.get(12),
        files_skipped: row.get(13),
        files_failed: row.get(14),
        files_deleted: row.get(15),
        files_deletion_failed: row.get(16),
        files_per_second: row.get(17),
        error_description: row.get(18),
        error_trace: row.get(19),
        failure_count: row.get(20),
        job_parameters: row.get(21),
        hostname: row.get(22),
        instance_id: row.get(23),
        steps: row.get(24),
        created_at: row.get(25),
        updated_at: row.get(26),
    }
}

fn audit_params(doc: &AuditDocument) -> [&(dyn ToSql + Sync); 27] {
    [
        &doc.audit_id,
        &doc.execution_id,
        &doc.service_name,
        &doc.job_name,
        &doc.status,
        &doc.start_time,
        &doc.end_time,
        &doc.duration_ms,
        &doc.duration_formatted,
        &doc.exit_code,
        &doc.exit_description,
        &doc.files_processed,
        &doc.files_reorganized,
        &doc.files_skipped,
        &doc.files_failed,
        &doc.files_deleted,
        &doc.files_deletion_failed,
        &doc.files_per_second,
        &doc.error_description,
        &doc.error_trace,
        &doc.failure_count,
        &doc.job_parameters,
        &doc.hostname,
        &doc.instance_id,
        &doc.steps,
        &doc.created_at,
        &doc.updated_at,
    ]
}

impl RecordStore for PostgresStateBackend {
    fn insert_records(&self, records: &[FileRecord]) -> error::Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "INSERT INTO file_records ({RECORD_COLUMNS}) VALUES ({}) \
             ON CONFLICT (id) DO NOTHING",
            placeholders(24)
        );

        let mut client = self.lock_client()?;
        let mut tx = client
            .transaction()
            .map_err(|e| StateError::backend_context("insert_records: begin tx", e))?;
        let stmt = tx
            .prepare(&sql)
            .map_err(|e| StateError::backend_context("insert_records: prepare", e))?;

        let mut inserted = 0u64;
        for record in records {
            let doc = document::record_to_document(record);
            inserted += tx
                .execute(&stmt, &record_params(&doc))
                .map_err(|e| StateError::backend_context("insert_records: execute", e))?;
        }
        tx.commit()
            .map_err(|e| StateError::backend_context("insert_records: commit", e))?;
        Ok(inserted)
    }

    fn get_record(&self, id: &RecordId) -> error::Result<Option<FileRecord>> {
        let mut client = self.lock_client()?;
        let row = client
            .query_opt(
                &format!("SELECT {RECORD_COLUMNS} FROM file_records WHERE id = $1"),
                &[&id.as_str()],
            )
            .map_err(|e| StateError::backend_context("get_record", e))?;
        row.map(|r| document::record_from_document(record_doc_from_row(&r, 0)))
            .transpose()
    }

    fn fetch_pending_page(
        &self,
        after_seq: i64,
        limit: usize,
    ) -> error::Result<Vec<PendingRecord>> {
        let mut client = self.lock_client()?;
        let rows = client
            .query(
                &format!(
                    "SELECT seq, {RECORD_COLUMNS} FROM file_records \
                     WHERE reorg_status = 'PENDING' AND seq > $1 ORDER BY seq LIMIT $2"
                ),
                &[&after_seq, &limit_param(Some(limit))],
            )
            .map_err(|e| StateError::backend_context("fetch_pending_page", e))?;

        Ok(rows
            .iter()
            .map(|row| {
                let doc = record_doc_from_row(row, 1);
                PendingRecord {
                    seq: row.get(0),
                    id: RecordId::new(doc.id.clone()),
                    record: document::record_from_document(doc).ok(),
                }
            })
            .collect())
    }

    fn update_reorg(&self, id: &RecordId, update: &ReorgUpdate) -> error::Result<()> {
        let mut client = self.lock_client()?;
        let changed = match update {
            ReorgUpdate::Success {
                destination_path,
                completed_at,
                duration_ms,
                job_execution_id,
                attempts,
            } => client.execute(
                "UPDATE file_records SET reorg_status = 'SUCCESS', \
                 reorg_destination_path = $1, reorg_completed_at = $2, \
                 reorg_duration_ms = $3, reorg_job_execution_id = $4, \
                 reorg_attempts = reorg_attempts + $5, reorg_error = NULL, \
                 reorg_last_attempt_at = $2 \
                 WHERE id = $6",
                &[
                    destination_path,
                    &document::format_ts(*completed_at),
                    &i64::try_from(*duration_ms).unwrap_or(i64::MAX),
                    &job_execution_id.to_string(),
                    &i64::from(*attempts),
                    &id.as_str(),
                ],
            ),
            ReorgUpdate::Failure {
                error,
                attempted_at,
                job_execution_id,
                attempts,
            } => client.execute(
                "UPDATE file_records SET reorg_status = 'FAILED', reorg_error = $1, \
                 reorg_last_attempt_at = $2, reorg_job_execution_id = $3, \
                 reorg_attempts = reorg_attempts + $4 \
                 WHERE id = $5",
                &[
                    error,
                    &document::format_ts(*attempted_at),
                    &job_execution_id.to_string(),
                    &i64::from(*attempts),
                    &id.as_str(),
                ],
            ),
        }
        .map_err(|e| StateError::backend_context("update_reorg", e))?;

        if changed == 0 {
            return Err(StateError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn bulk_update_cleanup(
        &self,
        updates: &[(RecordId, CleanupUpdate)],
    ) -> error::Result<BulkUpdateReport> {
        let mut client = self.lock_client()?;
        let mut report = BulkUpdateReport::default();
        for (id, update) in updates {
            let result = match update {
                CleanupUpdate::Deleted {
                    deleted_at,
                    deleted_by,
                } => client.execute(
                    "UPDATE file_records SET deleted_from_source = TRUE, \
                     source_deletion_date = $1, deleted_by = $2 WHERE id = $3",
                    &[&document::format_ts(*deleted_at), deleted_by, &id.as_str()],
                ),
                CleanupUpdate::DeletionFailed {
                    error,
                    attempted_at,
                } => client.execute(
                    "UPDATE file_records SET reorg_error = $1, reorg_last_attempt_at = $2 \
                     WHERE id = $3",
                    &[error, &document::format_ts(*attempted_at), &id.as_str()],
                ),
            };
            match result {
                Ok(0) => report.errors.push((id.clone(), "record not found".into())),
                Ok(n) => {
                    report.matched += n;
                    report.modified += n;
                }
                Err(e) => report.errors.push((id.clone(), e.to_string())),
            }
        }
        Ok(report)
    }

    fn find_cleanup_candidates(
        &self,
        filter: &CandidateFilter,
    ) -> error::Result<Vec<CleanupCandidate>> {
        let mut client = self.lock_client()?;
        let after = filter.after.as_ref().map_or("", RecordId::as_str);
        let rows = client
            .query(
                &format!(
                    "SELECT {CANDIDATE_COLUMNS} FROM file_records \
                     WHERE reorg_status = 'SUCCESS' AND deleted_from_source = FALSE \
                     AND reorg_destination_path IS NOT NULL AND reorg_destination_path <> '' \
                     AND reorg_completed_at >= $1 AND id > $2 \
                     ORDER BY id LIMIT $3"
                ),
                &[
                    &document::format_ts(filter.completed_since),
                    &after,
                    &limit_param(Some(filter.limit)),
                ],
            )
            .map_err(|e| StateError::backend_context("find_cleanup_candidates", e))?;

        Ok(rows
            .iter()
            .map(|row| {
                document::candidate_from_document(CandidateDocument {
                    id: row.get(0),
                    source_path: row.get(1),
                    destination_path: row.get(2),
                    completed_at: row.get(3),
                    file_size: row.get(4),
                    last_modified: row.get(5),
                })
            })
            .collect())
    }

    #[allow(clippy::cast_sign_loss)]
    fn count_by_reorg_status(&self, status: ReorgStatus) -> error::Result<u64> {
        let mut client = self.lock_client()?;
        let row = client
            .query_one(
                "SELECT COUNT(*) FROM file_records WHERE reorg_status = $1",
                &[&status.as_str()],
            )
            .map_err(|e| StateError::backend_context("count_by_reorg_status", e))?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }
}

impl AuditStore for PostgresStateBackend {
    fn insert_audit(&self, audit: &ExecutionAudit) -> error::Result<()> {
        let doc = document::audit_to_document(audit)?;
        let mut client = self.lock_client()?;
        client
            .execute(
                &format!(
                    "INSERT INTO execution_audits ({AUDIT_COLUMNS}) VALUES ({})",
                    placeholders(27)
                ),
                &audit_params(&doc),
            )
            .map_err(|e| StateError::backend_context("insert_audit", e))?;
        Ok(())
    }

    fn update_audit(&self, audit: &ExecutionAudit) -> error::Result<()> {
        let doc = document::audit_to_document(audit)?;
        let assignments = AUDIT_COLUMNS
            .split(", ")
            .enumerate()
            .skip(1)
            .map(|(i, col)| format!("{} = ${}", col.trim(), i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let mut client = self.lock_client()?;
        let changed = client
            .execute(
                &format!("UPDATE execution_audits SET {assignments} WHERE audit_id = $1"),
                &audit_params(&doc),
            )
            .map_err(|e| StateError::backend_context("update_audit", e))?;
        if changed == 0 {
            return Err(StateError::NotFound(doc.audit_id));
        }
        Ok(())
    }

    fn find_audit(&self, execution_id: &ExecutionId) -> error::Result<Option<ExecutionAudit>> {
        let mut client = self.lock_client()?;
        let row = client
            .query_opt(
                &format!("SELECT {AUDIT_COLUMNS} FROM execution_audits WHERE execution_id = $1"),
                &[&execution_id.to_string()],
            )
            .map_err(|e| StateError::backend_context("find_audit", e))?;
        row.map(|r| document::audit_from_document(audit_doc_from_row(&r)))
            .transpose()
    }

    fn list_audits(&self, query: &AuditQuery) -> error::Result<Vec<ExecutionAudit>> {
        let mut client = self.lock_client()?;
        let rows = client
            .query(
                &format!(
                    "SELECT {AUDIT_COLUMNS} FROM execution_audits \
                     WHERE ($1::TEXT IS NULL OR job_name = $1) \
                     AND ($2::TEXT IS NULL OR status = $2) \
                     AND ($3::TEXT IS NULL OR start_time >= $3) \
                     AND ($4::TEXT IS NULL OR start_time <= $4) \
                     ORDER BY start_time DESC LIMIT $5"
                ),
                &[
                    &query.job_name,
                    &query.status.map(ExecutionStatus::as_str),
                    &query.started_from.map(document::format_ts),
                    &query.started_to.map(document::format_ts),
                    &limit_param(query.limit),
                ],
            )
            .map_err(|e| StateError::backend_context("list_audits", e))?;

        rows.iter()
            .map(|row| document::audit_from_document(audit_doc_from_row(row)))
            .collect()
    }

    #[allow(clippy::cast_sign_loss)]
    fn count_audits_by_status(
        &self,
        job_name: Option<&str>,
    ) -> error::Result<Vec<(ExecutionStatus, u64)>> {
        let mut client = self.lock_client()?;
        let rows = client
            .query(
                "SELECT status, COUNT(*) FROM execution_audits \
                 WHERE ($1::TEXT IS NULL OR job_name = $1) GROUP BY status ORDER BY status",
                &[&job_name],
            )
            .map_err(|e| StateError::backend_context("count_audits_by_status", e))?;

        rows.iter()
            .map(|row| {
                let raw: String = row.get(0);
                let count: i64 = row.get(1);
                ExecutionStatus::parse(&raw)
                    .map(|status| (status, count as u64))
                    .ok_or_else(|| {
                        StateError::corrupt("execution_audits", format!("unknown status '{raw}'"))
                    })
            })
            .collect()
    }
}

impl LeaseStore for PostgresStateBackend {
    fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        locked_until: DateTime<Utc>,
    ) -> error::Result<bool> {
        let mut client = self.lock_client()?;
        let changed = client
            .execute(
                "INSERT INTO execution_leases (name, holder, acquired_at, locked_until) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (name) DO UPDATE SET holder = EXCLUDED.holder, \
                 acquired_at = EXCLUDED.acquired_at, locked_until = EXCLUDED.locked_until \
                 WHERE execution_leases.locked_until <= EXCLUDED.acquired_at",
                &[
                    &name,
                    &holder,
                    &document::format_ts(now),
                    &document::format_ts(locked_until),
                ],
            )
            .map_err(|e| StateError::backend_context("try_acquire_lease", e))?;
        Ok(changed > 0)
    }

    fn release_lease(
        &self,
        name: &str,
        holder: &str,
        locked_until: DateTime<Utc>,
    ) -> error::Result<bool> {
        let mut client = self.lock_client()?;
        let changed = client
            .execute(
                "UPDATE execution_leases SET locked_until = $1 WHERE name = $2 AND holder = $3",
                &[&document::format_ts(locked_until), &name, &holder],
            )
            .map_err(|e| StateError::backend_context("release_lease", e))?;
        Ok(changed > 0)
    }

    fn get_lease(&self, name: &str) -> error::Result<Option<LeaseRecord>> {
        let mut client = self.lock_client()?;
        let row = client
            .query_opt(
                "SELECT name, holder, acquired_at, locked_until FROM execution_leases \
                 WHERE name = $1",
                &[&name],
            )
            .map_err(|e| StateError::backend_context("get_lease", e))?;
        row.map(|r| {
            let acquired: String = r.get(2);
            let until: String = r.get(3);
            document::lease_from_row(r.get(0), r.get(1), &acquired, &until)
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_numbered() {
        assert_eq!(placeholders(3), "$1, $2, $3");
    }

    #[test]
    fn limit_none_means_no_limit() {
        assert_eq!(limit_param(None), None);
        assert_eq!(limit_param(Some(10)), Some(10));
    }

    #[test]
    fn open_rejects_unreachable_server() {
        let err = PostgresStateBackend::open("host=127.0.0.1 port=1 user=nobody connect_timeout=1");
        assert!(err.is_err());
    }
}
