//! `SQLite`-backed implementation of the record, audit, and lease stores.
//!
//! Uses a single `Mutex<Connection>` for thread safety. Every statement runs
//! under that lock, which also makes the lease upsert atomic.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rehome_types::{
    CleanupCandidate, ExecutionAudit, ExecutionId, ExecutionStatus, FileRecord, LeaseRecord,
    RecordId, ReorgStatus,
};
use rusqlite::{Connection, OptionalExtension, Row, ToSql};

use crate::backend::{
    AuditQuery, AuditStore, BulkUpdateReport, CandidateFilter, CleanupUpdate, LeaseStore,
    PendingRecord, RecordStore, ReorgUpdate,
};
use crate::document::{
    self, AuditDocument, CandidateDocument, RecordDocument, AUDIT_COLUMNS, CANDIDATE_COLUMNS,
    RECORD_COLUMNS,
};
use crate::error::{self, StateError};

/// Idempotent DDL for state tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS file_records (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    source_path TEXT NOT NULL,
    file_name TEXT NOT NULL,
    extension TEXT,
    file_size INTEGER,
    last_modified TEXT,
    document_type TEXT,
    customer_code TEXT,
    business_year INTEGER,
    business_month INTEGER,
    indexing_status TEXT NOT NULL DEFAULT 'PENDING',
    indexed_at TEXT,
    indexing_error TEXT,
    reorg_status TEXT NOT NULL DEFAULT 'PENDING',
    reorg_destination_path TEXT,
    reorg_completed_at TEXT,
    reorg_job_execution_id TEXT,
    reorg_duration_ms INTEGER,
    reorg_attempts INTEGER NOT NULL DEFAULT 0,
    reorg_error TEXT,
    reorg_last_attempt_at TEXT,
    deleted_from_source INTEGER NOT NULL DEFAULT 0,
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
    duration_ms INTEGER,
    duration_formatted TEXT,
    exit_code TEXT,
    exit_description TEXT,
    files_processed INTEGER NOT NULL DEFAULT 0,
    files_reorganized INTEGER NOT NULL DEFAULT 0,
    files_skipped INTEGER NOT NULL DEFAULT 0,
    files_failed INTEGER NOT NULL DEFAULT 0,
    files_deleted INTEGER NOT NULL DEFAULT 0,
    files_deletion_failed INTEGER NOT NULL DEFAULT 0,
    files_per_second REAL,
    error_description TEXT,
    error_trace TEXT,
    failure_count INTEGER NOT NULL DEFAULT 0,
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

/// `SQLite`-backed state storage.
///
/// Create with [`SqliteStateBackend::open`] for file-backed persistence
/// or [`SqliteStateBackend::in_memory`] for tests.
pub struct SqliteStateBackend {
    conn: Mutex<Connection>,
}

impl SqliteStateBackend {
    /// Open or create a `SQLite` state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Backend`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(StateError::backend)?;
        Self::init(conn)
    }

    /// Create an in-memory `SQLite` backend (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Backend`] if the in-memory database can't
    /// be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(StateError::backend)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> error::Result<Self> {
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StateError::backend_context("create tables", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    #[cfg(test)]
    fn audit_row_count(&self) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.query_row("SELECT COUNT(*) FROM execution_audits", [], |row| row.get(0))
            .map_err(StateError::backend)
    }
}

fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ")
}

#[allow(clippy::cast_possible_wrap)]
fn limit_param(limit: Option<usize>) -> i64 {
    limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX))
}

fn record_doc_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<RecordDocument> {
    let col = |i: usize| offset + i;
    Ok(RecordDocument {
        id: row.get(col(0))?,
        source_path: row.get(col(1))?,
        file_name: row.get(col(2))?,
        extension: row.get(col(3))?,
        file_size: row.get(col(4))?,
        last_modified: row.get(col(5))?,
        document_type: row.get(col(6))?,
        customer_code: row.get(col(7))?,
        business_year: row.get(col(8))?,
        business_month: row.get(col(9))?,
        indexing_status: row.get(col(10))?,
        indexed_at: row.get(col(11))?,
        indexing_error: row.get(col(12))?,
        reorg_status: row.get(col(13))?,
        reorg_destination_path: row.get(col(14))?,
        reorg_completed_at: row.get(col(15))?,
        reorg_job_execution_id: row.get(col(16))?,
        reorg_duration_ms: row.get(col(17))?,
        reorg_attempts: row.get(col(18))?,
        reorg_error: row.get(col(19))?,
        reorg_last_attempt_at: row.get(col(20))?,
        deleted_from_source: row.get(col(21))?,
        source_deletion_date: row.get(col(22))?,
        deleted_by: row.get(col(23))?,
    })
}

fn record_params(doc: &RecordDocument) -> [&dyn ToSql; 24] {
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

fn audit_doc_from_row(row: &Row<'_>) -> rusqlite::Result<AuditDocument> {
    Ok(AuditDocument {
        audit_id: row.get(0)?,
        execution_id: row.get(1)?,
        service_name: row.get(2)?,
        job_name: row.get(3)?,
        status: row.get(4)?,
        start_time: row.get(5)?,
        end_time: row.get(6)?,
        duration_ms: row.get(7)?,
        duration_formatted: row.get(8)?,
        exit_code: row.get(9)?,
        exit_description: row.get(10)?,
        files_processed: row.get(11)?,
        files_reorganized: row.get(12)?,
        files_skipped: row.get(13)?,
        files_failed: row.get(14)?,
        files_deleted: row.get(15)?,
        files_deletion_failed: row.get(16)?,
        files_per_second: row.get(17)?,
        error_description: row.get(18)?,
        error_trace: row.get(19)?,
        failure_count: row.get(20)?,
        job_parameters: row.get(21)?,
        hostname: row.get(22)?,
        instance_id: row.get(23)?,
        steps: row.get(24)?,
        created_at: row.get(25)?,
        updated_at: row.get(26)?,
    })
}

fn audit_params(doc: &AuditDocument) -> [&dyn ToSql; 27] {
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

impl RecordStore for SqliteStateBackend {
    fn insert_records(&self, records: &[FileRecord]) -> error::Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "INSERT OR IGNORE INTO file_records ({RECORD_COLUMNS}) VALUES ({})",
            placeholders(24)
        );

        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::backend_context("insert_records: begin tx", e))?;
        let mut stmt = tx
            .prepare(&sql)
            .map_err(|e| StateError::backend_context("insert_records: prepare", e))?;

        let mut inserted = 0u64;
        for record in records {
            let doc = document::record_to_document(record);
            let changed = stmt
                .execute(&record_params(&doc)[..])
                .map_err(|e| StateError::backend_context("insert_records: execute", e))?;
            inserted += changed as u64;
        }
        drop(stmt);
        tx.commit()
            .map_err(|e| StateError::backend_context("insert_records: commit", e))?;
        Ok(inserted)
    }

    fn get_record(&self, id: &RecordId) -> error::Result<Option<FileRecord>> {
        let conn = self.lock_conn()?;
        let doc = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM file_records WHERE id = ?1"),
                [id.as_str()],
                |row| record_doc_from_row(row, 0),
            )
            .optional()
            .map_err(|e| StateError::backend_context("get_record", e))?;
        doc.map(document::record_from_document).transpose()
    }

    fn fetch_pending_page(
        &self,
        after_seq: i64,
        limit: usize,
    ) -> error::Result<Vec<PendingRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT seq, {RECORD_COLUMNS} FROM file_records \
                 WHERE reorg_status = 'PENDING' AND seq > ?1 ORDER BY seq LIMIT ?2"
            ))
            .map_err(|e| StateError::backend_context("fetch_pending_page: prepare", e))?;
        let rows = stmt
            .query_map(
                rusqlite::params![after_seq, limit_param(Some(limit))],
                |row| Ok((row.get::<_, i64>(0)?, record_doc_from_row(row, 1)?)),
            )
            .map_err(|e| StateError::backend_context("fetch_pending_page: query", e))?;

        let mut page = Vec::with_capacity(limit);
        for row in rows {
            let (seq, doc) =
                row.map_err(|e| StateError::backend_context("fetch_pending_page: row", e))?;
            let id = RecordId::new(doc.id.clone());
            page.push(PendingRecord {
                seq,
                id,
                record: document::record_from_document(doc).ok(),
            });
        }
        Ok(page)
    }

    fn update_reorg(&self, id: &RecordId, update: &ReorgUpdate) -> error::Result<()> {
        let conn = self.lock_conn()?;
        let changed = match update {
            ReorgUpdate::Success {
                destination_path,
                completed_at,
                duration_ms,
                job_execution_id,
                attempts,
            } => conn.execute(
                "UPDATE file_records SET reorg_status = 'SUCCESS', \
                 reorg_destination_path = ?1, reorg_completed_at = ?2, \
                 reorg_duration_ms = ?3, reorg_job_execution_id = ?4, \
                 reorg_attempts = reorg_attempts + ?5, reorg_error = NULL, \
                 reorg_last_attempt_at = ?2 \
                 WHERE id = ?6",
                rusqlite::params![
                    destination_path,
                    document::format_ts(*completed_at),
                    i64::try_from(*duration_ms).unwrap_or(i64::MAX),
                    job_execution_id.to_string(),
                    attempts,
                    id.as_str(),
                ],
            ),
            ReorgUpdate::Failure {
                error,
                attempted_at,
                job_execution_id,
                attempts,
            } => conn.execute(
                "UPDATE file_records SET reorg_status = 'FAILED', reorg_error = ?1, \
                 reorg_last_attempt_at = ?2, reorg_job_execution_id = ?3, \
                 reorg_attempts = reorg_attempts + ?4 \
                 WHERE id = ?5",
                rusqlite::params![
                    error,
                    document::format_ts(*attempted_at),
                    job_execution_id.to_string(),
                    attempts,
                    id.as_str(),
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
        let conn = self.lock_conn()?;
        let mut report = BulkUpdateReport::default();
        for (id, update) in updates {
            let result = match update {
                CleanupUpdate::Deleted {
                    deleted_at,
                    deleted_by,
                } => conn.execute(
                    "UPDATE file_records SET deleted_from_source = 1, \
                     source_deletion_date = ?1, deleted_by = ?2 WHERE id = ?3",
                    rusqlite::params![document::format_ts(*deleted_at), deleted_by, id.as_str()],
                ),
                CleanupUpdate::DeletionFailed {
                    error,
                    attempted_at,
                } => conn.execute(
                    "UPDATE file_records SET reorg_error = ?1, reorg_last_attempt_at = ?2 \
                     WHERE id = ?3",
                    rusqlite::params![error, document::format_ts(*attempted_at), id.as_str()],
                ),
            };
            match result {
                Ok(0) => report.errors.push((id.clone(), "record not found".into())),
                Ok(n) => {
                    report.matched += n as u64;
                    report.modified += n as u64;
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
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CANDIDATE_COLUMNS} FROM file_records \
                 WHERE reorg_status = 'SUCCESS' AND deleted_from_source = 0 \
                 AND reorg_destination_path IS NOT NULL AND reorg_destination_path <> '' \
                 AND reorg_completed_at >= ?1 AND id > ?2 \
                 ORDER BY id LIMIT ?3"
            ))
            .map_err(|e| StateError::backend_context("find_cleanup_candidates: prepare", e))?;
        let after = filter.after.as_ref().map_or("", RecordId::as_str);
        let rows = stmt
            .query_map(
                rusqlite::params![
                    document::format_ts(filter.completed_since),
                    after,
                    limit_param(Some(filter.limit)),
                ],
                |row| {
                    Ok(CandidateDocument {
                        id: row.get(0)?,
                        source_path: row.get(1)?,
                        destination_path: row.get(2)?,
                        completed_at: row.get(3)?,
                        file_size: row.get(4)?,
                        last_modified: row.get(5)?,
                    })
                },
            )
            .map_err(|e| StateError::backend_context("find_cleanup_candidates: query", e))?;

        rows.map(|row| {
            row.map(document::candidate_from_document)
                .map_err(|e| StateError::backend_context("find_cleanup_candidates: row", e))
        })
        .collect()
    }

    #[allow(clippy::cast_sign_loss)]
    fn count_by_reorg_status(&self, status: ReorgStatus) -> error::Result<u64> {
        let conn = self.lock_conn()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM file_records WHERE reorg_status = ?1",
                [status.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| StateError::backend_context("count_by_reorg_status", e))?;
        Ok(count as u64)
    }
}

impl AuditStore for SqliteStateBackend {
    fn insert_audit(&self, audit: &ExecutionAudit) -> error::Result<()> {
        let doc = document::audit_to_document(audit)?;
        let conn = self.lock_conn()?;
        conn.execute(
            &format!(
                "INSERT INTO execution_audits ({AUDIT_COLUMNS}) VALUES ({})",
                placeholders(27)
            ),
            &audit_params(&doc)[..],
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
            .map(|(i, col)| format!("{} = ?{}", col.trim(), i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let conn = self.lock_conn()?;
        let changed = conn
            .execute(
                &format!("UPDATE execution_audits SET {assignments} WHERE audit_id = ?1"),
                &audit_params(&doc)[..],
            )
            .map_err(|e| StateError::backend_context("update_audit", e))?;
        if changed == 0 {
            return Err(StateError::NotFound(doc.audit_id));
        }
        Ok(())
    }

    fn find_audit(&self, execution_id: &ExecutionId) -> error::Result<Option<ExecutionAudit>> {
        let conn = self.lock_conn()?;
        let doc = conn
            .query_row(
                &format!("SELECT {AUDIT_COLUMNS} FROM execution_audits WHERE execution_id = ?1"),
                [execution_id.to_string()],
                audit_doc_from_row,
            )
            .optional()
            .map_err(|e| StateError::backend_context("find_audit", e))?;
        doc.map(document::audit_from_document).transpose()
    }

    fn list_audits(&self, query: &AuditQuery) -> error::Result<Vec<ExecutionAudit>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {AUDIT_COLUMNS} FROM execution_audits \
                 WHERE (?1 IS NULL OR job_name = ?1) \
                 AND (?2 IS NULL OR status = ?2) \
                 AND (?3 IS NULL OR start_time >= ?3) \
                 AND (?4 IS NULL OR start_time <= ?4) \
                 ORDER BY start_time DESC LIMIT ?5"
            ))
            .map_err(|e| StateError::backend_context("list_audits: prepare", e))?;
        let rows = stmt
            .query_map(
                rusqlite::params![
                    query.job_name,
                    query.status.map(ExecutionStatus::as_str),
                    query.started_from.map(document::format_ts),
                    query.started_to.map(document::format_ts),
                    limit_param(query.limit),
                ],
                audit_doc_from_row,
            )
            .map_err(|e| StateError::backend_context("list_audits: query", e))?;

        let mut audits = Vec::new();
        for row in rows {
            let doc = row.map_err(|e| StateError::backend_context("list_audits: row", e))?;
            audits.push(document::audit_from_document(doc)?);
        }
        Ok(audits)
    }

    #[allow(clippy::cast_sign_loss)]
    fn count_audits_by_status(
        &self,
        job_name: Option<&str>,
    ) -> error::Result<Vec<(ExecutionStatus, u64)>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT status, COUNT(*) FROM execution_audits \
                 WHERE (?1 IS NULL OR job_name = ?1) GROUP BY status ORDER BY status",
            )
            .map_err(|e| StateError::backend_context("count_audits_by_status: prepare", e))?;
        let rows = stmt
            .query_map([job_name], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(|e| StateError::backend_context("count_audits_by_status: query", e))?;

        let mut counts = Vec::new();
        for row in rows {
            let (raw, count) =
                row.map_err(|e| StateError::backend_context("count_audits_by_status: row", e))?;
            let status = ExecutionStatus::parse(&raw).ok_or_else(|| {
                StateError::corrupt("execution_audits", format!("unknown status '{raw}'"))
            })?;
            counts.push((status, count as u64));
        }
        Ok(counts)
    }
}

impl LeaseStore for SqliteStateBackend {
    fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        locked_until: DateTime<Utc>,
    ) -> error::Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn
            .execute(
                "INSERT INTO execution_leases (name, holder, acquired_at, locked_until) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, \
                 acquired_at = excluded.acquired_at, locked_until = excluded.locked_until \
                 WHERE execution_leases.locked_until <= excluded.acquired_at",
                rusqlite::params![
                    name,
                    holder,
                    document::format_ts(now),
                    document::format_ts(locked_until),
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
        let conn = self.lock_conn()?;
        let changed = conn
            .execute(
                "UPDATE execution_leases SET locked_until = ?1 WHERE name = ?2 AND holder = ?3",
                rusqlite::params![document::format_ts(locked_until), name, holder],
            )
            .map_err(|e| StateError::backend_context("release_lease", e))?;
        Ok(changed > 0)
    }

    fn get_lease(&self, name: &str) -> error::Result<Option<LeaseRecord>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT name, holder, acquired_at, locked_until FROM execution_leases \
                 WHERE name = ?1",
                [name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| StateError::backend_context("get_lease", e))?;
        row.map(|(name, holder, acquired, until)| {
            document::lease_from_row(name, holder, &acquired, &until)
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rehome_types::{AuditCounters, AuditId};
    use std::collections::BTreeMap;

    fn pending(id: &str) -> FileRecord {
        FileRecord::pending(id, format!("/in/{id}.pdf"), format!("{id}.pdf"))
    }

    fn success(dest: &str, completed_at: DateTime<Utc>) -> ReorgUpdate {
        ReorgUpdate::Success {
            destination_path: dest.into(),
            completed_at,
            duration_ms: 12,
            job_execution_id: ExecutionId::generate(),
            attempts: 1,
        }
    }

    fn audit(job: &str, status: ExecutionStatus, start: DateTime<Utc>) -> ExecutionAudit {
        let exec = ExecutionId::generate();
        ExecutionAudit {
            audit_id: AuditId::for_run(job, &exec),
            execution_id: exec,
            service_name: "rehome".into(),
            job_name: job.into(),
            status,
            start_time: start,
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
            job_parameters: BTreeMap::new(),
            hostname: "host-a".into(),
            instance_id: "host-a".into(),
            steps: Vec::new(),
            created_at: start,
            updated_at: start,
        }
    }

    #[test]
    fn insert_is_idempotent_by_id() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        assert_eq!(backend.insert_records(&[pending("a"), pending("b")]).unwrap(), 2);
        assert_eq!(backend.insert_records(&[pending("b"), pending("c")]).unwrap(), 1);
        assert_eq!(backend.count_by_reorg_status(ReorgStatus::Pending).unwrap(), 3);
    }

    #[test]
    fn pending_pages_follow_insertion_order() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        backend
            .insert_records(&[pending("z"), pending("a"), pending("m")])
            .unwrap();

        let first = backend.fetch_pending_page(0, 2).unwrap();
        let ids: Vec<_> = first.iter().map(|p| p.id.as_str().to_owned()).collect();
        assert_eq!(ids, vec!["z", "a"]);

        let second = backend.fetch_pending_page(first[1].seq, 2).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id.as_str(), "m");
        assert!(second[0].record.is_some());

        assert!(backend.fetch_pending_page(second[0].seq, 2).unwrap().is_empty());
    }

    #[test]
    fn corrupt_pending_row_maps_to_none() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        backend.insert_records(&[pending("ok"), pending("bad")]).unwrap();
        {
            let conn = backend.lock_conn().unwrap();
            conn.execute("UPDATE file_records SET source_path = '' WHERE id = 'bad'", [])
                .unwrap();
        }
        let page = backend.fetch_pending_page(0, 10).unwrap();
        assert_eq!(page.len(), 2);
        assert!(page[0].record.is_some());
        assert!(page[1].record.is_none());
        assert_eq!(page[1].id.as_str(), "bad");
    }

    #[test]
    fn reorg_success_leaves_pending_set_and_counts_attempts() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        backend.insert_records(&[pending("a"), pending("b")]).unwrap();
        let id = RecordId::new("a");

        backend
            .update_reorg(
                &id,
                &ReorgUpdate::Failure {
                    error: "timeout".into(),
                    attempted_at: Utc::now(),
                    job_execution_id: ExecutionId::generate(),
                    attempts: 2,
                },
            )
            .unwrap();
        backend.update_reorg(&id, &success("/d/a.pdf", Utc::now())).unwrap();

        let rec = backend.get_record(&id).unwrap().unwrap();
        assert_eq!(rec.reorg.status, ReorgStatus::Success);
        assert_eq!(rec.reorg.attempts, 3);
        assert_eq!(rec.reorg.last_error, None);
        assert_eq!(rec.reorg.destination_path.as_deref(), Some("/d/a.pdf"));
        assert!(rec.reorg.last_attempt_at.is_some());

        let page = backend.fetch_pending_page(0, 10).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id.as_str(), "b");
    }

    #[test]
    fn reorg_update_on_missing_record_is_not_found() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let err = backend
            .update_reorg(&RecordId::new("ghost"), &success("/d", Utc::now()))
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn cleanup_candidates_respect_window_and_flag() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        backend
            .insert_records(&[pending("old"), pending("new"), pending("gone"), pending("todo")])
            .unwrap();
        let now = Utc::now();
        backend
            .update_reorg(&"old".into(), &success("/d/old", now - Duration::days(91)))
            .unwrap();
        backend
            .update_reorg(&"new".into(), &success("/d/new", now - Duration::days(89)))
            .unwrap();
        backend
            .update_reorg(&"gone".into(), &success("/d/gone", now - Duration::days(1)))
            .unwrap();
        backend
            .bulk_update_cleanup(&[(
                "gone".into(),
                CleanupUpdate::Deleted {
                    deleted_at: now,
                    deleted_by: "cleanup-step".into(),
                },
            )])
            .unwrap();

        let candidates = backend
            .find_cleanup_candidates(&CandidateFilter {
                completed_since: now - Duration::days(90),
                after: None,
                limit: 100,
            })
            .unwrap();
        let ids: Vec<_> = candidates.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["new"]);
        assert_eq!(candidates[0].source_path.as_deref(), Some("/in/new.pdf"));
    }

    #[test]
    fn bulk_cleanup_is_unordered_and_partial() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        backend.insert_records(&[pending("a"), pending("b")]).unwrap();
        let now = Utc::now();
        let report = backend
            .bulk_update_cleanup(&[
                (
                    "a".into(),
                    CleanupUpdate::Deleted {
                        deleted_at: now,
                        deleted_by: "cleanup-step".into(),
                    },
                ),
                (
                    "missing".into(),
                    CleanupUpdate::Deleted {
                        deleted_at: now,
                        deleted_by: "cleanup-step".into(),
                    },
                ),
                (
                    "b".into(),
                    CleanupUpdate::DeletionFailed {
                        error: "Cleanup failed: permission denied".into(),
                        attempted_at: now,
                    },
                ),
            ])
            .unwrap();
        assert_eq!(report.modified, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0.as_str(), "missing");

        let a = backend.get_record(&"a".into()).unwrap().unwrap();
        assert!(a.cleanup.deleted_from_source);
        assert_eq!(a.cleanup.deleted_by.as_deref(), Some("cleanup-step"));

        let b = backend.get_record(&"b".into()).unwrap().unwrap();
        assert!(!b.cleanup.deleted_from_source);
        assert_eq!(
            b.reorg.last_error.as_deref(),
            Some("Cleanup failed: permission denied")
        );
    }

    #[test]
    fn audit_update_is_in_place() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let mut a = audit("job", ExecutionStatus::Started, Utc::now());
        backend.insert_audit(&a).unwrap();

        a.status = ExecutionStatus::Failed;
        a.error_description = Some("boom".into());
        backend.update_audit(&a).unwrap();

        assert_eq!(backend.audit_row_count().unwrap(), 1);
        let stored = backend.find_audit(&a.execution_id).unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Failed);
        assert_eq!(stored.error_description.as_deref(), Some("boom"));
        assert_eq!(stored.audit_id, a.audit_id);
    }

    #[test]
    fn audit_update_never_inserts() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let a = audit("job", ExecutionStatus::Completed, Utc::now());
        assert!(matches!(
            backend.update_audit(&a).unwrap_err(),
            StateError::NotFound(_)
        ));
        assert_eq!(backend.audit_row_count().unwrap(), 0);
    }

    #[test]
    fn audit_queries_filter_and_order() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let t0 = Utc::now() - Duration::hours(3);
        backend
            .insert_audit(&audit("a", ExecutionStatus::Completed, t0))
            .unwrap();
        backend
            .insert_audit(&audit("a", ExecutionStatus::Failed, t0 + Duration::hours(1)))
            .unwrap();
        backend
            .insert_audit(&audit("b", ExecutionStatus::Completed, t0 + Duration::hours(2)))
            .unwrap();

        let by_job = backend.list_audits(&AuditQuery::by_job("a")).unwrap();
        assert_eq!(by_job.len(), 2);
        assert_eq!(by_job[0].status, ExecutionStatus::Failed);

        let latest = backend.list_audits(&AuditQuery::latest(1)).unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].job_name, "b");

        let range = backend
            .list_audits(&AuditQuery::started_between(
                t0 + Duration::minutes(30),
                t0 + Duration::minutes(90),
            ))
            .unwrap();
        assert_eq!(range.len(), 1);

        let counts = backend.count_audits_by_status(None).unwrap();
        assert!(counts.contains(&(ExecutionStatus::Completed, 2)));
        assert!(counts.contains(&(ExecutionStatus::Failed, 1)));
        let counts_a = backend.count_audits_by_status(Some("a")).unwrap();
        assert!(counts_a.contains(&(ExecutionStatus::Completed, 1)));
    }

    #[test]
    fn lease_excludes_until_expiry() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let now = Utc::now();
        assert!(backend
            .try_acquire_lease("job", "h1", now, now + Duration::minutes(10))
            .unwrap());
        assert!(!backend
            .try_acquire_lease("job", "h2", now + Duration::minutes(1), now + Duration::minutes(11))
            .unwrap());
        assert_eq!(backend.get_lease("job").unwrap().unwrap().holder, "h1");

        assert!(backend
            .try_acquire_lease("job", "h2", now + Duration::minutes(10), now + Duration::minutes(20))
            .unwrap());
        assert_eq!(backend.get_lease("job").unwrap().unwrap().holder, "h2");
    }

    #[test]
    fn release_only_by_holder() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let now = Utc::now();
        backend
            .try_acquire_lease("job", "h1", now, now + Duration::hours(2))
            .unwrap();
        assert!(!backend.release_lease("job", "h2", now).unwrap());
        assert!(backend.release_lease("job", "h1", now).unwrap());
        assert!(backend
            .try_acquire_lease("job", "h2", now, now + Duration::hours(2))
            .unwrap());
    }

    #[test]
    fn file_backed_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");
        {
            let backend = SqliteStateBackend::open(&path).unwrap();
            backend.insert_records(&[pending("a")]).unwrap();
        }
        let reopened = SqliteStateBackend::open(&path).unwrap();
        assert!(reopened.get_record(&"a".into()).unwrap().is_some());
    }
}
