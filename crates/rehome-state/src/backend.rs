//! Storage contracts consumed by the migration engine.
//!
//! Three narrow, synchronous traits, one per logical collection:
//! [`RecordStore`] (per-file migration state), [`AuditStore`] (one document
//! per run) and [`LeaseStore`] (distributed execution lease). Backends
//! implement all three; the engine holds them as `Arc<dyn StateBackend>`
//! and calls them from `spawn_blocking`.

use chrono::{DateTime, Utc};
use rehome_types::{
    CleanupCandidate, ExecutionAudit, ExecutionId, ExecutionStatus, FileRecord, LeaseRecord,
    RecordId, ReorgStatus,
};

use crate::error;

// ---------------------------------------------------------------------------
// Record store
// ---------------------------------------------------------------------------

/// One row of a pending-record page.
///
/// `record` is `None` when the stored document exists but cannot be mapped
/// to a [`FileRecord`]; the reader still advances past its `seq`.
#[derive(Debug, Clone)]
pub struct PendingRecord {
    pub seq: i64,
    pub id: RecordId,
    pub record: Option<FileRecord>,
}

/// Outcome of one reorganisation attempt series for a record.
///
/// `attempts` is the number of tries made in this series and is *added* to
/// the stored attempt count.
#[derive(Debug, Clone, PartialEq)]
pub enum ReorgUpdate {
    Success {
        destination_path: String,
        completed_at: DateTime<Utc>,
        duration_ms: u64,
        job_execution_id: ExecutionId,
        attempts: u32,
    },
    Failure {
        error: String,
        attempted_at: DateTime<Utc>,
        job_execution_id: ExecutionId,
        attempts: u32,
    },
}

/// Outcome of an origin deletion.
#[derive(Debug, Clone, PartialEq)]
pub enum CleanupUpdate {
    Deleted {
        deleted_at: DateTime<Utc>,
        deleted_by: String,
    },
    /// Annotates the record without touching `deleted_from_source`.
    DeletionFailed {
        error: String,
        attempted_at: DateTime<Utc>,
    },
}

/// Result of an unordered bulk update. Items are applied independently;
/// one failing item never undoes the others.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkUpdateReport {
    pub matched: u64,
    pub modified: u64,
    pub errors: Vec<(RecordId, String)>,
}

/// Selection for cleanup candidates, paged by record id.
#[derive(Debug, Clone)]
pub struct CandidateFilter {
    /// Lower bound on reorganisation completion time.
    pub completed_since: DateTime<Utc>,
    /// Exclusive lower bound on record id, for keyset paging.
    pub after: Option<RecordId>,
    pub limit: usize,
}

/// Storage contract for per-file migration state.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn StateBackend>`.
pub trait RecordStore: Send + Sync {
    /// Insert new records, ignoring ids that already exist. Returns the
    /// number actually inserted.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn insert_records(&self, records: &[FileRecord]) -> error::Result<u64>;

    /// Fetch one record by identity.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure
    /// or when the stored document is corrupt.
    fn get_record(&self, id: &RecordId) -> error::Result<Option<FileRecord>>;

    /// Next page of `PENDING` records with insertion sequence greater than
    /// `after_seq`, ordered by sequence.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn fetch_pending_page(&self, after_seq: i64, limit: usize)
        -> error::Result<Vec<PendingRecord>>;

    /// Persist the outcome of a reorganisation attempt series.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFound`](crate::error::StateError::NotFound)
    /// if no record has this id.
    fn update_reorg(&self, id: &RecordId, update: &ReorgUpdate) -> error::Result<()>;

    /// Apply cleanup outcomes item by item without a surrounding transaction.
    ///
    /// # Errors
    ///
    /// Only fails when the backend itself is unusable; per-item failures are
    /// reported in [`BulkUpdateReport::errors`].
    fn bulk_update_cleanup(
        &self,
        updates: &[(RecordId, CleanupUpdate)],
    ) -> error::Result<BulkUpdateReport>;

    /// Records eligible for origin deletion, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn find_cleanup_candidates(
        &self,
        filter: &CandidateFilter,
    ) -> error::Result<Vec<CleanupCandidate>>;

    /// Count records in a reorganisation state.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn count_by_reorg_status(&self, status: ReorgStatus) -> error::Result<u64>;
}

// ---------------------------------------------------------------------------
// Audit store
// ---------------------------------------------------------------------------

/// Filter for audit listings. Every set field narrows the result; results
/// are ordered by start time, newest first.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub job_name: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub started_from: Option<DateTime<Utc>>,
    pub started_to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    #[must_use]
    pub fn latest(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn by_job(job_name: impl Into<String>) -> Self {
        Self {
            job_name: Some(job_name.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn by_status(status: ExecutionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn started_between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            started_from: Some(from),
            started_to: Some(to),
            ..Self::default()
        }
    }
}

/// Storage contract for execution audits.
pub trait AuditStore: Send + Sync {
    /// Persist a new audit document.
    ///
    /// # Errors
    ///
    /// Fails if a document with the same audit id already exists.
    fn insert_audit(&self, audit: &ExecutionAudit) -> error::Result<()>;

    /// Overwrite the document stored under `audit.audit_id` in place.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFound`](crate::error::StateError::NotFound)
    /// if there is nothing to update; never inserts.
    fn update_audit(&self, audit: &ExecutionAudit) -> error::Result<()>;

    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn find_audit(&self, execution_id: &ExecutionId) -> error::Result<Option<ExecutionAudit>>;

    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn list_audits(&self, query: &AuditQuery) -> error::Result<Vec<ExecutionAudit>>;

    /// Number of audits per status, optionally restricted to one job.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn count_audits_by_status(
        &self,
        job_name: Option<&str>,
    ) -> error::Result<Vec<(ExecutionStatus, u64)>>;
}

// ---------------------------------------------------------------------------
// Lease store
// ---------------------------------------------------------------------------

/// Storage contract for the distributed execution lease.
pub trait LeaseStore: Send + Sync {
    /// Atomically take `name` for `holder` if it has no row yet or its
    /// `locked_until <= now`. Returns whether the lease was taken.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        locked_until: DateTime<Utc>,
    ) -> error::Result<bool>;

    /// Move `locked_until` of a lease still owned by `holder`. Returns
    /// `false` if another holder has since taken it.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn release_lease(
        &self,
        name: &str,
        holder: &str,
        locked_until: DateTime<Utc>,
    ) -> error::Result<bool>;

    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_lease(&self, name: &str) -> error::Result<Option<LeaseRecord>>;
}

/// Everything the engine needs from one backend.
pub trait StateBackend: RecordStore + AuditStore + LeaseStore {}

impl<T: RecordStore + AuditStore + LeaseStore> StateBackend for T {}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify the traits are object-safe.
    #[test]
    fn traits_are_object_safe() {
        fn _records(_: &dyn RecordStore) {}
        fn _audits(_: &dyn AuditStore) {}
        fn _leases(_: &dyn LeaseStore) {}
        fn _backend(_: &dyn StateBackend) {}
    }

    #[test]
    fn audit_query_constructors() {
        let q = AuditQuery::latest(10);
        assert_eq!(q.limit, Some(10));
        assert!(q.job_name.is_none());

        let q = AuditQuery::by_status(ExecutionStatus::Failed);
        assert_eq!(q.status, Some(ExecutionStatus::Failed));
        assert!(q.limit.is_none());
    }
}
