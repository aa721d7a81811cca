//! Per-record transform and transfer with retry.
//!
//! Everything here is synchronous and runs on blocking worker threads: one
//! call moves one file from the origin pool to the destination pool and
//! persists the outcome on the record before returning.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rehome_remote::SessionPool;
use rehome_state::{PendingRecord, ReorgUpdate, StateBackend};
use rehome_types::audit::truncate_detail;
use rehome_types::{ErrorClass, ExecutionId, FileRecord, RecordId};

use crate::errors::{classify, compute_backoff, ItemError};
use crate::layout::PathResolver;

const MAX_ERROR_CHARS: usize = 2000;

/// Shared by every transfer worker of one run.
pub struct TransferContext {
    pub origin: SessionPool,
    pub destination: SessionPool,
    pub store: Arc<dyn StateBackend>,
    pub resolver: PathResolver,
    /// Root that relative source paths are resolved against.
    pub origin_base: Option<String>,
    pub destination_base: String,
    /// Extra tries after the first transient failure.
    pub retry_limit: u32,
    pub retry_backoff: Duration,
    pub execution_id: ExecutionId,
}

/// A record ready to move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pub id: RecordId,
    pub origin_path: String,
    pub destination_path: String,
}

/// Transform-stage result for one pending row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Planned {
    Ready(TransferPlan),
    /// The stored row could not be mapped to a record.
    Filtered(RecordId),
    /// The record is malformed and will not be attempted.
    Invalid { id: RecordId, reason: String },
}

/// How one item ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Reorganized { bytes: u64, attempts: u32 },
    /// Transient failures outlasted the retry limit.
    Skipped { attempts: u32, error: String },
    /// Not retried.
    Failed { attempts: u32, error: String },
    Filtered,
}

pub(crate) fn join_origin(base: Option<&str>, source_path: &str) -> String {
    match base {
        Some(base) if !source_path.starts_with('/') => {
            format!("{}/{}", base.trim_end_matches('/'), source_path)
        }
        _ => source_path.to_string(),
    }
}

/// Map a pending row to a transfer plan, computing its destination.
#[must_use]
pub fn plan(
    pending: PendingRecord,
    resolver: &PathResolver,
    origin_base: Option<&str>,
    destination_base: &str,
) -> Planned {
    let Some(record) = pending.record else {
        return Planned::Filtered(pending.id);
    };
    match validate_record(&record) {
        Ok(()) => Planned::Ready(TransferPlan {
            origin_path: join_origin(origin_base, &record.source_path),
            destination_path: resolver.resolve(&record.id, destination_base, &record.file_name),
            id: record.id,
        }),
        Err(reason) => Planned::Invalid {
            id: record.id,
            reason,
        },
    }
}

fn validate_record(record: &FileRecord) -> Result<(), String> {
    if record.id.as_str().trim().is_empty() {
        return Err("empty record identity".to_string());
    }
    if record.source_path.trim().is_empty() {
        return Err("empty source path".to_string());
    }
    let name = record.file_name.trim();
    if name.is_empty() || name == "." || name == ".." || record.file_name.contains('/') {
        return Err(format!("unusable file name '{}'", record.file_name));
    }
    Ok(())
}

fn duration_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

impl TransferContext {
    /// Stream one file from origin to destination. Both sessions are
    /// released before this returns, whatever the outcome.
    fn copy_once(&self, plan: &TransferPlan) -> Result<u64, ItemError> {
        self.origin.with_read_session(&plan.origin_path, |reader| {
            self.destination
                .write_from(&plan.destination_path, reader)
                .map_err(ItemError::from)
        })
    }

    fn persist(&self, id: &RecordId, update: &ReorgUpdate) -> Result<(), ItemError> {
        self.store.update_reorg(id, update).map_err(ItemError::from)
    }

    fn persist_failure(&self, id: &RecordId, attempts: u32, error: &str) -> Result<(), ItemError> {
        self.persist(
            id,
            &ReorgUpdate::Failure {
                error: truncate_detail(error, MAX_ERROR_CHARS),
                attempted_at: Utc::now(),
                job_execution_id: self.execution_id,
                attempts,
            },
        )
    }

    /// Record a malformed item as failed without attempting it.
    ///
    /// # Errors
    ///
    /// Returns the state error if the outcome cannot be persisted.
    pub fn reject(&self, id: &RecordId, reason: &str) -> Result<ItemOutcome, ItemError> {
        let error = ItemError::Invalid(reason.to_string()).to_string();
        tracing::error!(record_id = %id, error = %error, "Record rejected");
        self.persist_failure(id, 1, &error)?;
        Ok(ItemOutcome::Failed { attempts: 1, error })
    }

    /// Move one file, retrying transient failures with backoff, and persist
    /// the outcome on its record.
    ///
    /// # Errors
    ///
    /// Only fatal errors (state store unusable, pool closed) are returned;
    /// every other failure is persisted and reported as an outcome.
    pub fn transfer(&self, plan: &TransferPlan) -> Result<ItemOutcome, ItemError> {
        let started = Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let err = match self.copy_once(plan) {
                Ok(bytes) => {
                    self.persist(
                        &plan.id,
                        &ReorgUpdate::Success {
                            destination_path: plan.destination_path.clone(),
                            completed_at: Utc::now(),
                            duration_ms: duration_ms(started.elapsed()),
                            job_execution_id: self.execution_id,
                            attempts,
                        },
                    )?;
                    tracing::debug!(
                        record_id = %plan.id,
                        destination = %plan.destination_path,
                        bytes,
                        attempts,
                        "Record reorganized"
                    );
                    return Ok(ItemOutcome::Reorganized { bytes, attempts });
                }
                Err(err) => err,
            };

            match classify(&err) {
                ErrorClass::Retryable if attempts <= self.retry_limit => {
                    let delay = compute_backoff(attempts, self.retry_backoff);
                    tracing::warn!(
                        record_id = %plan.id,
                        attempt = attempts,
                        retry_limit = self.retry_limit,
                        delay_ms = duration_ms(delay),
                        error = %err,
                        "Transfer failed, retrying"
                    );
                    std::thread::sleep(delay);
                }
                ErrorClass::Retryable => {
                    let error = err.to_string();
                    tracing::warn!(
                        record_id = %plan.id,
                        attempts,
                        error = %error,
                        "Transfer retries exhausted, skipping record"
                    );
                    self.persist_failure(&plan.id, attempts, &error)?;
                    return Ok(ItemOutcome::Skipped { attempts, error });
                }
                ErrorClass::Permanent => {
                    let error = err.to_string();
                    tracing::error!(
                        record_id = %plan.id,
                        path = %plan.origin_path,
                        error = %error,
                        "Transfer failed permanently"
                    );
                    self.persist_failure(&plan.id, attempts, &error)?;
                    return Ok(ItemOutcome::Failed { attempts, error });
                }
                ErrorClass::Fatal => return Err(err),
            }
        }
    }

    /// Dispatch a transform result to the matching handler.
    ///
    /// # Errors
    ///
    /// Fatal item errors only.
    pub fn process(&self, planned: &Planned) -> Result<ItemOutcome, ItemError> {
        match planned {
            Planned::Ready(plan) => self.transfer(plan),
            Planned::Invalid { id, reason } => self.reject(id, reason),
            Planned::Filtered(id) => {
                tracing::debug!(record_id = %id, "Unmappable record filtered");
                Ok(ItemOutcome::Filtered)
            }
        }
    }
}
