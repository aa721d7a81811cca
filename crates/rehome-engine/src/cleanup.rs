//! Origin cleanup stage.
//!
//! Pages through reorganised records completed inside the safety window,
//! validates each candidate in memory, deletes the valid ones from the
//! origin on bounded blocking workers, and writes every outcome back in one
//! unordered bulk update per page. Failed deletions keep
//! `deleted_from_source = false`, so the next run selects them again.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rehome_remote::{RemoteError, SessionPool};
use rehome_state::{CandidateFilter, CleanupUpdate, StateBackend};
use rehome_types::audit::truncate_detail;
use rehome_types::{CleanupCandidate, RecordId};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::errors::RunError;
use crate::result::{StageCounts, StageReport, CLEANUP_STAGE};
use crate::transfer::join_origin;

const MAX_ERROR_CHARS: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupSettings {
    /// Only records reorganised within this window are deleted.
    pub safety_window: chrono::Duration,
    pub workers: usize,
    pub chunk_size: usize,
    /// Recorded as the deleting process on each deleted record.
    pub deleted_by: String,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            safety_window: chrono::Duration::days(90),
            workers: 10,
            chunk_size: 500,
            deleted_by: "cleanup-step".to_string(),
        }
    }
}

/// A candidate that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionTarget {
    pub id: RecordId,
    pub source_path: String,
}

/// Reject candidates that lack what proves the file was moved.
///
/// # Errors
///
/// Returns the reason the candidate must not be deleted.
pub fn validate_candidate(candidate: &CleanupCandidate) -> Result<DeletionTarget, &'static str> {
    if candidate.completed_at.is_none() {
        return Err("missing completion time");
    }
    if candidate
        .destination_path
        .as_deref()
        .map_or(true, |p| p.trim().is_empty())
    {
        return Err("missing destination path");
    }
    match candidate.source_path.as_deref() {
        Some(path) if !path.trim().is_empty() => Ok(DeletionTarget {
            id: candidate.id.clone(),
            source_path: path.to_string(),
        }),
        _ => Err("missing origin path"),
    }
}

pub struct CleanupPipeline {
    store: Arc<dyn StateBackend>,
    origin: SessionPool,
    /// Relative source paths resolve under this directory, as in migration.
    origin_base: Option<String>,
    settings: CleanupSettings,
}

impl CleanupPipeline {
    #[must_use]
    pub fn new(
        store: Arc<dyn StateBackend>,
        origin: SessionPool,
        origin_base: Option<String>,
        settings: CleanupSettings,
    ) -> Self {
        Self {
            store,
            origin,
            origin_base,
            settings,
        }
    }

    /// Delete every eligible origin file as of `now`.
    pub async fn run(&self, now: DateTime<Utc>) -> StageReport {
        let started = Instant::now();
        let mut report = StageReport::new(CLEANUP_STAGE);
        let completed_since = now - self.settings.safety_window;
        let semaphore = Arc::new(Semaphore::new(self.settings.workers.max(1)));
        let mut after: Option<RecordId> = None;

        tracing::info!(
            stage = CLEANUP_STAGE,
            completed_since = %completed_since,
            workers = self.settings.workers,
            chunk_size = self.settings.chunk_size,
            "Stage started"
        );

        loop {
            let filter = CandidateFilter {
                completed_since,
                after: after.clone(),
                limit: self.settings.chunk_size.max(1),
            };
            let candidates = match self.find_candidates(filter).await {
                Ok(candidates) => candidates,
                Err(e) => {
                    tracing::error!(stage = CLEANUP_STAGE, error = %e, "Candidate query failed");
                    report.error = Some(RunError::Infrastructure(e));
                    break;
                }
            };
            let Some(last) = candidates.last() else {
                break;
            };
            after = Some(last.id.clone());
            let page_len = candidates.len();

            match self.process_page(candidates, &semaphore).await {
                Ok(counts) => {
                    tracing::info!(
                        stage = CLEANUP_STAGE,
                        candidates = counts.read,
                        deleted = counts.written,
                        rejected = counts.skipped,
                        failed = counts.failed,
                        "Cleanup page processed"
                    );
                    report.add_chunk(&counts);
                }
                Err(e) => {
                    tracing::error!(stage = CLEANUP_STAGE, error = %e, "Bulk update failed");
                    report.error = Some(e);
                    break;
                }
            }
            if page_len < self.settings.chunk_size.max(1) {
                break;
            }
        }

        report.elapsed = started.elapsed();
        tracing::info!(
            stage = CLEANUP_STAGE,
            status = %report.status(),
            candidates = report.counts.read,
            deleted = report.counts.written,
            rejected = report.counts.skipped,
            failed = report.counts.failed,
            "Stage finished"
        );
        report
    }

    async fn find_candidates(&self, filter: CandidateFilter) -> anyhow::Result<Vec<CleanupCandidate>> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.find_cleanup_candidates(&filter))
            .await
            .context("candidate query task panicked")?
            .context("Failed to query cleanup candidates")
    }

    async fn process_page(
        &self,
        candidates: Vec<CleanupCandidate>,
        semaphore: &Arc<Semaphore>,
    ) -> Result<StageCounts, RunError> {
        let mut counts = StageCounts {
            read: candidates.len() as u64,
            ..StageCounts::default()
        };

        let mut deletions: JoinSet<(RecordId, Result<(), RemoteError>)> = JoinSet::new();
        for candidate in &candidates {
            let target = match validate_candidate(candidate) {
                Ok(target) => target,
                Err(reason) => {
                    tracing::warn!(
                        stage = CLEANUP_STAGE,
                        record_id = %candidate.id,
                        reason,
                        "Candidate rejected, not deleting"
                    );
                    counts.skipped += 1;
                    continue;
                }
            };
            let permit = Arc::clone(semaphore)
                .acquire_owned()
                .await
                .map_err(|e| RunError::Infrastructure(anyhow::anyhow!("Semaphore closed: {e}")))?;
            let origin = self.origin.clone();
            let origin_path = join_origin(self.origin_base.as_deref(), &target.source_path);
            deletions.spawn_blocking(move || {
                let _permit = permit;
                let result = match origin.remove(&origin_path) {
                    // Already gone: a previous run deleted it but did not record it.
                    Err(RemoteError::NotFound(_)) => Ok(()),
                    other => other,
                };
                (target.id, result)
            });
        }

        let mut updates = Vec::with_capacity(candidates.len());
        while let Some(joined) = deletions.join_next().await {
            let (id, result) = joined.map_err(|e| RunError::Stage {
                stage: CLEANUP_STAGE.to_string(),
                message: format!("deletion worker panicked: {e}"),
            })?;
            let now = Utc::now();
            match result {
                Ok(()) => {
                    tracing::debug!(record_id = %id, "Origin file deleted");
                    updates.push((
                        id,
                        CleanupUpdate::Deleted {
                            deleted_at: now,
                            deleted_by: self.settings.deleted_by.clone(),
                        },
                    ));
                }
                Err(e) => {
                    tracing::error!(record_id = %id, error = %e, "Origin deletion failed");
                    updates.push((
                        id,
                        CleanupUpdate::DeletionFailed {
                            error: truncate_detail(&format!("Cleanup failed: {e}"), MAX_ERROR_CHARS),
                            attempted_at: now,
                        },
                    ));
                }
            }
        }

        if updates.is_empty() {
            return Ok(counts);
        }
        let deleted = updates
            .iter()
            .filter(|(_, u)| matches!(u, CleanupUpdate::Deleted { .. }))
            .count() as u64;
        counts.written = deleted;
        counts.failed = updates.len() as u64 - deleted;

        let store = Arc::clone(&self.store);
        let bulk = tokio::task::spawn_blocking(move || store.bulk_update_cleanup(&updates))
            .await
            .map_err(|e| RunError::Infrastructure(anyhow::anyhow!("bulk update task panicked: {e}")))??;
        for (id, error) in &bulk.errors {
            tracing::error!(record_id = %id, error = %error, "Cleanup status update failed");
        }
        tracing::debug!(
            matched = bulk.matched,
            modified = bulk.modified,
            errors = bulk.errors.len(),
            "Cleanup bulk update applied"
        );
        Ok(counts)
    }
}
