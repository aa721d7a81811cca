//! Chunked reorganisation stage.
//!
//! A single reader task streams pending records in insertion order and
//! hands over fixed-size chunks. Each chunk is transformed, then its items
//! are transferred on blocking workers bounded by a semaphore. Every item
//! persists its own outcome, so stopping between chunks never needs a
//! rollback. The stage stops between chunks when the skip budget is spent
//! or an item hits a fatal error.

use std::sync::Arc;
use std::time::Instant;

use rehome_state::StateBackend;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::errors::{ItemError, RunError};
use crate::reader::{spawn_chunk_reader, PendingRecordStream};
use crate::result::{StageCounts, StageReport, REORGANIZE_STAGE};
use crate::transfer::{plan, ItemOutcome, Planned, TransferContext};

/// Chunking and fault-tolerance limits for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationSettings {
    pub chunk_size: usize,
    pub workers: usize,
    /// Skipped items tolerated across the run.
    pub skip_limit: u64,
    /// Reader page size.
    pub prefetch: usize,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            workers: 20,
            skip_limit: 5,
            prefetch: 100,
        }
    }
}

pub struct MigrationPipeline {
    ctx: Arc<TransferContext>,
    settings: MigrationSettings,
}

impl MigrationPipeline {
    #[must_use]
    pub fn new(ctx: Arc<TransferContext>, settings: MigrationSettings) -> Self {
        Self { ctx, settings }
    }

    fn store(&self) -> Arc<dyn StateBackend> {
        Arc::clone(&self.ctx.store)
    }

    /// Reorganise every pending record.
    pub async fn run(&self) -> StageReport {
        let started = Instant::now();
        let mut report = StageReport::new(REORGANIZE_STAGE);
        let semaphore = Arc::new(Semaphore::new(self.settings.workers.max(1)));

        tracing::info!(
            stage = REORGANIZE_STAGE,
            execution_id = %self.ctx.execution_id,
            chunk_size = self.settings.chunk_size,
            workers = self.settings.workers,
            skip_limit = self.settings.skip_limit,
            "Stage started"
        );

        let stream = PendingRecordStream::new(self.store(), self.settings.prefetch);
        let (mut chunks, reader) = spawn_chunk_reader(stream, self.settings.chunk_size);
        let mut chunk_index = 0u64;

        while let Some(chunk) = chunks.recv().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::error!(stage = REORGANIZE_STAGE, error = %e, "Reader failed");
                    report.error = Some(RunError::Infrastructure(e));
                    break;
                }
            };
            chunk_index += 1;

            let (counts, fatal) = self.process_chunk(chunk, &semaphore).await;
            report.add_chunk(&counts);
            tracing::info!(
                stage = REORGANIZE_STAGE,
                chunk = chunk_index,
                read = counts.read,
                written = counts.written,
                skipped = counts.skipped,
                failed = counts.failed,
                "Chunk processed"
            );

            if let Some(error) = fatal {
                tracing::error!(stage = REORGANIZE_STAGE, error = %error, "Stopping stage");
                report.error = Some(error);
                break;
            }
            if report.counts.skipped > self.settings.skip_limit {
                tracing::error!(
                    stage = REORGANIZE_STAGE,
                    skipped = report.counts.skipped,
                    skip_limit = self.settings.skip_limit,
                    "Skip limit exceeded, stopping stage"
                );
                report.error = Some(RunError::SkipLimitExceeded {
                    skipped: report.counts.skipped,
                    limit: self.settings.skip_limit,
                });
                break;
            }
        }

        drop(chunks);
        if let Err(e) = reader.await {
            tracing::warn!(error = %e, "Chunk reader task failed");
        }

        report.elapsed = started.elapsed();
        tracing::info!(
            stage = REORGANIZE_STAGE,
            status = %report.status(),
            read = report.counts.read,
            written = report.counts.written,
            skipped = report.counts.skipped,
            failed = report.counts.failed,
            duration_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
            "Stage finished"
        );
        report
    }

    /// Transform and transfer one chunk. Every item is attempted; the first
    /// fatal error is returned alongside the counts.
    async fn process_chunk(
        &self,
        chunk: Vec<rehome_state::PendingRecord>,
        semaphore: &Arc<Semaphore>,
    ) -> (StageCounts, Option<RunError>) {
        let mut counts = StageCounts {
            read: chunk.len() as u64,
            ..StageCounts::default()
        };
        let mut fatal: Option<RunError> = None;
        let mut workers: JoinSet<Result<ItemOutcome, ItemError>> = JoinSet::new();

        for pending in chunk {
            let planned = plan(
                pending,
                &self.ctx.resolver,
                self.ctx.origin_base.as_deref(),
                &self.ctx.destination_base,
            );
            if let Planned::Filtered(id) = &planned {
                tracing::debug!(record_id = %id, "Unmappable record filtered");
                counts.filtered += 1;
                continue;
            }
            let permit = match Arc::clone(semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    fatal = Some(RunError::Infrastructure(anyhow::anyhow!(
                        "Semaphore closed: {e}"
                    )));
                    break;
                }
            };
            let ctx = Arc::clone(&self.ctx);
            workers.spawn_blocking(move || {
                let _permit = permit;
                ctx.process(&planned)
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(ItemOutcome::Reorganized { .. })) => counts.written += 1,
                Ok(Ok(ItemOutcome::Skipped { .. })) => counts.skipped += 1,
                Ok(Ok(ItemOutcome::Failed { .. })) => counts.failed += 1,
                Ok(Ok(ItemOutcome::Filtered)) => counts.filtered += 1,
                Ok(Err(e)) => {
                    counts.failed += 1;
                    tracing::error!(stage = REORGANIZE_STAGE, error = %e, "Fatal item error");
                    fatal.get_or_insert(RunError::Stage {
                        stage: REORGANIZE_STAGE.to_string(),
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    counts.failed += 1;
                    tracing::error!(stage = REORGANIZE_STAGE, error = %e, "Transfer worker panicked");
                    fatal.get_or_insert(RunError::Stage {
                        stage: REORGANIZE_STAGE.to_string(),
                        message: format!("transfer worker panicked: {e}"),
                    });
                }
            }
        }

        (counts, fatal)
    }
}
