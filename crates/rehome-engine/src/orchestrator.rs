//! Run orchestration: lease, audit, reorganise, clean up, finalize.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rehome_remote::SessionPool;
use rehome_state::StateBackend;
use rehome_types::{ExecutionId, ExecutionStatus};
use tokio::task::{JoinError, JoinHandle};

use crate::audit::{AuditHandle, AuditLedger, RunMetadata};
use crate::cleanup::{CleanupPipeline, CleanupSettings};
use crate::config::types::{EndpointConfig, JobConfig};
use crate::config::validator::validate_job;
use crate::errors::RunError;
use crate::layout::PathResolver;
use crate::lock::{ExecutionLock, LeaseGuard, LockPolicy};
use crate::reorganize::{MigrationPipeline, MigrationSettings};
use crate::resolve::{self, check_state_backend};
use crate::result::{CheckResult, RunOutcome, RunReport, TriggerReceipt};
use crate::transfer::TransferContext;

/// Service name recorded on every audit.
pub const SERVICE_NAME: &str = "rehome";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSettings {
    pub name: String,
    pub lock_name: String,
    pub lock_policy: LockPolicy,
}

/// Everything one job needs, built once at startup.
pub struct JobContext {
    pub job: JobSettings,
    pub store: Arc<dyn StateBackend>,
    pub origin: SessionPool,
    pub destination: SessionPool,
    pub resolver: PathResolver,
    pub origin_base: Option<String>,
    pub destination_base: String,
    pub migration: MigrationSettings,
    pub retry_limit: u32,
    pub retry_backoff: Duration,
    /// `None` runs the reorganisation stage only.
    pub cleanup: Option<CleanupSettings>,
}

/// Entry point for running a job.
#[derive(Clone)]
pub struct Orchestrator {
    ctx: Arc<JobContext>,
    lock: ExecutionLock,
    ledger: Arc<AuditLedger>,
}

pub type RunHandle = JoinHandle<Result<RunReport, RunError>>;

impl Orchestrator {
    #[must_use]
    pub fn new(ctx: JobContext) -> Self {
        let lock = ExecutionLock::new(Arc::clone(&ctx.store));
        let ledger = AuditLedger::new(Arc::clone(&ctx.store), SERVICE_NAME);
        Self {
            ctx: Arc::new(ctx),
            lock,
            ledger: Arc::new(ledger),
        }
    }

    #[must_use]
    pub fn context(&self) -> &JobContext {
        &self.ctx
    }

    /// Start a run and return as soon as it is under way.
    ///
    /// The lease is taken and the `STARTED` audit persisted before this
    /// returns; the stages run on a spawned task whose handle resolves to
    /// the final report.
    ///
    /// # Errors
    ///
    /// [`RunError::AlreadyRunning`] if another run holds the lease, or an
    /// infrastructure error if the lease or audit cannot be written.
    pub async fn trigger(
        &self,
        job_name: Option<&str>,
        parameters: BTreeMap<String, String>,
    ) -> Result<(TriggerReceipt, RunHandle), RunError> {
        let job = &self.ctx.job;
        let Some(guard) = self.lock.try_acquire(&job.lock_name, job.lock_policy).await? else {
            return Err(RunError::AlreadyRunning {
                lock_name: job.lock_name.clone(),
            });
        };

        let meta = RunMetadata {
            job_name: job_name.unwrap_or(&job.name).to_string(),
            execution_id: ExecutionId::generate(),
            parameters,
        };
        let handle = match self.ledger.begin(&meta).await {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(release_err) = guard.release().await {
                    tracing::warn!(error = %release_err, "Lease release failed");
                }
                return Err(RunError::Infrastructure(e));
            }
        };

        let receipt = TriggerReceipt::accepted(meta.execution_id, handle.audit_id().clone());
        tracing::info!(
            execution_id = %receipt.execution_id,
            audit_id = %receipt.audit_id,
            job = %meta.job_name,
            "Run accepted"
        );

        let body = run_stages(Arc::clone(&self.ctx), meta.execution_id);
        let run = tokio::spawn(supervise(Arc::clone(&self.ledger), handle, guard, body));
        Ok((receipt, run))
    }

    /// Trigger a run and wait for it to finish.
    ///
    /// # Errors
    ///
    /// Same as [`trigger`](Self::trigger), plus a failure to finalize the
    /// audit. A run that fails inside its stages still returns `Ok` with a
    /// `FAILED` report.
    pub async fn run(
        &self,
        job_name: Option<&str>,
        parameters: BTreeMap<String, String>,
    ) -> Result<RunReport, RunError> {
        let (_, handle) = self.trigger(job_name, parameters).await?;
        handle.await.map_err(|e| RunError::Stage {
            stage: "run".to_string(),
            message: panic_message(e),
        })?
    }
}

fn panic_message(err: JoinError) -> String {
    if err.is_cancelled() {
        return "run task cancelled".to_string();
    }
    let payload = err.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "run task panicked".to_string())
}

/// Run `body` on its own task, then finalize the audit and release the
/// lease whatever `body` did, including panicking.
async fn supervise<Fut>(
    ledger: Arc<AuditLedger>,
    handle: AuditHandle,
    guard: LeaseGuard,
    body: Fut,
) -> Result<RunReport, RunError>
where
    Fut: Future<Output = RunOutcome> + Send + 'static,
{
    let execution_id = handle.execution_id();
    let outcome = match tokio::spawn(body).await {
        Ok(outcome) => outcome,
        Err(e) => {
            let message = panic_message(e);
            tracing::error!(execution_id = %execution_id, error = %message, "Run panicked");
            RunOutcome::aborted(RunError::Stage {
                stage: "run".to_string(),
                message,
            })
        }
    };

    let finalized = ledger.finalize(&handle, &outcome).await;
    if let Err(e) = guard.release().await {
        tracing::warn!(execution_id = %execution_id, error = %e, "Lease release failed");
    }
    let audit = finalized.map_err(|e| {
        tracing::error!(execution_id = %execution_id, error = %e, "Audit finalize failed");
        RunError::Infrastructure(e)
    })?;

    Ok(RunReport {
        execution_id,
        status: audit.status,
        audit,
    })
}

/// Validate a job and probe its state backend and both endpoints.
///
/// # Errors
///
/// Returns an error if the configuration is invalid; unreachable
/// dependencies are reported in the result instead.
pub async fn check_job(config: &JobConfig) -> anyhow::Result<CheckResult> {
    tracing::info!(job = config.job.name, "Checking job configuration");
    validate_job(config)?;

    let state_ok = check_state_backend(&config.state);
    let origin = probe_endpoint(resolve::ORIGIN, &config.origin);
    let destination = probe_endpoint(resolve::DESTINATION, &config.destination);
    let (origin_ok, destination_ok) = tokio::join!(origin, destination);

    Ok(CheckResult {
        state_ok,
        origin_ok,
        destination_ok,
    })
}

async fn probe_endpoint(name: &'static str, config: &EndpointConfig) -> bool {
    let pool = match resolve::sftp_pool(name, config) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!(endpoint = name, error = %e, "Endpoint: FAILED");
            return false;
        }
    };
    match tokio::task::spawn_blocking(move || pool.check()).await {
        Ok(Ok(())) => {
            tracing::info!(endpoint = name, "Endpoint: OK");
            true
        }
        Ok(Err(e)) => {
            tracing::error!(endpoint = name, error = %e, "Endpoint: FAILED");
            false
        }
        Err(e) => {
            tracing::error!(endpoint = name, error = %e, "Endpoint check task panicked");
            false
        }
    }
}

async fn run_stages(ctx: Arc<JobContext>, execution_id: ExecutionId) -> RunOutcome {
    let transfer = TransferContext {
        origin: ctx.origin.clone(),
        destination: ctx.destination.clone(),
        store: Arc::clone(&ctx.store),
        resolver: ctx.resolver,
        origin_base: ctx.origin_base.clone(),
        destination_base: ctx.destination_base.clone(),
        retry_limit: ctx.retry_limit,
        retry_backoff: ctx.retry_backoff,
        execution_id,
    };
    let reorganize = MigrationPipeline::new(Arc::new(transfer), ctx.migration)
        .run()
        .await;
    let mut outcome = RunOutcome {
        reorganize: Some(reorganize),
        ..RunOutcome::default()
    };

    match &ctx.cleanup {
        Some(_) if outcome.status() == ExecutionStatus::Failed => {
            tracing::warn!(execution_id = %execution_id, "Reorganization failed, skipping cleanup");
        }
        Some(settings) => {
            let cleanup = CleanupPipeline::new(
                Arc::clone(&ctx.store),
                ctx.origin.clone(),
                ctx.origin_base.clone(),
                settings.clone(),
            );
            outcome.cleanup = Some(cleanup.run(Utc::now()).await);
        }
        None => tracing::debug!(execution_id = %execution_id, "Cleanup disabled"),
    }
    outcome
}
