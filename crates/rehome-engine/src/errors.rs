//! Run-level error model, per-item error classification, and retry backoff.

use std::time::Duration;

use rehome_remote::RemoteError;
use rehome_state::StateError;
use rehome_types::ErrorClass;

const BACKOFF_MAX_MS: u64 = 60_000;

// ---------------------------------------------------------------------------
// RunError: outcomes that end (or refuse to start) a run
// ---------------------------------------------------------------------------

/// Categorised run-level failure.
///
/// `AlreadyRunning` is a coordination signal, not a failure: the trigger
/// layer reports it as "already running" and no audit is written for it.
#[derive(Debug)]
pub enum RunError {
    /// Another holder owns the execution lease.
    AlreadyRunning { lock_name: String },
    /// More items were skipped than the run tolerates.
    SkipLimitExceeded { skipped: u64, limit: u64 },
    /// A stage stopped on an unrecoverable item error or panicked.
    Stage { stage: String, message: String },
    /// State backend, task, or wiring failure.
    Infrastructure(anyhow::Error),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyRunning { lock_name } => {
                write!(f, "job '{lock_name}' is already running")
            }
            Self::SkipLimitExceeded { skipped, limit } => {
                write!(f, "skip limit exceeded: {skipped} skipped, limit {limit}")
            }
            Self::Stage { stage, message } => write!(f, "stage '{stage}' failed: {message}"),
            Self::Infrastructure(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RunError {}

impl From<anyhow::Error> for RunError {
    fn from(e: anyhow::Error) -> Self {
        Self::Infrastructure(e)
    }
}

impl From<StateError> for RunError {
    fn from(e: StateError) -> Self {
        Self::Infrastructure(e.into())
    }
}

impl RunError {
    #[must_use]
    pub fn is_already_running(&self) -> bool {
        matches!(self, Self::AlreadyRunning { .. })
    }

    /// Multi-line detail for the audit trace: the error and its causes.
    #[must_use]
    pub fn trace(&self) -> String {
        match self {
            Self::Infrastructure(e) => format!("{e:?}"),
            other => other.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// ItemError: failures scoped to one record
// ---------------------------------------------------------------------------

/// Failure while processing a single record.
#[derive(Debug, thiserror::Error)]
pub enum ItemError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    State(#[from] StateError),
    /// The record cannot be processed as stored.
    #[error("invalid record: {0}")]
    Invalid(String),
}

/// Decide how the pipeline treats an item failure.
///
/// Transport faults and pool exhaustion are retried; missing files, server
/// refusals, and malformed records are not; state-store failures and a
/// closed pool stop the stage.
#[must_use]
pub fn classify(err: &ItemError) -> ErrorClass {
    match err {
        ItemError::Remote(RemoteError::Closed(_)) => ErrorClass::Fatal,
        ItemError::Remote(e) if e.is_transient() => ErrorClass::Retryable,
        ItemError::Remote(_) | ItemError::Invalid(_) => ErrorClass::Permanent,
        ItemError::State(_) => ErrorClass::Fatal,
    }
}

/// Delay before retry `attempt` (1-based): `base * 2^(attempt-1)`, capped at
/// one minute.
#[must_use]
pub fn compute_backoff(attempt: u32, base: Duration) -> Duration {
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(base_ms.saturating_mul(factor).min(BACKOFF_MAX_MS))
}
