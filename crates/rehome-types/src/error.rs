//! Failure classification shared by the pipelines and the audit ledger.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a failure is handled by the fault-tolerance policy.
///
/// Produced by the engine's `classify` function; the pipelines branch on this
/// tag rather than on concrete error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Timeout, connection reset, pool exhaustion. Retried up to the retry
    /// limit, then counted against the run's skip budget.
    Retryable,
    /// Malformed or missing data. Never retried; recorded as an item failure.
    Permanent,
    /// The run itself cannot continue (e.g. the record store is unreachable).
    Fatal,
}

impl ErrorClass {
    /// Whether another attempt may succeed.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Retryable)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Retryable => "retryable",
            Self::Permanent => "permanent",
            Self::Fatal => "fatal",
        };
        f.write_str(s)
    }
}
