//! State backend error types.

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced by the record, audit, and lease stores.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying database failure (`SQLite` or `PostgreSQL`).
    #[error("state backend error: {0}")]
    Backend(#[source] BoxError),

    /// Database failure with the operation that hit it.
    #[error("{context}: {source}")]
    BackendContext {
        context: &'static str,
        #[source]
        source: BoxError,
    },

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON-encoded column could not be (de)serialized.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored document could not be mapped back to the domain model.
    #[error("corrupt document {id}: {reason}")]
    CorruptDocument { id: String, reason: String },

    /// An update targeted a document that does not exist.
    #[error("document not found: {0}")]
    NotFound(String),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("state backend lock poisoned")]
    LockPoisoned,
}

impl StateError {
    /// Wrap a database error.
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }

    /// Wrap a database error with the failing operation name.
    pub fn backend_context(
        context: &'static str,
        err: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::BackendContext {
            context,
            source: Box::new(err),
        }
    }

    pub(crate) fn corrupt(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptDocument {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;
