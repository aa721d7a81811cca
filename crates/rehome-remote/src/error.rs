//! Remote transport error types.

use std::time::Duration;

/// Errors produced by remote sessions and the session pool.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// TCP connect or SSH handshake failed.
    #[error("connect to {endpoint} failed: {message}")]
    Connect { endpoint: String, message: String },

    /// The endpoint rejected the configured credentials.
    #[error("authentication to {endpoint} failed: {message}")]
    Auth { endpoint: String, message: String },

    /// No session became available within the acquire timeout.
    #[error("no session available for {endpoint} after {waited:?}")]
    PoolTimeout { endpoint: String, waited: Duration },

    /// The pool was closed while waiting or before the call.
    #[error("session pool for {0} is closed")]
    Closed(String),

    #[error("remote path not found: {0}")]
    NotFound(String),

    /// Transport-level failure while operating on `path`.
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Reading the byte source of a transfer failed. The destination
    /// session itself is still usable.
    #[error("reading transfer source for {path} failed: {source}")]
    Source {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The server answered with an error status (permission denied,
    /// failure, unsupported operation).
    #[error("remote operation on {path} failed: {message}")]
    Protocol { path: String, message: String },
}

impl RemoteError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn protocol(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same operation may succeed: connection
    /// failures, timeouts, i/o failures, and pool exhaustion.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::PoolTimeout { .. } | Self::Io { .. } | Self::Source { .. }
        )
    }

    /// Whether the session that produced this error must be discarded
    /// instead of returned to the idle list.
    #[must_use]
    pub fn breaks_session(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Auth { .. } | Self::Io { .. })
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, RemoteError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn transient_classification() {
        let reset = RemoteError::io("/a", io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(reset.is_transient());
        assert!(reset.breaks_session());

        let timeout = RemoteError::PoolTimeout {
            endpoint: "origin".into(),
            waited: Duration::from_secs(30),
        };
        assert!(timeout.is_transient());
        assert!(!timeout.breaks_session());

        let missing = RemoteError::NotFound("/a".into());
        assert!(!missing.is_transient());
        assert!(!missing.breaks_session());

        let auth = RemoteError::Auth {
            endpoint: "origin".into(),
            message: "bad password".into(),
        };
        assert!(!auth.is_transient());
        assert!(auth.breaks_session());
    }

    #[test]
    fn source_errors_keep_destination_session() {
        let err = RemoteError::Source {
            path: "/dest/a".into(),
            source: io::Error::from(io::ErrorKind::TimedOut),
        };
        assert!(err.is_transient());
        assert!(!err.breaks_session());
    }

    #[test]
    fn display_names_endpoint() {
        let err = RemoteError::Closed("destination".into());
        assert_eq!(err.to_string(), "session pool for destination is closed");
    }
}
