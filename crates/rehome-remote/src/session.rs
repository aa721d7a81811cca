//! Session and factory contracts.
//!
//! A [`RemoteSession`] is one authenticated connection to a file endpoint.
//! Sessions are only ever used by one worker at a time; the pool hands them
//! out and takes them back.

use std::io::{Read, Write};

use crate::error;

/// One authenticated connection to a remote file endpoint.
pub trait RemoteSession: Send {
    /// Open `path` for raw reading.
    ///
    /// # Errors
    ///
    /// [`RemoteError::NotFound`](crate::RemoteError::NotFound) if the file
    /// does not exist, a transport error otherwise.
    fn open_read(&mut self, path: &str) -> error::Result<Box<dyn Read + Send>>;

    /// Leave raw read mode after the stream from [`open_read`](Self::open_read)
    /// has been closed.
    ///
    /// # Errors
    ///
    /// A transport error if the session could not be brought back to a
    /// usable state.
    fn finalize_read(&mut self) -> error::Result<()> {
        Ok(())
    }

    /// Create or truncate `path` for writing. The parent directory must exist.
    ///
    /// # Errors
    ///
    /// A transport or protocol error.
    fn open_write(&mut self, path: &str) -> error::Result<Box<dyn Write + Send>>;

    /// # Errors
    ///
    /// A transport or protocol error; a missing path is `Ok(false)`.
    fn exists(&mut self, path: &str) -> error::Result<bool>;

    /// Create a single directory. The parent must exist.
    ///
    /// # Errors
    ///
    /// A protocol error if the directory already exists or cannot be created.
    fn mkdir(&mut self, path: &str) -> error::Result<()>;

    /// Delete a file.
    ///
    /// # Errors
    ///
    /// [`RemoteError::NotFound`](crate::RemoteError::NotFound) if absent.
    fn remove(&mut self, path: &str) -> error::Result<()>;

    /// Cheap round trip proving the session is alive.
    ///
    /// # Errors
    ///
    /// A transport error if the endpoint does not answer.
    fn ping(&mut self) -> error::Result<()>;
}

/// Creates new sessions for one endpoint.
pub trait SessionFactory: Send + Sync {
    /// Human-readable endpoint name used in errors and logs.
    fn endpoint(&self) -> &str;

    /// Open and authenticate a new session.
    ///
    /// # Errors
    ///
    /// [`RemoteError::Connect`](crate::RemoteError::Connect) or
    /// [`RemoteError::Auth`](crate::RemoteError::Auth).
    fn connect(&self) -> error::Result<Box<dyn RemoteSession>>;
}
