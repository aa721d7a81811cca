//! Session-aware read stream.

use std::io::{self, BufRead, BufReader, Read};

use crate::error;
use crate::pool::PooledSession;

/// A buffered read stream that owns the pooled session it reads through.
///
/// [`close`](Self::close) closes the transport stream, leaves raw read mode
/// on the session, and releases the session, in that order. It is
/// idempotent, and dropping an unclosed reader closes it.
pub struct SessionReader {
    path: String,
    stream: Option<BufReader<Box<dyn Read + Send>>>,
    session: Option<PooledSession>,
    bytes_read: u64,
}

impl SessionReader {
    pub(crate) fn new(
        path: &str,
        stream: Box<dyn Read + Send>,
        session: PooledSession,
        buffer_size: usize,
    ) -> Self {
        Self {
            path: path.to_owned(),
            stream: Some(BufReader::with_capacity(buffer_size.max(1), stream)),
            session: Some(session),
            bytes_read: 0,
        }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.session.is_none()
    }

    /// Close the stream and give the session back.
    ///
    /// # Errors
    ///
    /// Returns the session's finalize error. The session is released even
    /// then (and discarded if the error broke it).
    pub fn close(&mut self) -> error::Result<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        drop(self.stream.take());
        let result = session.run(|s| s.finalize_read());
        if let Err(e) = &result {
            tracing::warn!(path = %self.path, error = %e, "Finalizing read stream failed");
        }
        drop(session);
        tracing::trace!(path = %self.path, bytes = self.bytes_read, "Read stream closed");
        result
    }
}

impl Read for SessionReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("read stream for {} is closed", self.path),
            ));
        };
        match stream.read(buf) {
            Ok(n) => {
                self.bytes_read += n as u64;
                Ok(n)
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::Interrupted {
                    if let Some(session) = self.session.as_mut() {
                        session.mark_broken();
                    }
                }
                Err(e)
            }
        }
    }
}

impl BufRead for SessionReader {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        match self.stream.as_mut() {
            Some(stream) => stream.fill_buf(),
            None => Ok(&[]),
        }
    }

    fn consume(&mut self, amt: usize) {
        if let Some(stream) = self.stream.as_mut() {
            stream.consume(amt);
            self.bytes_read += amt as u64;
        }
    }
}

impl Drop for SessionReader {
    fn drop(&mut self) {
        if self.session.is_some() {
            tracing::debug!(path = %self.path, "Read stream dropped without close");
            let _ = self.close();
        }
    }
}

impl std::fmt::Debug for SessionReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionReader")
            .field("path", &self.path)
            .field("bytes_read", &self.bytes_read)
            .field("closed", &self.is_closed())
            .finish()
    }
}
