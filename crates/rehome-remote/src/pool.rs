//! Bounded session pool with RAII checkout.
//!
//! Every session handed out is wrapped in a [`PooledSession`]; dropping the
//! guard returns the session to the idle list (or discards it when it broke),
//! so release happens exactly once on every exit path.

use std::io::{Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{self, RemoteError};
use crate::reader::SessionReader;
use crate::session::{RemoteSession, SessionFactory};

/// Sizing and timing for one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_size: usize,
    pub acquire_timeout: Duration,
    /// Buffer size for streamed reads and writes.
    pub buffer_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            buffer_size: 8192,
        }
    }
}

/// Point-in-time view of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub max_size: usize,
    pub idle: usize,
    pub in_use: usize,
    /// Sessions that can be checked out without waiting (idle plus
    /// not-yet-created slots).
    pub available: usize,
}

struct PoolState {
    idle: Vec<Box<dyn RemoteSession>>,
    in_use: usize,
    closed: bool,
}

struct PoolInner {
    factory: Arc<dyn SessionFactory>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    released: Condvar,
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        // Pool bookkeeping stays consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, session: Option<Box<dyn RemoteSession>>) {
        let mut state = self.lock_state();
        state.in_use = state.in_use.saturating_sub(1);
        match session {
            Some(session) if !state.closed => state.idle.push(session),
            Some(_) => {}
            None => tracing::debug!(endpoint = self.factory.endpoint(), "Discarded broken session"),
        }
        drop(state);
        self.released.notify_one();
    }
}

/// Shared handle to a bounded pool of sessions for one endpoint.
///
/// Cloning is cheap; all clones share the same sessions.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    #[must_use]
    pub fn new(factory: Arc<dyn SessionFactory>, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                factory,
                config,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    in_use: 0,
                    closed: false,
                }),
                released: Condvar::new(),
            }),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        self.inner.factory.endpoint()
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Check out a session, creating one if the pool has room and waiting up
    /// to the acquire timeout otherwise.
    ///
    /// # Errors
    ///
    /// [`RemoteError::PoolTimeout`] when no session frees up in time,
    /// [`RemoteError::Closed`] after [`close`](Self::close), or the factory's
    /// connect error.
    pub fn checkout(&self) -> error::Result<PooledSession> {
        let inner = &self.inner;
        let timeout = inner.config.acquire_timeout;
        let deadline = Instant::now() + timeout;
        let mut state = inner.lock_state();
        loop {
            if state.closed {
                return Err(RemoteError::Closed(self.endpoint().to_owned()));
            }
            if let Some(session) = state.idle.pop() {
                state.in_use += 1;
                tracing::trace!(endpoint = self.endpoint(), "Reused idle session");
                return Ok(PooledSession::new(Arc::clone(inner), session));
            }
            if state.in_use < inner.config.max_size {
                // Reserve the slot, then connect without holding the lock.
                state.in_use += 1;
                drop(state);
                return match inner.factory.connect() {
                    Ok(session) => {
                        tracing::debug!(endpoint = self.endpoint(), "Opened new session");
                        Ok(PooledSession::new(Arc::clone(inner), session))
                    }
                    Err(e) => {
                        inner.release(None);
                        Err(e)
                    }
                };
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    endpoint = self.endpoint(),
                    max_size = inner.config.max_size,
                    "Session pool exhausted"
                );
                return Err(RemoteError::PoolTimeout {
                    endpoint: self.endpoint().to_owned(),
                    waited: timeout,
                });
            }
            state = inner
                .released
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Open `path` for streaming. The returned reader owns a pooled session
    /// until it is closed or dropped.
    ///
    /// # Errors
    ///
    /// Checkout errors, or the session's open error (the session is released
    /// before returning).
    pub fn open_read(&self, path: &str) -> error::Result<SessionReader> {
        let mut session = self.checkout()?;
        let stream = session.run(|s| s.open_read(path))?;
        tracing::trace!(endpoint = self.endpoint(), path, "Opened read stream");
        Ok(SessionReader::new(
            path,
            stream,
            session,
            self.inner.config.buffer_size,
        ))
    }

    /// Run `body` against a read stream for `path`, closing the stream and
    /// releasing its session whatever `body` returns.
    ///
    /// # Errors
    ///
    /// `body`'s error if it failed, otherwise any open or close error.
    pub fn with_read_session<T, E, F>(&self, path: &str, body: F) -> Result<T, E>
    where
        F: FnOnce(&mut SessionReader) -> Result<T, E>,
        E: From<RemoteError>,
    {
        let mut reader = self.open_read(path)?;
        let result = body(&mut reader);
        let closed = reader.close();
        match result {
            Ok(value) => {
                closed?;
                Ok(value)
            }
            Err(e) => {
                if let Err(close_err) = closed {
                    tracing::warn!(path, error = %close_err, "Close after failed read also failed");
                }
                Err(e)
            }
        }
    }

    /// Stream `source` into `path`, creating parent directories first.
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// [`RemoteError::Source`] if reading `source` fails, otherwise a
    /// transport or protocol error from the destination.
    pub fn write_from(&self, path: &str, source: &mut dyn Read) -> error::Result<u64> {
        let buffer_size = self.inner.config.buffer_size.max(1);
        let mut session = self.checkout()?;
        session.run(|s| {
            create_parent_directories(s, path)?;
            let sink = s.open_write(path)?;
            let mut writer = std::io::BufWriter::with_capacity(buffer_size, sink);
            let mut buf = vec![0u8; buffer_size];
            let mut total = 0u64;
            loop {
                let n = match source.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        return Err(RemoteError::Source {
                            path: path.to_owned(),
                            source: e,
                        })
                    }
                };
                writer
                    .write_all(&buf[..n])
                    .map_err(|e| RemoteError::io(path, e))?;
                total += n as u64;
            }
            writer.flush().map_err(|e| RemoteError::io(path, e))?;
            Ok(total)
        })
    }

    /// Create `dir` and every missing ancestor.
    ///
    /// # Errors
    ///
    /// Transport or protocol errors other than a concurrent creation.
    pub fn ensure_directories(&self, dir: &str) -> error::Result<()> {
        let mut session = self.checkout()?;
        session.run(|s| create_directories(s, dir))
    }

    /// Delete `path`.
    ///
    /// # Errors
    ///
    /// [`RemoteError::NotFound`] if absent, otherwise a transport or
    /// protocol error.
    pub fn remove(&self, path: &str) -> error::Result<()> {
        let mut session = self.checkout()?;
        session.run(|s| s.remove(path))
    }

    /// Open (or reuse) one session and round-trip to the endpoint.
    ///
    /// # Errors
    ///
    /// Any checkout or transport error.
    pub fn check(&self) -> error::Result<()> {
        let mut session = self.checkout()?;
        session.run(|s| s.ping())
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock_state();
        let max_size = self.inner.config.max_size;
        PoolStats {
            max_size,
            idle: state.idle.len(),
            in_use: state.in_use,
            available: max_size.saturating_sub(state.in_use),
        }
    }

    /// Drop idle sessions and refuse further checkouts. Sessions still in
    /// use are discarded when their guards drop.
    pub fn close(&self) {
        let mut state = self.inner.lock_state();
        state.closed = true;
        let idle = std::mem::take(&mut state.idle);
        drop(state);
        drop(idle);
        self.inner.released.notify_all();
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("endpoint", &self.endpoint())
            .field("stats", &self.stats())
            .finish()
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "",
        Some(idx) => &path[..idx],
    }
}

fn create_parent_directories(session: &mut dyn RemoteSession, path: &str) -> error::Result<()> {
    let parent = parent_of(path);
    if parent.is_empty() {
        return Ok(());
    }
    create_directories(session, parent)
}

/// Check-then-create each segment, tolerating a concurrent creator.
fn create_directories(session: &mut dyn RemoteSession, dir: &str) -> error::Result<()> {
    let absolute = dir.starts_with('/');
    let mut current = String::with_capacity(dir.len());
    for segment in dir.split('/').filter(|s| !s.is_empty()) {
        if absolute || !current.is_empty() {
            current.push('/');
        }
        current.push_str(segment);
        if session.exists(&current)? {
            continue;
        }
        if let Err(e) = session.mkdir(&current) {
            if session.exists(&current)? {
                tracing::trace!(dir = %current, "Directory created concurrently");
                continue;
            }
            return Err(e);
        }
        tracing::debug!(dir = %current, "Created directory");
    }
    Ok(())
}

/// A checked-out session. Returns to its pool on drop.
pub struct PooledSession {
    pool: Arc<PoolInner>,
    session: Option<Box<dyn RemoteSession>>,
    broken: bool,
}

impl PooledSession {
    fn new(pool: Arc<PoolInner>, session: Box<dyn RemoteSession>) -> Self {
        Self {
            pool,
            session: Some(session),
            broken: false,
        }
    }

    /// Run `op` against the session, marking it broken if the error means
    /// the connection can no longer be trusted.
    ///
    /// # Errors
    ///
    /// Whatever `op` returns.
    pub fn run<T>(
        &mut self,
        op: impl FnOnce(&mut dyn RemoteSession) -> error::Result<T>,
    ) -> error::Result<T> {
        let Some(session) = self.session.as_deref_mut() else {
            return Err(RemoteError::Closed(self.pool.factory.endpoint().to_owned()));
        };
        let result = op(session);
        if let Err(e) = &result {
            if e.breaks_session() {
                self.broken = true;
            }
        }
        result
    }

    /// Discard the session on release instead of reusing it.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("endpoint", &self.pool.factory.endpoint())
            .field("open", &self.session.is_some())
            .field("broken", &self.broken)
            .finish()
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        let session = self.session.take().filter(|_| !self.broken);
        self.pool.release(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Fault, MemoryFileSystem};

    fn pool(fs: &MemoryFileSystem, max_size: usize) -> SessionPool {
        SessionPool::new(
            Arc::new(fs.factory("origin")),
            PoolConfig {
                max_size,
                acquire_timeout: Duration::from_millis(50),
                buffer_size: 4,
            },
        )
    }

    #[test]
    fn parent_of_paths() {
        assert_eq!(parent_of("/organized/a1/b2/file.txt"), "/organized/a1/b2");
        assert_eq!(parent_of("/file.txt"), "");
        assert_eq!(parent_of("file.txt"), "");
        assert_eq!(parent_of("/dir/"), "/dir");
    }

    #[test]
    fn sessions_are_reused() {
        let fs = MemoryFileSystem::new();
        let pool = pool(&fs, 2);
        pool.check().unwrap();
        pool.check().unwrap();
        assert_eq!(fs.connect_count(), 1);
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.available, 2);
    }

    #[test]
    fn exhausted_pool_times_out() {
        let fs = MemoryFileSystem::new();
        let pool = pool(&fs, 1);
        let held = pool.checkout().unwrap();
        let err = pool.checkout().unwrap_err();
        assert!(matches!(err, RemoteError::PoolTimeout { .. }), "got: {err}");
        assert!(err.is_transient());
        assert_eq!(
            format!("{held:?}"),
            r#"PooledSession { endpoint: "origin", open: true, broken: false }"#
        );
        drop(held);
        assert!(pool.checkout().is_ok());
    }

    #[test]
    fn waiter_wakes_on_release() {
        let fs = MemoryFileSystem::new();
        let pool = SessionPool::new(
            Arc::new(fs.factory("origin")),
            PoolConfig {
                max_size: 1,
                acquire_timeout: Duration::from_secs(5),
                buffer_size: 8,
            },
        );
        let held = pool.checkout().unwrap();
        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.checkout().map(|_| ()))
        };
        std::thread::sleep(Duration::from_millis(20));
        drop(held);
        assert!(waiter.join().unwrap().is_ok());
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn broken_session_is_discarded() {
        let fs = MemoryFileSystem::new();
        fs.insert_file("/in/a.txt", b"hello".to_vec());
        fs.inject("/in/a.txt", Fault::ConnectionReset, 1);
        let pool = pool(&fs, 2);

        assert!(pool.open_read("/in/a.txt").is_err());
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().in_use, 0);
        assert_eq!(fs.live_sessions(), 0);

        let mut reader = pool.open_read("/in/a.txt").unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        reader.close().unwrap();
        assert_eq!(out, "hello");
        assert_eq!(fs.connect_count(), 2);
    }

    #[test]
    fn failed_connect_frees_slot() {
        let fs = MemoryFileSystem::new();
        fs.fail_connects(1);
        let pool = pool(&fs, 1);
        assert!(matches!(
            pool.check().unwrap_err(),
            RemoteError::Connect { .. }
        ));
        assert_eq!(pool.stats().in_use, 0);
        pool.check().unwrap();
    }

    #[test]
    fn write_creates_parents_and_streams() {
        let fs = MemoryFileSystem::new();
        let pool = pool(&fs, 1);
        let mut src: &[u8] = b"0123456789";
        let written = pool.write_from("/dest/a1/b2/c3/f.bin", &mut src).unwrap();
        assert_eq!(written, 10);
        assert!(fs.is_dir("/dest/a1/b2"));
        assert_eq!(fs.read_file("/dest/a1/b2/c3/f.bin").unwrap(), b"0123456789");
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn ensure_directories_is_idempotent() {
        let fs = MemoryFileSystem::new();
        let pool = pool(&fs, 1);
        pool.ensure_directories("/dest/x/y").unwrap();
        pool.ensure_directories("/dest/x/y").unwrap();
        assert!(fs.is_dir("/dest/x/y"));
    }

    #[test]
    fn closed_pool_refuses_checkout() {
        let fs = MemoryFileSystem::new();
        let pool = pool(&fs, 1);
        pool.check().unwrap();
        pool.close();
        assert!(matches!(pool.check().unwrap_err(), RemoteError::Closed(_)));
        assert_eq!(fs.live_sessions(), 0);
    }
}
