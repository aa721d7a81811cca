//! In-memory remote endpoint with fault injection.
//!
//! Behaves like an SFTP server with a single root: writes need an existing
//! parent directory, `mkdir` fails on existing paths, and deletes of missing
//! files report not-found. Used by tests and by dry runs of a job config.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{self, RemoteError};
use crate::session::{RemoteSession, SessionFactory};

/// Failure injected into operations on a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Transport failure that breaks the session.
    ConnectionReset,
    /// Operation timed out.
    Timeout,
    /// Server refuses the operation.
    PermissionDenied,
}

impl Fault {
    fn to_error(self, path: &str) -> RemoteError {
        match self {
            Self::ConnectionReset => {
                RemoteError::io(path, io::Error::from(io::ErrorKind::ConnectionReset))
            }
            Self::Timeout => RemoteError::io(path, io::Error::from(io::ErrorKind::TimedOut)),
            Self::PermissionDenied => RemoteError::protocol(path, "permission denied"),
        }
    }
}

#[derive(Default)]
struct FsState {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    faults: HashMap<String, (Fault, usize)>,
    failing_connects: usize,
    connects: usize,
    live_sessions: usize,
    finalizes: usize,
    operations: usize,
}

impl FsState {
    /// Consume one injected fault for `path`, if any remain.
    fn take_fault(&mut self, path: &str) -> Option<Fault> {
        let (fault, remaining) = self.faults.get_mut(path)?;
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        Some(*fault)
    }

    fn parent_exists(&self, path: &str) -> bool {
        match path.rfind('/') {
            Some(0) | None => true,
            Some(idx) => self.dirs.contains(&path[..idx]),
        }
    }
}

/// Shared in-memory file tree. Cloning shares the same tree.
#[derive(Clone, Default)]
pub struct MemoryFileSystem {
    state: Arc<Mutex<FsState>>,
}

impl MemoryFileSystem {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A session factory for this tree, labelled `endpoint`.
    #[must_use]
    pub fn factory(&self, endpoint: impl Into<String>) -> MemorySessionFactory {
        MemorySessionFactory {
            endpoint: endpoint.into(),
            fs: self.clone(),
        }
    }

    /// Seed a file, creating its parent directories.
    pub fn insert_file(&self, path: &str, contents: Vec<u8>) {
        let mut state = self.lock();
        for (idx, c) in path.char_indices().skip(1) {
            if c == '/' {
                state.dirs.insert(path[..idx].to_owned());
            }
        }
        state.files.insert(path.to_owned(), contents);
    }

    /// Fail the next `times` operations touching `path`.
    pub fn inject(&self, path: &str, fault: Fault, times: usize) {
        self.lock().faults.insert(path.to_owned(), (fault, times));
    }

    /// Fail the next `times` connection attempts.
    pub fn fail_connects(&self, times: usize) {
        self.lock().failing_connects = times;
    }

    #[must_use]
    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.lock().files.contains_key(path)
    }

    #[must_use]
    pub fn is_dir(&self, path: &str) -> bool {
        self.lock().dirs.contains(path)
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.lock().files.len()
    }

    /// Paths of every stored file, sorted.
    #[must_use]
    pub fn files(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    /// Sessions created and not yet dropped.
    #[must_use]
    pub fn live_sessions(&self) -> usize {
        self.lock().live_sessions
    }

    #[must_use]
    pub fn finalize_count(&self) -> usize {
        self.lock().finalizes
    }

    /// Total session operations served.
    #[must_use]
    pub fn operation_count(&self) -> usize {
        self.lock().operations
    }
}

pub struct MemorySessionFactory {
    endpoint: String,
    fs: MemoryFileSystem,
}

impl SessionFactory for MemorySessionFactory {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn connect(&self) -> error::Result<Box<dyn RemoteSession>> {
        let mut state = self.fs.lock();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(RemoteError::Connect {
                endpoint: self.endpoint.clone(),
                message: "connection refused".into(),
            });
        }
        state.connects += 1;
        state.live_sessions += 1;
        Ok(Box::new(MemorySession {
            fs: self.fs.clone(),
        }))
    }
}

struct MemorySession {
    fs: MemoryFileSystem,
}

impl MemorySession {
    fn begin(&self, path: &str) -> error::Result<MutexGuard<'_, FsState>> {
        let mut state = self.fs.lock();
        state.operations += 1;
        if let Some(fault) = state.take_fault(path) {
            return Err(fault.to_error(path));
        }
        Ok(state)
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let mut state = self.fs.lock();
        state.live_sessions = state.live_sessions.saturating_sub(1);
    }
}

impl RemoteSession for MemorySession {
    fn open_read(&mut self, path: &str) -> error::Result<Box<dyn Read + Send>> {
        let state = self.begin(path)?;
        let data = state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(path.to_owned()))?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn finalize_read(&mut self) -> error::Result<()> {
        self.fs.lock().finalizes += 1;
        Ok(())
    }

    fn open_write(&mut self, path: &str) -> error::Result<Box<dyn Write + Send>> {
        let state = self.begin(path)?;
        if !state.parent_exists(path) {
            return Err(RemoteError::NotFound(path.to_owned()));
        }
        drop(state);
        Ok(Box::new(MemoryWriter {
            fs: self.fs.clone(),
            path: path.to_owned(),
            buf: Vec::new(),
        }))
    }

    fn exists(&mut self, path: &str) -> error::Result<bool> {
        let state = self.begin(path)?;
        Ok(path == "/" || state.dirs.contains(path) || state.files.contains_key(path))
    }

    fn mkdir(&mut self, path: &str) -> error::Result<()> {
        let mut state = self.begin(path)?;
        if state.dirs.contains(path) || state.files.contains_key(path) {
            return Err(RemoteError::protocol(path, "already exists"));
        }
        if !state.parent_exists(path) {
            return Err(RemoteError::NotFound(path.to_owned()));
        }
        state.dirs.insert(path.to_owned());
        Ok(())
    }

    fn remove(&mut self, path: &str) -> error::Result<()> {
        let mut state = self.begin(path)?;
        state
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| RemoteError::NotFound(path.to_owned()))
    }

    fn ping(&mut self) -> error::Result<()> {
        self.fs.lock().operations += 1;
        Ok(())
    }
}

/// Buffers writes and publishes the file on flush, like a remote handle
/// whose contents become visible once written out.
struct MemoryWriter {
    fs: MemoryFileSystem,
    path: String,
    buf: Vec<u8>,
}

impl Write for MemoryWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.fs
            .lock()
            .files
            .insert(self.path.clone(), self.buf.clone());
        Ok(())
    }
}
