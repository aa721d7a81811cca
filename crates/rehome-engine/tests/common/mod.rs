//! Shared harness: in-memory origin and destination trees over an
//! in-memory sqlite state store.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rehome_engine::cleanup::CleanupSettings;
use rehome_engine::layout::PathResolver;
use rehome_engine::lock::LockPolicy;
use rehome_engine::orchestrator::{JobContext, JobSettings};
use rehome_engine::reorganize::MigrationSettings;
use rehome_engine::Orchestrator;
use rehome_remote::memory::MemoryFileSystem;
use rehome_remote::{PoolConfig, SessionPool};
use rehome_state::{SqliteStateBackend, StateBackend};
use rehome_types::FileRecord;

pub const DESTINATION_BASE: &str = "/organized";

pub struct Harness {
    pub origin: MemoryFileSystem,
    pub destination: MemoryFileSystem,
    pub store: Arc<dyn StateBackend>,
}

fn pool(fs: &MemoryFileSystem, name: &str) -> SessionPool {
    SessionPool::new(
        Arc::new(fs.factory(name)),
        PoolConfig {
            max_size: 4,
            acquire_timeout: Duration::from_secs(5),
            buffer_size: 16,
        },
    )
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(SqliteStateBackend::in_memory().unwrap()))
    }

    pub fn with_store(store: Arc<dyn StateBackend>) -> Self {
        Self {
            origin: MemoryFileSystem::new(),
            destination: MemoryFileSystem::new(),
            store,
        }
    }

    /// Put a file on the origin and index it as pending.
    pub fn seed(&self, id: &str, source_path: &str, file_name: &str, contents: &[u8]) -> FileRecord {
        self.origin.insert_file(source_path, contents.to_vec());
        let mut record = FileRecord::pending(id, source_path, file_name);
        record.file_size = Some(contents.len() as u64);
        self.store.insert_records(std::slice::from_ref(&record)).unwrap();
        record
    }

    pub fn origin_pool(&self) -> SessionPool {
        pool(&self.origin, "origin")
    }

    pub fn destination_pool(&self) -> SessionPool {
        pool(&self.destination, "destination")
    }

    pub fn context(&self) -> JobContext {
        JobContext {
            job: JobSettings {
                name: "reorganize-full".into(),
                lock_name: "reorganize-full".into(),
                lock_policy: LockPolicy {
                    min_hold: Duration::ZERO,
                    max_hold: Duration::from_secs(600),
                },
            },
            store: Arc::clone(&self.store),
            origin: self.origin_pool(),
            destination: self.destination_pool(),
            resolver: PathResolver::default(),
            origin_base: None,
            destination_base: DESTINATION_BASE.into(),
            migration: MigrationSettings {
                chunk_size: 2,
                workers: 2,
                skip_limit: 5,
                prefetch: 2,
            },
            retry_limit: 2,
            retry_backoff: Duration::ZERO,
            cleanup: None,
        }
    }

    pub fn orchestrator(&self, tune: impl FnOnce(&mut JobContext)) -> Orchestrator {
        let mut ctx = self.context();
        tune(&mut ctx);
        Orchestrator::new(ctx)
    }
}

pub fn cleanup_enabled(ctx: &mut JobContext) {
    ctx.cleanup = Some(CleanupSettings::default());
}
