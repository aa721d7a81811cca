//! Persistence for the rehome migration engine.
//!
//! Provides the [`RecordStore`], [`AuditStore`], and [`LeaseStore`]
//! contracts plus `SQLite` and `PostgreSQL` implementations of all three.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod document;
pub mod error;
pub mod postgres;
pub mod sqlite;

pub use backend::{
    AuditQuery, AuditStore, BulkUpdateReport, CandidateFilter, CleanupUpdate, LeaseStore,
    PendingRecord, RecordStore, ReorgUpdate, StateBackend,
};
pub use error::StateError;
pub use postgres::PostgresStateBackend;
pub use sqlite::SqliteStateBackend;
