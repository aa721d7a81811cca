//! Shared domain model for the rehome migration engine.
//!
//! Pure data types only: file records and their state machines, execution
//! audits, stage summaries, lease records, and error classification. Storage
//! and transport crates map to and from these types; nothing here performs I/O.

pub mod audit;
pub mod error;
pub mod lease;
pub mod record;

pub use audit::{
    AuditCounters, AuditId, ExecutionAudit, ExecutionId, ExecutionStatus, StageSummary,
};
pub use error::ErrorClass;
pub use lease::LeaseRecord;
pub use record::{
    BusinessMetadata, CleanupCandidate, CleanupState, FileRecord, IndexingState, IndexingStatus,
    RecordId, ReorgState, ReorgStatus,
};
