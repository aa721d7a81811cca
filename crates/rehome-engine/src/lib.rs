//! Migration engine for rehome: reorganises origin files into a sharded
//! destination layout, cleans up the origin, and audits every run.

#![warn(clippy::pedantic)]

pub mod audit;
pub mod cleanup;
pub mod config;
pub mod errors;
pub mod layout;
pub mod lock;
pub mod orchestrator;
pub mod reader;
pub mod reorganize;
pub mod resolve;
pub mod result;
pub mod transfer;

// Re-export public API for convenience
pub use errors::RunError;
pub use layout::PathResolver;
pub use orchestrator::{check_job, JobContext, Orchestrator, RunHandle};
pub use resolve::resolve_job;
pub use result::{CheckResult, RunReport, TriggerReceipt};
