//! Pooled remote file sessions.
//!
//! A [`SessionPool`] hands out sessions from a [`SessionFactory`] (SFTP via
//! [`sftp::SftpSessionFactory`], or the in-memory endpoint in
//! [`memory`]) and guarantees each checked-out session is released exactly
//! once, including when a read stream is dropped early or an operation fails.

#![warn(clippy::pedantic)]

pub mod error;
pub mod memory;
pub mod pool;
pub mod reader;
pub mod session;
pub mod sftp;

pub use error::RemoteError;
pub use pool::{PoolConfig, PoolStats, PooledSession, SessionPool};
pub use reader::SessionReader;
pub use session::{RemoteSession, SessionFactory};
