//! File transfer transport
//!
//! The pipeline talks to the transfer server through [`TransportSession`]s.
//! [`ftp::FtpConnector`] opens real FTP sessions; [`memory::MemoryTransport`]
//! is an in-process tree used by tests and dry runs. Sessions are pooled by
//! [`pool::SessionPool`].

pub mod ftp;
pub mod memory;
pub mod pool;

pub use ftp::{FtpConfig, FtpConnector, FtpSession};
pub use memory::MemoryTransport;
pub use pool::{PooledSession, SessionPool};

use async_trait::async_trait;
use thiserror::Error;

use crate::pool::PoolError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("FTP error: {0}")]
    Ftp(#[from] suppaftp::FtpError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Session already closed")]
    SessionClosed,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Transport task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// One authenticated connection to the transfer server
///
/// Paths are absolute or relative to the login directory, `/` separated.
#[async_trait]
pub trait TransportSession: Send + 'static {
    /// Names of the entries directly inside `dir`
    async fn list(&mut self, dir: &str) -> Result<Vec<String>, TransportError>;

    async fn retrieve(&mut self, path: &str) -> Result<Vec<u8>, TransportError>;

    /// Create or overwrite `path`
    async fn store(&mut self, path: &str, data: Vec<u8>) -> Result<(), TransportError>;

    async fn rename(&mut self, from: &str, to: &str) -> Result<(), TransportError>;

    async fn delete(&mut self, path: &str) -> Result<(), TransportError>;

    /// Create `path` and any missing parents
    async fn make_dir(&mut self, path: &str) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens new sessions for a [`SessionPool`]
#[async_trait]
pub trait TransportConnector: Send + Sync + 'static {
    type Session: TransportSession;

    async fn connect(&self) -> Result<Self::Session, TransportError>;
}

/// Last path segment of a listing entry
///
/// Some servers answer `NLST dir` with `dir/name` rather than `name`.
pub fn entry_name(entry: &str) -> &str {
    entry.trim_end_matches('/').rsplit('/').next().unwrap_or(entry)
}
