//! Concurrency limiters
//!
//! [`worker::WorkerPool`] bounds file-processing tasks. The transport session
//! pool lives in [`crate::transport::pool`] and shares [`PoolError`].

pub mod worker;

pub use worker::{resolve_size, WorkerPool, DEFAULT_WORKER_POOL_SIZE};

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("Cancelled while waiting for a worker slot")]
    Cancelled,

    #[error("Session pool is closed")]
    PoolClosed,
}
