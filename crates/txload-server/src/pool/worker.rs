//! Bounded worker pool for file processing
//!
//! Each submitted future occupies one slot until it completes. `submit` waits
//! for a free slot or for cancellation, whichever comes first; there is no
//! queue beyond the callers already waiting.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::PoolError;

/// Size used when the configured size is zero or negative
pub const DEFAULT_WORKER_POOL_SIZE: usize = 8;

pub struct WorkerPool {
    size: usize,
    slots: Arc<Semaphore>,
    tasks: JoinSet<()>,
}

/// Effective pool size; `requested <= 0` falls back to [`DEFAULT_WORKER_POOL_SIZE`]
pub fn resolve_size(requested: i64) -> usize {
    usize::try_from(requested)
        .ok()
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_WORKER_POOL_SIZE)
}

impl WorkerPool {
    pub fn new(requested: i64) -> Self {
        let size = resolve_size(requested);

        Self {
            size,
            slots: Arc::new(Semaphore::new(size)),
            tasks: JoinSet::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots currently held by running tasks
    pub fn active(&self) -> usize {
        self.size - self.slots.available_permits()
    }

    /// Spawn `task` once a slot is free.
    ///
    /// Returns [`PoolError::Cancelled`] if `cancel` fires first; the task is
    /// then dropped without running.
    pub async fn submit<F>(&mut self, cancel: &CancellationToken, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            permit = self.slots.clone().acquire_owned() => {
                permit.map_err(|_| PoolError::Cancelled)?
            }
        };

        self.tasks.spawn(async move {
            task.await;
            drop(permit);
        });

        // Reap finished tasks so the set does not grow for the whole run
        while let Some(result) = self.tasks.try_join_next() {
            log_join(result);
        }

        Ok(())
    }

    /// Wait for every submitted task to finish
    pub async fn wait(&mut self) {
        debug!(pending = self.tasks.len(), "Waiting for workers");
        while let Some(result) = self.tasks.join_next().await {
            log_join(result);
        }
    }
}

fn log_join(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "Worker task panicked");
        }
    }
}
