//! Fixed-size pool of transport sessions
//!
//! Sessions are opened eagerly and parked in a bounded channel. A checked-out
//! session is wrapped in a [`PooledSession`] guard that puts it back when the
//! guard drops, or closes it if the pool has been closed in the meantime.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_channel::{Receiver, Sender};
use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use super::{TransportConnector, TransportError, TransportSession};
use crate::pool::PoolError;

/// Size used when zero sessions are requested
pub const DEFAULT_SESSION_POOL_SIZE: usize = 4;

pub struct SessionPool<S: TransportSession> {
    size: usize,
    idle_tx: Sender<S>,
    idle_rx: Receiver<S>,
    closed: AtomicBool,
}

impl<S: TransportSession> SessionPool<S> {
    /// Open `size` sessions up front.
    ///
    /// If any connect fails, the sessions opened so far are closed and the
    /// error is returned.
    pub async fn connect<C>(connector: &C, size: usize) -> Result<Arc<Self>, TransportError>
    where
        C: TransportConnector<Session = S>,
    {
        let size = if size == 0 { DEFAULT_SESSION_POOL_SIZE } else { size };
        let mut opened = Vec::with_capacity(size);

        for index in 0..size {
            match connector.connect().await {
                Ok(session) => opened.push(session),
                Err(e) => {
                    warn!(opened = index, size, error = %e, "Session pool connect failed");
                    for mut session in opened {
                        if let Err(close_err) = session.close().await {
                            warn!(error = %close_err, "Failed to close session after connect failure");
                        }
                    }
                    return Err(e);
                },
            }
        }

        let (idle_tx, idle_rx) = async_channel::bounded(size);
        for session in opened {
            idle_tx.send(session).await.map_err(|_| PoolError::PoolClosed)?;
        }

        info!(size, "Transport session pool ready");
        Ok(Arc::new(Self {
            size,
            idle_tx,
            idle_rx,
            closed: AtomicBool::new(false),
        }))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Sessions currently parked in the pool
    pub fn idle(&self) -> usize {
        self.idle_rx.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait for a free session
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledSession<S>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }

        let session = self.idle_rx.recv().await.map_err(|_| PoolError::PoolClosed)?;
        if self.is_closed() {
            close_detached(session);
            return Err(PoolError::PoolClosed);
        }

        Ok(PooledSession {
            pool: self.clone(),
            session: Some(session),
        })
    }

    /// Run `f` with a session that is returned afterwards, whatever `f` returns
    pub async fn with_session<T, F>(self: &Arc<Self>, f: F) -> Result<T, TransportError>
    where
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, Result<T, TransportError>>,
    {
        let mut session = self.acquire().await?;
        f(&mut *session).await
    }

    /// Close the pool and every parked session. Safe to call more than once.
    ///
    /// Sessions checked out at this point are closed when their guards drop.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.idle_rx.close();

        let mut closed = 0usize;
        while let Ok(mut session) = self.idle_rx.try_recv() {
            if let Err(e) = session.close().await {
                warn!(error = %e, "Failed to close pooled session");
            }
            closed += 1;
        }
        info!(closed, size = self.size, "Transport session pool closed");
    }

    fn release(&self, session: S) {
        if self.is_closed() {
            close_detached(session);
            return;
        }
        if let Err(e) = self.idle_tx.try_send(session) {
            close_detached(e.into_inner());
        }
    }
}

fn close_detached<S: TransportSession>(mut session: S) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = session.close().await {
                    warn!(error = %e, "Failed to close returned session");
                }
            });
        },
        Err(_) => debug!("No runtime available, dropping session without QUIT"),
    }
}

/// A session checked out of a [`SessionPool`]
pub struct PooledSession<S: TransportSession> {
    pool: Arc<SessionPool<S>>,
    session: Option<S>,
}

impl<S: TransportSession> Deref for PooledSession<S> {
    type Target = S;

    fn deref(&self) -> &S {
        match self.session.as_ref() {
            Some(session) => session,
            None => unreachable!("session is only taken on drop"),
        }
    }
}

impl<S: TransportSession> DerefMut for PooledSession<S> {
    fn deref_mut(&mut self) -> &mut S {
        match self.session.as_mut() {
            Some(session) => session,
            None => unreachable!("session is only taken on drop"),
        }
    }
}

impl<S: TransportSession> Drop for PooledSession<S> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.release(session);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use futures::FutureExt;

    #[tokio::test]
    async fn test_connect_opens_every_session() {
        let transport = MemoryTransport::new();
        let pool = SessionPool::connect(&transport, 3).await.unwrap();
        assert_eq!(transport.connects(), 3);
        assert_eq!(pool.idle(), 3);
    }

    #[tokio::test]
    async fn test_connect_failure_closes_opened_sessions() {
        let transport = MemoryTransport::new();
        transport.fail_connect_after(2);

        let result = SessionPool::connect(&transport, 4).await;
        assert!(result.is_err());
        assert_eq!(transport.connects(), 2);
        assert_eq!(transport.closes(), 2);
    }

    #[tokio::test]
    async fn test_guard_returns_session() {
        let transport = MemoryTransport::new();
        transport.put("/in/a.txt", "a");
        let pool = SessionPool::connect(&transport, 1).await.unwrap();

        {
            let mut session = pool.acquire().await.unwrap();
            assert_eq!(pool.idle(), 0);
            assert_eq!(session.retrieve("/in/a.txt").await.unwrap(), b"a");
        }
        assert_eq!(pool.idle(), 1);

        let names = pool
            .with_session(|s| async move { s.list("/in").await }.boxed())
            .await
            .unwrap();
        assert_eq!(names, vec!["a.txt"]);
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn test_session_returned_after_error() {
        let transport = MemoryTransport::new();
        let pool = SessionPool::connect(&transport, 1).await.unwrap();

        let result = pool
            .with_session(|s| async move { s.retrieve("/missing").await }.boxed())
            .await;
        assert!(matches!(result, Err(TransportError::NotFound(_))));
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn test_acquire_after_close_fails() {
        let transport = MemoryTransport::new();
        let pool = SessionPool::connect(&transport, 2).await.unwrap();

        pool.close().await;
        pool.close().await;

        assert!(matches!(pool.acquire().await, Err(PoolError::PoolClosed)));
        assert_eq!(transport.closes(), 2);
    }

    #[tokio::test]
    async fn test_checked_out_session_closed_on_release_after_close() {
        let transport = MemoryTransport::new();
        let pool = SessionPool::connect(&transport, 2).await.unwrap();

        let session = pool.acquire().await.unwrap();
        pool.close().await;
        assert_eq!(transport.closes(), 1);

        drop(session);
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(transport.closes(), 2);
    }

    #[tokio::test]
    async fn test_waiter_is_woken_by_release() {
        let transport = MemoryTransport::new();
        let pool = SessionPool::connect(&transport, 1).await.unwrap();

        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap().unwrap();
    }
}
