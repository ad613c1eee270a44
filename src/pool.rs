//! Bounded cache of ready relay sessions.
//!
//! Handshakes are expensive, so flows borrow sessions from here instead of
//! dialling per connection. The pool bounds IDLE sessions only; the flow
//! table decides how many are outstanding. One mutex guards the lists and is
//! held only for bookkeeping — session construction happens outside it.

use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::session::{SecureSession, SessionError, TransportConnector};

/// Default number of idle slots.
pub const DEFAULT_CAPACITY: usize = 5;

#[derive(Default)]
struct PoolInner {
    idle: Vec<SecureSession>,
    in_use: Vec<SecureSession>,
    initialised: bool,
}

/// Fixed-capacity cache of idle [`SecureSession`]s.
pub struct SessionPool {
    connector: Arc<dyn TransportConnector>,
    psk: [u8; 32],
    capacity: usize,
    inner: Mutex<PoolInner>,
}

impl SessionPool {
    pub fn new(connector: Arc<dyn TransportConnector>, psk: [u8; 32]) -> Self {
        Self::with_capacity(connector, psk, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(
        connector: Arc<dyn TransportConnector>,
        psk: [u8; 32],
        capacity: usize,
    ) -> Self {
        Self {
            connector,
            psk,
            capacity: capacity.max(1),
            inner: Mutex::new(PoolInner::default()),
        }
    }

    /// Eagerly fills the idle slots, tolerating individual handshake
    /// failures; the pool may start with fewer than `capacity` sessions.
    pub async fn initialise(&self) {
        if self.inner.lock().initialised {
            return;
        }
        let attempts = (0..self.capacity)
            .map(|_| SecureSession::connect(self.connector.as_ref(), &self.psk));
        let results = join_all(attempts).await;

        let mut ready = 0usize;
        let mut inner = self.inner.lock();
        for result in results {
            match result {
                Ok(session) if inner.idle.len() < self.capacity => {
                    inner.idle.push(session);
                    ready += 1;
                }
                Ok(session) => session.close(),
                Err(e) => warn!(target: "sproxy::pool", error = %e, "eager session failed"),
            }
        }
        inner.initialised = true;
        drop(inner);
        info!(target: "sproxy::pool", ready, capacity = self.capacity, "pool initialised");
    }

    /// Hands out a ready session: an idle one when available and still
    /// healthy, otherwise a freshly connected one.
    pub async fn acquire(&self) -> Result<SecureSession, SessionError> {
        let popped = self.inner.lock().idle.pop();
        let session = match popped {
            Some(session) if session.is_connected() => session,
            Some(stale) => {
                debug!(
                    target: "sproxy::pool",
                    id = stale.session_id(),
                    "discarding unhealthy idle session"
                );
                stale.close();
                SecureSession::connect(self.connector.as_ref(), &self.psk).await?
            }
            None => SecureSession::connect(self.connector.as_ref(), &self.psk).await?,
        };
        self.inner.lock().in_use.push(session.clone());
        Ok(session)
    }

    /// Returns a borrowed session. Healthy sessions go back to the idle set
    /// while there is room; everything else is closed.
    pub fn release(&self, session: SecureSession) {
        let mut inner = self.inner.lock();
        let id = session.session_id();
        inner.in_use.retain(|s| s.session_id() != id);
        if session.is_connected() && inner.idle.len() < self.capacity {
            inner.idle.push(session);
        } else {
            drop(inner);
            session.close();
        }
    }

    /// Closes every idle and tracked in-use session and resets the pool.
    pub fn cleanup(&self) {
        let (idle, in_use) = {
            let mut inner = self.inner.lock();
            inner.initialised = false;
            (
                std::mem::take(&mut inner.idle),
                std::mem::take(&mut inner.in_use),
            )
        };
        for session in idle.into_iter().chain(in_use) {
            session.close();
        }
    }

    pub fn idle_count(&self) -> usize {
        self.inner.lock().idle.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.inner.lock().in_use.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{psk_of, DeadConnector, PipeConnector, SimRelay};

    fn sim_pool(capacity: usize) -> SessionPool {
        let connector = Arc::new(PipeConnector::new(SimRelay::new(psk_of(5))));
        SessionPool::with_capacity(connector, psk_of(5), capacity)
    }

    #[tokio::test]
    async fn initialise_fills_idle_slots() {
        let pool = sim_pool(3);
        pool.initialise().await;
        assert_eq!(pool.idle_count(), 3);
        assert_eq!(pool.in_use_count(), 0);
        pool.cleanup();
    }

    #[tokio::test(start_paused = true)]
    async fn initialise_tolerates_failures() {
        let pool = SessionPool::with_capacity(Arc::new(DeadConnector), psk_of(0), 3);
        pool.initialise().await;
        assert_eq!(pool.idle_count(), 0);
        // Acquire still works by propagating the connect error.
        assert!(pool.acquire().await.is_err());
    }

    #[tokio::test]
    async fn acquire_reuses_then_creates() {
        let pool = sim_pool(2);
        pool.initialise().await;
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.in_use_count(), 2);
        // Both idle slots were consumed; the third is created on demand.
        let c = pool.acquire().await.unwrap();
        assert_eq!(pool.in_use_count(), 3);
        pool.release(a);
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.in_use_count(), 0);
        pool.cleanup();
    }

    #[tokio::test]
    async fn release_beyond_capacity_closes() {
        let pool = sim_pool(1);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        pool.release(a);
        pool.release(b.clone());
        assert_eq!(pool.idle_count(), 1);
        assert!(!b.is_connected());
        pool.cleanup();
    }

    #[tokio::test]
    async fn unhealthy_idle_session_is_replaced() {
        let pool = sim_pool(1);
        pool.initialise().await;
        // Kill the idle session behind the pool's back.
        let dead = {
            let inner = pool.inner.lock();
            inner.idle[0].clone()
        };
        dead.close();
        let fresh = pool.acquire().await.unwrap();
        assert!(fresh.is_connected());
        assert_ne!(fresh.session_id(), dead.session_id());
        pool.cleanup();
    }

    #[tokio::test]
    async fn idle_bound_holds_at_all_points() {
        let pool = sim_pool(2);
        pool.initialise().await;
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(pool.acquire().await.unwrap());
            assert!(pool.idle_count() <= pool.capacity());
        }
        for session in held {
            pool.release(session);
            assert!(pool.idle_count() <= pool.capacity());
        }
        pool.cleanup();
    }

    #[tokio::test(start_paused = true)]
    async fn expired_idle_session_is_not_handed_out() {
        let pool = sim_pool(1);
        pool.initialise().await;
        let stale_id = pool.inner.lock().idle[0].session_id();

        // Past the idle limit the watchdog closes the cached session; the
        // next acquire must hand out a fresh one.
        tokio::time::advance(std::time::Duration::from_secs(121)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        let fresh = pool.acquire().await.unwrap();
        assert!(fresh.is_connected());
        assert_ne!(fresh.session_id(), stale_id);
        pool.cleanup();
    }

    #[tokio::test]
    async fn cleanup_closes_in_use_sessions_too() {
        let pool = sim_pool(2);
        let held = pool.acquire().await.unwrap();
        pool.cleanup();
        assert!(!held.is_connected());
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.in_use_count(), 0);
    }
}
