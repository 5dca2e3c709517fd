use codeindex_core::{
    AccessMode, BackendSession, PersistenceError, PoolConfig, Result, SessionFactory,
};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

/// A session on loan from the pool. Exactly one caller holds it between
/// `acquire` and `release`.
pub struct PooledSession {
    pub id: Uuid,
    session: Arc<dyn BackendSession>,
    created_at: Instant,
    last_acquired: Instant,
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("last_acquired", &self.last_acquired)
            .finish_non_exhaustive()
    }
}

impl PooledSession {
    fn new(session: Arc<dyn BackendSession>) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            session,
            created_at: now,
            last_acquired: now,
        }
    }

    pub fn session(&self) -> &Arc<dyn BackendSession> {
        &self.session
    }
}

struct PoolState {
    idle: VecDeque<PooledSession>,
    in_use: HashSet<Uuid>,
    live: usize,
    closed: bool,
}

enum AcquireStep {
    Ready(PooledSession),
    Create,
    Wait,
}

/// Bounded pool of reusable backend sessions with lazy idle expiry and
/// wait-with-timeout acquisition. The idle and in-use sets are disjoint by
/// construction; `live` counts both plus slots reserved for creation.
pub struct ResourcePool {
    factory: Arc<dyn SessionFactory>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    released: Notify,
    monitor: PoolMonitor,
}

impl ResourcePool {
    pub fn new(factory: Arc<dyn SessionFactory>, config: PoolConfig) -> Self {
        Self {
            factory,
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                in_use: HashSet::new(),
                live: 0,
                closed: false,
            }),
            released: Notify::new(),
            monitor: PoolMonitor::default(),
        }
    }

    pub fn monitor(&self) -> &PoolMonitor {
        &self.monitor
    }

    pub async fn acquire(&self, mode: AccessMode) -> Result<PooledSession> {
        let deadline = Instant::now() + self.config.acquire_timeout();

        loop {
            let (step, expired) = self.try_checkout()?;
            self.close_all(expired).await;

            match step {
                AcquireStep::Ready(session) => {
                    self.monitor.acquired.fetch_add(1, Ordering::Relaxed);
                    return Ok(session);
                }
                AcquireStep::Create => match self.factory.create_session(mode).await {
                    Ok(raw) => {
                        let session = PooledSession::new(raw);
                        self.state.lock().in_use.insert(session.id);
                        self.monitor.created.fetch_add(1, Ordering::Relaxed);
                        self.monitor.acquired.fetch_add(1, Ordering::Relaxed);
                        debug!(session_id = %session.id, "created pooled session");
                        return Ok(session);
                    }
                    Err(e) => {
                        {
                            // close() may have zeroed the counter in the
                            // meantime, so the reserved slot is given back
                            // without going below zero.
                            let mut state = self.state.lock();
                            state.live = state.live.saturating_sub(1);
                        }
                        self.released.notify_one();
                        return Err(PersistenceError::Connection(format!(
                            "session creation failed: {}",
                            e
                        )));
                    }
                },
                AcquireStep::Wait => {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                        self.monitor.timeouts.fetch_add(1, Ordering::Relaxed);
                        return Err(PersistenceError::PoolTimeout(format!(
                            "no session available within {:?}",
                            self.config.acquire_timeout()
                        )));
                    };
                    if tokio::time::timeout(remaining, self.released.notified())
                        .await
                        .is_err()
                    {
                        self.monitor.timeouts.fetch_add(1, Ordering::Relaxed);
                        return Err(PersistenceError::PoolTimeout(format!(
                            "no session available within {:?}",
                            self.config.acquire_timeout()
                        )));
                    }
                }
            }
        }
    }

    /// Synchronous checkout attempt: evicts stale idle sessions, then hands
    /// out an idle session, reserves a creation slot, or asks the caller to
    /// wait. Expired sessions are returned for closing outside the lock.
    fn try_checkout(&self) -> Result<(AcquireStep, Vec<PooledSession>)> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PersistenceError::Connection(
                "resource pool is closed".to_string(),
            ));
        }

        let ttl = self.config.idle_ttl();
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut fresh = VecDeque::with_capacity(state.idle.len());
        while let Some(session) = state.idle.pop_front() {
            if now.duration_since(session.created_at) > ttl {
                state.live -= 1;
                expired.push(session);
            } else {
                fresh.push_back(session);
            }
        }
        state.idle = fresh;

        if let Some(mut session) = state.idle.pop_front() {
            session.last_acquired = now;
            state.in_use.insert(session.id);
            return Ok((AcquireStep::Ready(session), expired));
        }

        if state.live < self.config.capacity {
            state.live += 1;
            return Ok((AcquireStep::Create, expired));
        }

        Ok((AcquireStep::Wait, expired))
    }

    /// Returns a session to the idle set after a health probe, or discards
    /// it when the probe fails. Sessions released after `close()` are closed
    /// here, since the pool keeps no handle to lent-out sessions. Releasing
    /// a session from another pool is a no-op.
    pub async fn release(&self, session: PooledSession) {
        let (known, closed) = {
            let mut state = self.state.lock();
            let known = state.in_use.remove(&session.id);
            (known, state.closed)
        };
        if !known {
            if closed {
                self.discard(session).await;
            }
            return;
        }

        let held = session.last_acquired.elapsed();
        self.monitor
            .held_ms_total
            .fetch_add(held.as_millis() as u64, Ordering::Relaxed);
        self.monitor.released.fetch_add(1, Ordering::Relaxed);

        let healthy = !closed && session.session.ping().await.is_ok();
        if !healthy && !closed {
            warn!(session_id = %session.id, "discarding unhealthy session");
        }

        if healthy {
            let mut state = self.state.lock();
            if !state.closed {
                state.idle.push_back(session);
                drop(state);
                self.released.notify_one();
                return;
            }
        }

        self.discard(session).await;
        {
            let mut state = self.state.lock();
            state.live = state.live.saturating_sub(1);
        }
        self.released.notify_one();
    }

    async fn discard(&self, session: PooledSession) {
        if let Err(e) = session.session.close().await {
            debug!(error = %e, "session close failed");
        }
        self.monitor.closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Closes every idle session and rejects future acquisition. In-use
    /// sessions are closed when their holders release them.
    pub async fn close(&self) {
        let idle: Vec<PooledSession> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.in_use.clear();
            state.live = 0;
            state.idle.drain(..).collect()
        };
        self.close_all(idle).await;
        self.released.notify_waiters();
    }

    async fn close_all(&self, sessions: Vec<PooledSession>) {
        for session in sessions {
            self.discard(session).await;
        }
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.state.lock().in_use.len()
    }
}

/// Cumulative pool bookkeeping. Observability only; nothing here feeds back
/// into acquisition decisions.
#[derive(Debug, Default)]
pub struct PoolMonitor {
    created: AtomicU64,
    closed: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    timeouts: AtomicU64,
    held_ms_total: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub created: u64,
    pub closed: u64,
    pub acquired: u64,
    pub released: u64,
    pub timeouts: u64,
    pub active: u64,
    pub avg_held_ms: f64,
}

impl PoolMonitor {
    pub fn snapshot(&self) -> PoolStats {
        let created = self.created.load(Ordering::Relaxed);
        let closed = self.closed.load(Ordering::Relaxed);
        let released = self.released.load(Ordering::Relaxed);
        let held_total = self.held_ms_total.load(Ordering::Relaxed);
        PoolStats {
            created,
            closed,
            acquired: self.acquired.load(Ordering::Relaxed),
            released,
            timeouts: self.timeouts.load(Ordering::Relaxed),
            active: created.saturating_sub(closed),
            avg_held_ms: if released > 0 {
                held_total as f64 / released as f64
            } else {
                0.0
            },
        }
    }
}
