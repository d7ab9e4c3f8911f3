//! Bounded warehouse connection pool
//!
//! Concurrency model:
//! - A fair semaphore with `max_connections` permits bounds checkouts; waiters
//!   are served strictly FIFO and one release wakes exactly one waiter
//! - Idle sessions live in a `VecDeque` behind a `std::sync::Mutex` that is
//!   only held for bookkeeping, never across a warehouse round-trip
//! - Sessions are opened lazily when no idle one is usable
//! - A checked-out session is owned by its [`PooledConnection`] guard; the
//!   guard returns it on an explicit healthy release and discards it otherwise

pub mod connection;

pub use connection::PooledConnection;

use crate::context::RequestContext;
use crate::errors::{BridgeError, Result};
use crate::telemetry::{Telemetry, TelemetryEvent};
use crate::warehouse::{Connector, WarehouseSession};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

/// Pool sizing and lifetime settings
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on open sessions
    pub max_connections: usize,

    /// Sessions opened by `warm_up` and kept by the reaper
    pub min_connections: usize,

    /// How long `acquire` waits for a free slot
    pub acquire_timeout: Duration,

    /// Idle sessions older than this are closed
    pub max_idle: Duration,

    /// Ping idle sessions unused for longer than this before handing them out
    pub health_check_after: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            min_connections: 0,
            acquire_timeout: Duration::from_secs(30),
            max_idle: Duration::from_secs(300),
            health_check_after: Some(Duration::from_secs(60)),
        }
    }
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub max: usize,
    pub in_use: usize,
    pub idle: usize,
    pub opened: u64,
    pub closed: u64,
}

/// Session parked in the idle set
pub(crate) struct IdleSession {
    pub(crate) id: u64,
    pub(crate) session: Box<dyn WarehouseSession>,
    pub(crate) last_used: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<IdleSession>,
    in_use: usize,
    opened: u64,
    closed: u64,
    shut: bool,
}

/// Bounded pool of warehouse sessions
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
    telemetry: Telemetry,
}

impl ConnectionPool {
    /// Create a pool; no session is opened until `acquire` or `warm_up`
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig, telemetry: Telemetry) -> Arc<Self> {
        let max = config.max_connections.max(1);
        Arc::new(Self {
            connector,
            config: PoolConfig {
                max_connections: max,
                min_connections: config.min_connections.min(max),
                ..config
            },
            permits: Arc::new(Semaphore::new(max)),
            state: Mutex::new(PoolState::default()),
            next_id: AtomicU64::new(1),
            telemetry,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed_error() -> BridgeError {
        BridgeError::Unavailable("connection pool is closed".to_string())
    }

    /// Check out a session for one request
    ///
    /// Waits FIFO for a slot. Fails with `PoolExhausted` after the acquire
    /// timeout, `Cancelled`/`Timeout` when the request is withdrawn or its
    /// deadline passes first, `Unavailable` when the pool is closed and
    /// `Connection` when a new session cannot be opened.
    pub async fn acquire(self: &Arc<Self>, ctx: &RequestContext) -> Result<PooledConnection> {
        ctx.check()?;
        if self.state().shut {
            return Err(Self::closed_error());
        }

        let started = Instant::now();
        let permit = self.wait_for_permit(ctx, started).await?;

        loop {
            let candidate = {
                let mut state = self.state();
                if state.shut {
                    return Err(Self::closed_error());
                }
                state.idle.pop_back()
            };
            let Some(mut idle) = candidate else { break };

            if idle.session.is_closed() || idle.last_used.elapsed() > self.config.max_idle {
                self.discard(idle.id, idle.session, false);
                continue;
            }

            if let Some(after) = self.config.health_check_after {
                if idle.last_used.elapsed() > after {
                    if let Err(err) = ctx.guard(ctx.deadline(), idle.session.ping()).await {
                        tracing::debug!(conn_id = idle.id, error = %err, "idle connection failed health check");
                        self.discard(idle.id, idle.session, false);
                        if matches!(err, BridgeError::Cancelled | BridgeError::Timeout { .. }) {
                            return Err(err);
                        }
                        continue;
                    }
                }
            }

            self.state().in_use += 1;
            return Ok(PooledConnection::new(Arc::clone(self), idle.id, idle.session, permit));
        }

        let session = match ctx.guard(ctx.deadline(), self.connector.connect()).await {
            Ok(session) => session,
            Err(err) => {
                if let BridgeError::Connection(message) = &err {
                    tracing::warn!(target_db = %self.connector.target(), error = %message, "failed to open warehouse connection");
                    self.telemetry.record(TelemetryEvent::ConnectionFailed {
                        message: message.clone(),
                        timestamp: Instant::now(),
                    });
                }
                return Err(err);
            }
        };
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.state();
            state.opened += 1;
            state.in_use += 1;
        }
        tracing::debug!(conn_id = id, "opened warehouse connection");
        self.telemetry.record(TelemetryEvent::ConnectionOpened {
            conn_id: id,
            timestamp: Instant::now(),
        });
        Ok(PooledConnection::new(Arc::clone(self), id, session, permit))
    }

    async fn wait_for_permit(&self, ctx: &RequestContext, started: Instant) -> Result<OwnedSemaphorePermit> {
        let request_deadline = async {
            match ctx.deadline() {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        let exhausted = tokio::time::sleep(self.config.acquire_timeout);

        tokio::select! {
            biased;
            _ = ctx.cancel_token().cancelled() => Err(BridgeError::Cancelled),
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| Self::closed_error())
            }
            _ = request_deadline => Err(BridgeError::Timeout {
                duration_ms: started.elapsed().as_millis() as u64,
            }),
            _ = exhausted => {
                let waited_ms = started.elapsed().as_millis() as u64;
                tracing::warn!(waited_ms, max = self.config.max_connections, "connection pool exhausted");
                self.telemetry.record(TelemetryEvent::PoolExhausted {
                    waited_ms,
                    timestamp: Instant::now(),
                });
                Err(BridgeError::PoolExhausted { waited_ms })
            }
        }
    }

    /// Return a checked-out session; called by the guard
    pub(crate) fn check_in(&self, id: u64, session: Box<dyn WarehouseSession>, healthy: bool) {
        let rejected = {
            let mut state = self.state();
            state.in_use = state.in_use.saturating_sub(1);
            if healthy && !state.shut && !session.is_closed() {
                state.idle.push_back(IdleSession {
                    id,
                    session,
                    last_used: Instant::now(),
                });
                None
            } else {
                Some(session)
            }
        };
        if let Some(session) = rejected {
            self.discard(id, session, healthy);
        }
    }

    fn discard(&self, id: u64, session: Box<dyn WarehouseSession>, healthy: bool) {
        drop(session);
        self.state().closed += 1;
        tracing::debug!(conn_id = id, healthy, "closed warehouse connection");
        self.telemetry.record(TelemetryEvent::ConnectionClosed {
            conn_id: id,
            healthy,
            timestamp: Instant::now(),
        });
    }

    /// Open sessions until `min_connections` exist; returns how many were opened
    pub async fn warm_up(&self) -> Result<usize> {
        let mut opened = 0;
        loop {
            {
                let state = self.state();
                if state.shut || state.idle.len() + state.in_use >= self.config.min_connections {
                    break;
                }
            }
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                break;
            };
            let session = self.connector.connect().await?;
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            {
                let mut state = self.state();
                state.opened += 1;
                state.idle.push_back(IdleSession {
                    id,
                    session,
                    last_used: Instant::now(),
                });
            }
            drop(permit);
            self.telemetry.record(TelemetryEvent::ConnectionOpened {
                conn_id: id,
                timestamp: Instant::now(),
            });
            opened += 1;
        }
        if opened > 0 {
            tracing::info!(opened, target_db = %self.connector.target(), "warmed up connection pool");
        }
        Ok(opened)
    }

    /// Close idle sessions older than `max_idle`, keeping `min_connections`
    pub fn reap_idle(&self) -> usize {
        let expired = {
            let mut state = self.state();
            let mut total = state.idle.len() + state.in_use;
            let mut expired = Vec::new();
            let mut kept = VecDeque::with_capacity(state.idle.len());
            while let Some(idle) = state.idle.pop_front() {
                if total > self.config.min_connections && idle.last_used.elapsed() > self.config.max_idle {
                    total -= 1;
                    expired.push(idle);
                } else {
                    kept.push_back(idle);
                }
            }
            state.idle = kept;
            expired
        };
        let count = expired.len();
        for idle in expired {
            self.discard(idle.id, idle.session, true);
        }
        if count > 0 {
            tracing::debug!(count, "reaped idle connections");
        }
        count
    }

    /// Periodically reap idle sessions until the pool is closed or dropped
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else { break };
                if pool.is_closed() {
                    break;
                }
                pool.reap_idle();
            }
        })
    }

    /// Stop new checkouts and close every idle session
    ///
    /// Waiters fail with `Unavailable`; checked-out sessions are closed when
    /// their guards come back.
    pub fn close_all(&self) {
        let drained: Vec<IdleSession> = {
            let mut state = self.state();
            state.shut = true;
            state.idle.drain(..).collect()
        };
        self.permits.close();
        let count = drained.len();
        for idle in drained {
            self.discard(idle.id, idle.session, true);
        }
        tracing::info!(closed = count, "connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.state().shut
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state();
        PoolStats {
            max: self.config.max_connections,
            in_use: state.in_use,
            idle: state.idle.len(),
            opened: state.opened,
            closed: state.closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::MemoryWarehouse;

    fn pool_with(warehouse: &MemoryWarehouse, config: PoolConfig) -> Arc<ConnectionPool> {
        ConnectionPool::new(Arc::new(warehouse.clone()), config, Telemetry::new())
    }

    fn small(max: usize) -> PoolConfig {
        PoolConfig {
            max_connections: max,
            acquire_timeout: Duration::from_millis(100),
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn test_sessions_are_reused() {
        let warehouse = MemoryWarehouse::new();
        let pool = pool_with(&warehouse, small(2));
        let ctx = RequestContext::new();

        let first = pool.acquire(&ctx).await.unwrap();
        let id = first.id();
        first.release(true);
        let second = pool.acquire(&ctx).await.unwrap();

        assert_eq!(second.id(), id);
        assert_eq!(warehouse.stats().opened, 1);
    }

    #[tokio::test]
    async fn test_unhealthy_release_closes_session() {
        let warehouse = MemoryWarehouse::new();
        let pool = pool_with(&warehouse, small(1));
        let ctx = RequestContext::new();

        pool.acquire(&ctx).await.unwrap().release(false);
        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.closed, 1);
        assert_eq!(warehouse.stats().live(), 0);

        let again = pool.acquire(&ctx).await.unwrap();
        assert_ne!(again.id(), 1);
    }

    #[tokio::test]
    async fn test_dropped_guard_frees_slot() {
        let warehouse = MemoryWarehouse::new();
        let pool = pool_with(&warehouse, small(1));
        let ctx = RequestContext::new();

        drop(pool.acquire(&ctx).await.unwrap());
        assert_eq!(pool.stats().in_use, 0);
        assert_eq!(pool.stats().idle, 0);
        assert!(pool.acquire(&ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let warehouse = MemoryWarehouse::new();
        let pool = pool_with(&warehouse, small(1));
        let ctx = RequestContext::new();

        let _held = pool.acquire(&ctx).await.unwrap();
        match pool.acquire(&ctx).await {
            Err(BridgeError::PoolExhausted { waited_ms }) => assert!(waited_ms >= 100),
            other => panic!("expected exhaustion, got {:?}", other.map(|c| c.id())),
        }
    }

    #[tokio::test]
    async fn test_cancelled_context_never_touches_pool() {
        let warehouse = MemoryWarehouse::new();
        let pool = pool_with(&warehouse, small(1));
        let ctx = RequestContext::new();
        ctx.cancel();

        assert!(matches!(pool.acquire(&ctx).await, Err(BridgeError::Cancelled)));
        assert_eq!(warehouse.stats().opened, 0);
    }

    #[tokio::test]
    async fn test_connect_failure_frees_slot() {
        let warehouse = MemoryWarehouse::new();
        let pool = pool_with(&warehouse, small(1));
        let ctx = RequestContext::new();

        warehouse.set_fail_connect(true);
        assert!(matches!(pool.acquire(&ctx).await, Err(BridgeError::Connection(_))));
        warehouse.set_fail_connect(false);
        assert!(pool.acquire(&ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_warm_up_opens_min_connections() {
        let warehouse = MemoryWarehouse::new();
        let pool = pool_with(
            &warehouse,
            PoolConfig {
                min_connections: 3,
                ..small(5)
            },
        );

        assert_eq!(pool.warm_up().await.unwrap(), 3);
        assert_eq!(pool.warm_up().await.unwrap(), 0);
        assert_eq!(pool.stats().idle, 3);
        assert_eq!(warehouse.stats().opened, 3);
    }

    #[tokio::test]
    async fn test_reaper_keeps_min_connections() {
        let warehouse = MemoryWarehouse::new();
        let pool = pool_with(
            &warehouse,
            PoolConfig {
                min_connections: 1,
                max_idle: Duration::from_millis(10),
                ..small(4)
            },
        );
        let ctx = RequestContext::new();

        let a = pool.acquire(&ctx).await.unwrap();
        let b = pool.acquire(&ctx).await.unwrap();
        let c = pool.acquire(&ctx).await.unwrap();
        a.release(true);
        b.release(true);
        c.release(true);
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(pool.reap_idle(), 2);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_failed_health_check_replaces_session() {
        let warehouse = MemoryWarehouse::new();
        let pool = pool_with(
            &warehouse,
            PoolConfig {
                health_check_after: Some(Duration::ZERO),
                ..small(1)
            },
        );
        let ctx = RequestContext::new();

        let first = pool.acquire(&ctx).await.unwrap();
        let first_id = first.id();
        first.release(true);
        tokio::time::sleep(Duration::from_millis(5)).await;
        warehouse.set_fail_ping(true);

        let second = pool.acquire(&ctx).await.unwrap();
        assert_ne!(second.id(), first_id);
        assert_eq!(warehouse.stats().opened, 2);
    }

    #[tokio::test]
    async fn test_close_all_rejects_new_and_waiting_callers() {
        let warehouse = MemoryWarehouse::new();
        let pool = pool_with(
            &warehouse,
            PoolConfig {
                acquire_timeout: Duration::from_secs(5),
                ..small(1)
            },
        );
        let ctx = RequestContext::new();
        let held = pool.acquire(&ctx).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(&RequestContext::new()).await.map(|c| c.id()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.close_all();

        assert!(matches!(waiter.await.unwrap(), Err(BridgeError::Unavailable(_))));
        assert!(matches!(pool.acquire(&ctx).await, Err(BridgeError::Unavailable(_))));

        held.release(true);
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(warehouse.stats().live(), 0);
    }
}
