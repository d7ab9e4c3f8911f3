//! Checked-out connection guard

use crate::pool::ConnectionPool;
use crate::warehouse::WarehouseSession;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OwnedSemaphorePermit;

/// Exclusive handle to one pooled warehouse session
///
/// Call [`PooledConnection::release`] when the request is done. Dropping the
/// guard without releasing treats the session as unhealthy.
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    id: u64,
    session: Option<Box<dyn WarehouseSession>>,
    permit: Option<OwnedSemaphorePermit>,
    checked_out_at: Instant,
}

impl PooledConnection {
    pub(crate) fn new(
        pool: Arc<ConnectionPool>,
        id: u64,
        session: Box<dyn WarehouseSession>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            pool,
            id,
            session: Some(session),
            permit: Some(permit),
            checked_out_at: Instant::now(),
        }
    }

    /// Monotonic connection id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// How long this guard has been checked out
    pub fn held_for(&self) -> std::time::Duration {
        self.checked_out_at.elapsed()
    }

    pub fn session(&self) -> &dyn WarehouseSession {
        match &self.session {
            Some(session) => session.as_ref(),
            None => unreachable!("session is present until release"),
        }
    }

    pub fn session_mut(&mut self) -> &mut dyn WarehouseSession {
        match &mut self.session {
            Some(session) => session.as_mut(),
            None => unreachable!("session is present until release"),
        }
    }

    /// Give the session back to the pool
    ///
    /// `healthy == false` closes the session and frees its slot.
    pub fn release(mut self, healthy: bool) {
        self.finish(healthy);
    }

    fn finish(&mut self, healthy: bool) {
        if let Some(session) = self.session.take() {
            self.pool.check_in(self.id, session, healthy);
        }
        // Session is parked before the slot opens so the next waiter finds it.
        self.permit.take();
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.session.is_some() {
            tracing::debug!(conn_id = self.id, "connection guard dropped without release");
            self.finish(false);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("held_for", &self.held_for())
            .finish()
    }
}
