//! Per-invocation request context
//!
//! One [`RequestContext`] is created by the transport for each tool call and
//! handed by reference to the pool, executor and catalog. It never outlives
//! the invocation.

use crate::context::cancel::CancelToken;
use crate::errors::{BridgeError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Correlation id, cancellation signal and deadline for one tool call
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlation identifier for diagnostics
    id: Uuid,

    /// Shared cancellation signal
    cancel: CancelToken,

    /// Absolute deadline, if any
    deadline: Option<Instant>,
}

impl RequestContext {
    /// Create context with a fresh id and no deadline
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            cancel: CancelToken::new(),
            deadline: None,
        }
    }

    /// Attach an externally owned cancellation token
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Set deadline relative to now
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Set absolute deadline
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Time left before the deadline; `None` means unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Earlier of the context deadline and `now + timeout`
    pub fn effective_deadline(&self, timeout: Option<Duration>) -> Option<Instant> {
        let local = timeout.map(|limit| Instant::now() + limit);
        match (self.deadline, local) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fail fast when cancelled or past the deadline
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(BridgeError::Timeout { duration_ms: 0 });
            }
        }
        Ok(())
    }

    /// Run `fut` until it completes, the token fires, or `deadline` passes
    ///
    /// Cancellation wins over a simultaneously elapsed deadline.
    pub async fn guard<F, T>(&self, deadline: Option<Instant>, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let sleep = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BridgeError::Cancelled),
            _ = sleep => Err(BridgeError::Timeout {
                duration_ms: started.elapsed().as_millis() as u64,
            }),
            result = fut => result,
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
