//! Telemetry for warehouse-mcp
//!
//! In-process counters for requests, pool pressure and warehouse sessions.
//! Structured log lines are emitted with `tracing` at the call sites; the
//! collector only keeps numbers for the shutdown summary and a short tail of
//! recent events.

use crate::errors::ErrorKind;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Number of recent events retained
pub const EVENT_HISTORY: usize = 256;

/// Telemetry event types
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    // Request events
    RequestStarted {
        request_id: Uuid,
        tool: String,
        timestamp: Instant,
    },
    RequestCompleted {
        request_id: Uuid,
        tool: String,
        duration_ms: u64,
        rows: usize,
        truncated: bool,
        timestamp: Instant,
    },
    RequestFailed {
        request_id: Uuid,
        tool: String,
        kind: ErrorKind,
        duration_ms: u64,
        timestamp: Instant,
    },
    RequestCancelled {
        request_id: Uuid,
        tool: String,
        timestamp: Instant,
    },

    // Pool events
    PoolExhausted {
        waited_ms: u64,
        timestamp: Instant,
    },
    ConnectionOpened {
        conn_id: u64,
        timestamp: Instant,
    },
    ConnectionClosed {
        conn_id: u64,
        healthy: bool,
        timestamp: Instant,
    },
    ConnectionFailed {
        message: String,
        timestamp: Instant,
    },
}

/// Telemetry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetryStats {
    pub requests_started: usize,
    pub requests_completed: usize,
    pub requests_failed: usize,
    pub requests_cancelled: usize,
    pub pool_exhausted: usize,
    pub connections_opened: usize,
    pub connections_closed: usize,
    pub connection_errors: usize,
    pub rows_returned: usize,
    pub truncations: usize,
}

/// Telemetry collector
#[derive(Clone)]
pub struct Telemetry {
    events: Arc<Mutex<VecDeque<TelemetryEvent>>>,
    stats: Arc<Mutex<TelemetryStats>>,
    start_time: Instant,
}

impl Telemetry {
    /// Create a new telemetry collector
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(EVENT_HISTORY))),
            stats: Arc::new(Mutex::new(TelemetryStats::default())),
            start_time: Instant::now(),
        }
    }

    /// Record an event
    pub fn record(&self, event: TelemetryEvent) {
        {
            let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
            match &event {
                TelemetryEvent::RequestStarted { .. } => stats.requests_started += 1,
                TelemetryEvent::RequestCompleted { rows, truncated, .. } => {
                    stats.requests_completed += 1;
                    stats.rows_returned += rows;
                    if *truncated {
                        stats.truncations += 1;
                    }
                }
                TelemetryEvent::RequestFailed { .. } => stats.requests_failed += 1,
                TelemetryEvent::RequestCancelled { .. } => stats.requests_cancelled += 1,
                TelemetryEvent::PoolExhausted { .. } => stats.pool_exhausted += 1,
                TelemetryEvent::ConnectionOpened { .. } => stats.connections_opened += 1,
                TelemetryEvent::ConnectionClosed { .. } => stats.connections_closed += 1,
                TelemetryEvent::ConnectionFailed { .. } => stats.connection_errors += 1,
            }
        }

        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if events.len() == EVENT_HISTORY {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Get current statistics
    pub fn get_stats(&self) -> TelemetryStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Get elapsed time since start
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Get recent events (last n)
    pub fn recent_events(&self, n: usize) -> Vec<TelemetryEvent> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let start = events.len().saturating_sub(n);
        events.iter().skip(start).cloned().collect()
    }

    /// Fraction of finished requests that succeeded
    pub fn success_rate(&self) -> f64 {
        let stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        let total = stats.requests_completed + stats.requests_failed + stats.requests_cancelled;
        if total == 0 {
            1.0
        } else {
            stats.requests_completed as f64 / total as f64
        }
    }

    /// Emit the session summary through `tracing`
    pub fn log_summary(&self) {
        let stats = self.get_stats();
        tracing::info!(
            uptime_secs = self.elapsed().as_secs(),
            requests = stats.requests_started,
            completed = stats.requests_completed,
            failed = stats.requests_failed,
            cancelled = stats.requests_cancelled,
            rows = stats.rows_returned,
            truncated = stats.truncations,
            pool_exhausted = stats.pool_exhausted,
            connections_opened = stats.connections_opened,
            connection_errors = stats.connection_errors,
            success_rate = format!("{:.1}%", self.success_rate() * 100.0),
            "session summary"
        );
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}
