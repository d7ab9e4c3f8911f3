//! Per-request state machine
//!
//! Valid transitions:
//! 1. Received  → Validated (on: Validate)
//! 2. Received  → Failed    (on: Reject)
//! 3. Validated → Executing (on: Execute)
//! 4. Executing → Completed (on: Succeed)
//! 5. Executing → Failed    (on: Fail)
//! 6. Received | Validated | Executing → Cancelled (on: Cancel)
//! 7. Validated → Failed    (on: Fail)
//!
//! Terminal states accept no further events.

use crate::errors::{BridgeError, Result};
use serde::{Deserialize, Serialize};

/// Lifecycle of one tool invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestState {
    /// Call accepted from the transport
    Received,

    /// Arguments passed validation
    Validated,

    /// Holding a connection, talking to the warehouse
    Executing,

    /// Result produced (terminal)
    Completed,

    /// Error produced (terminal)
    Failed,

    /// Withdrawn by the caller (terminal)
    Cancelled,
}

/// Events that drive [`RequestState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestEvent {
    Validate,
    Reject,
    Execute,
    Succeed,
    Fail,
    Cancel,
}

impl RequestState {
    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Cancelled
        )
    }

    /// Attempt state transition with validation
    pub fn transition(&self, event: RequestEvent) -> Result<RequestState> {
        use RequestEvent::*;
        use RequestState::*;

        let next = match (self, event) {
            (Received, Validate) => Validated,
            (Received, Reject) => Failed,
            (Validated, Execute) => Executing,
            (Validated, Fail) => Failed,
            (Executing, Succeed) => Completed,
            (Executing, Fail) => Failed,
            (Received | Validated | Executing, Cancel) => Cancelled,
            (from, event) => {
                return Err(BridgeError::Internal(format!(
                    "invalid request transition from {:?} on {:?}",
                    from, event
                )))
            }
        };

        Ok(next)
    }

    /// Get all valid events from this state
    pub fn valid_events(&self) -> Vec<RequestEvent> {
        use RequestEvent::*;
        use RequestState::*;

        match self {
            Received => vec![Validate, Reject, Cancel],
            Validated => vec![Execute, Fail, Cancel],
            Executing => vec![Succeed, Fail, Cancel],
            Completed | Failed | Cancelled => vec![],
        }
    }
}
