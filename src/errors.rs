//! Error types for warehouse-mcp
//!
//! Every failure inside the pool, executor and catalog is classified into
//! exactly one [`BridgeError`] variant. The dispatcher turns those into the
//! caller-facing [`ToolError`] envelope; nothing else crosses the protocol
//! boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Main error type for the warehouse bridge
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Malformed tool call; the warehouse was never contacted
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No connection became available within the acquire timeout
    #[error("Connection pool exhausted: no connection available within {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    /// Warehouse unreachable or session dropped
    #[error("Connection error: {0}")]
    Connection(String),

    /// Pool closed or server draining; this process will not serve the call
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Warehouse rejected the statement
    #[error("Query error: {message}")]
    Query {
        message: String,
        sqlstate: Option<String>,
    },

    /// Statement or fetch deadline exceeded
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Caller withdrew the request
    #[error("Request cancelled")]
    Cancelled,

    /// Startup configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Anything without a better classification
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Stable classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            BridgeError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            BridgeError::Connection(_) | BridgeError::Unavailable(_) => ErrorKind::ConnectionError,
            BridgeError::Query { .. } => ErrorKind::QueryError,
            BridgeError::Timeout { .. } => ErrorKind::TimeoutError,
            BridgeError::Cancelled => ErrorKind::Cancelled,
            BridgeError::Config(_) | BridgeError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Shorthand for a query error without SQLSTATE
    pub fn query(message: impl Into<String>) -> Self {
        BridgeError::Query {
            message: message.into(),
            sqlstate: None,
        }
    }

    /// Whether the session that produced this error may be reused
    pub fn leaves_session_healthy(&self) -> bool {
        matches!(self, BridgeError::InvalidArgument(_))
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Internal(format!("serialization failed: {}", err))
    }
}

/// Caller-facing error vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    PoolExhausted,
    ConnectionError,
    QueryError,
    TimeoutError,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Wire code
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::ConnectionError => "connection_error",
            ErrorKind::QueryError => "query_error",
            ErrorKind::TimeoutError => "timeout_error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether resubmitting the same call unchanged may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::PoolExhausted | ErrorKind::ConnectionError | ErrorKind::TimeoutError
        )
    }

    /// Remediation hint attached to the envelope
    pub fn default_hint(&self) -> Option<&'static str> {
        match self {
            ErrorKind::InvalidArgument => Some("check the tool's input schema"),
            ErrorKind::PoolExhausted => {
                Some("retry after in-flight queries complete or raise max_connections")
            }
            ErrorKind::ConnectionError => Some("the warehouse session was lost; retry the call"),
            ErrorKind::QueryError => Some("fix the SQL statement before retrying"),
            ErrorKind::TimeoutError => {
                Some("narrow the query, add a LIMIT, or raise timeout_ms")
            }
            ErrorKind::Cancelled | ErrorKind::Internal => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

const UNAVAILABLE_HINT: &str = "the server is stopping; retry once it has been restarted";

/// Structured error returned to protocol callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl From<&BridgeError> for ToolError {
    fn from(err: &BridgeError) -> Self {
        let kind = err.kind();
        let message = match err {
            // Config problems are operator-facing; callers only see the kind
            BridgeError::Config(_) => "server misconfiguration".to_string(),
            BridgeError::Query { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self {
            kind,
            message,
            retryable: kind.is_retryable(),
            hint: match err {
                BridgeError::Unavailable(_) => Some(UNAVAILABLE_HINT.to_string()),
                _ => kind.default_hint().map(str::to_string),
            },
        }
    }
}

impl From<BridgeError> for ToolError {
    fn from(err: BridgeError) -> Self {
        ToolError::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BridgeError::PoolExhausted { waited_ms: 250 };
        assert!(err.to_string().contains("250"));
        assert_eq!(err.kind(), ErrorKind::PoolExhausted);
    }

    #[test]
    fn test_every_variant_has_one_kind() {
        let cases = [
            (BridgeError::InvalidArgument("x".into()), ErrorKind::InvalidArgument),
            (BridgeError::PoolExhausted { waited_ms: 1 }, ErrorKind::PoolExhausted),
            (BridgeError::Connection("x".into()), ErrorKind::ConnectionError),
            (BridgeError::Unavailable("x".into()), ErrorKind::ConnectionError),
            (BridgeError::query("x"), ErrorKind::QueryError),
            (BridgeError::Timeout { duration_ms: 1 }, ErrorKind::TimeoutError),
            (BridgeError::Cancelled, ErrorKind::Cancelled),
            (BridgeError::Config("x".into()), ErrorKind::Internal),
            (BridgeError::Internal("x".into()), ErrorKind::Internal),
        ];
        for (err, kind) in cases {
            assert_eq!(err.kind(), kind);
        }
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::PoolExhausted.is_retryable());
        assert!(ErrorKind::ConnectionError.is_retryable());
        assert!(ErrorKind::TimeoutError.is_retryable());
        assert!(!ErrorKind::QueryError.is_retryable());
        assert!(!ErrorKind::InvalidArgument.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn test_query_message_passes_through() {
        let err = BridgeError::Query {
            message: "syntax error at or near \"selec\"".to_string(),
            sqlstate: Some("42601".to_string()),
        };
        let envelope = ToolError::from(&err);
        assert_eq!(envelope.kind, ErrorKind::QueryError);
        assert_eq!(envelope.message, "syntax error at or near \"selec\"");
        assert!(!envelope.retryable);
    }

    #[test]
    fn test_config_details_are_not_exposed() {
        let envelope = ToolError::from(BridgeError::Config("password=hunter2".into()));
        assert_eq!(envelope.kind, ErrorKind::Internal);
        assert!(!envelope.message.contains("hunter2"));
    }

    #[test]
    fn test_unavailable_has_its_own_hint() {
        let lost = ToolError::from(BridgeError::Connection("gone".into()));
        let stopping = ToolError::from(BridgeError::Unavailable("server is shutting down".into()));

        assert_eq!(stopping.kind, ErrorKind::ConnectionError);
        assert_eq!(stopping.message, "Service unavailable: server is shutting down");
        assert_ne!(stopping.hint, lost.hint);
        assert!(stopping.hint.unwrap().contains("restarted"));
    }

    #[test]
    fn test_kind_serializes_as_code() {
        let json = serde_json::to_string(&ErrorKind::PoolExhausted).unwrap();
        assert_eq!(json, "\"pool_exhausted\"");
    }
}
