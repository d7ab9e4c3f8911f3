//! warehouse-mcp - Data warehouse bridge for agents
//!
//! Exposes a PostgreSQL-protocol warehouse (Amazon Redshift) as MCP tools
//! over stdio.
//!
//! # Architecture
//!
//! - **warehouse**: Connector/session/cursor traits, tokio-postgres backend, in-process test warehouse
//! - **pool**: Bounded FIFO connection pool
//! - **query**: Statement execution with row caps, deadlines and batch fetching
//! - **catalog**: Schema, table and column introspection
//! - **tools**: Argument validation, request state machine, dispatcher
//! - **server**: MCP JSON-RPC transport
//! - **context**: Per-request cancellation, deadline and correlation id

pub mod catalog;
pub mod cli;
pub mod context;
pub mod errors;
pub mod pool;
pub mod query;
pub mod server;
pub mod telemetry;
pub mod tools;
pub mod warehouse;

// Re-export commonly used types
pub use errors::{BridgeError, ErrorKind, Result, ToolError};
