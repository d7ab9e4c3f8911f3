//! Tool layer
//!
//! Provides the protocol-facing half of the bridge:
//! - 4 tools (execute_query, list_schemas, list_tables, describe_table)
//! - Argument validation into a closed [`ToolCall`] enum
//! - Read-only statement guard
//! - Per-request state machine
//! - Dispatcher routing calls to the executor and the catalog

pub mod dispatcher;
pub mod guard;
pub mod registry;
pub mod state;
pub mod types;

// Re-export commonly used types
pub use dispatcher::{Admission, Dispatcher};
pub use guard::SqlGuard;
pub use registry::ToolRegistry;
pub use state::{RequestEvent, RequestState};
pub use types::{ExecuteQueryArgs, ToolCall, ToolName, ToolPayload, ToolResult, ToolSchema};
