//! Warehouse connectivity
//!
//! The pool and executor talk to the warehouse only through the traits in
//! this module:
//! - [`Connector`] opens sessions
//! - [`WarehouseSession`] is one exclusive server session
//! - [`RowCursor`] is a forward-only portal pulled in batches
//! - [`UpstreamCancel`] asks the server to abort the running statement
//!
//! `postgres` implements them over tokio-postgres; `memory` is an in-process
//! warehouse used by the test-suite.

pub mod memory;
pub mod numeric;
pub mod postgres;
pub mod types;

pub use memory::{MemoryStats, MemoryWarehouse, ScriptedQuery};
pub use postgres::PgConnector;
pub use types::{CellValue, ColumnDescriptor, QueryParam, Row};

use crate::errors::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Statement submitted to a session
#[derive(Debug, Clone, Copy)]
pub struct CursorRequest<'a> {
    /// SQL text, parameters as `$1..$n`
    pub sql: &'a str,

    /// Bound parameters in order
    pub params: &'a [QueryParam],

    /// Server-side statement timeout
    pub statement_timeout: Option<Duration>,
}

/// Opens warehouse sessions
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open one new session
    async fn connect(&self) -> Result<Box<dyn WarehouseSession>>;

    /// Target description for logs (never includes credentials)
    fn target(&self) -> String;
}

/// One exclusive warehouse session
#[async_trait]
pub trait WarehouseSession: Send {
    /// Prepare, bind and open a portal for `request`
    async fn open_cursor<'s>(
        &'s mut self,
        request: CursorRequest<'_>,
    ) -> Result<Box<dyn RowCursor + 's>>;

    /// Handle that can abort this session's running statement from elsewhere
    fn cancel_handle(&self) -> Box<dyn UpstreamCancel>;

    /// Cheap liveness round-trip
    async fn ping(&mut self) -> Result<()>;

    /// Whether the underlying transport is gone
    fn is_closed(&self) -> bool;
}

/// Forward-only result cursor
#[async_trait]
pub trait RowCursor: Send {
    /// Column metadata, available before the first fetch
    fn columns(&self) -> &[ColumnDescriptor];

    /// Fetch up to `max_rows` rows; fewer than requested means exhausted
    async fn fetch(&mut self, max_rows: usize) -> Result<Vec<Row>>;

    /// Close the portal and end the statement's transaction
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Best-effort server-side cancel
#[async_trait]
pub trait UpstreamCancel: Send + Sync {
    async fn cancel(&self) -> Result<()>;
}
