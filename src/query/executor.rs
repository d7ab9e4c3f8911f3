//! Statement execution with deadlines and row caps

use crate::context::RequestContext;
use crate::errors::{BridgeError, Result};
use crate::pool::PooledConnection;
use crate::query::result::ResultSet;
use crate::warehouse::{CursorRequest, QueryParam, UpstreamCancel};
use std::time::Duration;
use tokio::time::Instant;

/// SQLSTATE reported when a statement is cancelled server-side
pub const QUERY_CANCELED: &str = "57014";

/// Upper bound on a best-effort upstream cancel round-trip
pub const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// One statement with its bound parameters
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    sql: String,
    params: Vec<QueryParam>,
    row_limit: Option<usize>,
    statement_timeout: Option<Duration>,
}

impl QueryRequest {
    /// Create request for `sql` with no parameters
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            row_limit: None,
            statement_timeout: None,
        }
    }

    /// Bind parameters `$1..$n` in order
    pub fn with_params(mut self, params: Vec<QueryParam>) -> Self {
        self.params = params;
        self
    }

    pub fn with_row_limit(mut self, limit: usize) -> Self {
        self.row_limit = Some(limit);
        self
    }

    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[QueryParam] {
        &self.params
    }

    pub fn row_limit(&self) -> Option<usize> {
        self.row_limit
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout
    }
}

/// Executor limits
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Rows pulled from the portal per round-trip
    pub fetch_batch_size: usize,

    /// Hard cap on rows returned by one statement
    pub max_rows: usize,

    /// Statement timeout applied when the request carries none
    pub default_statement_timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            fetch_batch_size: 500,
            max_rows: 10_000,
            default_statement_timeout: Some(Duration::from_secs(120)),
        }
    }
}

/// Runs statements on pooled connections
#[derive(Debug, Clone, Default)]
pub struct QueryExecutor {
    config: ExecutorConfig,
}

impl QueryExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config: ExecutorConfig {
                fetch_batch_size: config.fetch_batch_size.max(1),
                ..config
            },
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Open `request` on `conn` and return its lazily fetched result
    ///
    /// Nothing but column metadata is read here; rows arrive through
    /// [`ResultSet::next_batch`]. Any error leaves the connection unusable and
    /// the caller must release it unhealthy.
    pub async fn execute<'c>(
        &self,
        conn: &'c mut PooledConnection,
        request: &QueryRequest,
        ctx: &RequestContext,
    ) -> Result<ResultSet<'c>> {
        ctx.check()?;

        let statement_timeout = request
            .statement_timeout()
            .or(self.config.default_statement_timeout);
        let deadline = ctx.effective_deadline(statement_timeout);
        let row_cap = request
            .row_limit()
            .map_or(self.config.max_rows, |limit| limit.min(self.config.max_rows));

        let conn_id = conn.id();
        let cancel = conn.session().cancel_handle();
        tracing::debug!(
            request_id = %ctx.id(),
            conn_id,
            params = request.params().len(),
            row_cap,
            "executing statement"
        );

        let opened = ctx
            .guard(
                deadline,
                conn.session_mut().open_cursor(CursorRequest {
                    sql: request.sql(),
                    params: request.params(),
                    statement_timeout,
                }),
            )
            .await;

        match opened {
            Ok(cursor) => Ok(ResultSet::new(
                cursor,
                cancel,
                ctx.clone(),
                deadline,
                statement_timeout,
                row_cap,
                self.config.fetch_batch_size,
            )),
            Err(err) => {
                let err = classify(err, ctx, deadline, statement_timeout);
                if matches!(err, BridgeError::Cancelled | BridgeError::Timeout { .. }) {
                    cancel_upstream(cancel.as_ref(), ctx).await;
                }
                Err(err)
            }
        }
    }
}

/// Ask the warehouse to abort the running statement, bounded by [`CANCEL_GRACE`]
pub(crate) async fn cancel_upstream(cancel: &dyn UpstreamCancel, ctx: &RequestContext) {
    match tokio::time::timeout(CANCEL_GRACE, cancel.cancel()).await {
        Ok(Ok(())) => tracing::debug!(request_id = %ctx.id(), "sent upstream cancel"),
        Ok(Err(err)) => tracing::warn!(request_id = %ctx.id(), error = %err, "upstream cancel failed"),
        Err(_) => tracing::warn!(request_id = %ctx.id(), "upstream cancel timed out"),
    }
}

/// Reclassify a server-side cancellation by what caused it
pub(crate) fn classify(
    err: BridgeError,
    ctx: &RequestContext,
    deadline: Option<Instant>,
    statement_timeout: Option<Duration>,
) -> BridgeError {
    let server_cancelled = matches!(
        &err,
        BridgeError::Query { sqlstate: Some(state), .. } if state == QUERY_CANCELED
    );
    if !server_cancelled {
        return err;
    }
    if ctx.is_cancelled() {
        return BridgeError::Cancelled;
    }
    if deadline.is_some_and(|at| Instant::now() >= at) {
        return BridgeError::Timeout {
            duration_ms: statement_timeout.map_or(0, |t| t.as_millis() as u64),
        };
    }
    match statement_timeout {
        Some(timeout) => BridgeError::Timeout {
            duration_ms: timeout.as_millis() as u64,
        },
        None => err,
    }
}
