//! Tool dispatcher
//!
//! Routes a validated [`ToolCall`] to the executor or the catalog, owns the
//! per-request state machine and maps every outcome to a [`ToolResult`].
//! The pool and the lifecycle counters are the only shared state.

use crate::catalog::SchemaIntrospector;
use crate::context::RequestContext;
use crate::errors::{BridgeError, Result};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::query::{QueryExecutor, QueryRequest};
use crate::telemetry::{Telemetry, TelemetryEvent};
use crate::tools::guard::SqlGuard;
use crate::tools::registry::ToolRegistry;
use crate::tools::state::{RequestEvent, RequestState};
use crate::tools::types::{SchemaList, TableList, ToolCall, ToolPayload, ToolResult, ToolSchema};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::Instrument;

/// Protocol-facing router for tool invocations
pub struct Dispatcher {
    pool: Arc<ConnectionPool>,
    executor: QueryExecutor,
    introspector: SchemaIntrospector,
    registry: ToolRegistry,
    guard: SqlGuard,
    telemetry: Telemetry,
    accepting: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
}

/// In-flight slot reserved by [`Dispatcher::admit`]
///
/// Shutdown waits for every outstanding admission, including calls whose
/// task has not started running yet. The slot is freed on drop.
pub struct Admission {
    dispatcher: Arc<Dispatcher>,
}

impl Admission {
    /// Serve the admitted call, then free its slot
    pub async fn dispatch(self, name: &str, arguments: &Value, ctx: &RequestContext) -> ToolResult {
        let result = self.dispatcher.serve(name, arguments, ctx).await;
        drop(self);
        result
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if self.dispatcher.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.dispatcher.drained.notify_waiters();
        }
    }
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission").finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        pool: Arc<ConnectionPool>,
        executor: QueryExecutor,
        guard: SqlGuard,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            pool,
            introspector: SchemaIntrospector::new(executor.clone()),
            executor,
            registry: ToolRegistry::new(),
            guard,
            telemetry,
            accepting: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Calls currently being served
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Name, description and input schema of every tool
    pub fn tool_definitions(&self) -> Vec<&ToolSchema> {
        self.registry.schemas()
    }

    /// Reserve an in-flight slot for a call; `None` once shutdown has begun
    pub fn admit(self: &Arc<Self>) -> Option<Admission> {
        // Counted before the check so a concurrent shutdown either sees the
        // slot or makes this call fail the check.
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let admission = Admission {
            dispatcher: Arc::clone(self),
        };
        if self.is_accepting() {
            Some(admission)
        } else {
            None
        }
    }

    /// Serve one tool invocation
    pub async fn dispatch(self: &Arc<Self>, name: &str, arguments: &Value, ctx: &RequestContext) -> ToolResult {
        match self.admit() {
            Some(admission) => admission.dispatch(name, arguments, ctx).await,
            None => self.reject(name, ctx),
        }
    }

    /// Answer a call that arrived after shutdown began
    pub fn reject(&self, name: &str, ctx: &RequestContext) -> ToolResult {
        let _span = tracing::info_span!("tool_call", request_id = %ctx.id(), tool = name).entered();
        let started = self.record_start(name, ctx);
        let err = BridgeError::Unavailable("server is shutting down".to_string());
        self.finish(name, RequestState::Failed, Err(err), started, ctx)
    }

    fn record_start(&self, name: &str, ctx: &RequestContext) -> Instant {
        let started = Instant::now();
        self.telemetry.record(TelemetryEvent::RequestStarted {
            request_id: ctx.id(),
            tool: name.to_string(),
            timestamp: started,
        });
        tracing::debug!("request started");
        started
    }

    async fn serve(&self, name: &str, arguments: &Value, ctx: &RequestContext) -> ToolResult {
        let span = tracing::info_span!("tool_call", request_id = %ctx.id(), tool = name);
        async {
            let started = self.record_start(name, ctx);
            let mut state = RequestState::Received;
            let outcome = self.run(&mut state, name, arguments, ctx).await;
            self.finish(name, state, outcome, started, ctx)
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        state: &mut RequestState,
        name: &str,
        arguments: &Value,
        ctx: &RequestContext,
    ) -> Result<ToolPayload> {
        let validated = ToolCall::from_arguments(name, arguments).and_then(|call| {
            if let ToolCall::ExecuteQuery(args) = &call {
                self.guard.check(&args.sql)?;
            }
            Ok(call)
        });
        let call = match validated {
            Ok(call) => call,
            Err(err) => {
                *state = state.transition(RequestEvent::Reject)?;
                return Err(err);
            }
        };
        *state = state.transition(RequestEvent::Validate)?;

        let mut conn = match self.pool.acquire(ctx).await {
            Ok(conn) => conn,
            Err(err) => {
                *state = state.transition(event_for(&err))?;
                return Err(err);
            }
        };
        *state = state.transition(RequestEvent::Execute)?;
        tracing::debug!(conn_id = conn.id(), "connection acquired");

        let result = self.execute(&call, &mut conn, ctx).await;
        conn.release(result.is_ok());

        *state = state.transition(match &result {
            Ok(_) => RequestEvent::Succeed,
            Err(err) => event_for(err),
        })?;
        result
    }

    async fn execute(
        &self,
        call: &ToolCall,
        conn: &mut PooledConnection,
        ctx: &RequestContext,
    ) -> Result<ToolPayload> {
        match call {
            ToolCall::ExecuteQuery(args) => {
                let mut request = QueryRequest::new(args.sql.as_str()).with_params(args.params.clone());
                if let Some(limit) = args.limit {
                    request = request.with_row_limit(limit);
                }
                if let Some(timeout) = args.timeout {
                    request = request.with_statement_timeout(timeout);
                }
                let output = self.executor.execute(conn, &request, ctx).await?.collect().await?;
                Ok(ToolPayload::Query(output))
            }
            ToolCall::ListSchemas => {
                let schemas = self.introspector.list_schemas(conn, ctx).await?;
                Ok(ToolPayload::Schemas(SchemaList {
                    schemas: schemas.into_iter().map(|schema| schema.name).collect(),
                }))
            }
            ToolCall::ListTables { schema } => {
                let tables = self.introspector.list_tables(conn, schema, ctx).await?;
                Ok(ToolPayload::Tables(TableList {
                    schema: schema.clone(),
                    tables,
                }))
            }
            ToolCall::DescribeTable { schema, table } => {
                let description = self.introspector.describe_table(conn, schema, table, ctx).await?;
                Ok(ToolPayload::Table(description))
            }
        }
    }

    fn finish(
        &self,
        name: &str,
        state: RequestState,
        outcome: Result<ToolPayload>,
        started: Instant,
        ctx: &RequestContext,
    ) -> ToolResult {
        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(payload) => {
                let rows = payload.row_count();
                let truncated = payload.truncated();
                tracing::info!(elapsed_ms = duration_ms, rows, truncated, "request completed");
                self.telemetry.record(TelemetryEvent::RequestCompleted {
                    request_id: ctx.id(),
                    tool: name.to_string(),
                    duration_ms,
                    rows,
                    truncated,
                    timestamp: Instant::now(),
                });
                ToolResult::Success(payload)
            }
            Err(err) if state == RequestState::Cancelled => {
                tracing::info!(elapsed_ms = duration_ms, "request cancelled");
                self.telemetry.record(TelemetryEvent::RequestCancelled {
                    request_id: ctx.id(),
                    tool: name.to_string(),
                    timestamp: Instant::now(),
                });
                ToolResult::from(err)
            }
            Err(err) => {
                let kind = err.kind();
                tracing::warn!(elapsed_ms = duration_ms, kind = %kind, error = %err, "request failed");
                self.telemetry.record(TelemetryEvent::RequestFailed {
                    request_id: ctx.id(),
                    tool: name.to_string(),
                    kind,
                    duration_ms,
                    timestamp: Instant::now(),
                });
                ToolResult::from(err)
            }
        }
    }

    /// Stop accepting calls, wait up to `grace` for in-flight ones, close the pool
    ///
    /// Returns whether every in-flight call finished within `grace`.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.accepting.store(false, Ordering::SeqCst);
        let pending = self.in_flight();
        tracing::info!(in_flight = pending, grace_ms = grace.as_millis() as u64, "shutting down dispatcher");

        let drained = tokio::time::timeout(grace, async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.in_flight() == 0 {
                    break;
                }
                notified.await;
            }
        })
        .await
        .is_ok();

        if !drained {
            tracing::warn!(in_flight = self.in_flight(), "grace period elapsed with calls still running");
        }
        self.pool.close_all();
        drained
    }
}

fn event_for(err: &BridgeError) -> RequestEvent {
    match err {
        BridgeError::Cancelled => RequestEvent::Cancel,
        _ => RequestEvent::Fail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::pool::PoolConfig;
    use crate::warehouse::{MemoryWarehouse, ScriptedQuery};
    use serde_json::json;

    fn dispatcher(warehouse: &MemoryWarehouse, read_only: bool) -> Arc<Dispatcher> {
        let telemetry = Telemetry::new();
        let pool = ConnectionPool::new(Arc::new(warehouse.clone()), PoolConfig::default(), telemetry.clone());
        Arc::new(Dispatcher::new(pool, QueryExecutor::default(), SqlGuard::new(read_only), telemetry))
    }

    fn kind(result: &ToolResult) -> Option<ErrorKind> {
        result.error().map(|err| err.kind)
    }

    #[tokio::test]
    async fn test_invalid_arguments_never_touch_pool() {
        let warehouse = MemoryWarehouse::new();
        let dispatcher = dispatcher(&warehouse, false);

        let result = dispatcher
            .dispatch("list_tables", &json!({}), &RequestContext::new())
            .await;

        assert_eq!(kind(&result), Some(ErrorKind::InvalidArgument));
        assert_eq!(warehouse.stats().opened, 0);
        assert_eq!(dispatcher.telemetry().get_stats().requests_failed, 1);
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let warehouse = MemoryWarehouse::new();
        let dispatcher = dispatcher(&warehouse, true);

        let result = dispatcher
            .dispatch("execute_query", &json!({"sql": "delete from users"}), &RequestContext::new())
            .await;

        assert_eq!(kind(&result), Some(ErrorKind::InvalidArgument));
        assert_eq!(warehouse.stats().opened, 0);
    }

    #[tokio::test]
    async fn test_query_error_discards_connection() {
        let warehouse = MemoryWarehouse::new();
        let dispatcher = dispatcher(&warehouse, false);

        let result = dispatcher
            .dispatch("execute_query", &json!({"sql": "selec 1"}), &RequestContext::new())
            .await;

        assert_eq!(kind(&result), Some(ErrorKind::QueryError));
        assert_eq!(dispatcher.pool().stats().idle, 0);
        assert_eq!(warehouse.stats().live(), 0);
    }

    #[tokio::test]
    async fn test_success_returns_connection() {
        let warehouse = MemoryWarehouse::new().with_schema("public");
        let dispatcher = dispatcher(&warehouse, false);

        let result = dispatcher
            .dispatch("list_schemas", &Value::Null, &RequestContext::new())
            .await;

        assert_eq!(result.to_json(), json!({"schemas": ["public"]}));
        assert_eq!(dispatcher.pool().stats().idle, 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_calls() {
        let warehouse = MemoryWarehouse::new();
        let dispatcher = dispatcher(&warehouse, false);

        assert!(dispatcher.shutdown(Duration::from_millis(10)).await);
        let result = dispatcher
            .dispatch("list_schemas", &Value::Null, &RequestContext::new())
            .await;

        assert_eq!(kind(&result), Some(ErrorKind::ConnectionError));
        assert!(result.error().unwrap().message.contains("shutting down"));
        assert!(result.error().unwrap().hint.as_deref().unwrap().contains("restarted"));
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_admitted_call_survives_shutdown() {
        let warehouse = MemoryWarehouse::new().with_schema("public");
        let dispatcher = dispatcher(&warehouse, false);
        let admission = dispatcher.admit().unwrap();

        let shutdown = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.shutdown(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!dispatcher.is_accepting());
        assert!(dispatcher.admit().is_none());
        assert!(!shutdown.is_finished());

        let result = admission
            .dispatch("list_schemas", &Value::Null, &RequestContext::new())
            .await;
        assert_eq!(result.to_json(), json!({"schemas": ["public"]}));
        assert!(shutdown.await.unwrap());
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_call() {
        let warehouse = MemoryWarehouse::new();
        warehouse.script(
            "select n from slow",
            ScriptedQuery::sequence(3).with_fetch_delay(Duration::from_millis(100)),
        );
        let dispatcher = dispatcher(&warehouse, false);

        let call = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .dispatch("execute_query", &json!({"sql": "select n from slow"}), &RequestContext::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(dispatcher.shutdown(Duration::from_secs(5)).await);
        let result = call.await.unwrap();
        assert!(!result.is_error());
        assert!(dispatcher.pool().is_closed());
    }

    #[tokio::test]
    async fn test_cancelled_request_state() {
        let warehouse = MemoryWarehouse::new();
        let dispatcher = dispatcher(&warehouse, false);
        let ctx = RequestContext::new();
        ctx.cancel();

        let result = dispatcher.dispatch("list_schemas", &Value::Null, &ctx).await;
        assert_eq!(kind(&result), Some(ErrorKind::Cancelled));
        assert_eq!(dispatcher.telemetry().get_stats().requests_cancelled, 1);
    }
}
