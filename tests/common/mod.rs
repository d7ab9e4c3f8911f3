//! Shared fixtures for integration tests

#![allow(dead_code)]

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use warehouse_mcp::context::RequestContext;
use warehouse_mcp::pool::{ConnectionPool, PoolConfig};
use warehouse_mcp::query::{ExecutorConfig, QueryExecutor};
use warehouse_mcp::telemetry::Telemetry;
use warehouse_mcp::tools::{Dispatcher, SqlGuard, ToolResult};
use warehouse_mcp::warehouse::MemoryWarehouse;

pub const EVENT_ROWS: usize = 50_000;

/// `public` (created first) and `analytics` with `events` and `users`
pub fn sample_warehouse() -> MemoryWarehouse {
    MemoryWarehouse::new()
        .with_table(
            "public",
            "accounts",
            &[("id", "integer", false), ("name", "character varying(64)", false)],
            3,
        )
        .with_table(
            "analytics",
            "users",
            &[("id", "bigint", false), ("email", "character varying(256)", false)],
            12,
        )
        .with_table(
            "analytics",
            "events",
            &[
                ("id", "bigint", false),
                ("ts", "timestamp without time zone", false),
                ("payload", "character varying", true),
            ],
            EVENT_ROWS,
        )
}

pub struct Harness {
    pub warehouse: MemoryWarehouse,
    pub telemetry: Telemetry,
    pub pool: Arc<ConnectionPool>,
    pub dispatcher: Arc<Dispatcher>,
}

pub fn pool_config(max_connections: usize) -> PoolConfig {
    PoolConfig {
        max_connections,
        min_connections: 0,
        acquire_timeout: Duration::from_secs(5),
        max_idle: Duration::from_secs(300),
        health_check_after: None,
    }
}

pub fn executor_config() -> ExecutorConfig {
    ExecutorConfig {
        fetch_batch_size: 500,
        max_rows: 10_000,
        default_statement_timeout: Some(Duration::from_secs(30)),
    }
}

pub fn harness_with(warehouse: MemoryWarehouse, pool: PoolConfig, executor: ExecutorConfig) -> Harness {
    let telemetry = Telemetry::new();
    let pool = ConnectionPool::new(Arc::new(warehouse.clone()), pool, telemetry.clone());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&pool),
        QueryExecutor::new(executor),
        SqlGuard::new(false),
        telemetry.clone(),
    ));
    Harness {
        warehouse,
        telemetry,
        pool,
        dispatcher,
    }
}

pub fn harness() -> Harness {
    harness_with(sample_warehouse(), pool_config(4), executor_config())
}

impl Harness {
    pub async fn call(&self, tool: &str, arguments: Value) -> ToolResult {
        self.dispatcher
            .dispatch(tool, &arguments, &RequestContext::new())
            .await
    }

    pub async fn call_with(&self, tool: &str, arguments: Value, ctx: &RequestContext) -> ToolResult {
        self.dispatcher.dispatch(tool, &arguments, ctx).await
    }
}

/// Success body, panicking with the error envelope otherwise
pub fn ok_json(result: &ToolResult) -> Value {
    assert!(!result.is_error(), "unexpected tool error: {}", result.to_json());
    result.to_json()
}

pub fn error_code(result: &ToolResult) -> String {
    assert!(result.is_error(), "expected an error, got {}", result.to_json());
    result.to_json()["kind"].as_str().unwrap_or_default().to_string()
}
