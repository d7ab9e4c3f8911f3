//! MCP stdio server
//!
//! Reads newline-delimited JSON-RPC from an `AsyncBufRead`, answers on an
//! `AsyncWrite`. Every `tools/call` runs on its own task, so responses are
//! written in completion order; `notifications/cancelled` trips the matching
//! call's cancellation token. EOF (or the shutdown signal) drains in-flight
//! calls through [`Dispatcher::shutdown`].

pub mod protocol;

use crate::context::{CancelToken, RequestContext};
use crate::tools::Dispatcher;
use protocol::{
    initialize_result, tool_call_result, tools_list_result, CallToolParams, JsonRpcRequest,
    JsonRpcResponse, ServerInfo, INVALID_PARAMS, INVALID_REQUEST, JSONRPC_VERSION,
    METHOD_NOT_FOUND, PARSE_ERROR,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Server behavior knobs
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Deadline attached to every tool call
    pub request_timeout: Option<Duration>,

    /// How long shutdown waits for in-flight calls
    pub shutdown_grace: Duration,

    pub info: ServerInfo,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            request_timeout: None,
            shutdown_grace: Duration::from_secs(10),
            info: ServerInfo::default(),
        }
    }
}

/// What happened during one `serve` run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeSummary {
    pub messages: usize,
    pub tool_calls: usize,
    pub drained: bool,
}

type InFlightCalls = Arc<Mutex<HashMap<String, CancelToken>>>;

/// MCP server over a line-oriented byte stream
pub struct McpServer {
    dispatcher: Arc<Dispatcher>,
    options: ServerOptions,
    in_flight: InFlightCalls,
}

fn call_key(id: &Value) -> String {
    id.to_string()
}

impl McpServer {
    pub fn new(dispatcher: Arc<Dispatcher>, options: ServerOptions) -> Self {
        Self {
            dispatcher,
            options,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Serve until EOF on `reader`
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> std::io::Result<ServeSummary>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.serve_until(reader, writer, std::future::pending::<()>()).await
    }

    /// Serve until EOF on `reader` or until `signal` resolves
    pub async fn serve_until<R, W, S>(&self, reader: R, writer: W, signal: S) -> std::io::Result<ServeSummary>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
        S: Future<Output = ()>,
    {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(write_lines(writer, rx));
        let mut calls = JoinSet::new();
        let mut summary = ServeSummary::default();
        let mut lines = reader.lines();
        tokio::pin!(signal);

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line,
                _ = &mut signal => {
                    tracing::info!("shutdown signal received");
                    break;
                }
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    tracing::info!("stdin closed");
                    break;
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to read from transport");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            summary.messages += 1;
            if let Some(call) = self.handle_line(&line, &tx) {
                summary.tool_calls += 1;
                calls.spawn(call);
            }
            while calls.try_join_next().is_some() {}
        }

        summary.drained = self.dispatcher.shutdown(self.options.shutdown_grace).await;
        let leftovers: Vec<CancelToken> = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for token in &leftovers {
            token.cancel();
        }
        while calls.join_next().await.is_some() {}

        drop(tx);
        match writer_task.await {
            Ok(result) => result?,
            Err(err) => tracing::error!(error = %err, "response writer task failed"),
        }
        Ok(summary)
    }

    /// Answer one message; returns the task for a `tools/call`
    fn handle_line(
        &self,
        line: &str,
        tx: &mpsc::UnboundedSender<String>,
    ) -> Option<impl Future<Output = ()> + Send + 'static> {
        let send = |response: JsonRpcResponse| {
            let _ = tx.send(response.to_line());
        };

        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(error = %err, "unparseable message");
                send(JsonRpcResponse::error(Value::Null, PARSE_ERROR, format!("parse error: {}", err)));
                return None;
            }
        };
        let id = value.get("id").cloned().unwrap_or(Value::Null);
        let request = match serde_json::from_value::<JsonRpcRequest>(value) {
            Ok(request) if request.jsonrpc == JSONRPC_VERSION => request,
            _ => {
                send(JsonRpcResponse::error(id, INVALID_REQUEST, "invalid request"));
                return None;
            }
        };

        let Some(id) = request.id.clone() else {
            self.handle_notification(&request);
            return None;
        };

        match request.method.as_str() {
            "initialize" => {
                send(JsonRpcResponse::success(
                    id,
                    initialize_result(&self.options.info, request.params.as_ref()),
                ));
                None
            }
            "ping" => {
                send(JsonRpcResponse::success(id, json!({})));
                None
            }
            "tools/list" => {
                let tools = self.dispatcher.tool_definitions();
                send(JsonRpcResponse::success(id, tools_list_result(&tools)));
                None
            }
            "tools/call" => {
                let params = request.params.unwrap_or(Value::Null);
                let params: CallToolParams = match serde_json::from_value(params) {
                    Ok(params) => params,
                    Err(err) => {
                        send(JsonRpcResponse::error(id, INVALID_PARAMS, format!("invalid params: {}", err)));
                        return None;
                    }
                };
                self.tool_call(id, params, tx)
            }
            other => {
                send(JsonRpcResponse::error(id, METHOD_NOT_FOUND, format!("method not found: {}", other)));
                None
            }
        }
    }

    fn handle_notification(&self, request: &JsonRpcRequest) {
        match request.method.as_str() {
            "notifications/initialized" => tracing::debug!("client initialized"),
            "notifications/cancelled" => {
                let Some(target) = request.params.as_ref().and_then(|p| p.get("requestId")) else {
                    return;
                };
                let token = self
                    .in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&call_key(target))
                    .cloned();
                match token {
                    Some(token) => {
                        token.cancel();
                        tracing::info!(call = %target, "cancel requested by client");
                    }
                    None => tracing::debug!(call = %target, "cancel for unknown or finished call"),
                }
            }
            other => tracing::debug!(method = other, "ignoring notification"),
        }
    }

    /// Register and admit a call; the returned task serves it
    ///
    /// Admission happens here, before the task is spawned, so a shutdown
    /// triggered by the next line still waits for this call.
    fn tool_call(
        &self,
        id: Value,
        params: CallToolParams,
        tx: &mpsc::UnboundedSender<String>,
    ) -> Option<impl Future<Output = ()> + Send + 'static> {
        let mut ctx = RequestContext::new();
        if let Some(timeout) = self.options.request_timeout {
            ctx = ctx.with_timeout(timeout);
        }
        let key = call_key(&id);

        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if in_flight.contains_key(&key) {
                drop(in_flight);
                tracing::warn!(call = %key, "request id reused while the call is in flight");
                let response = JsonRpcResponse::error(
                    id,
                    INVALID_REQUEST,
                    format!("request id {} is already in flight", key),
                );
                let _ = tx.send(response.to_line());
                return None;
            }
            in_flight.insert(key.clone(), ctx.cancel_token().clone());
        }

        let Some(admission) = self.dispatcher.admit() else {
            self.in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
            let result = self.dispatcher.reject(&params.name, &ctx);
            let _ = tx.send(JsonRpcResponse::success(id, tool_call_result(&result)).to_line());
            return None;
        };

        let tx = tx.clone();
        let in_flight = Arc::clone(&self.in_flight);
        Some(async move {
            let result = admission.dispatch(&params.name, &params.arguments, &ctx).await;
            in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
            let response = JsonRpcResponse::success(id, tool_call_result(&result));
            let _ = tx.send(response.to_line());
        })
    }
}

async fn write_lines<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<String>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{ConnectionPool, PoolConfig};
    use crate::query::QueryExecutor;
    use crate::telemetry::Telemetry;
    use crate::tools::SqlGuard;
    use crate::warehouse::MemoryWarehouse;
    use tokio::io::BufReader;

    fn server() -> McpServer {
        let telemetry = Telemetry::new();
        let warehouse = MemoryWarehouse::new().with_schema("public");
        let pool = ConnectionPool::new(Arc::new(warehouse), PoolConfig::default(), telemetry.clone());
        let dispatcher = Dispatcher::new(pool, QueryExecutor::default(), SqlGuard::default(), telemetry);
        McpServer::new(Arc::new(dispatcher), ServerOptions::default())
    }

    async fn exchange(input: &str) -> Vec<Value> {
        let (client, server_end) = tokio::io::duplex(64 * 1024);
        let (read_half, mut write_half) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server_end);

        write_half.write_all(input.as_bytes()).await.unwrap();
        write_half.shutdown().await.unwrap();

        server().serve(BufReader::new(server_read), server_write).await.unwrap();

        let mut out = Vec::new();
        let mut lines = BufReader::new(read_half).lines();
        while let Some(line) = lines.next_line().await.unwrap() {
            out.push(serde_json::from_str(&line).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_protocol_errors() {
        let responses = exchange(
            "not json\n\
             {\"jsonrpc\":\"1.0\",\"id\":1,\"method\":\"ping\"}\n\
             {\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"resources/list\"}\n\
             {\"jsonrpc\":\"2.0\",\"id\":3,\"method\":\"tools/call\",\"params\":{}}\n",
        )
        .await;

        let codes: Vec<i64> = responses
            .iter()
            .map(|r| r["error"]["code"].as_i64().unwrap())
            .collect();
        assert_eq!(codes, vec![PARSE_ERROR, INVALID_REQUEST, METHOD_NOT_FOUND, INVALID_PARAMS]);
    }

    #[tokio::test]
    async fn test_handshake_and_listing() {
        let responses = exchange(
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"initialize\",\"params\":{\"protocolVersion\":\"2024-11-05\"}}\n\
             {\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n\
             {\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"tools/list\"}\n\
             {\"jsonrpc\":\"2.0\",\"id\":3,\"method\":\"ping\"}\n",
        )
        .await;

        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0]["result"]["capabilities"]["tools"]["listChanged"], false);
        assert_eq!(responses[1]["result"]["tools"].as_array().unwrap().len(), 4);
        assert_eq!(responses[2]["result"], json!({}));
    }

    #[tokio::test]
    async fn test_call_before_eof_is_answered() {
        let responses = exchange(
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/call\",\"params\":{\"name\":\"list_schemas\"}}\n",
        )
        .await;

        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["result"]["isError"], false);
        assert_eq!(responses[0]["result"]["structuredContent"], json!({"schemas": ["public"]}));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_tool_error() {
        let responses = exchange(
            "{\"jsonrpc\":\"2.0\",\"id\":\"a\",\"method\":\"tools/call\",\"params\":{\"name\":\"drop_everything\"}}\n",
        )
        .await;

        assert_eq!(responses[0]["id"], "a");
        assert_eq!(responses[0]["result"]["isError"], true);
        assert_eq!(responses[0]["result"]["structuredContent"]["kind"], "invalid_argument");
    }
}
