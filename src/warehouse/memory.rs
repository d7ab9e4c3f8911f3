//! In-process warehouse
//!
//! Implements the same [`Connector`] contract as the tokio-postgres backend
//! without a server. It answers the catalog queries issued by
//! [`crate::catalog`], `select $n` echoes, `select count(*)` and `select *`
//! over declared tables, plus any statement registered with
//! [`MemoryWarehouse::script`]. Session, cancel and statement counters make
//! pool and executor behavior observable from tests.

use crate::catalog::{DESCRIBE_TABLE_SQL, LIST_SCHEMAS_SQL, LIST_TABLES_SQL};
use crate::errors::{BridgeError, Result};
use crate::warehouse::types::{CellValue, ColumnDescriptor, QueryParam, Row};
use crate::warehouse::{Connector, CursorRequest, RowCursor, UpstreamCancel, WarehouseSession};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// A declared table column: name, raw catalog type, nullability
#[derive(Debug, Clone)]
struct MemoryColumn {
    name: String,
    data_type: String,
    nullable: bool,
}

#[derive(Debug, Clone)]
struct MemoryTable {
    name: String,
    columns: Vec<MemoryColumn>,
    rows: usize,
}

#[derive(Debug, Clone)]
struct MemorySchema {
    name: String,
    tables: Vec<MemoryTable>,
}

#[derive(Debug, Clone)]
enum RowSource {
    Fixed(Vec<Row>),
    Generated(usize),
}

/// Canned response for one statement
#[derive(Debug, Clone)]
pub struct ScriptedQuery {
    columns: Vec<ColumnDescriptor>,
    rows: RowSource,
    fetch_delay: Option<Duration>,
    error: Option<BridgeError>,
    fail_after: Option<(usize, BridgeError)>,
}

impl ScriptedQuery {
    /// Fixed rows
    pub fn rows(columns: Vec<ColumnDescriptor>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows: RowSource::Fixed(rows),
            fetch_delay: None,
            error: None,
            fail_after: None,
        }
    }

    /// `count` generated rows; integer columns hold the row index
    pub fn generated(columns: Vec<ColumnDescriptor>, count: usize) -> Self {
        Self {
            rows: RowSource::Generated(count),
            ..Self::rows(columns, Vec::new())
        }
    }

    /// Single `int8` column `n` holding 0..count
    pub fn sequence(count: usize) -> Self {
        Self::generated(vec![ColumnDescriptor::new("n", "int8")], count)
    }

    /// Statement rejected when opened
    pub fn failing(error: BridgeError) -> Self {
        Self {
            error: Some(error),
            ..Self::rows(Vec::new(), Vec::new())
        }
    }

    /// Sleep before every batch
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    /// Fail the fetch that would return row number `rows`
    pub fn failing_after(mut self, rows: usize, error: BridgeError) -> Self {
        self.fail_after = Some((rows, error));
        self
    }
}

/// Counters observed by tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub opened: usize,
    pub closed: usize,
    pub cancels: usize,
    pub statements: usize,
}

impl MemoryStats {
    pub fn live(&self) -> usize {
        self.opened - self.closed
    }
}

#[derive(Default)]
struct Inner {
    schemas: Mutex<Vec<MemorySchema>>,
    scripts: Mutex<HashMap<String, ScriptedQuery>>,
    fail_connect: AtomicBool,
    fail_ping: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    cancels: AtomicUsize,
    statements: AtomicUsize,
}

/// In-process warehouse connector
#[derive(Clone, Default)]
pub struct MemoryWarehouse {
    inner: Arc<Inner>,
}

fn normalize(sql: &str) -> String {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(';')
        .trim_end()
        .to_lowercase()
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a schema; schemas are listed in declaration order
    pub fn with_schema(self, schema: &str) -> Self {
        {
            let mut schemas = self.inner.schemas.lock().unwrap_or_else(PoisonError::into_inner);
            if !schemas.iter().any(|s| s.name == schema) {
                schemas.push(MemorySchema {
                    name: schema.to_string(),
                    tables: Vec::new(),
                });
            }
        }
        self
    }

    /// Declare a table with `(name, catalog type, nullable)` columns and a row count
    pub fn with_table(self, schema: &str, table: &str, columns: &[(&str, &str, bool)], rows: usize) -> Self {
        let this = self.with_schema(schema);
        {
            let mut schemas = this.inner.schemas.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = schemas.iter_mut().find(|s| s.name == schema) {
                entry.tables.retain(|t| t.name != table);
                entry.tables.push(MemoryTable {
                    name: table.to_string(),
                    columns: columns
                        .iter()
                        .map(|(name, data_type, nullable)| MemoryColumn {
                            name: name.to_string(),
                            data_type: data_type.to_string(),
                            nullable: *nullable,
                        })
                        .collect(),
                    rows,
                });
            }
        }
        this
    }

    /// Register a canned response for `sql` (whitespace and case insensitive)
    pub fn script(&self, sql: &str, query: ScriptedQuery) {
        self.inner
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(normalize(sql), query);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.inner.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_ping(&self, fail: bool) {
        self.inner.fail_ping.store(fail, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self
            .inner
            .connect_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            opened: self.inner.opened.load(Ordering::SeqCst),
            closed: self.inner.closed.load(Ordering::SeqCst),
            cancels: self.inner.cancels.load(Ordering::SeqCst),
            statements: self.inner.statements.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl Connector for MemoryWarehouse {
    async fn connect(&self) -> Result<Box<dyn WarehouseSession>> {
        let delay = *self
            .inner
            .connect_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.inner.fail_connect.load(Ordering::SeqCst) {
            return Err(BridgeError::Connection(
                "could not connect to memory warehouse: connection refused".to_string(),
            ));
        }
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            inner: Arc::clone(&self.inner),
            cancelled: Arc::new(AtomicBool::new(false)),
        }))
    }

    fn target(&self) -> String {
        "memory".to_string()
    }
}

struct MemorySession {
    inner: Arc<Inner>,
    cancelled: Arc<AtomicBool>,
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.inner.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn query_error(message: String, sqlstate: &str) -> BridgeError {
    BridgeError::Query {
        message,
        sqlstate: Some(sqlstate.to_string()),
    }
}

fn text_param(params: &[QueryParam], index: usize) -> Result<String> {
    match params.get(index) {
        Some(QueryParam::Text(value)) | Some(QueryParam::Decimal(value)) => Ok(value.clone()),
        Some(other) => Err(BridgeError::query(format!(
            "parameter ${} must be text, got {:?}",
            index + 1,
            other
        ))),
        None => Err(BridgeError::query(format!(
            "bind message supplies {} parameters, but prepared statement requires {}",
            params.len(),
            index + 1
        ))),
    }
}

fn generated_cell(column: &MemoryColumn, index: usize) -> CellValue {
    let data_type = column.data_type.to_lowercase();
    if column.nullable && index % 3 == 2 {
        return CellValue::Null;
    }
    if matches!(data_type.as_str(), "bigint" | "integer" | "smallint" | "int8" | "int4" | "int2") {
        CellValue::Int(index as i64)
    } else if data_type.starts_with("timestamp") {
        CellValue::Text(format!("2024-01-01T00:{:02}:{:02}", (index / 60) % 60, index % 60))
    } else if data_type.starts_with("numeric") {
        CellValue::Decimal(format!("{}.{:02}", index, index % 100))
    } else if data_type == "boolean" {
        CellValue::Bool(index % 2 == 0)
    } else {
        CellValue::Text(format!("{}-{}", column.name, index))
    }
}

impl MemorySession {
    fn lookup_table(&self, qualified: &str) -> Result<MemoryTable> {
        let (schema, table) = qualified
            .split_once('.')
            .unwrap_or(("public", qualified));
        let schemas = self.inner.schemas.lock().unwrap_or_else(PoisonError::into_inner);
        schemas
            .iter()
            .find(|s| s.name == schema)
            .and_then(|s| s.tables.iter().find(|t| t.name == table))
            .cloned()
            .ok_or_else(|| query_error(format!("relation \"{}\" does not exist", qualified), "42P01"))
    }

    fn plan(&self, request: &CursorRequest<'_>) -> Result<MemoryCursor> {
        let sql = normalize(request.sql);
        let params = request.params;

        let scripted = self
            .inner
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&sql)
            .cloned();
        if let Some(script) = scripted {
            if let Some(error) = script.error {
                return Err(error);
            }
            let feed = match script.rows {
                RowSource::Fixed(rows) => RowFeed::Fixed(rows.into()),
                RowSource::Generated(count) => RowFeed::Sequence {
                    next: 0,
                    total: count,
                    width: script.columns.len(),
                },
            };
            return Ok(self.cursor(script.columns, feed, script.fetch_delay, script.fail_after));
        }

        let schemas = self.inner.schemas.lock().unwrap_or_else(PoisonError::into_inner).clone();

        if sql == normalize(LIST_SCHEMAS_SQL) {
            let rows = schemas
                .iter()
                .map(|s| vec![CellValue::Text(s.name.clone())])
                .collect::<Vec<_>>();
            let columns = vec![ColumnDescriptor::new("schema_name", "varchar")];
            return Ok(self.cursor(columns, RowFeed::Fixed(rows.into()), None, None));
        }

        if sql == normalize(LIST_TABLES_SQL) {
            let schema = text_param(params, 0)?;
            let mut tables = schemas
                .iter()
                .filter(|s| s.name == schema)
                .flat_map(|s| s.tables.iter().map(|t| t.name.clone()))
                .collect::<Vec<_>>();
            tables.sort();
            let rows = tables
                .into_iter()
                .map(|name| vec![CellValue::Text(name), CellValue::Text("BASE TABLE".to_string())])
                .collect::<Vec<_>>();
            let columns = vec![
                ColumnDescriptor::new("table_name", "varchar"),
                ColumnDescriptor::new("table_type", "varchar"),
            ];
            return Ok(self.cursor(columns, RowFeed::Fixed(rows.into()), None, None));
        }

        if sql == normalize(DESCRIBE_TABLE_SQL) {
            let schema = text_param(params, 0)?;
            let table = text_param(params, 1)?;
            let rows = schemas
                .iter()
                .filter(|s| s.name == schema)
                .flat_map(|s| s.tables.iter().filter(|t| t.name == table))
                .flat_map(|t| t.columns.iter().enumerate())
                .map(|(ordinal, column)| {
                    vec![
                        CellValue::Text(column.name.clone()),
                        CellValue::Text(column.data_type.clone()),
                        CellValue::Text(if column.nullable { "YES" } else { "NO" }.to_string()),
                        CellValue::Int(ordinal as i64 + 1),
                    ]
                })
                .collect::<Vec<_>>();
            let columns = vec![
                ColumnDescriptor::new("column_name", "varchar"),
                ColumnDescriptor::new("data_type", "varchar"),
                ColumnDescriptor::new("is_nullable", "varchar"),
                ColumnDescriptor::new("ordinal_position", "int4"),
            ];
            return Ok(self.cursor(columns, RowFeed::Fixed(rows.into()), None, None));
        }

        if sql.starts_with("select $") {
            let row: Row = params
                .iter()
                .map(|param| match param {
                    QueryParam::Null => CellValue::Null,
                    QueryParam::Bool(v) => CellValue::Bool(*v),
                    QueryParam::Int(v) => CellValue::Int(*v),
                    QueryParam::Float(v) => CellValue::Float(*v),
                    QueryParam::Text(v) | QueryParam::Decimal(v) => CellValue::Text(v.clone()),
                })
                .collect();
            let columns = (0..row.len())
                .map(|_| ColumnDescriptor::new("?column?", "text"))
                .collect();
            return Ok(self.cursor(columns, RowFeed::Fixed(VecDeque::from(vec![row])), None, None));
        }

        if let Some(target) = sql.strip_prefix("select count(*) from ") {
            let table = self.lookup_table(target.trim())?;
            let columns = vec![ColumnDescriptor::new("count", "int8").with_nullable(false)];
            let rows = VecDeque::from(vec![vec![CellValue::Int(table.rows as i64)]]);
            return Ok(self.cursor(columns, RowFeed::Fixed(rows), None, None));
        }

        if let Some(target) = sql.strip_prefix("select * from ") {
            let table = self.lookup_table(target.trim())?;
            let columns = table
                .columns
                .iter()
                .map(|c| ColumnDescriptor::new(&c.name, &c.data_type).with_nullable(c.nullable))
                .collect();
            let feed = RowFeed::Table {
                next: 0,
                total: table.rows,
                columns: table.columns,
            };
            return Ok(self.cursor(columns, feed, None, None));
        }

        let token = sql.split_whitespace().next().unwrap_or_default();
        Err(query_error(
            format!("syntax error at or near \"{}\"", token),
            "42601",
        ))
    }

    fn cursor(
        &self,
        columns: Vec<ColumnDescriptor>,
        feed: RowFeed,
        fetch_delay: Option<Duration>,
        fail_after: Option<(usize, BridgeError)>,
    ) -> MemoryCursor {
        MemoryCursor {
            columns,
            feed,
            fetch_delay,
            fail_after,
            delivered: 0,
            cancelled: Arc::clone(&self.cancelled),
        }
    }
}

#[async_trait]
impl WarehouseSession for MemorySession {
    async fn open_cursor<'s>(
        &'s mut self,
        request: CursorRequest<'_>,
    ) -> Result<Box<dyn RowCursor + 's>> {
        self.inner.statements.fetch_add(1, Ordering::SeqCst);
        self.cancelled.store(false, Ordering::SeqCst);
        let cursor = self.plan(&request)?;
        Ok(Box::new(cursor))
    }

    fn cancel_handle(&self) -> Box<dyn UpstreamCancel> {
        Box::new(MemoryCancel {
            inner: Arc::clone(&self.inner),
            cancelled: Arc::clone(&self.cancelled),
        })
    }

    async fn ping(&mut self) -> Result<()> {
        if self.inner.fail_ping.load(Ordering::SeqCst) {
            return Err(BridgeError::Connection("server closed the connection unexpectedly".to_string()));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        false
    }
}

enum RowFeed {
    Fixed(VecDeque<Row>),
    Sequence { next: usize, total: usize, width: usize },
    Table { next: usize, total: usize, columns: Vec<MemoryColumn> },
}

impl RowFeed {
    fn pull(&mut self, max_rows: usize) -> Vec<Row> {
        match self {
            RowFeed::Fixed(rows) => {
                let take = max_rows.min(rows.len());
                rows.drain(..take).collect()
            }
            RowFeed::Sequence { next, total, width } => {
                let end = (*next + max_rows).min(*total);
                let rows = (*next..end)
                    .map(|i| (0..*width).map(|_| CellValue::Int(i as i64)).collect())
                    .collect();
                *next = end;
                rows
            }
            RowFeed::Table { next, total, columns } => {
                let end = (*next + max_rows).min(*total);
                let rows = (*next..end)
                    .map(|i| columns.iter().map(|c| generated_cell(c, i)).collect())
                    .collect();
                *next = end;
                rows
            }
        }
    }
}

struct MemoryCursor {
    columns: Vec<ColumnDescriptor>,
    feed: RowFeed,
    fetch_delay: Option<Duration>,
    fail_after: Option<(usize, BridgeError)>,
    delivered: usize,
    cancelled: Arc<AtomicBool>,
}

#[async_trait]
impl RowCursor for MemoryCursor {
    fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    async fn fetch(&mut self, max_rows: usize) -> Result<Vec<Row>> {
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(query_error(
                "canceling statement due to user request".to_string(),
                "57014",
            ));
        }
        if let Some((limit, error)) = &self.fail_after {
            if self.delivered + max_rows > *limit {
                return Err(error.clone());
            }
        }
        let rows = self.feed.pull(max_rows);
        self.delivered += rows.len();
        Ok(rows)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

struct MemoryCancel {
    inner: Arc<Inner>,
    cancelled: Arc<AtomicBool>,
}

#[async_trait]
impl UpstreamCancel for MemoryCancel {
    async fn cancel(&self) -> Result<()> {
        self.inner.cancels.fetch_add(1, Ordering::SeqCst);
        self.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }
}
