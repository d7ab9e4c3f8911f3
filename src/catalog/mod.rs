//! Schema introspection
//!
//! Fixed catalog queries run through the [`QueryExecutor`] and shaped into
//! typed records. Schema and table names are always bound parameters.

use crate::context::RequestContext;
use crate::errors::{BridgeError, Result};
use crate::pool::PooledConnection;
use crate::query::{QueryExecutor, QueryOutput, QueryRequest};
use crate::warehouse::{CellValue, QueryParam, Row};
use serde::{Deserialize, Serialize};

/// User schemas in creation order
pub const LIST_SCHEMAS_SQL: &str = "SELECT nspname::varchar AS schema_name \
     FROM pg_catalog.pg_namespace \
     WHERE nspname !~ '^pg_' AND nspname <> 'information_schema' \
     ORDER BY oid";

/// Tables and views of one schema
pub const LIST_TABLES_SQL: &str = "SELECT table_name::varchar, table_type::varchar \
     FROM information_schema.tables \
     WHERE table_schema = CAST($1 AS varchar) \
     ORDER BY table_name";

/// Columns of one table
pub const DESCRIBE_TABLE_SQL: &str = "SELECT column_name::varchar, data_type::varchar, \
     is_nullable::varchar, ordinal_position::int \
     FROM information_schema.columns \
     WHERE table_schema = CAST($1 AS varchar) AND table_name = CAST($2 AS varchar) \
     ORDER BY ordinal_position";

/// Catalog queries never need more rows than this
const CATALOG_ROW_LIMIT: usize = 100_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaInfo {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    pub table_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub ordinal_position: i64,
}

/// Columns of one table; empty when the table does not exist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescription {
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnInfo>,
}

/// Collapse catalog type spellings to their short names
///
/// `character varying(256)` becomes `varchar`, `timestamp without time zone`
/// becomes `timestamp`, and so on. Unknown names are lowercased and stripped
/// of size modifiers.
pub fn normalize_type_name(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let base = match lowered.find('(') {
        Some(open) => {
            let close = lowered[open..].find(')').map_or(lowered.len(), |i| open + i + 1);
            format!("{}{}", lowered[..open].trim_end(), &lowered[close..])
        }
        None => lowered,
    };
    let base = base.split_whitespace().collect::<Vec<_>>().join(" ");

    match base.as_str() {
        "character varying" => "varchar",
        "character" => "char",
        "timestamp without time zone" | "timestamp" => "timestamp",
        "timestamp with time zone" => "timestamptz",
        "time without time zone" => "time",
        "time with time zone" => "timetz",
        "double precision" => "float8",
        "real" => "float4",
        other => return other.to_string(),
    }
    .to_string()
}

/// Answers catalog questions over a checked-out connection
#[derive(Debug, Clone)]
pub struct SchemaIntrospector {
    executor: QueryExecutor,
}

impl SchemaIntrospector {
    pub fn new(executor: QueryExecutor) -> Self {
        Self { executor }
    }

    async fn run(
        &self,
        conn: &mut PooledConnection,
        request: QueryRequest,
        ctx: &RequestContext,
    ) -> Result<QueryOutput> {
        let request = request.with_row_limit(CATALOG_ROW_LIMIT);
        self.executor.execute(conn, &request, ctx).await?.collect().await
    }

    /// User schemas, system schemas excluded
    pub async fn list_schemas(
        &self,
        conn: &mut PooledConnection,
        ctx: &RequestContext,
    ) -> Result<Vec<SchemaInfo>> {
        let output = self.run(conn, QueryRequest::new(LIST_SCHEMAS_SQL), ctx).await?;
        output
            .rows
            .iter()
            .map(|row| Ok(SchemaInfo { name: text(row, 0)? }))
            .collect()
    }

    /// Tables of `schema`, alphabetical
    pub async fn list_tables(
        &self,
        conn: &mut PooledConnection,
        schema: &str,
        ctx: &RequestContext,
    ) -> Result<Vec<TableInfo>> {
        let request = QueryRequest::new(LIST_TABLES_SQL)
            .with_params(vec![QueryParam::Text(schema.to_string())]);
        let output = self.run(conn, request, ctx).await?;
        output
            .rows
            .iter()
            .map(|row| {
                Ok(TableInfo {
                    schema: schema.to_string(),
                    name: text(row, 0)?,
                    table_type: text(row, 1)?,
                })
            })
            .collect()
    }

    /// Columns of `schema.table` in ordinal order
    pub async fn describe_table(
        &self,
        conn: &mut PooledConnection,
        schema: &str,
        table: &str,
        ctx: &RequestContext,
    ) -> Result<TableDescription> {
        let request = QueryRequest::new(DESCRIBE_TABLE_SQL).with_params(vec![
            QueryParam::Text(schema.to_string()),
            QueryParam::Text(table.to_string()),
        ]);
        let output = self.run(conn, request, ctx).await?;
        let columns = output
            .rows
            .iter()
            .map(|row| {
                Ok(ColumnInfo {
                    name: text(row, 0)?,
                    data_type: normalize_type_name(&text(row, 1)?),
                    nullable: text(row, 2)?.eq_ignore_ascii_case("YES"),
                    ordinal_position: integer(row, 3)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(TableDescription {
            schema: schema.to_string(),
            table: table.to_string(),
            columns,
        })
    }
}

fn text(row: &Row, index: usize) -> Result<String> {
    match row.get(index) {
        Some(CellValue::Text(value)) => Ok(value.clone()),
        other => Err(BridgeError::Internal(format!(
            "unexpected catalog value in column {}: {:?}",
            index, other
        ))),
    }
}

fn integer(row: &Row, index: usize) -> Result<i64> {
    match row.get(index) {
        Some(CellValue::Int(value)) => Ok(*value),
        other => Err(BridgeError::Internal(format!(
            "unexpected catalog value in column {}: {:?}",
            index, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{ConnectionPool, PoolConfig};
    use crate::telemetry::Telemetry;
    use crate::warehouse::MemoryWarehouse;
    use std::sync::Arc;

    #[test]
    fn test_normalize_type_names() {
        assert_eq!(normalize_type_name("character varying"), "varchar");
        assert_eq!(normalize_type_name("character varying(256)"), "varchar");
        assert_eq!(normalize_type_name("timestamp without time zone"), "timestamp");
        assert_eq!(normalize_type_name("timestamp with time zone"), "timestamptz");
        assert_eq!(normalize_type_name("character(1)"), "char");
        assert_eq!(normalize_type_name("time without time zone"), "time");
        assert_eq!(normalize_type_name("double precision"), "float8");
        assert_eq!(normalize_type_name("numeric(18,4)"), "numeric");
        assert_eq!(normalize_type_name("BIGINT"), "bigint");
    }

    #[tokio::test]
    async fn test_unknown_table_is_empty() {
        let warehouse = MemoryWarehouse::new().with_schema("public");
        let pool = ConnectionPool::new(Arc::new(warehouse), PoolConfig::default(), Telemetry::new());
        let ctx = RequestContext::new();
        let mut conn = pool.acquire(&ctx).await.unwrap();

        let introspector = SchemaIntrospector::new(QueryExecutor::default());
        let description = introspector
            .describe_table(&mut conn, "public", "missing", &ctx)
            .await
            .unwrap();
        assert!(description.columns.is_empty());

        let tables = introspector.list_tables(&mut conn, "nowhere", &ctx).await.unwrap();
        assert!(tables.is_empty());
    }

    #[tokio::test]
    async fn test_describe_normalizes_types() {
        let warehouse = MemoryWarehouse::new().with_table(
            "analytics",
            "events",
            &[
                ("id", "bigint", false),
                ("payload", "character varying", true),
            ],
            0,
        );
        let pool = ConnectionPool::new(Arc::new(warehouse), PoolConfig::default(), Telemetry::new());
        let ctx = RequestContext::new();
        let mut conn = pool.acquire(&ctx).await.unwrap();

        let description = SchemaIntrospector::new(QueryExecutor::default())
            .describe_table(&mut conn, "analytics", "events", &ctx)
            .await
            .unwrap();

        assert_eq!(
            description.columns[1],
            ColumnInfo {
                name: "payload".to_string(),
                data_type: "varchar".to_string(),
                nullable: true,
                ordinal_position: 2,
            }
        );
    }
}
