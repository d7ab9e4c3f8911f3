//! Tool call and result types
//!
//! A [`ToolCall`] is only ever built by [`ToolCall::from_arguments`], so a
//! value of this type has already passed argument validation.

use crate::catalog::{TableDescription, TableInfo};
use crate::errors::{BridgeError, Result, ToolError};
use crate::query::QueryOutput;
use crate::warehouse::QueryParam;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Closed set of tools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    ExecuteQuery,
    ListSchemas,
    ListTables,
    DescribeTable,
}

impl ToolName {
    pub const ALL: [ToolName; 4] = [
        ToolName::ExecuteQuery,
        ToolName::ListSchemas,
        ToolName::ListTables,
        ToolName::DescribeTable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::ExecuteQuery => "execute_query",
            ToolName::ListSchemas => "list_schemas",
            ToolName::ListTables => "list_tables",
            ToolName::DescribeTable => "describe_table",
        }
    }

    /// Argument names accepted by this tool
    fn fields(&self) -> &'static [&'static str] {
        match self {
            ToolName::ExecuteQuery => &["sql", "params", "limit", "timeout_ms"],
            ToolName::ListSchemas => &[],
            ToolName::ListTables => &["schema"],
            ToolName::DescribeTable => &["schema", "table"],
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = BridgeError;

    fn from_str(name: &str) -> Result<Self> {
        ToolName::ALL
            .into_iter()
            .find(|tool| tool.as_str() == name)
            .ok_or_else(|| BridgeError::InvalidArgument(format!("unknown tool '{}'", name)))
    }
}

/// Tool schema advertised to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Tool name
    pub name: String,

    /// Tool description
    pub description: String,

    /// Parameter schema (JSON Schema)
    #[serde(rename = "inputSchema")]
    pub parameters: Value,

    /// Whether the tool can only read
    #[serde(skip)]
    pub read_only: bool,
}

impl ToolSchema {
    /// Create new tool schema
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        read_only: bool,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            read_only,
        }
    }
}

/// Validated `execute_query` arguments
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteQueryArgs {
    pub sql: String,
    pub params: Vec<QueryParam>,
    pub limit: Option<usize>,
    pub timeout: Option<Duration>,
}

/// One validated tool invocation
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    ExecuteQuery(ExecuteQueryArgs),
    ListSchemas,
    ListTables { schema: String },
    DescribeTable { schema: String, table: String },
}

impl ToolCall {
    /// Validate `arguments` against the schema of tool `name`
    ///
    /// Missing arguments are treated as an empty object. Unknown fields,
    /// missing required fields and uncoercible values are rejected with
    /// `InvalidArgument`.
    pub fn from_arguments(name: &str, arguments: &Value) -> Result<Self> {
        let tool: ToolName = name.parse()?;
        let empty = Map::new();
        let args = match arguments {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => {
                return Err(invalid(format!(
                    "arguments for '{}' must be an object, got {}",
                    tool,
                    json_type(other)
                )))
            }
        };

        if let Some(unknown) = args.keys().find(|key| !tool.fields().contains(&key.as_str())) {
            return Err(invalid(format!("unknown field '{}' for tool '{}'", unknown, tool)));
        }

        match tool {
            ToolName::ExecuteQuery => {
                let sql = required_string(args, "sql")?;
                let params = match args.get("params") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(values)) => values
                        .iter()
                        .enumerate()
                        .map(|(index, value)| parse_param(index, value))
                        .collect::<Result<Vec<_>>>()?,
                    Some(other) => {
                        return Err(invalid(format!(
                            "'params' must be an array, got {}",
                            json_type(other)
                        )))
                    }
                };
                let limit = positive_integer(args, "limit")?.map(|v| v as usize);
                let timeout = positive_integer(args, "timeout_ms")?.map(Duration::from_millis);
                Ok(ToolCall::ExecuteQuery(ExecuteQueryArgs {
                    sql,
                    params,
                    limit,
                    timeout,
                }))
            }
            ToolName::ListSchemas => Ok(ToolCall::ListSchemas),
            ToolName::ListTables => Ok(ToolCall::ListTables {
                schema: required_string(args, "schema")?,
            }),
            ToolName::DescribeTable => Ok(ToolCall::DescribeTable {
                schema: required_string(args, "schema")?,
                table: required_string(args, "table")?,
            }),
        }
    }

    pub fn name(&self) -> ToolName {
        match self {
            ToolCall::ExecuteQuery(_) => ToolName::ExecuteQuery,
            ToolCall::ListSchemas => ToolName::ListSchemas,
            ToolCall::ListTables { .. } => ToolName::ListTables,
            ToolCall::DescribeTable { .. } => ToolName::DescribeTable,
        }
    }
}

fn invalid(message: String) -> BridgeError {
    BridgeError::InvalidArgument(message)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn required_string(args: &Map<String, Value>, field: &str) -> Result<String> {
    match args.get(field) {
        Some(Value::String(value)) if !value.trim().is_empty() => Ok(value.clone()),
        Some(Value::String(_)) => Err(invalid(format!("'{}' must not be empty", field))),
        None | Some(Value::Null) => Err(invalid(format!("missing required field '{}'", field))),
        Some(other) => Err(invalid(format!(
            "'{}' must be a string, got {}",
            field,
            json_type(other)
        ))),
    }
}

/// Integers and integer strings; zero and negatives rejected
fn positive_integer(args: &Map<String, Value>, field: &str) -> Result<Option<u64>> {
    let parsed = match args.get(field) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(number)) => number.as_u64(),
        Some(Value::String(text)) => text.trim().parse::<u64>().ok(),
        Some(_) => None,
    };
    match parsed {
        Some(value) if value > 0 => Ok(Some(value)),
        _ => Err(invalid(format!("'{}' must be a positive integer", field))),
    }
}

fn parse_param(index: usize, value: &Value) -> Result<QueryParam> {
    match value {
        Value::Null => Ok(QueryParam::Null),
        Value::Bool(v) => Ok(QueryParam::Bool(*v)),
        Value::Number(number) => match (number.as_i64(), number.as_f64()) {
            (Some(int), _) => Ok(QueryParam::Int(int)),
            (None, Some(float)) => Ok(QueryParam::Float(float)),
            (None, None) => Err(invalid(format!("params[{}] is out of range", index))),
        },
        Value::String(text) => Ok(QueryParam::Text(text.clone())),
        Value::Object(map) if map.len() == 1 => match map.get("decimal") {
            Some(Value::String(literal)) => QueryParam::decimal(literal.clone())
                .map_err(|reason| invalid(format!("params[{}]: {}", index, reason))),
            _ => Err(invalid(format!(
                "params[{}] must be a scalar or {{\"decimal\": \"...\"}}",
                index
            ))),
        },
        other => Err(invalid(format!(
            "params[{}] must be a scalar or {{\"decimal\": \"...\"}}, got {}",
            index,
            json_type(other)
        ))),
    }
}

/// Schema names in creation order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaList {
    pub schemas: Vec<String>,
}

/// Tables of one schema
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableList {
    pub schema: String,
    pub tables: Vec<TableInfo>,
}

/// Successful tool output
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ToolPayload {
    Query(QueryOutput),
    Schemas(SchemaList),
    Tables(TableList),
    Table(TableDescription),
}

impl ToolPayload {
    /// Rows carried by the payload, for telemetry
    pub fn row_count(&self) -> usize {
        match self {
            ToolPayload::Query(output) => output.row_count,
            ToolPayload::Schemas(list) => list.schemas.len(),
            ToolPayload::Tables(list) => list.tables.len(),
            ToolPayload::Table(description) => description.columns.len(),
        }
    }

    pub fn truncated(&self) -> bool {
        matches!(self, ToolPayload::Query(output) if output.truncated)
    }
}

/// Outcome of one tool invocation
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResult {
    Success(ToolPayload),
    Error(ToolError),
}

impl ToolResult {
    pub fn is_error(&self) -> bool {
        matches!(self, ToolResult::Error(_))
    }

    pub fn error(&self) -> Option<&ToolError> {
        match self {
            ToolResult::Error(err) => Some(err),
            ToolResult::Success(_) => None,
        }
    }

    pub fn payload(&self) -> Option<&ToolPayload> {
        match self {
            ToolResult::Success(payload) => Some(payload),
            ToolResult::Error(_) => None,
        }
    }

    /// JSON body of the result, payload or error envelope
    pub fn to_json(&self) -> Value {
        let body = match self {
            ToolResult::Success(payload) => serde_json::to_value(payload),
            ToolResult::Error(err) => serde_json::to_value(err),
        };
        body.unwrap_or_else(|err| {
            serde_json::json!({
                "kind": "internal",
                "message": format!("serialization failed: {}", err),
                "retryable": false,
            })
        })
    }
}

impl From<BridgeError> for ToolResult {
    fn from(err: BridgeError) -> Self {
        ToolResult::Error(ToolError::from(err))
    }
}
