//! Tool registry with JSON schemas
//!
//! Tools:
//! - execute_query: Run one SQL statement and return its rows
//! - list_schemas: List user schemas
//! - list_tables: List tables of a schema
//! - describe_table: Describe the columns of a table

use crate::tools::types::{ToolName, ToolSchema};
use serde_json::json;
use std::collections::HashMap;

/// Tool registry
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    /// Map of tool name to schema
    tools: HashMap<ToolName, ToolSchema>,
}

impl ToolRegistry {
    /// Create new tool registry with all tools
    pub fn new() -> Self {
        let mut registry = Self {
            tools: HashMap::new(),
        };

        registry.register_execute_query();
        registry.register_list_schemas();
        registry.register_list_tables();
        registry.register_describe_table();

        registry
    }

    /// Register execute_query tool
    fn register_execute_query(&mut self) {
        let schema = ToolSchema::new(
            ToolName::ExecuteQuery.as_str(),
            "Run one SQL statement against the warehouse and return columns and rows. \
             Results beyond the row cap are dropped and flagged as truncated.",
            json!({
                "type": "object",
                "properties": {
                    "sql": {
                        "type": "string",
                        "description": "SQL statement; use $1, $2, ... for parameters"
                    },
                    "params": {
                        "type": "array",
                        "description": "Positional parameters. Exact decimals as {\"decimal\": \"12.34\"}",
                        "items": {
                            "anyOf": [
                                { "type": "null" },
                                { "type": "boolean" },
                                { "type": "number" },
                                { "type": "string" },
                                {
                                    "type": "object",
                                    "properties": { "decimal": { "type": "string" } },
                                    "required": ["decimal"],
                                    "additionalProperties": false
                                }
                            ]
                        },
                        "default": []
                    },
                    "limit": {
                        "type": "integer",
                        "description": "Maximum rows to return (capped by the server's max_rows)",
                        "minimum": 1
                    },
                    "timeout_ms": {
                        "type": "integer",
                        "description": "Statement timeout in milliseconds",
                        "minimum": 1
                    }
                },
                "required": ["sql"],
                "additionalProperties": false
            }),
            false,
        );
        self.tools.insert(ToolName::ExecuteQuery, schema);
    }

    /// Register list_schemas tool
    fn register_list_schemas(&mut self) {
        let schema = ToolSchema::new(
            ToolName::ListSchemas.as_str(),
            "List user schemas in creation order; system schemas are excluded",
            json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
            true,
        );
        self.tools.insert(ToolName::ListSchemas, schema);
    }

    /// Register list_tables tool
    fn register_list_tables(&mut self) {
        let schema = ToolSchema::new(
            ToolName::ListTables.as_str(),
            "List the tables and views of a schema in alphabetical order",
            json!({
                "type": "object",
                "properties": {
                    "schema": {
                        "type": "string",
                        "description": "Schema name"
                    }
                },
                "required": ["schema"],
                "additionalProperties": false
            }),
            true,
        );
        self.tools.insert(ToolName::ListTables, schema);
    }

    /// Register describe_table tool
    fn register_describe_table(&mut self) {
        let schema = ToolSchema::new(
            ToolName::DescribeTable.as_str(),
            "Describe the columns of a table: name, type, nullability, ordinal position",
            json!({
                "type": "object",
                "properties": {
                    "schema": {
                        "type": "string",
                        "description": "Schema name"
                    },
                    "table": {
                        "type": "string",
                        "description": "Table name"
                    }
                },
                "required": ["schema", "table"],
                "additionalProperties": false
            }),
            true,
        );
        self.tools.insert(ToolName::DescribeTable, schema);
    }

    /// Get tool schema by name
    pub fn get(&self, name: ToolName) -> Option<&ToolSchema> {
        self.tools.get(&name)
    }

    /// Check if tool exists
    pub fn contains(&self, name: &str) -> bool {
        self.tools.values().any(|schema| schema.name == name)
    }

    /// All tool schemas in declaration order
    pub fn schemas(&self) -> Vec<&ToolSchema> {
        ToolName::ALL
            .iter()
            .filter_map(|name| self.tools.get(name))
            .collect()
    }

    /// Get read-only tool names
    pub fn read_only_tools(&self) -> Vec<ToolName> {
        ToolName::ALL
            .into_iter()
            .filter(|name| self.tools.get(name).is_some_and(|schema| schema.read_only))
            .collect()
    }

    /// Get total number of tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
