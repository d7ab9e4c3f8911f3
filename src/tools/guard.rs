//! Read-only statement guard
//!
//! When the server runs read-only, an `execute_query` statement must parse as
//! exactly one of:
//! - a query (SELECT, WITH, VALUES, set operations) that writes nothing:
//!   no `SELECT ... INTO`, no row locks, no data-modifying CTE
//! - SHOW
//! - EXPLAIN of such a query
//!
//! Parsing tries the Redshift dialect first, then PostgreSQL.

use crate::errors::{BridgeError, Result};
use sqlparser::ast::{Query, SetExpr, Statement};
use sqlparser::dialect::{Dialect, PostgreSqlDialect, RedshiftSqlDialect};
use sqlparser::parser::{Parser, ParserError};

/// Statement guard for `execute_query`
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlGuard {
    read_only: bool,
}

impl SqlGuard {
    /// Create new guard
    pub fn new(read_only: bool) -> Self {
        Self { read_only }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Reject statements the server is not allowed to run
    pub fn check(&self, sql: &str) -> Result<()> {
        if !self.read_only {
            return Ok(());
        }

        let statements = parse(sql)?;
        let statement = match statements.as_slice() {
            [] => return Err(BridgeError::InvalidArgument("statement is empty".to_string())),
            [single] => single,
            _ => {
                return Err(BridgeError::InvalidArgument(
                    "only a single statement is allowed in read-only mode".to_string(),
                ))
            }
        };

        if is_read_only_statement(statement) {
            Ok(())
        } else {
            Err(BridgeError::InvalidArgument(format!(
                "statement '{}' is not allowed in read-only mode",
                summarize(statement)
            )))
        }
    }
}

fn parse(sql: &str) -> Result<Vec<Statement>> {
    let dialects: [&dyn Dialect; 2] = [&RedshiftSqlDialect {}, &PostgreSqlDialect {}];
    let mut first_error: Option<ParserError> = None;
    for dialect in dialects {
        match Parser::parse_sql(dialect, sql) {
            Ok(statements) => return Ok(statements),
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }
    }
    let reason = first_error.map_or_else(|| "unparseable statement".to_string(), |err| err.to_string());
    Err(BridgeError::InvalidArgument(format!(
        "read-only mode could not parse statement: {}",
        reason
    )))
}

fn is_read_only_statement(statement: &Statement) -> bool {
    match statement {
        Statement::Query(query) => is_read_only_query(query),
        Statement::Explain { statement, .. } => is_read_only_statement(statement),
        Statement::ShowVariable { .. } | Statement::ShowTables { .. } | Statement::ShowColumns { .. } => {
            true
        }
        _ => false,
    }
}

fn is_read_only_query(query: &Query) -> bool {
    if !query.locks.is_empty() {
        return false;
    }
    let ctes_read_only = query
        .with
        .as_ref()
        .map_or(true, |with| with.cte_tables.iter().all(|cte| is_read_only_query(&cte.query)));
    ctes_read_only && is_read_only_body(&query.body)
}

fn is_read_only_body(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => select.into.is_none(),
        SetExpr::Query(query) => is_read_only_query(query),
        SetExpr::SetOperation { left, right, .. } => is_read_only_body(left) && is_read_only_body(right),
        SetExpr::Values(_) | SetExpr::Table(_) => true,
        _ => false,
    }
}

/// Leading words of the statement for error messages
fn summarize(statement: &Statement) -> String {
    let text = statement.to_string();
    let words: Vec<&str> = text.split_whitespace().take(4).collect();
    words.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> SqlGuard {
        SqlGuard::new(true)
    }

    fn rejected(sql: &str) -> bool {
        matches!(guard().check(sql), Err(BridgeError::InvalidArgument(_)))
    }

    #[test]
    fn test_disabled_guard_allows_anything() {
        assert!(SqlGuard::new(false).check("drop table users").is_ok());
        assert!(SqlGuard::new(false).check("not even sql").is_ok());
    }

    #[test]
    fn test_read_statements_allowed() {
        for sql in [
            "select 1",
            "SELECT * FROM analytics.events;",
            "  with t as (select 1) select * from t",
            "-- leading comment\nselect 1",
            "/* block */ explain select 1",
            "(select 1) union (select 2)",
            "show search_path",
            "values (1), (2)",
        ] {
            assert!(guard().check(sql).is_ok(), "{}", sql);
        }
    }

    #[test]
    fn test_writes_rejected() {
        for sql in [
            "insert into t values (1)",
            "DELETE FROM t",
            "update t set a = 1",
            "drop table t",
            "create table t (a int)",
        ] {
            assert!(rejected(sql), "{}", sql);
        }
    }

    #[test]
    fn test_select_into_rejected() {
        assert!(rejected("select * into analytics.events_copy from analytics.events"));
        assert!(rejected("with e as (select 1 as a) select a into tmp_a from e"));
        assert!(rejected("select 1 union select * into t2 from t"));
    }

    #[test]
    fn test_row_locks_rejected() {
        assert!(rejected("select * from t for update"));
    }

    #[test]
    fn test_explain_of_write_rejected() {
        assert!(rejected("explain analyze delete from t"));
        assert!(rejected("explain select * into t2 from t"));
    }

    #[test]
    fn test_multiple_statements_rejected() {
        let err = guard().check("select 1; drop table t").unwrap_err();
        assert!(err.to_string().contains("single statement"));
    }

    #[test]
    fn test_semicolons_in_literals_ignored() {
        assert!(guard().check("select ';' as a, \"x;y\" from t").is_ok());
        assert!(guard().check("select $1, $2").is_ok());
        assert!(guard().check("select 1 -- ; drop table t").is_ok());
    }

    #[test]
    fn test_empty_and_unparseable_rejected() {
        assert!(rejected("-- nothing here"));
        assert!(rejected("select 'open"));
        assert!(rejected("selec 1"));
    }
}
