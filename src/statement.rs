//! Compiled statements (C2): a select/update split derived from authorizer
//! callbacks observed during `prepare`, argument binding/validation, and a
//! tiny best-effort splitter for the handful of multi-statement scripts
//! migrations and schema setup actually need (not a general SQL parser).

use std::collections::HashMap;

use crate::error::{ArgumentError, Result};
use crate::value::DatabaseValue;

/// Either positional or named arguments for a single statement.
#[derive(Debug, Clone)]
pub enum StatementArguments {
    Positional(Vec<DatabaseValue>),
    Named(HashMap<String, DatabaseValue>),
}

impl StatementArguments {
    pub fn none() -> Self {
        StatementArguments::Positional(Vec::new())
    }

    pub fn positional(values: impl IntoIterator<Item = impl Into<DatabaseValue>>) -> Self {
        StatementArguments::Positional(values.into_iter().map(Into::into).collect())
    }

    pub fn named(values: impl IntoIterator<Item = (impl Into<String>, impl Into<DatabaseValue>)>) -> Self {
        StatementArguments::Named(
            values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Pops `count` positional values off the front, for handing the rest to
    /// the next statement in a multi-statement script. Errs if this is a
    /// named-argument set, or there aren't enough values left.
    pub(crate) fn take_positional(&mut self, count: usize) -> Result<Vec<DatabaseValue>> {
        match self {
            StatementArguments::Positional(values) => {
                if values.len() < count {
                    return Err(ArgumentError::CountMismatch {
                        expected: count,
                        got: values.len(),
                    }
                    .into());
                }
                Ok(values.drain(0..count).collect())
            }
            StatementArguments::Named(_) => Err(ArgumentError::CountMismatch {
                expected: count,
                got: 0,
            }
            .into()),
        }
    }
}

impl From<Vec<DatabaseValue>> for StatementArguments {
    fn from(v: Vec<DatabaseValue>) -> Self {
        StatementArguments::Positional(v)
    }
}

/// Declared parameter shape of a compiled statement: `?1`-style positional
/// and/or `:name`/`@name`/`$name`-style named parameters, SQLite allows
/// mixing, so we just track both.
#[derive(Debug, Clone, Default)]
pub struct ParameterInfo {
    pub count: usize,
    pub names: Vec<Option<String>>,
}

impl ParameterInfo {
    /// Validates and resolves `args` into a positional vector suitable for
    /// binding, in declared parameter order. Unnamed positional arguments
    /// are permitted to satisfy named parameters, positionally.
    pub(crate) fn resolve(&self, args: &StatementArguments) -> Result<Vec<DatabaseValue>> {
        match args {
            StatementArguments::Positional(values) => {
                if values.len() != self.count {
                    return Err(ArgumentError::CountMismatch {
                        expected: self.count,
                        got: values.len(),
                    }
                    .into());
                }
                Ok(values.clone())
            }
            StatementArguments::Named(map) => {
                let mut resolved = Vec::with_capacity(self.count);
                for name in &self.names {
                    let name = name.as_ref().ok_or_else(|| {
                        ArgumentError::CountMismatch {
                            expected: self.count,
                            got: map.len(),
                        }
                    })?;
                    let value = map
                        .get(name.as_str())
                        .ok_or_else(|| ArgumentError::NoSuchNamedParameter(name.clone()))?;
                    resolved.push(value.clone());
                }
                Ok(resolved)
            }
        }
    }
}

/// Authorizer-derived metadata about one compiled statement.
#[derive(Debug, Clone, Default)]
pub struct StatementMetadata {
    /// Tables touched by `SQLITE_READ` during compilation (select statements)
    /// or by `INSERT`/`UPDATE`/`DELETE` (update statements).
    pub observed_tables: Vec<String>,
    /// Whether compilation observed a schema-mutating action
    /// (`CREATE`/`DROP`/`ALTER` table or index).
    pub is_schema_mutating: bool,
}

/// A compiled `SELECT` (or other row-producing) statement.
#[derive(Debug, Clone)]
pub struct SelectStatement {
    pub sql: String,
    pub parameters: ParameterInfo,
    pub metadata: StatementMetadata,
}

/// A compiled `INSERT`/`UPDATE`/`DELETE`/DDL statement.
#[derive(Debug, Clone)]
pub struct UpdateStatement {
    pub sql: String,
    pub parameters: ParameterInfo,
    pub metadata: StatementMetadata,
}

/// The result of executing an `UpdateStatement`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionOutcome {
    pub changed_row_count: u64,
    pub last_inserted_row_id: Option<i64>,
}

/// Either half of a compiled statement, as returned by `compile`.
#[derive(Debug, Clone)]
pub enum CompiledStatement {
    Select(SelectStatement),
    Update(UpdateStatement),
}

/// Splits a script into individual statements on top-level `;` boundaries,
/// respecting single/double-quoted strings and `--`/`/* */` comments.
/// Deliberately not a parser: anything past quoting and comments is the
/// caller's problem.
pub(crate) fn split_sql_statements(sql: &str) -> Vec<&str> {
    let bytes = sql.as_bytes();
    let mut statements = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;
    let mut in_single = false;
    let mut in_double = false;
    let mut in_line_comment = false;
    let mut in_block_comment = false;

    while i < bytes.len() {
        let b = bytes[i];
        if in_line_comment {
            if b == b'\n' {
                in_line_comment = false;
            }
        } else if in_block_comment {
            if b == b'*' && i + 1 < bytes.len() && bytes[i + 1] == b'/' {
                in_block_comment = false;
                i += 1;
            }
        } else if in_single {
            if b == b'\'' {
                in_single = false;
            }
        } else if in_double {
            if b == b'"' {
                in_double = false;
            }
        } else {
            match b {
                b'\'' => in_single = true,
                b'"' => in_double = true,
                b'-' if i + 1 < bytes.len() && bytes[i + 1] == b'-' => {
                    in_line_comment = true;
                    i += 1;
                }
                b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'*' => {
                    in_block_comment = true;
                    i += 1;
                }
                b';' => {
                    let stmt = sql[start..i].trim();
                    if !stmt.is_empty() {
                        statements.push(stmt);
                    }
                    start = i + 1;
                }
                _ => {}
            }
        }
        i += 1;
    }
    let tail = sql[start..].trim();
    if !tail.is_empty() {
        statements.push(tail);
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_top_level_semicolons() {
        let stmts = split_sql_statements("INSERT INTO t VALUES (1); INSERT INTO t VALUES (2);");
        assert_eq!(stmts, vec!["INSERT INTO t VALUES (1)", "INSERT INTO t VALUES (2)"]);
    }

    #[test]
    fn ignores_semicolons_inside_string_literals() {
        let stmts = split_sql_statements("INSERT INTO t VALUES ('a;b')");
        assert_eq!(stmts, vec!["INSERT INTO t VALUES ('a;b')"]);
    }

    #[test]
    fn ignores_semicolons_inside_line_comments() {
        let stmts = split_sql_statements("SELECT 1; -- trailing; comment\nSELECT 2;");
        assert_eq!(stmts, vec!["SELECT 1", "-- trailing; comment\nSELECT 2"]);
    }

    #[test]
    fn resolve_named_args_in_declared_order() {
        let params = ParameterInfo {
            count: 2,
            names: vec![Some("a".into()), Some("b".into())],
        };
        let args = StatementArguments::named([("b", DatabaseValue::Int64(2)), ("a", DatabaseValue::Int64(1))]);
        let resolved = params.resolve(&args).unwrap();
        assert_eq!(resolved, vec![DatabaseValue::Int64(1), DatabaseValue::Int64(2)]);
    }

    #[test]
    fn resolve_rejects_wrong_positional_count() {
        let params = ParameterInfo { count: 2, names: vec![None, None] };
        let args = StatementArguments::positional([1i64]);
        assert!(params.resolve(&args).is_err());
    }

    #[test]
    fn take_positional_leaves_the_remainder() {
        let mut args = StatementArguments::positional([1i64, 2, 3]);
        let first = args.take_positional(1).unwrap();
        assert_eq!(first, vec![DatabaseValue::Int64(1)]);
        let rest = args.take_positional(2).unwrap();
        assert_eq!(rest, vec![DatabaseValue::Int64(2), DatabaseValue::Int64(3)]);
    }
}
