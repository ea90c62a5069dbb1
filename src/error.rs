//! Error taxonomy for the database façade.
//!
//! Each concern gets its own `thiserror` enum, following the shape used
//! throughout the workspace (`SyncError`, `AuthError`, `CryptoError`): flat
//! variants, `{field}` interpolation, `#[from]` bridges for the handful of
//! external error types we actually cross.

use std::fmt;

use thiserror::Error;

/// Top-level error returned by every public operation in this crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error(transparent)]
    Argument(#[from] ArgumentError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    CommitVetoed(#[from] CommitVetoed),

    #[error("operation ran on the wrong worker (expected stamp {expected}, got {actual})")]
    WrongWorker { expected: u64, actual: u64 },

    #[error("record not found")]
    NotFound,
}

/// Any failure surfaced by the underlying SQLite API.
#[derive(Debug, Error)]
#[error("{}", format_database_error(.code, .message.as_deref(), .sql.as_deref(), .arguments.as_deref()))]
pub struct DatabaseError {
    /// The raw SQLite result code (e.g. 19 for `SQLITE_CONSTRAINT`).
    pub code: i32,
    pub message: Option<String>,
    pub sql: Option<String>,
    pub arguments: Option<String>,
}

impl DatabaseError {
    pub fn new(code: i32, message: impl Into<Option<String>>) -> Self {
        Self {
            code,
            message: message.into(),
            sql: None,
            arguments: None,
        }
    }

    pub fn with_context(mut self, sql: Option<String>, arguments: Option<String>) -> Self {
        self.sql = sql;
        self.arguments = arguments;
        self
    }
}

fn format_database_error(
    code: i32,
    message: Option<&str>,
    sql: Option<&str>,
    arguments: Option<&str>,
) -> String {
    let mut out = format!("SQLite error {code}");
    if let Some(message) = message {
        out.push_str(": ");
        out.push_str(message);
    }
    if let Some(sql) = sql {
        out.push_str(" — while executing `");
        out.push_str(sql);
        out.push('`');
    }
    if let Some(arguments) = arguments {
        out.push_str(" with arguments ");
        out.push_str(arguments);
    }
    out
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        let code = sqlite_error_code(&err);
        DatabaseError::new(code, Some(err.to_string()))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(DatabaseError::from(err))
    }
}

fn sqlite_error_code(err: &rusqlite::Error) -> i32 {
    match err {
        rusqlite::Error::SqliteFailure(ffi_err, _) => ffi_err.extended_code,
        _ => -1,
    }
}

/// A fetched value was NULL or type-incompatible with the requested Rust type.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("column {column:?} is NULL but was requested as a non-optional value")]
    UnexpectedNull { column: ColumnRef },

    #[error("column {column:?} holds a value of a different storage class and cannot convert")]
    TypeMismatch { column: ColumnRef },

    #[error("no column named {0:?}")]
    NoSuchColumn(String),
}

/// Identifies a column by index or name, for error messages.
#[derive(Debug, Clone)]
pub enum ColumnRef {
    Index(usize),
    Name(String),
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnRef::Index(i) => write!(f, "#{i}"),
            ColumnRef::Name(n) => write!(f, "{n:?}"),
        }
    }
}

/// Wrong number/naming of bound parameters, or an invalid primary-key value.
#[derive(Debug, Error)]
pub enum ArgumentError {
    #[error("statement expects {expected} argument(s), got {got}")]
    CountMismatch { expected: usize, got: usize },

    #[error("statement has no parameter named {0:?}")]
    NoSuchNamedParameter(String),

    #[error("persistence dictionary is empty")]
    EmptyPersistenceDictionary,

    #[error("primary key column {0:?} must be non-null")]
    NullPrimaryKeyColumn(String),

    #[error("record has no primary key columns to act on")]
    MissingPrimaryKey,
}

/// A required table or primary key is missing, or a query cannot be
/// deterministically ordered.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("table {0:?} has no columns (does it exist?)")]
    NoSuchTable(String),

    #[error("table {0:?} has no primary key and ordering was requested via reverse()")]
    NoDeterministicOrdering(String),

    #[error("reverse() requires a plain table source, found a derived query")]
    ReverseRequiresTable,

    #[error("foreign key check failed after migration {identifier:?}: {violations} violation(s)")]
    ForeignKeyViolation {
        identifier: String,
        violations: usize,
    },
}

/// A migration-specific failure (distinct from the underlying `SchemaError`
/// so callers can match on "which migration" independently of "why").
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration {0:?} is registered twice")]
    DuplicateIdentifier(String),

    #[error("migration {identifier:?} failed: {source}")]
    Failed {
        identifier: String,
        #[source]
        source: Box<Error>,
    },
}

/// An observer's `will_commit` vetoed the transaction; SQLite has already
/// rolled back by the time this is surfaced to the caller.
#[derive(Debug, Error)]
#[error("commit vetoed by observer: {source}")]
pub struct CommitVetoed {
    #[source]
    pub source: Box<Error>,
}

pub type Result<T> = std::result::Result<T, Error>;
