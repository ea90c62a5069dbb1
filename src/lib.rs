//! A typed, concurrency-safe façade over an embedded SQLite database:
//! values and rows, compiled statements, schema introspection, a
//! worker-affine connection, a serialized writer queue, a WAL reader pool,
//! an expression/query builder, a persistence mapper, a migrator,
//! transaction observation and a fetched-records controller.
//!
//! The crate's only FFI boundary is [`rusqlite`]; everything above
//! `connection` is pure Rust built on top of it.

pub mod config;
pub mod connection;
pub mod controller;
pub mod error;
pub mod facade;
pub mod mapper;
pub mod migrator;
pub mod observation;
pub mod query;
mod queue;
pub mod row;
pub mod schema;
pub mod statement;
pub mod value;

pub use config::{BusyMode, Config, TransactionKind};
pub use connection::Connection;
pub use controller::{ControllerDelegate, FetchSource, FetchedRecordsController, RecordChange};
pub use error::{Error, Result};
pub use facade::{DatabasePool, DatabaseQueue};
pub use mapper::{Mapper, PersistableRecord};
pub use migrator::{ForeignKeyCheckMode, Migrator};
pub use observation::{ChangeEvent, ChangeKind, TransactionObserver};
pub use row::Row;
pub use schema::PrimaryKey;
pub use statement::{
    CompiledStatement, ExecutionOutcome, ParameterInfo, SelectStatement, StatementArguments, StatementMetadata,
    UpdateStatement,
};
pub use value::DatabaseValue;
