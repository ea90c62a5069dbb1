//! Open-time configuration. A flat options struct rather than a builder
//! macro, matching the shape of `AutofillOptions`/`ObserverConfig` elsewhere
//! in the workspace.

use std::sync::Arc;
use std::time::Duration;

/// How a connection reacts to `SQLITE_BUSY`.
#[derive(Clone)]
pub enum BusyMode {
    /// Fail immediately with `SQLITE_BUSY` — the default.
    ImmediateError,
    /// Retry internally up to the given wall-clock budget.
    Timeout(Duration),
    /// A user callback invoked with the retry count; return `false` to
    /// give up and surface `SQLITE_BUSY`.
    Callback(Arc<dyn Fn(i32) -> bool + Send + Sync>),
}

impl Default for BusyMode {
    fn default() -> Self {
        BusyMode::ImmediateError
    }
}

impl std::fmt::Debug for BusyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusyMode::ImmediateError => write!(f, "BusyMode::ImmediateError"),
            BusyMode::Timeout(d) => write!(f, "BusyMode::Timeout({d:?})"),
            BusyMode::Callback(_) => write!(f, "BusyMode::Callback(..)"),
        }
    }
}

/// SQLite's three transaction-opening modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Deferred,
    Immediate,
    Exclusive,
}

impl TransactionKind {
    pub(crate) fn begin_sql(self) -> &'static str {
        match self {
            TransactionKind::Deferred => "BEGIN DEFERRED",
            TransactionKind::Immediate => "BEGIN IMMEDIATE",
            TransactionKind::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

impl Default for TransactionKind {
    fn default() -> Self {
        TransactionKind::Immediate
    }
}

/// Connection-open configuration, applied identically to the writer and to
/// every reader of a pool.
#[derive(Clone)]
pub struct Config {
    pub read_only: bool,
    pub foreign_keys_enabled: bool,
    pub busy_mode: BusyMode,
    pub default_transaction_kind: TransactionKind,
    pub trace: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    /// Used in tracing spans and worker thread names; purely diagnostic.
    pub label: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_only: false,
            foreign_keys_enabled: true,
            busy_mode: BusyMode::default(),
            default_transaction_kind: TransactionKind::default(),
            trace: None,
            label: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("read_only", &self.read_only)
            .field("foreign_keys_enabled", &self.foreign_keys_enabled)
            .field("busy_mode", &self.busy_mode)
            .field("default_transaction_kind", &self.default_transaction_kind)
            .field("trace", &self.trace.is_some())
            .field("label", &self.label)
            .finish()
    }
}
