//! Connection (C4): one owned `sqlite3` handle — compilation, execution,
//! transactions, schema introspection, function/collation registration,
//! and the worker-affinity stamp that prevents a handle from being driven
//! off its assigned thread.

use std::cell::Cell;
use std::os::raw::{c_int, c_void};
use std::sync::Arc;

use rusqlite::hooks::{AuthAction, Authorization};
use rusqlite::trace::{TraceEvent, TraceEventCodes};
use rusqlite::Connection as RawConnection;
use rusqlite::OpenFlags;
use tracing::{debug, instrument, trace};

use crate::config::{BusyMode, Config, TransactionKind};
use crate::error::{DatabaseError, Error, Result};
use crate::observation::{ChangeEvent, ChangeKind, ObservationCenter, TransactionObserver};
use crate::row::{self, Row};
use crate::schema::{self, PrimaryKey, SchemaCache};
use crate::statement::{
    split_sql_statements, CompiledStatement, ExecutionOutcome, ParameterInfo, SelectStatement,
    StatementArguments, StatementMetadata, UpdateStatement,
};
use crate::value::DatabaseValue;

thread_local! {
    static CURRENT_STAMP: Cell<Option<u64>> = const { Cell::new(None) };
}

static NEXT_STAMP: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

fn next_stamp() -> u64 {
    NEXT_STAMP.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

/// `sqlite3_busy_handler` trampoline: `arg` is a `*const Arc<dyn Fn(i32) ->
/// bool + Send + Sync>` kept alive for the connection's lifetime in
/// `Connection::busy_handler_state`. rusqlite's own `busy_handler` wrapper
/// only accepts a bare `fn` pointer, which can't carry a per-connection
/// `BusyMode::Callback` closure, so `BusyMode::Callback` goes through this
/// raw `libsqlite3-sys` entry point instead.
unsafe extern "C" fn busy_handler_trampoline(arg: *mut c_void, count: c_int) -> c_int {
    let callback = &*(arg as *const Arc<dyn Fn(i32) -> bool + Send + Sync>);
    c_int::from(callback(count))
}

/// Marks the calling thread as the worker for `stamp`. Called once by the
/// serialized worker (C5) that owns a `Connection` before running any job
/// on it.
pub(crate) fn bind_current_thread(stamp: u64) {
    CURRENT_STAMP.with(|c| c.set(Some(stamp)));
}

/// One open SQLite database handle. Not `Sync` — a `Connection` is meant
/// to live on exactly one worker thread for its whole lifetime (C5 pins
/// it there); `bind_current_thread` records which thread that is, and
/// every public method asserts against it in debug and release alike
/// (getting this wrong is a correctness bug, not a perf one).
pub struct Connection {
    raw: RawConnection,
    config: Config,
    schema_cache: SchemaCache,
    pub(crate) observation: Arc<ObservationCenter>,
    stamp: u64,
    // Backing storage for a `BusyMode::Callback`'s trampoline `arg` pointer;
    // never read again after `from_raw`, only kept alive. `None` for every
    // other `BusyMode`.
    #[allow(dead_code)]
    busy_handler_state: Option<Box<Arc<dyn Fn(i32) -> bool + Send + Sync>>>,
}

impl Connection {
    #[instrument(skip(config), fields(read_only = config.read_only))]
    pub fn open(path: &str, config: Config) -> Result<Self> {
        let flags = if config.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
        };
        let raw = RawConnection::open_with_flags(path, flags)?;
        let stamp = next_stamp();
        let conn = Self::from_raw(raw, config, stamp)?;
        debug!(path, "opened connection");
        Ok(conn)
    }

    pub fn open_in_memory(config: Config) -> Result<Self> {
        let raw = RawConnection::open_in_memory()?;
        let stamp = next_stamp();
        Self::from_raw(raw, config, stamp)
    }

    fn from_raw(raw: RawConnection, config: Config, stamp: u64) -> Result<Self> {
        // The thread that opens a connection is its worker until the
        // serialized queue (C5) rebinds it from inside the dedicated
        // worker thread it spawns.
        bind_current_thread(stamp);

        if config.foreign_keys_enabled {
            raw.execute_batch("PRAGMA foreign_keys = ON")?;
        }
        let mut busy_handler_state: Option<Box<Arc<dyn Fn(i32) -> bool + Send + Sync>>> = None;
        match &config.busy_mode {
            BusyMode::ImmediateError => {
                raw.busy_handler(None)?;
            }
            BusyMode::Timeout(duration) => {
                raw.busy_timeout(*duration)?;
            }
            BusyMode::Callback(callback) => {
                // rusqlite's safe `busy_handler` wrapper only accepts a bare
                // `fn(i32) -> bool`, which can't close over this config's
                // `Arc<dyn Fn>`. Register directly through libsqlite3-sys
                // instead, keeping the boxed callback alive in
                // `busy_handler_state` for as long as the connection lives.
                let boxed: Box<Arc<dyn Fn(i32) -> bool + Send + Sync>> = Box::new(callback.clone());
                let arg = boxed.as_ref() as *const Arc<dyn Fn(i32) -> bool + Send + Sync> as *mut c_void;
                unsafe {
                    rusqlite::ffi::sqlite3_busy_handler(raw.handle(), Some(busy_handler_trampoline), arg);
                }
                busy_handler_state = Some(boxed);
            }
        }
        if let Some(trace_fn) = config.trace.clone() {
            raw.trace_v2(
                TraceEventCodes::SQLITE_TRACE_STMT,
                Some(move |event: TraceEvent<'_>| {
                    if let TraceEvent::Statement(_, sql) = event {
                        trace_fn(sql);
                    }
                }),
            );
        }

        let conn = Self {
            raw,
            config,
            schema_cache: SchemaCache::default(),
            observation: Arc::new(ObservationCenter::default()),
            stamp,
            busy_handler_state,
        };
        conn.install_hooks();
        Ok(conn)
    }

    pub fn stamp(&self) -> u64 {
        self.stamp
    }

    /// Asserts the caller is running on this connection's bound worker
    /// thread.
    pub fn assert_on_worker(&self) -> Result<()> {
        let actual = CURRENT_STAMP.with(|c| c.get()).unwrap_or(0);
        if actual != self.stamp {
            return Err(Error::WrongWorker {
                expected: self.stamp,
                actual,
            });
        }
        Ok(())
    }

    fn install_hooks(&self) {
        let observation = self.observation.clone();
        self.raw.update_hook(Some(move |action, db_name: &str, table_name: &str, row_id: i64| {
            let kind = match action {
                rusqlite::hooks::Action::SQLITE_INSERT => ChangeKind::Insert,
                rusqlite::hooks::Action::SQLITE_UPDATE => ChangeKind::Update,
                rusqlite::hooks::Action::SQLITE_DELETE => ChangeKind::Delete,
                _ => return,
            };
            observation.on_row_changed(ChangeEvent {
                kind,
                database_name: db_name.to_string(),
                table_name: table_name.to_string(),
                row_id,
            });
        }));

        // The commit hook is the only raw SQLite hook we need: it fires for
        // every top-level commit, implicit (a single autocommit statement)
        // or explicit (an in-progress `BEGIN`/`COMMIT`), so it is also the
        // only point that reliably knows a commit actually went through.
        // Returning `true` vetoes it — SQLite converts the commit into a
        // rollback and the call that triggered it (`execute_update`, or an
        // explicit `COMMIT`) sees the failure and asks `finish_rollback` for
        // the veto reason. A `rollback_hook` is deliberately not registered:
        // there is no post-commit hook to pair it with, so it would fire for
        // both real rollbacks and converted-commit rollbacks with no way to
        // tell which, double-dispatching `did_rollback` for the latter.
        let observation = self.observation.clone();
        self.raw.commit_hook(Some(move || {
            if observation.on_will_commit() {
                true
            } else {
                observation.finish_commit();
                false
            }
        }));
    }

    pub fn add_observer(&self, observer: &Arc<dyn TransactionObserver>) {
        self.observation.add(observer);
    }

    // ------------------------------------------------------------------
    // Compilation (C2)
    // ------------------------------------------------------------------

    #[instrument(skip(self, sql), fields(sql))]
    pub fn compile(&self, sql: &str) -> Result<CompiledStatement> {
        self.assert_on_worker()?;

        let observed: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let is_ddl = Arc::new(std::sync::atomic::AtomicBool::new(false));
        {
            let observed = observed.clone();
            let is_ddl = is_ddl.clone();
            self.raw.authorizer(Some(move |ctx: rusqlite::hooks::AuthContext<'_>| {
                let debug_repr = format!("{:?}", ctx.action);
                if debug_repr.starts_with("Create") || debug_repr.starts_with("Drop") || debug_repr.starts_with("Alter") {
                    is_ddl.store(true, std::sync::atomic::Ordering::Relaxed);
                }
                match ctx.action {
                    AuthAction::Read { table_name, .. } => {
                        observed.lock().unwrap().push(table_name.to_string());
                    }
                    AuthAction::Insert { table_name } => {
                        observed.lock().unwrap().push(table_name.to_string());
                    }
                    AuthAction::Update { table_name, .. } => {
                        observed.lock().unwrap().push(table_name.to_string());
                    }
                    AuthAction::Delete { table_name } => {
                        observed.lock().unwrap().push(table_name.to_string());
                    }
                    _ => {}
                }
                Authorization::Allow
            }));
        }

        let stmt = self.raw.prepare(sql);
        self.raw
            .authorizer(None::<fn(rusqlite::hooks::AuthContext<'_>) -> Authorization>);
        let stmt = stmt?;

        let is_readonly = stmt.readonly();
        let mut names = Vec::with_capacity(stmt.parameter_count());
        for i in 1..=stmt.parameter_count() {
            names.push(stmt.parameter_name(i).map(|n| n.trim_start_matches([':', '@', '$']).to_string()));
        }
        let parameters = ParameterInfo {
            count: stmt.parameter_count(),
            names,
        };
        let mut observed_tables: Vec<String> = observed.lock().unwrap().clone();
        observed_tables.sort();
        observed_tables.dedup();
        let metadata = StatementMetadata {
            observed_tables,
            is_schema_mutating: is_ddl.load(std::sync::atomic::Ordering::Relaxed),
        };

        trace!(readonly = is_readonly, tables = ?metadata.observed_tables, "compiled statement");

        Ok(if is_readonly {
            CompiledStatement::Select(SelectStatement {
                sql: sql.to_string(),
                parameters,
                metadata,
            })
        } else {
            if metadata.is_schema_mutating {
                self.schema_cache.invalidate();
            }
            CompiledStatement::Update(UpdateStatement {
                sql: sql.to_string(),
                parameters,
                metadata,
            })
        })
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Executes an update statement, returning the number of changed rows
    /// and, if the table has a rowid, the last inserted rowid.
    pub fn execute_update(&self, stmt: &UpdateStatement, args: &StatementArguments) -> Result<ExecutionOutcome> {
        self.assert_on_worker()?;
        let values = stmt.parameters.resolve(args)?;
        let mut prepared = self.raw.prepare_cached(&stmt.sql)?;
        let params = values.iter().map(|v| v as &dyn rusqlite::types::ToSql).collect::<Vec<_>>();
        let changed = match prepared.execute(params.as_slice()) {
            Ok(changed) => changed,
            Err(err) => {
                if let Some(veto) = self.observation.finish_rollback() {
                    return Err(veto);
                }
                return Err(Error::from(DatabaseError::from(err)));
            }
        };
        Ok(ExecutionOutcome {
            changed_row_count: changed as u64,
            last_inserted_row_id: Some(self.raw.last_insert_rowid()),
        })
    }

    /// Runs every row of a select statement through `visitor`, passing a
    /// live `rusqlite::Row` valid only for the duration of the call —
    /// the internal "live view". Callers that need to
    /// retain rows should detach them with `row::detach` inside `visitor`.
    pub fn for_each_row(
        &self,
        stmt: &SelectStatement,
        args: &StatementArguments,
        mut visitor: impl FnMut(&rusqlite::Row<'_>) -> Result<()>,
    ) -> Result<()> {
        self.assert_on_worker()?;
        let values = stmt.parameters.resolve(args)?;
        let mut prepared = self.raw.prepare_cached(&stmt.sql)?;
        let params = values.iter().map(|v| v as &dyn rusqlite::types::ToSql).collect::<Vec<_>>();
        let mut rows = prepared.query(params.as_slice())?;
        while let Some(row) = rows.next()? {
            visitor(row)?;
        }
        Ok(())
    }

    /// Materializes every row of a select statement as detached `Row`s.
    pub fn fetch_all(&self, stmt: &SelectStatement, args: &StatementArguments) -> Result<Vec<Row>> {
        let mut out = Vec::new();
        self.for_each_row(stmt, args, |raw_row| {
            out.push(row::detach(raw_row)?);
            Ok(())
        })?;
        Ok(out)
    }

    pub fn fetch_one(&self, stmt: &SelectStatement, args: &StatementArguments) -> Result<Option<Row>> {
        let mut out = None;
        let mut seen = false;
        self.for_each_row(stmt, args, |raw_row| {
            if !seen {
                out = Some(row::detach(raw_row)?);
                seen = true;
            }
            Ok(())
        })?;
        Ok(out)
    }

    /// Compiles and executes a (possibly multi-statement) script, splitting
    /// top-level `;` boundaries and handing each statement its own prefix
    /// of `args` as consumable positional arguments. Returns the outcome
    /// of the *last* statement.
    pub fn execute(&self, sql: &str, mut args: StatementArguments) -> Result<ExecutionOutcome> {
        self.assert_on_worker()?;
        let statements = split_sql_statements(sql);
        if statements.is_empty() {
            return Ok(ExecutionOutcome::default());
        }
        let mut outcome = ExecutionOutcome::default();
        for piece in statements {
            let compiled = self.compile(piece)?;
            let count = match &compiled {
                CompiledStatement::Update(update) => update.parameters.count,
                CompiledStatement::Select(select) => select.parameters.count,
            };
            let is_named = matches!(&args, StatementArguments::Named(_));
            let piece_args = if is_named {
                args.clone()
            } else {
                StatementArguments::Positional(args.take_positional(count)?)
            };
            match compiled {
                CompiledStatement::Update(update) => {
                    outcome = self.execute_update(&update, &piece_args)?;
                }
                CompiledStatement::Select(select) => {
                    self.for_each_row(&select, &piece_args, |_| Ok(()))?;
                }
            }
        }
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Schema introspection (C3/C4)
    // ------------------------------------------------------------------

    pub fn primary_key(&self, table: &str) -> Result<Arc<PrimaryKey>> {
        self.assert_on_worker()?;
        self.schema_cache.primary_key(&self.raw, table)
    }

    pub fn column_names(&self, table: &str) -> Result<Vec<String>> {
        self.assert_on_worker()?;
        schema::fetch_column_names(&self.raw, table)
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub fn begin(&self, kind: TransactionKind) -> Result<()> {
        self.assert_on_worker()?;
        self.raw.execute_batch(kind.begin_sql())?;
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        self.assert_on_worker()?;
        // `finish_commit` is already dispatched from the commit hook itself
        // (`install_hooks`) the instant SQLite agrees to commit; a success
        // here just means that already happened.
        match self.raw.execute_batch("COMMIT") {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(veto) = self.observation.finish_rollback() {
                    return Err(veto);
                }
                Err(Error::from(DatabaseError::from(err)))
            }
        }
    }

    pub fn rollback(&self) -> Result<()> {
        self.assert_on_worker()?;
        // A ROLLBACK that fails with FULL/IOERR/BUSY/NOMEM likely means
        // SQLite already rolled back on its own; swallow it.
        match self.raw.execute_batch("ROLLBACK") {
            Ok(()) => {}
            Err(rusqlite::Error::SqliteFailure(ffi_err, _))
                if matches!(
                    ffi_err.code,
                    rusqlite::ErrorCode::DatabaseFull
                        | rusqlite::ErrorCode::SystemIoFailure
                        | rusqlite::ErrorCode::DatabaseBusy
                        | rusqlite::ErrorCode::OutOfMemory
                ) => {}
            Err(err) => return Err(Error::from(DatabaseError::from(err))),
        }
        let _ = self.observation.finish_rollback();
        Ok(())
    }

    /// Runs `body` inside a transaction of `kind`, committing on success
    /// and rolling back (propagating the original error) on failure.
    pub fn in_transaction<T>(&self, kind: TransactionKind, body: impl FnOnce() -> Result<T>) -> Result<T> {
        self.begin(kind)?;
        match body() {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                self.rollback()?;
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // Functions & collations
    // ------------------------------------------------------------------

    pub fn create_scalar_function<F>(&self, name: &str, arg_count: i32, deterministic: bool, function: F) -> Result<()>
    where
        F: Fn(&rusqlite::functions::Context<'_>) -> rusqlite::Result<DatabaseValue> + Send + Sync + 'static,
    {
        self.assert_on_worker()?;
        let flags = if deterministic {
            rusqlite::functions::FunctionFlags::SQLITE_UTF8 | rusqlite::functions::FunctionFlags::SQLITE_DETERMINISTIC
        } else {
            rusqlite::functions::FunctionFlags::SQLITE_UTF8
        };
        self.raw.create_scalar_function(name, arg_count, flags, move |ctx| {
            let value = function(ctx)?;
            Ok(rusqlite::types::Value::from(value))
        })?;
        Ok(())
    }

    pub fn remove_function(&self, name: &str, arg_count: i32) -> Result<()> {
        self.assert_on_worker()?;
        self.raw.remove_function(name, arg_count)?;
        Ok(())
    }

    pub fn create_collation<F>(&self, name: &str, compare: F) -> Result<()>
    where
        F: Fn(&str, &str) -> std::cmp::Ordering + Send + Sync + 'static,
    {
        self.assert_on_worker()?;
        self.raw.create_collation(name, compare)?;
        Ok(())
    }

    pub fn remove_collation(&self, name: &str) -> Result<()> {
        self.assert_on_worker()?;
        self.raw.remove_collation(name)?;
        Ok(())
    }

    /// Releases cached pages/statements back to the OS, per
    /// `sqlite3_db_release_memory` (pool-wide memory pressure handling).
    pub fn release_memory(&self) -> Result<()> {
        self.assert_on_worker()?;
        self.raw.execute_batch("PRAGMA shrink_memory")?;
        Ok(())
    }

    pub(crate) fn raw(&self) -> &RawConnection {
        &self.raw
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
