//! Migrator (C10): an ordered list of named migrations applied against the
//! `grdb_migrations` meta table, each running inside its own transaction
//! under one of two foreign-key enforcement modes.

use std::collections::HashSet;

use tracing::{debug, instrument};

use crate::config::TransactionKind;
use crate::connection::Connection;
use crate::error::{Error, MigrationError, Result, SchemaError};
use crate::statement::{CompiledStatement, StatementArguments};

/// How a migration's body interacts with foreign key enforcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignKeyCheckMode {
    /// Runs inside a transaction with FK enforcement exactly as configured.
    Standard,
    /// Disables FK enforcement for the duration of the migration, then
    /// runs `PRAGMA foreign_key_check` before commit; any reported
    /// violation aborts the migration. FK enforcement is restored
    /// afterward regardless of outcome.
    DeferredForeignKeys,
}

type MigrateFn = Box<dyn Fn(&Connection) -> Result<()> + Send + Sync>;

struct Migration {
    identifier: String,
    mode: ForeignKeyCheckMode,
    migrate: MigrateFn,
}

/// Holds the ordered list of registered migrations and applies the ones a
/// given database hasn't recorded yet.
#[derive(Default)]
pub struct Migrator {
    migrations: Vec<Migration>,
}

impl Migrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a migration. Errs if `identifier` is already registered.
    pub fn register(
        &mut self,
        identifier: impl Into<String>,
        mode: ForeignKeyCheckMode,
        migrate: impl Fn(&Connection) -> Result<()> + Send + Sync + 'static,
    ) -> Result<()> {
        let identifier = identifier.into();
        if self.migrations.iter().any(|m| m.identifier == identifier) {
            return Err(MigrationError::DuplicateIdentifier(identifier).into());
        }
        self.migrations.push(Migration {
            identifier,
            mode,
            migrate: Box::new(migrate),
        });
        Ok(())
    }

    pub fn registered_identifiers(&self) -> impl Iterator<Item = &str> {
        self.migrations.iter().map(|m| m.identifier.as_str())
    }

    /// Ensures the meta table exists, then applies every migration not yet
    /// recorded there, in registration order.
    #[instrument(skip(self, conn))]
    pub fn migrate(&self, conn: &Connection) -> Result<()> {
        self.ensure_meta_table(conn)?;
        let applied = self.applied_identifiers(conn)?;
        for migration in &self.migrations {
            if applied.contains(&migration.identifier) {
                continue;
            }
            debug!(identifier = %migration.identifier, "applying migration");
            self.apply_one(conn, migration)?;
        }
        Ok(())
    }

    fn ensure_meta_table(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS grdb_migrations (identifier TEXT NOT NULL PRIMARY KEY)",
            StatementArguments::none(),
        )?;
        Ok(())
    }

    fn applied_identifiers(&self, conn: &Connection) -> Result<HashSet<String>> {
        let stmt = match conn.compile("SELECT identifier FROM grdb_migrations")? {
            CompiledStatement::Select(s) => s,
            CompiledStatement::Update(_) => unreachable!("SELECT never compiles to an UpdateStatement"),
        };
        let rows = conn.fetch_all(&stmt, &StatementArguments::none())?;
        Ok(rows
            .iter()
            .filter_map(|r| r.get_named("identifier").and_then(|v| v.as_str()).map(str::to_string))
            .collect())
    }

    fn apply_one(&self, conn: &Connection, migration: &Migration) -> Result<()> {
        let result = match migration.mode {
            ForeignKeyCheckMode::Standard => self.apply_standard(conn, migration),
            ForeignKeyCheckMode::DeferredForeignKeys => self.apply_deferred(conn, migration),
        };
        result.map_err(|err| {
            Error::from(MigrationError::Failed {
                identifier: migration.identifier.clone(),
                source: Box::new(err),
            })
        })
    }

    fn apply_standard(&self, conn: &Connection, migration: &Migration) -> Result<()> {
        conn.in_transaction(TransactionKind::Immediate, || {
            (migration.migrate)(conn)?;
            self.record_applied(conn, &migration.identifier)
        })
    }

    /// Disables FK enforcement for the transaction, checks for violations
    /// before commit, and restores enforcement on every exit path.
    fn apply_deferred(&self, conn: &Connection, migration: &Migration) -> Result<()> {
        let restore_sql = if conn.config().foreign_keys_enabled {
            "PRAGMA foreign_keys = ON"
        } else {
            "PRAGMA foreign_keys = OFF"
        };
        conn.execute("PRAGMA foreign_keys = OFF", StatementArguments::none())?;

        let identifier = migration.identifier.clone();
        let result = conn.in_transaction(TransactionKind::Immediate, || {
            (migration.migrate)(conn)?;
            let violations = self.foreign_key_violation_count(conn)?;
            if violations > 0 {
                return Err(Error::from(SchemaError::ForeignKeyViolation {
                    identifier: identifier.clone(),
                    violations,
                }));
            }
            self.record_applied(conn, &identifier)
        });

        conn.execute(restore_sql, StatementArguments::none())?;
        result
    }

    fn foreign_key_violation_count(&self, conn: &Connection) -> Result<usize> {
        let stmt = match conn.compile("PRAGMA foreign_key_check")? {
            CompiledStatement::Select(s) => s,
            CompiledStatement::Update(_) => unreachable!("a PRAGMA that reports rows compiles as a SELECT"),
        };
        let rows = conn.fetch_all(&stmt, &StatementArguments::none())?;
        Ok(rows.len())
    }

    fn record_applied(&self, conn: &Connection, identifier: &str) -> Result<()> {
        conn.execute(
            "INSERT INTO grdb_migrations (identifier) VALUES (?)",
            StatementArguments::positional([identifier.to_string()]),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn conn() -> Connection {
        Connection::open_in_memory(Config::default()).unwrap()
    }

    #[test]
    fn applies_migrations_in_order_and_records_them() {
        let conn = conn();
        let mut migrator = Migrator::new();
        migrator
            .register("001_create_readers", ForeignKeyCheckMode::Standard, |conn| {
                conn.execute(
                    "CREATE TABLE readers(id INTEGER PRIMARY KEY, name TEXT)",
                    StatementArguments::none(),
                )?;
                Ok(())
            })
            .unwrap();
        migrator
            .register("002_seed_readers", ForeignKeyCheckMode::Standard, |conn| {
                conn.execute(
                    "INSERT INTO readers(name) VALUES ('Arthur')",
                    StatementArguments::none(),
                )?;
                Ok(())
            })
            .unwrap();

        migrator.migrate(&conn).unwrap();

        let applied = migrator.applied_identifiers(&conn).unwrap();
        assert!(applied.contains("001_create_readers"));
        assert!(applied.contains("002_seed_readers"));
    }

    #[test]
    fn already_applied_migrations_are_skipped() {
        let conn = conn();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut migrator = Migrator::new();
        let calls_clone = calls.clone();
        migrator
            .register("001_init", ForeignKeyCheckMode::Standard, move |conn| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                conn.execute("CREATE TABLE t(id INTEGER PRIMARY KEY)", StatementArguments::none())?;
                Ok(())
            })
            .unwrap();

        migrator.migrate(&conn).unwrap();
        migrator.migrate(&conn).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_identifier_is_rejected() {
        let mut migrator = Migrator::new();
        migrator.register("001_init", ForeignKeyCheckMode::Standard, |_| Ok(())).unwrap();
        let err = migrator
            .register("001_init", ForeignKeyCheckMode::Standard, |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::Migration(MigrationError::DuplicateIdentifier(_))));
    }

    #[test]
    fn failing_migration_is_wrapped_and_not_recorded() {
        let conn = conn();
        let mut migrator = Migrator::new();
        migrator
            .register("001_bad", ForeignKeyCheckMode::Standard, |conn| {
                conn.execute("SELECT * FROM nonexistent_table", StatementArguments::none())?;
                Ok(())
            })
            .unwrap();

        let err = migrator.migrate(&conn).unwrap_err();
        assert!(matches!(err, Error::Migration(MigrationError::Failed { .. })));
        assert!(migrator.applied_identifiers(&conn).unwrap().is_empty());
    }

    #[test]
    fn deferred_fk_mode_restores_enforcement_and_catches_violations() {
        let conn = conn();
        conn.execute(
            "CREATE TABLE parents(id INTEGER PRIMARY KEY); \
             CREATE TABLE children(id INTEGER PRIMARY KEY, parent_id INTEGER REFERENCES parents(id))",
            StatementArguments::none(),
        )
        .unwrap();

        let mut migrator = Migrator::new();
        migrator
            .register("001_orphan_insert", ForeignKeyCheckMode::DeferredForeignKeys, |conn| {
                conn.execute(
                    "INSERT INTO children(id, parent_id) VALUES (1, 999)",
                    StatementArguments::none(),
                )?;
                Ok(())
            })
            .unwrap();

        let err = migrator.migrate(&conn).unwrap_err();
        assert!(matches!(
            err,
            Error::Migration(MigrationError::Failed { .. })
        ));

        let row = conn
            .fetch_one(
                &match conn.compile("PRAGMA foreign_keys").unwrap() {
                    CompiledStatement::Select(s) => s,
                    _ => unreachable!(),
                },
                &StatementArguments::none(),
            )
            .unwrap()
            .unwrap();
        assert_eq!(row.get(0).and_then(|v| v.as_i64()), Some(1));
    }
}
