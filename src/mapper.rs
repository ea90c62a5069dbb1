//! Persistence mapper (C9): derives INSERT/UPDATE/DELETE/EXISTS SQL from a
//! record's column map and the table's primary key, and dispatches CRUD.
//!
//! Generated SQL text is cached by shape — `(table, columns)` for insert,
//! `(table, set columns, where columns)` for update — so repeated saves of
//! the same record type never re-derive or re-quote the same strings.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::connection::Connection;
use crate::error::{ArgumentError, Error, Result};
use crate::schema::{quote_identifier, PrimaryKey};
use crate::statement::{CompiledStatement, ExecutionOutcome, SelectStatement, StatementArguments, UpdateStatement};
use crate::value::DatabaseValue;

/// A record that can describe itself to the mapper: which table it belongs
/// to, and the column values it wants persisted.
pub trait PersistableRecord {
    fn table_name(&self) -> &str;

    /// Every column this record wants to write, keyed by column name.
    /// Columns absent from the map are left untouched by `update`.
    fn persistence_values(&self) -> BTreeMap<String, DatabaseValue>;

    /// Called after a successful insert into a rowid-aliased table, so the
    /// record can adopt the assigned id. No-op by default.
    #[allow(unused_variables)]
    fn did_insert(&mut self, rowid: i64, rowid_column: &str) {}
}

type InsertKey = (String, Vec<String>);
type UpdateKey = (String, Vec<String>, Vec<String>);

#[derive(Default)]
pub struct Mapper {
    insert_cache: RwLock<HashMap<InsertKey, Arc<UpdateStatement>>>,
    update_cache: RwLock<HashMap<UpdateKey, Arc<UpdateStatement>>>,
    exists_cache: RwLock<HashMap<(String, Vec<String>), Arc<SelectStatement>>>,
}

impl Mapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: &Connection, record: &mut dyn PersistableRecord) -> Result<ExecutionOutcome> {
        let table = record.table_name().to_string();
        let values = record.persistence_values();
        if values.is_empty() {
            return Err(ArgumentError::EmptyPersistenceDictionary.into());
        }
        let columns: Vec<String> = values.keys().cloned().collect();
        let key: InsertKey = (table.clone(), columns.clone());
        let stmt = self.insert_statement(conn, &table, &columns, &key)?;

        let bindings: Vec<DatabaseValue> = columns.iter().map(|c| values[c].clone()).collect();
        let outcome = conn.execute_update(&stmt, &StatementArguments::Positional(bindings))?;

        if let Some(rowid) = outcome.last_inserted_row_id {
            if let PrimaryKey::Rowid(rowid_column) = conn.primary_key(&table)?.as_ref() {
                record.did_insert(rowid, rowid_column);
            }
        }
        Ok(outcome)
    }

    fn insert_statement(
        &self,
        conn: &Connection,
        table: &str,
        columns: &[String],
        key: &InsertKey,
    ) -> Result<Arc<UpdateStatement>> {
        if let Some(stmt) = self.insert_cache.read().get(key) {
            return Ok(stmt.clone());
        }
        let column_list = columns.iter().map(|c| quote_identifier(c)).collect::<Vec<_>>().join(", ");
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({column_list}) VALUES ({placeholders})",
            quote_identifier(table)
        );
        let stmt = Arc::new(as_update_statement(conn.compile(&sql)?));
        self.insert_cache.write().insert(key.clone(), stmt.clone());
        Ok(stmt)
    }

    /// Updates non-PK columns in `SET`, PK columns in `WHERE`. If the
    /// record's map is exactly its PK columns, falls back to `PK = PK` so
    /// observers still see a row change.
    pub fn update(&self, conn: &Connection, record: &dyn PersistableRecord) -> Result<()> {
        let table = record.table_name().to_string();
        let values = record.persistence_values();
        if values.is_empty() {
            return Err(ArgumentError::EmptyPersistenceDictionary.into());
        }
        let pk = conn.primary_key(&table)?;
        if pk.is_empty() {
            return Err(ArgumentError::MissingPrimaryKey.into());
        }
        let pk_columns: Vec<String> = pk.columns().into_iter().map(String::from).collect();

        let has_non_null_pk = pk_columns
            .iter()
            .any(|c| !matches!(values.get(c), None | Some(DatabaseValue::Null)));
        if !has_non_null_pk {
            return Err(ArgumentError::NullPrimaryKeyColumn(pk_columns[0].clone()).into());
        }

        let mut set_columns: Vec<String> = values
            .keys()
            .filter(|c| !pk_columns.contains(c))
            .cloned()
            .collect();
        set_columns.sort();
        if set_columns.is_empty() {
            set_columns = pk_columns.clone();
        }

        let key: UpdateKey = (table.clone(), set_columns.clone(), pk_columns.clone());
        let stmt = self.update_statement(conn, &table, &set_columns, &pk_columns, &key)?;

        let mut bindings = Vec::with_capacity(set_columns.len() + pk_columns.len());
        for c in &set_columns {
            bindings.push(values.get(c).cloned().unwrap_or(DatabaseValue::Null));
        }
        for c in &pk_columns {
            bindings.push(values.get(c).cloned().unwrap_or(DatabaseValue::Null));
        }

        let outcome = conn.execute_update(&stmt, &StatementArguments::Positional(bindings))?;
        if outcome.changed_row_count == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn update_statement(
        &self,
        conn: &Connection,
        table: &str,
        set_columns: &[String],
        pk_columns: &[String],
        key: &UpdateKey,
    ) -> Result<Arc<UpdateStatement>> {
        if let Some(stmt) = self.update_cache.read().get(key) {
            return Ok(stmt.clone());
        }
        let set_clause = set_columns
            .iter()
            .map(|c| format!("{} = ?", quote_identifier(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let where_clause = where_clause(pk_columns);
        let sql = format!("UPDATE {} SET {set_clause} WHERE {where_clause}", quote_identifier(table));
        let stmt = Arc::new(as_update_statement(conn.compile(&sql)?));
        self.update_cache.write().insert(key.clone(), stmt.clone());
        Ok(stmt)
    }

    /// Updates when at least one PK column is non-null; falls back to
    /// insert when that update reports `NotFound`.
    pub fn save(&self, conn: &Connection, record: &mut dyn PersistableRecord) -> Result<()> {
        let table = record.table_name().to_string();
        let values = record.persistence_values();
        let pk = conn.primary_key(&table)?;
        let pk_has_value = !pk.is_empty()
            && pk
                .columns()
                .iter()
                .any(|c| !matches!(values.get(*c), None | Some(DatabaseValue::Null)));

        if pk_has_value {
            match self.update(conn, record) {
                Ok(()) => return Ok(()),
                Err(Error::NotFound) => {}
                Err(err) => return Err(err),
            }
        }
        self.insert(conn, record).map(|_| ())
    }

    pub fn delete(&self, conn: &Connection, record: &dyn PersistableRecord) -> Result<bool> {
        let table = record.table_name().to_string();
        let values = record.persistence_values();
        let pk = conn.primary_key(&table)?;
        if pk.is_empty() {
            return Err(ArgumentError::MissingPrimaryKey.into());
        }
        let pk_columns: Vec<String> = pk.columns().into_iter().map(String::from).collect();
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            quote_identifier(&table),
            where_clause(&pk_columns)
        );
        let stmt = as_update_statement(conn.compile(&sql)?);
        let bindings = pk_bindings(&pk_columns, &values);
        let outcome = conn.execute_update(&stmt, &StatementArguments::Positional(bindings))?;
        Ok(outcome.changed_row_count > 0)
    }

    pub fn exists(&self, conn: &Connection, record: &dyn PersistableRecord) -> Result<bool> {
        let table = record.table_name().to_string();
        let values = record.persistence_values();
        let pk = conn.primary_key(&table)?;
        if pk.is_empty() {
            return Err(ArgumentError::MissingPrimaryKey.into());
        }
        let pk_columns: Vec<String> = pk.columns().into_iter().map(String::from).collect();
        let key = (table.clone(), pk_columns.clone());
        let stmt = self.exists_statement(conn, &table, &pk_columns, &key)?;
        let bindings = pk_bindings(&pk_columns, &values);
        let row = conn.fetch_one(&stmt, &StatementArguments::Positional(bindings))?;
        Ok(row.is_some())
    }

    fn exists_statement(
        &self,
        conn: &Connection,
        table: &str,
        pk_columns: &[String],
        key: &(String, Vec<String>),
    ) -> Result<Arc<SelectStatement>> {
        if let Some(stmt) = self.exists_cache.read().get(key) {
            return Ok(stmt.clone());
        }
        let sql = format!(
            "SELECT 1 FROM {} WHERE {} LIMIT 1",
            quote_identifier(table),
            where_clause(pk_columns)
        );
        let stmt = Arc::new(match conn.compile(&sql)? {
            CompiledStatement::Select(s) => s,
            CompiledStatement::Update(_) => unreachable!("SELECT never compiles to an UpdateStatement"),
        });
        self.exists_cache.write().insert(key.clone(), stmt.clone());
        Ok(stmt)
    }
}

fn where_clause(pk_columns: &[String]) -> String {
    pk_columns
        .iter()
        .map(|c| format!("{} = ?", quote_identifier(c)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn pk_bindings(pk_columns: &[String], values: &BTreeMap<String, DatabaseValue>) -> Vec<DatabaseValue> {
    pk_columns
        .iter()
        .map(|c| values.get(c).cloned().unwrap_or(DatabaseValue::Null))
        .collect()
}

fn as_update_statement(compiled: CompiledStatement) -> UpdateStatement {
    match compiled {
        CompiledStatement::Update(u) => u,
        CompiledStatement::Select(_) => unreachable!("INSERT/UPDATE/DELETE never compile to a SelectStatement"),
    }
}
