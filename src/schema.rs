//! Schema introspection and the per-connection cache of primary keys and
//! compiled statements (C3).
//!
//! Introspection rules are verbatim SQLite's own: a single-column primary
//! key whose declared type is exactly `"INTEGER"` (case-insensitive)
//! becomes a rowid alias; any composite key is always `Regular`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rusqlite::Connection as RawConnection;
use tracing::trace;

use crate::error::{Result, SchemaError};

/// A table's primary key, as SQLite itself would report it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimaryKey {
    /// No declared primary key.
    None,
    /// A single `INTEGER PRIMARY KEY` column aliasing the rowid.
    Rowid(String),
    /// One or more non-rowid-aliasing primary key columns, in declaration order.
    Regular(Vec<String>),
}

impl PrimaryKey {
    /// The columns this key is made of, empty for `None`.
    pub fn columns(&self) -> Vec<&str> {
        match self {
            PrimaryKey::None => Vec::new(),
            PrimaryKey::Rowid(c) => vec![c.as_str()],
            PrimaryKey::Regular(cs) => cs.iter().map(String::as_str).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, PrimaryKey::None)
    }
}

struct ColumnInfo {
    name: String,
    decl_type: String,
    pk_index: i64, // 0 = not part of PK; otherwise 1-based position
}

/// Reads `PRAGMA table_info(table)` and derives the `PrimaryKey`.
pub(crate) fn fetch_primary_key(conn: &RawConnection, table: &str) -> Result<PrimaryKey> {
    let columns = fetch_table_info(conn, table)?;
    if columns.is_empty() {
        return Err(SchemaError::NoSuchTable(table.to_string()).into());
    }

    let mut pk_columns: Vec<&ColumnInfo> = columns.iter().filter(|c| c.pk_index > 0).collect();
    pk_columns.sort_by_key(|c| c.pk_index);

    Ok(match pk_columns.as_slice() {
        [] => PrimaryKey::None,
        [single] if single.decl_type.eq_ignore_ascii_case("INTEGER") => {
            PrimaryKey::Rowid(single.name.clone())
        }
        cols => PrimaryKey::Regular(cols.iter().map(|c| c.name.clone()).collect()),
    })
}

/// All declared column names for a table, in declaration order.
pub(crate) fn fetch_column_names(conn: &RawConnection, table: &str) -> Result<Vec<String>> {
    Ok(fetch_table_info(conn, table)?
        .into_iter()
        .map(|c| c.name)
        .collect())
}

fn fetch_table_info(conn: &RawConnection, table: &str) -> Result<Vec<ColumnInfo>> {
    let sql = format!("PRAGMA table_info({})", quote_identifier(table));
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| {
        Ok(ColumnInfo {
            name: row.get::<_, String>(1)?,
            decl_type: row.get::<_, String>(2)?,
            pk_index: row.get::<_, i64>(5)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Per-connection cache of primary keys and compiled statement SQL,
/// invalidated wholesale whenever a compiled statement is observed to
/// mutate the schema.
///
/// Statements themselves aren't cached here — `rusqlite::Connection`
/// already caches prepared statements via `prepare_cached`; this cache
/// only needs to remember which SQL strings we've *seen*, so a schema
/// change can tell the connection to drop its cache.
#[derive(Default)]
pub(crate) struct SchemaCache {
    primary_keys: RwLock<HashMap<String, Arc<PrimaryKey>>>,
}

impl SchemaCache {
    pub fn primary_key(
        &self,
        conn: &RawConnection,
        table: &str,
    ) -> Result<Arc<PrimaryKey>> {
        if let Some(pk) = self.primary_keys.read().get(table) {
            return Ok(pk.clone());
        }
        let pk = Arc::new(fetch_primary_key(conn, table)?);
        self.primary_keys.write().insert(table.to_string(), pk.clone());
        Ok(pk)
    }

    pub fn invalidate(&self) {
        trace!("schema changed, dropping cached primary keys");
        self.primary_keys.write().clear();
    }
}
