//! Row — an ordered sequence of `(column name, DatabaseValue)`, with
//! case-insensitive, leftmost-wins column lookup.
//!
//! Two representations exist: a *live view* borrowing a
//! prepared statement's current step, and a *detached* owned copy. Public
//! APIs in this crate only ever hand out detached rows — the live view is
//! an internal optimization used while iterating a select statement.

use crate::error::{ColumnRef, ConversionError};
use crate::value::DatabaseValue;

/// An owned snapshot of one result row. Cheap to clone column-by-column,
/// safe to retain past the statement that produced it.
#[derive(Debug, Clone, Default)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<DatabaseValue>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<DatabaseValue>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    /// Index of the leftmost column matching `name`, ASCII case-insensitively.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    pub fn get(&self, index: usize) -> Option<&DatabaseValue> {
        self.values.get(index)
    }

    pub fn get_named(&self, name: &str) -> Option<&DatabaseValue> {
        self.index_of(name).and_then(|i| self.values.get(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DatabaseValue)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    /// Fallible decode by index: `None` on any cross-class mismatch,
    /// including NULL.
    pub fn fallible<T>(&self, index: usize, decode: impl Fn(&DatabaseValue) -> Option<T>) -> Option<T> {
        self.values.get(index).and_then(decode)
    }

    pub fn fallible_named<T>(
        &self,
        name: &str,
        decode: impl Fn(&DatabaseValue) -> Option<T>,
    ) -> Option<T> {
        self.index_of(name).and_then(|i| self.fallible(i, decode))
    }

    /// Required, type-checked decode by index.
    pub fn require<T>(
        &self,
        index: usize,
        decode: impl Fn(&DatabaseValue) -> Option<T>,
    ) -> Result<T, ConversionError> {
        let value = self
            .values
            .get(index)
            .ok_or_else(|| ConversionError::NoSuchColumn(format!("#{index}")))?;
        value.require(ColumnRef::Index(index), decode)
    }

    /// Required, type-checked decode by name.
    pub fn require_named<T>(
        &self,
        name: &str,
        decode: impl Fn(&DatabaseValue) -> Option<T>,
    ) -> Result<T, ConversionError> {
        let index = self
            .index_of(name)
            .ok_or_else(|| ConversionError::NoSuchColumn(name.to_string()))?;
        self.values[index].require(ColumnRef::Name(name.to_string()), decode)
    }

    /// A `column name -> value` view for record mapping and diffing. Keeps
    /// first-seen order; duplicate names keep only the leftmost value,
    /// matching the lookup rule above.
    pub fn to_map(&self) -> std::collections::BTreeMap<String, DatabaseValue> {
        let mut map = std::collections::BTreeMap::new();
        for (name, value) in self.iter() {
            map.entry(name.to_string()).or_insert_with(|| value.clone());
        }
        map
    }
}

impl PartialEq for Row {
    fn eq(&self, other: &Self) -> bool {
        self.columns == other.columns && self.values == other.values
    }
}
impl Eq for Row {}

/// Builds a detached `Row` from a live `rusqlite::Row` — the step must be
/// valid at call time; the result owns everything and outlives it.
pub(crate) fn detach(row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    let stmt = row.as_ref();
    let count = stmt.column_count();
    let mut columns = Vec::with_capacity(count);
    let mut values = Vec::with_capacity(count);
    for i in 0..count {
        columns.push(stmt.column_name(i)?.to_string());
        values.push(DatabaseValue::from(row.get_ref(i)?));
    }
    Ok(Row::new(columns, values))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Row {
        Row::new(
            vec!["Id".into(), "name".into(), "NAME".into()],
            vec![
                DatabaseValue::Int64(1),
                DatabaseValue::Text("Arthur".into()),
                DatabaseValue::Text("duplicate".into()),
            ],
        )
    }

    #[test]
    fn lookup_is_case_insensitive_and_leftmost_wins() {
        let row = sample();
        assert_eq!(row.index_of("id"), Some(0));
        assert_eq!(row.index_of("NAME"), Some(1));
        assert_eq!(
            row.get_named("name"),
            Some(&DatabaseValue::Text("Arthur".into()))
        );
    }

    #[test]
    fn require_named_fails_on_null() {
        let row = Row::new(vec!["x".into()], vec![DatabaseValue::Null]);
        let err = row.require_named("x", DatabaseValue::as_i64).unwrap_err();
        assert!(matches!(err, ConversionError::UnexpectedNull { .. }));
    }

    #[test]
    fn require_named_fails_on_missing_column() {
        let row = sample();
        let err = row.require_named("nope", DatabaseValue::as_i64).unwrap_err();
        assert!(matches!(err, ConversionError::NoSuchColumn(_)));
    }
}
