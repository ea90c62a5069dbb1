//! `DatabaseValue` — a tagged SQLite storage value, and the affinity-aware
//! conversions used to move between it and Rust scalar types.
//!
//! SQLite has five storage classes (NULL, INTEGER, REAL, TEXT, BLOB); this
//! type mirrors them exactly rather than following any column's *declared*
//! affinity.

use rusqlite::types::{Value as SqliteValue, ValueRef};
use serde::{Serialize, Serializer};

use crate::error::{ColumnRef, ConversionError};

/// A single SQLite value, tagged by storage class.
#[derive(Debug, Clone)]
pub enum DatabaseValue {
    Null,
    Int64(i64),
    Double(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl DatabaseValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }

    /// Best-effort decode to `bool`: non-zero integer/double is true, NULL
    /// and text/blob are not convertible (`None`).
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DatabaseValue::Int64(i) => Some(*i != 0),
            DatabaseValue::Double(d) => Some(*d != 0.0),
            _ => None,
        }
    }

    /// Truncating decode to `i64`. Doubles truncate toward zero, matching
    /// SQLite's own `CAST(x AS INTEGER)` behavior.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DatabaseValue::Int64(i) => Some(*i),
            DatabaseValue::Double(d) => Some(*d as i64),
            _ => None,
        }
    }

    /// Widening decode to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DatabaseValue::Int64(i) => Some(*i as f64),
            DatabaseValue::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DatabaseValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            DatabaseValue::Blob(b) => Some(b.as_slice()),
            _ => None,
        }
    }

    /// Required, type-checked decode; fails on NULL or a cross-class
    /// mismatch the conversion matrix doesn't allow.
    pub fn require<T>(&self, column: ColumnRef, decode: impl Fn(&Self) -> Option<T>) -> Result<T, ConversionError> {
        if self.is_null() {
            return Err(ConversionError::UnexpectedNull { column });
        }
        decode(self).ok_or(ConversionError::TypeMismatch { column })
    }
}

impl PartialEq for DatabaseValue {
    fn eq(&self, other: &Self) -> bool {
        use DatabaseValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Int64(a), Int64(b)) => a == b,
            (Double(a), Double(b)) => a == b,
            (Text(a), Text(b)) => a == b,
            (Blob(a), Blob(b)) => a == b,
            // Int/float bridge: equal iff the double round-trips exactly.
            (Int64(i), Double(d)) | (Double(d), Int64(i)) => {
                d.fract() == 0.0 && *d >= i64::MIN as f64 && *d <= i64::MAX as f64 && (*d as i64) == *i
            }
            _ => false,
        }
    }
}
impl Eq for DatabaseValue {}

impl std::hash::Hash for DatabaseValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            DatabaseValue::Null => 0u8.hash(state),
            // An int and the double it's equal to must hash identically.
            DatabaseValue::Int64(i) => {
                1u8.hash(state);
                i.hash(state);
            }
            DatabaseValue::Double(d) => {
                if d.fract() == 0.0 && *d >= i64::MIN as f64 && *d <= i64::MAX as f64 {
                    1u8.hash(state);
                    (*d as i64).hash(state);
                } else {
                    2u8.hash(state);
                    d.to_bits().hash(state);
                }
            }
            DatabaseValue::Text(s) => {
                3u8.hash(state);
                s.hash(state);
            }
            DatabaseValue::Blob(b) => {
                4u8.hash(state);
                b.hash(state);
            }
        }
    }
}

impl Serialize for DatabaseValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DatabaseValue::Null => serializer.serialize_none(),
            DatabaseValue::Int64(i) => serializer.serialize_i64(*i),
            DatabaseValue::Double(d) => serializer.serialize_f64(*d),
            DatabaseValue::Text(s) => serializer.serialize_str(s),
            DatabaseValue::Blob(b) => serializer.serialize_bytes(b),
        }
    }
}

impl From<SqliteValue> for DatabaseValue {
    fn from(v: SqliteValue) -> Self {
        match v {
            SqliteValue::Null => DatabaseValue::Null,
            SqliteValue::Integer(i) => DatabaseValue::Int64(i),
            SqliteValue::Real(d) => DatabaseValue::Double(d),
            SqliteValue::Text(s) => DatabaseValue::Text(s),
            SqliteValue::Blob(b) => DatabaseValue::Blob(b),
        }
    }
}

impl From<DatabaseValue> for SqliteValue {
    fn from(v: DatabaseValue) -> Self {
        match v {
            DatabaseValue::Null => SqliteValue::Null,
            DatabaseValue::Int64(i) => SqliteValue::Integer(i),
            DatabaseValue::Double(d) => SqliteValue::Real(d),
            DatabaseValue::Text(s) => SqliteValue::Text(s),
            DatabaseValue::Blob(b) => SqliteValue::Blob(b),
        }
    }
}

impl<'a> From<ValueRef<'a>> for DatabaseValue {
    fn from(v: ValueRef<'a>) -> Self {
        match v {
            ValueRef::Null => DatabaseValue::Null,
            ValueRef::Integer(i) => DatabaseValue::Int64(i),
            ValueRef::Real(d) => DatabaseValue::Double(d),
            ValueRef::Text(t) => DatabaseValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => DatabaseValue::Blob(b.to_vec()),
        }
    }
}

impl rusqlite::types::ToSql for DatabaseValue {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        let v: SqliteValue = self.clone().into();
        Ok(rusqlite::types::ToSqlOutput::Owned(v))
    }
}

macro_rules! from_scalar {
    ($ty:ty, $variant:ident, $conv:expr) => {
        impl From<$ty> for DatabaseValue {
            fn from(v: $ty) -> Self {
                #[allow(clippy::redundant_closure_call)]
                DatabaseValue::$variant($conv(v))
            }
        }
    };
}

from_scalar!(i64, Int64, |v: i64| v);
from_scalar!(i32, Int64, |v: i32| v as i64);
from_scalar!(bool, Int64, |v: bool| v as i64);
from_scalar!(f64, Double, |v: f64| v);
from_scalar!(String, Text, |v: String| v);
from_scalar!(Vec<u8>, Blob, |v: Vec<u8>| v);

impl From<&str> for DatabaseValue {
    fn from(v: &str) -> Self {
        DatabaseValue::Text(v.to_string())
    }
}

impl<T: Into<DatabaseValue>> From<Option<T>> for DatabaseValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => DatabaseValue::Null,
        }
    }
}
