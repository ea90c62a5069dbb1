//! The typed expression AST (C8) — composed functionally by callers, then
//! rendered to parameterized SQL by `query::sql`.

use crate::query::request::Query;
use crate::query::selectable::Selectable;
use crate::value::DatabaseValue;

/// A SQL scalar expression.
#[derive(Debug, Clone)]
pub enum Expr {
    /// Raw, already-valid SQL, spliced in verbatim (escape hatch).
    Literal(String),
    Value(DatabaseValue),
    Identifier {
        name: String,
        qualifier: Option<String>,
    },
    Collate(Box<Expr>, String),
    Not(Box<Expr>),
    Equal(Box<Expr>, Box<Expr>),
    NotEqual(Box<Expr>, Box<Expr>),
    Is(Box<Expr>, Box<Expr>),
    IsNot(Box<Expr>, Box<Expr>),
    PrefixOp(String, Box<Expr>),
    InfixOp(String, Box<Expr>, Box<Expr>),
    InList(Vec<Expr>, Box<Expr>),
    InSubquery(Box<Query>, Box<Expr>),
    Exists(Box<Query>),
    Between {
        expr: Box<Expr>,
        min: Box<Expr>,
        max: Box<Expr>,
    },
    Function(String, Vec<Expr>),
    Count(Box<Selectable>),
    CountDistinct(Box<Expr>),
}

impl Expr {
    pub fn literal(sql: impl Into<String>) -> Self {
        Expr::Literal(sql.into())
    }

    pub fn column(name: impl Into<String>) -> Self {
        Expr::Identifier {
            name: name.into(),
            qualifier: None,
        }
    }

    pub fn qualified_column(qualifier: impl Into<String>, name: impl Into<String>) -> Self {
        Expr::Identifier {
            name: name.into(),
            qualifier: Some(qualifier.into()),
        }
    }

    pub fn value(v: impl Into<DatabaseValue>) -> Self {
        Expr::Value(v.into())
    }

    pub fn null() -> Self {
        Expr::Value(DatabaseValue::Null)
    }

    pub fn collate(self, collation: impl Into<String>) -> Self {
        Expr::Collate(Box::new(self), collation.into())
    }

    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }

    pub fn eq(self, other: Expr) -> Self {
        Expr::Equal(Box::new(self), Box::new(other))
    }

    pub fn ne(self, other: Expr) -> Self {
        Expr::NotEqual(Box::new(self), Box::new(other))
    }

    pub fn is(self, other: Expr) -> Self {
        Expr::Is(Box::new(self), Box::new(other))
    }

    pub fn is_not(self, other: Expr) -> Self {
        Expr::IsNot(Box::new(self), Box::new(other))
    }

    pub fn and(self, other: Expr) -> Self {
        Expr::InfixOp("AND".into(), Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Expr) -> Self {
        Expr::InfixOp("OR".into(), Box::new(self), Box::new(other))
    }

    pub fn lt(self, other: Expr) -> Self {
        Expr::InfixOp("<".into(), Box::new(self), Box::new(other))
    }

    pub fn lte(self, other: Expr) -> Self {
        Expr::InfixOp("<=".into(), Box::new(self), Box::new(other))
    }

    pub fn gt(self, other: Expr) -> Self {
        Expr::InfixOp(">".into(), Box::new(self), Box::new(other))
    }

    pub fn gte(self, other: Expr) -> Self {
        Expr::InfixOp(">=".into(), Box::new(self), Box::new(other))
    }

    pub fn between(self, min: Expr, max: Expr) -> Self {
        Expr::Between {
            expr: Box::new(self),
            min: Box::new(min),
            max: Box::new(max),
        }
    }

    pub fn in_list(self, values: Vec<Expr>) -> Self {
        Expr::InList(values, Box::new(self))
    }

    pub fn in_subquery(self, query: Query) -> Self {
        Expr::InSubquery(Box::new(query), Box::new(self))
    }

    pub fn exists(query: Query) -> Self {
        Expr::Exists(Box::new(query))
    }

    pub fn function(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Function(name.into(), args)
    }

    pub fn count(selectable: Selectable) -> Self {
        Expr::Count(Box::new(selectable))
    }

    pub fn count_distinct(expr: Expr) -> Self {
        Expr::CountDistinct(Box::new(expr))
    }

    /// `contains` on a container: closed numeric ranges
    /// become `BETWEEN`, half-open intervals become `(e >= lo) AND (e < hi)`,
    /// and finite sequences become `IN (...)`.
    pub fn contains(self, container: Container) -> Self {
        match container {
            Container::ClosedRange(min, max) => self.between(min, max),
            Container::HalfOpen(lo, hi) => self.clone().gte(lo).and(self.lt(hi)),
            Container::Sequence(values) => self.in_list(values),
        }
    }
}

/// What `Expr::contains` can be asked to test membership in.
pub enum Container {
    /// Inclusive on both ends: `lo..=hi`.
    ClosedRange(Expr, Expr),
    /// Inclusive lower, exclusive upper: `lo..hi`.
    HalfOpen(Expr, Expr),
    /// A finite, explicit list of values.
    Sequence(Vec<Expr>),
}

impl From<std::ops::RangeInclusive<i64>> for Container {
    fn from(r: std::ops::RangeInclusive<i64>) -> Self {
        Container::ClosedRange(Expr::value(*r.start()), Expr::value(*r.end()))
    }
}

impl From<std::ops::Range<i64>> for Container {
    fn from(r: std::ops::Range<i64>) -> Self {
        Container::HalfOpen(Expr::value(r.start), Expr::value(r.end))
    }
}
