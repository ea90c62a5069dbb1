//! `Query` — the composable request value itself. Every derivation method
//! consumes `self` and returns a new `Query`; filters AND-compose and
//! orderings append.

use crate::query::expression::Expr;
use crate::query::ordering::Ordering;
use crate::query::selectable::Selectable;

/// Where a query's rows come from.
#[derive(Debug, Clone)]
pub enum Source {
    Table {
        name: String,
        alias: Option<String>,
    },
    Subquery {
        query: Box<Query>,
        alias: Option<String>,
    },
}

impl Source {
    /// The plain table name, if this source is (still) a bare table —
    /// used by `reverse()`'s deterministic-ordering fallback and by the
    /// count-query rewrite.
    pub(crate) fn table_name(&self) -> Option<&str> {
        match self {
            Source::Table { name, .. } => Some(name.as_str()),
            Source::Subquery { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Query {
    pub selection: Vec<Selectable>,
    pub distinct: bool,
    pub source: Source,
    pub filter: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub ordering: Vec<Ordering>,
    pub reversed: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Query {
    /// A fresh `SELECT * FROM table` request.
    pub fn table(name: impl Into<String>) -> Self {
        Self {
            selection: vec![Selectable::star()],
            distinct: false,
            source: Source::Table {
                name: name.into(),
                alias: None,
            },
            filter: None,
            group_by: Vec::new(),
            having: None,
            ordering: Vec::new(),
            reversed: false,
            limit: None,
            offset: None,
        }
    }

    pub fn from_subquery(query: Query, alias: Option<String>) -> Self {
        Self {
            selection: vec![Selectable::star()],
            distinct: false,
            source: Source::Subquery {
                query: Box::new(query),
                alias,
            },
            filter: None,
            group_by: Vec::new(),
            having: None,
            ordering: Vec::new(),
            reversed: false,
            limit: None,
            offset: None,
        }
    }

    pub fn aliased(mut self, alias: impl Into<String>) -> Self {
        if let Source::Table { alias: slot, .. } = &mut self.source {
            *slot = Some(alias.into());
        }
        self
    }

    pub fn select(mut self, selection: Vec<Selectable>) -> Self {
        self.selection = selection;
        self
    }

    /// AND-composes `expr` onto any existing filter.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    pub fn group(mut self, exprs: Vec<Expr>) -> Self {
        self.group_by = exprs;
        self
    }

    pub fn having(mut self, expr: Expr) -> Self {
        self.having = Some(match self.having {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    /// Appends to any existing ordering.
    pub fn order(mut self, orderings: Vec<Ordering>) -> Self {
        self.ordering.extend(orderings);
        self
    }

    /// Toggles the `reversed` flag; actual flipping happens at SQL
    /// generation time.
    pub fn reverse(mut self) -> Self {
        self.reversed = !self.reversed;
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }
}
