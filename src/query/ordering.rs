//! `Ordering` — one `ORDER BY` term.

use crate::query::expression::Expr;

#[derive(Debug, Clone)]
pub enum Ordering {
    Asc(Expr),
    Desc(Expr),
}

impl Ordering {
    pub fn asc(expr: Expr) -> Self {
        Ordering::Asc(expr)
    }

    pub fn desc(expr: Expr) -> Self {
        Ordering::Desc(expr)
    }

    /// Flips direction — used when a request's `reversed` flag is applied
    /// to an explicit ordering list when a request is reversed.
    pub fn reversed(self) -> Self {
        match self {
            Ordering::Asc(e) => Ordering::Desc(e),
            Ordering::Desc(e) => Ordering::Asc(e),
        }
    }
}
