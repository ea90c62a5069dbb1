//! `Selectable` — one item of a `SELECT` list: `*` (optionally qualified)
//! or an aliased expression.

use crate::query::expression::Expr;

#[derive(Debug, Clone)]
pub enum Selectable {
    Star(Option<String>),
    Expr(Expr, Option<String>),
}

impl Selectable {
    pub fn star() -> Self {
        Selectable::Star(None)
    }

    pub fn qualified_star(qualifier: impl Into<String>) -> Self {
        Selectable::Star(Some(qualifier.into()))
    }

    pub fn expr(expr: Expr) -> Self {
        Selectable::Expr(expr, None)
    }

    pub fn aliased(expr: Expr, alias: impl Into<String>) -> Self {
        Selectable::Expr(expr, Some(alias.into()))
    }
}
