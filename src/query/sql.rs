//! SQL generation (C8): walks the `Query`/`Expr` AST and renders
//! parameterized SQL with a parallel binding list, applying the rewrites
//! spelled out by the expression algebra's rewrite rules.

use crate::connection::Connection;
use crate::error::{Result, SchemaError};
use crate::query::expression::Expr;
use crate::query::ordering::Ordering;
use crate::query::request::{Query, Source};
use crate::query::selectable::Selectable;
use crate::schema::quote_identifier;
use crate::value::DatabaseValue;

/// Rendered SQL plus its positional bindings, in left-to-right order.
#[derive(Debug, Clone)]
pub struct GeneratedSql {
    pub sql: String,
    pub bindings: Vec<DatabaseValue>,
}

struct Renderer {
    bindings: Vec<DatabaseValue>,
}

impl Renderer {
    fn new() -> Self {
        Self { bindings: Vec::new() }
    }

    fn push(&mut self, value: DatabaseValue) -> String {
        self.bindings.push(value);
        "?".to_string()
    }

    /// Renders `expr`, returning the SQL text. Whether the text already
    /// ends with a closing parenthesis (used by `collate`'s placement
    /// rule) can be read straight off the string with `.ends_with(')')`.
    fn expr(&mut self, expr: &Expr) -> Result<String> {
        Ok(match expr {
            Expr::Literal(sql) => sql.clone(),
            Expr::Value(DatabaseValue::Null) => "NULL".to_string(),
            Expr::Value(v) => self.push(v.clone()),
            Expr::Identifier { name, qualifier } => match qualifier {
                Some(q) => format!("{}.{}", quote_identifier(q), quote_identifier(name)),
                None => quote_identifier(name),
            },
            Expr::Collate(inner, collation) => {
                let rendered = self.expr(inner)?;
                if let Some(stripped) = rendered.strip_suffix(')') {
                    format!("{stripped} COLLATE {collation})")
                } else {
                    format!("{rendered} COLLATE {collation}")
                }
            }
            Expr::Not(inner) => {
                if let Expr::InList(values, _) = inner.as_ref() {
                    if values.is_empty() {
                        return Ok("1".to_string());
                    }
                }
                format!("NOT ({})", self.expr(inner)?)
            }
            Expr::Equal(a, b) => self.null_aware_binary(a, b, "=", "IS NULL")?,
            Expr::NotEqual(a, b) => self.null_aware_binary(a, b, "<>", "IS NOT NULL")?,
            Expr::Is(a, b) => format!("{} IS {}", self.expr(a)?, self.expr(b)?),
            Expr::IsNot(a, b) => format!("{} IS NOT {}", self.expr(a)?, self.expr(b)?),
            Expr::PrefixOp(op, inner) => format!("{op} {}", self.expr(inner)?),
            Expr::InfixOp(op, a, b) => format!("({} {op} {})", self.expr(a)?, self.expr(b)?),
            Expr::InList(values, inner) => {
                if values.is_empty() {
                    return Ok("0".to_string());
                }
                let lhs = self.expr(inner)?;
                let mut rendered = Vec::with_capacity(values.len());
                for v in values {
                    rendered.push(self.expr(v)?);
                }
                format!("{lhs} IN ({})", rendered.join(", "))
            }
            Expr::InSubquery(query, inner) => {
                let lhs = self.expr(inner)?;
                let sub = self.subquery(query)?;
                format!("{lhs} IN ({sub})")
            }
            Expr::Exists(query) => format!("EXISTS ({})", self.subquery(query)?),
            Expr::Between { expr, min, max } => {
                format!("{} BETWEEN {} AND {}", self.expr(expr)?, self.expr(min)?, self.expr(max)?)
            }
            Expr::Function(name, args) => {
                let mut rendered = Vec::with_capacity(args.len());
                for a in args {
                    rendered.push(self.expr(a)?);
                }
                format!("{name}({})", rendered.join(", "))
            }
            Expr::Count(selectable) => format!("COUNT({})", self.selectable(selectable)?),
            Expr::CountDistinct(inner) => format!("COUNT(DISTINCT {})", self.expr(inner)?),
        })
    }

    /// Shared logic for `==`/`!=` against `NULL`: regardless of which
    /// operand carries the literal null, emit `IS [NOT] NULL`.
    fn null_aware_binary(&mut self, a: &Expr, b: &Expr, op: &str, null_form: &str) -> Result<String> {
        let a_is_null = matches!(a, Expr::Value(DatabaseValue::Null));
        let b_is_null = matches!(b, Expr::Value(DatabaseValue::Null));
        if a_is_null && b_is_null {
            return Ok(format!("NULL {null_form}"));
        }
        if b_is_null {
            return Ok(format!("{} {null_form}", self.expr(a)?));
        }
        if a_is_null {
            return Ok(format!("{} {null_form}", self.expr(b)?));
        }
        Ok(format!("{} {op} {}", self.expr(a)?, self.expr(b)?))
    }

    fn selectable(&mut self, selectable: &Selectable) -> Result<String> {
        Ok(match selectable {
            Selectable::Star(None) => "*".to_string(),
            Selectable::Star(Some(q)) => format!("{}.*", quote_identifier(q)),
            Selectable::Expr(e, None) => self.expr(e)?,
            Selectable::Expr(e, Some(alias)) => format!("{} AS {}", self.expr(e)?, quote_identifier(alias)),
        })
    }

    fn ordering(&mut self, ordering: &Ordering) -> Result<String> {
        Ok(match ordering {
            Ordering::Asc(e) => format!("{} ASC", self.expr(e)?),
            Ordering::Desc(e) => format!("{} DESC", self.expr(e)?),
        })
    }

    fn source(&mut self, source: &Source) -> Result<String> {
        Ok(match source {
            Source::Table { name, alias } => match alias {
                Some(a) => format!("{} AS {}", quote_identifier(name), quote_identifier(a)),
                None => quote_identifier(name),
            },
            Source::Subquery { query, alias } => {
                let sub = self.subquery(query)?;
                match alias {
                    Some(a) => format!("({sub}) AS {}", quote_identifier(a)),
                    None => format!("({sub})"),
                }
            }
        })
    }

    fn subquery(&mut self, query: &Query) -> Result<String> {
        let mut nested = Renderer::new();
        let generated = render_select(&mut nested, query, None)?;
        self.bindings.extend(nested.bindings);
        Ok(generated)
    }
}

/// Resolves the effective ordering list for `query`, applying the
/// `reverse()` flag: flip an explicit ordering, or fall
/// back to a deterministic `DESC` over the source table's primary key.
fn resolve_orderings(query: &Query, conn: Option<&Connection>) -> Result<Vec<Ordering>> {
    if !query.reversed {
        return Ok(query.ordering.clone());
    }
    if !query.ordering.is_empty() {
        return Ok(query.ordering.iter().cloned().map(Ordering::reversed).collect());
    }
    let table = query
        .source
        .table_name()
        .ok_or(SchemaError::ReverseRequiresTable)?;
    let conn = conn.ok_or(SchemaError::ReverseRequiresTable)?;
    let pk = conn.primary_key(table)?;
    if pk.is_empty() {
        return Err(SchemaError::NoDeterministicOrdering(table.to_string()).into());
    }
    Ok(pk
        .columns()
        .into_iter()
        .map(|c| Ordering::Desc(Expr::column(c.to_string())))
        .collect())
}

fn render_select(renderer: &mut Renderer, query: &Query, conn: Option<&Connection>) -> Result<String> {
    let mut sql = String::from("SELECT ");
    if query.distinct {
        sql.push_str("DISTINCT ");
    }
    let mut selections = Vec::with_capacity(query.selection.len());
    for s in &query.selection {
        selections.push(renderer.selectable(s)?);
    }
    sql.push_str(&selections.join(", "));
    sql.push_str(" FROM ");
    sql.push_str(&renderer.source(&query.source)?);

    if let Some(filter) = &query.filter {
        sql.push_str(" WHERE ");
        sql.push_str(&renderer.expr(filter)?);
    }
    if !query.group_by.is_empty() {
        sql.push_str(" GROUP BY ");
        let mut groups = Vec::with_capacity(query.group_by.len());
        for e in &query.group_by {
            groups.push(renderer.expr(e)?);
        }
        sql.push_str(&groups.join(", "));
    }
    if let Some(having) = &query.having {
        sql.push_str(" HAVING ");
        sql.push_str(&renderer.expr(having)?);
    }

    let orderings = resolve_orderings(query, conn)?;
    if !orderings.is_empty() {
        sql.push_str(" ORDER BY ");
        let mut rendered = Vec::with_capacity(orderings.len());
        for o in &orderings {
            rendered.push(renderer.ordering(o)?);
        }
        sql.push_str(&rendered.join(", "));
    }

    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
        if let Some(offset) = query.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
    }
    Ok(sql)
}

/// Renders a full, top-level `SELECT` for `query` against `conn` (needed
/// only to resolve a primary-key-derived `reverse()` ordering).
pub fn generate(query: &Query, conn: &Connection) -> Result<GeneratedSql> {
    let mut renderer = Renderer::new();
    let sql = render_select(&mut renderer, query, Some(conn))?;
    Ok(GeneratedSql {
        sql,
        bindings: renderer.bindings,
    })
}

fn is_plain_star_selection(query: &Query) -> bool {
    !query.distinct
        && query.selection.len() == 1
        && matches!(&query.selection[0], Selectable::Star(None))
}

fn single_distinct_expr(query: &Query) -> Option<&Expr> {
    if query.distinct && query.selection.len() == 1 {
        if let Selectable::Expr(e, _) = &query.selection[0] {
            return Some(e);
        }
    }
    None
}

/// Rewrites `query` into a `SELECT COUNT(...)`, following the four-way
/// `fetchCount` rewrite rule: a plain star selection counts in place, a
/// single `DISTINCT` expression becomes `COUNT(DISTINCT ...)`, and anything
/// with `GROUP BY`/`LIMIT`/a derived source gets wrapped in an outer count.
pub fn generate_count(query: &Query, conn: &Connection) -> Result<GeneratedSql> {
    let needs_wrap = !query.group_by.is_empty() || query.limit.is_some() || query.source.table_name().is_none();

    if needs_wrap {
        return wrap_as_count(query, conn);
    }
    if is_plain_star_selection(query) {
        let mut rewritten = query.clone();
        rewritten.selection = vec![Selectable::expr(Expr::count(Selectable::star()))];
        rewritten.ordering.clear();
        rewritten.reversed = false;
        return generate(&rewritten, conn);
    }
    if let Some(expr) = single_distinct_expr(query) {
        let mut rewritten = query.clone();
        rewritten.distinct = false;
        rewritten.selection = vec![Selectable::expr(Expr::count_distinct(expr.clone()))];
        rewritten.ordering.clear();
        rewritten.reversed = false;
        return generate(&rewritten, conn);
    }
    wrap_as_count(query, conn)
}

fn wrap_as_count(query: &Query, conn: &Connection) -> Result<GeneratedSql> {
    let mut inner = query.clone();
    inner.ordering.clear();
    inner.reversed = false;
    let inner_sql = generate(&inner, conn)?;
    Ok(GeneratedSql {
        sql: format!("SELECT COUNT(*) FROM ({})", inner_sql.sql),
        bindings: inner_sql.bindings,
    })
}
