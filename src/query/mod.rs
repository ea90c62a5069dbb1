//! The expression algebra and query builder (C8): a typed, immutable AST
//! (`Expr`, `Ordering`, `Selectable`, `Query`) plus the renderer
//! (`sql`) that turns it into parameterized SQL.

pub mod expression;
pub mod ordering;
pub mod request;
pub mod selectable;
pub mod sql;

pub use expression::{Container, Expr};
pub use ordering::Ordering;
pub use request::{Query, Source};
pub use selectable::Selectable;
pub use sql::{generate, generate_count, GeneratedSql};
