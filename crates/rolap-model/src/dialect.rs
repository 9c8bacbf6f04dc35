//! SQL dialect capability interface.
//!
//! The native evaluator never renders dialect-specific syntax itself: quoting, literal
//! rendering, NULL collation and row-value support are all asked of a [`Dialect`]. Generated
//! SQL text is asserted verbatim by tests, so every method here must be deterministic.

use crate::value::Value;
use std::fmt;

/// How a dialect expresses "sort NULLs last" for an ascending or descending order item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NullCollation {
    /// `ISNULL(expr) ASC, expr ASC` (no native NULLS FIRST/LAST keyword).
    IsNullIdiom,
    /// `expr ASC NULLS LAST`.
    NullsKeyword,
}

pub trait Dialect: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    fn quote_identifier(&self, ident: &str) -> String;

    fn quote_string(&self, s: &str) -> String {
        format!("'{}'", s.replace('\'', "''"))
    }

    /// Render a non-NULL literal. NULL is rendered as `NULL`, but callers never compare with it.
    fn render_value(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Boolean(b) => {
                if *b {
                    "TRUE".to_string()
                } else {
                    "FALSE".to_string()
                }
            }
            Value::Number(_) => value.to_string(),
            Value::Text(s) => self.quote_string(s),
        }
    }

    /// Whether `(a, b) IN ((1, 2), (3, 4))` is accepted with a literal right-hand side.
    fn supports_multi_value_in(&self) -> bool;

    fn null_collation(&self) -> NullCollation;

    fn supports_grouping_sets(&self) -> bool {
        false
    }

    fn allows_as_before_table_alias(&self) -> bool {
        true
    }

    fn true_predicate(&self) -> &'static str {
        "1 = 1"
    }

    fn false_predicate(&self) -> &'static str {
        "1 = 0"
    }

    fn limit_clause(&self, limit: u64) -> String {
        format!("LIMIT {limit}")
    }

    /// Render one ORDER BY item that places NULLs last regardless of direction.
    fn order_item(&self, expr: &str, ascending: bool) -> String {
        let dir = if ascending { "ASC" } else { "DESC" };
        match self.null_collation() {
            NullCollation::IsNullIdiom => format!("ISNULL({expr}) ASC, {expr} {dir}"),
            NullCollation::NullsKeyword => format!("{expr} {dir} NULLS LAST"),
        }
    }
}

fn double_quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AnsiDialect;

impl Dialect for AnsiDialect {
    fn name(&self) -> &str {
        "ansi"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        double_quote(ident)
    }

    fn supports_multi_value_in(&self) -> bool {
        true
    }

    fn null_collation(&self) -> NullCollation {
        NullCollation::NullsKeyword
    }

    fn supports_grouping_sets(&self) -> bool {
        true
    }

    fn limit_clause(&self, limit: u64) -> String {
        format!("FETCH FIRST {limit} ROWS ONLY")
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MySqlDialect;

impl Dialect for MySqlDialect {
    fn name(&self) -> &str {
        "mysql"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn quote_string(&self, s: &str) -> String {
        format!("'{}'", s.replace('\\', "\\\\").replace('\'', "''"))
    }

    fn supports_multi_value_in(&self) -> bool {
        true
    }

    fn null_collation(&self) -> NullCollation {
        NullCollation::IsNullIdiom
    }
}

/// SQLite accepts row values on the left of `IN` only when the right-hand side is a subquery,
/// so compound constraints fall back to OR-ed conjunctions.
#[derive(Clone, Copy, Debug, Default)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        double_quote(ident)
    }

    fn render_value(&self, value: &Value) -> String {
        match value {
            Value::Boolean(b) => (if *b { "1" } else { "0" }).to_string(),
            Value::Null => "NULL".to_string(),
            Value::Number(_) => value.to_string(),
            Value::Text(s) => self.quote_string(s),
        }
    }

    fn supports_multi_value_in(&self) -> bool {
        false
    }

    fn null_collation(&self) -> NullCollation {
        NullCollation::NullsKeyword
    }
}
