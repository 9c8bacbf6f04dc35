//! Predicate trees over star columns.
//!
//! A [`Predicate`] is produced by the constraint compiler and consumed by the query assembler.
//! It is immutable and content-hashable, so the predicate itself (or its
//! [`fingerprint`](Predicate::fingerprint)) is used as cache key material. Rendering is purely a
//! function of the tree, the column resolver and the dialect, which makes identical predicates
//! produce byte-identical SQL.

use ahash::RandomState;
use rolap_model::{AggregateTable, ColumnId, Dialect, Star, Value};
use std::collections::BTreeSet;
use std::hash::{BuildHasher, Hash, Hasher};

/// Maps a star column to the SQL expression that reads it in the current query.
pub trait ColumnResolver {
    fn column_sql(&self, column: ColumnId) -> String;
}

/// Resolves columns against the base star tables (`"alias"."column"`).
pub struct StarColumns<'a> {
    pub star: &'a Star,
    pub dialect: &'a dyn Dialect,
}

impl ColumnResolver for StarColumns<'_> {
    fn column_sql(&self, column: ColumnId) -> String {
        self.star.column_expr(column, self.dialect)
    }
}

/// Resolves columns against an aggregate table; falls back to the base star for unmapped ones.
pub struct AggregateColumns<'a> {
    pub table: &'a AggregateTable,
    pub star: &'a Star,
    pub dialect: &'a dyn Dialect,
}

impl ColumnResolver for AggregateColumns<'_> {
    fn column_sql(&self, column: ColumnId) -> String {
        self.table
            .column_expr(column, self.dialect)
            .unwrap_or_else(|| self.star.column_expr(column, self.dialect))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Predicate {
    Const(bool),
    IsNull(ColumnId),
    Eq(ColumnId, Value),
    In(ColumnId, Vec<Value>),
    /// Row-value membership, `(c1, c2) IN ((v1, v2), ...)`.
    RowIn {
        columns: Vec<ColumnId>,
        rows: Vec<Vec<Value>>,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

const FINGERPRINT_SEEDS: (u64, u64, u64, u64) = (
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
);

/// Stable (per build) 64-bit hash for cache keys.
pub(crate) fn stable_hash<T: Hash + ?Sized>(value: &T) -> u64 {
    let (a, b, c, d) = FINGERPRINT_SEEDS;
    let mut hasher = RandomState::with_seeds(a, b, c, d).build_hasher();
    value.hash(&mut hasher);
    hasher.finish()
}

fn and3(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(false), _) | (_, Some(false)) => Some(false),
        (Some(true), Some(true)) => Some(true),
        _ => None,
    }
}

fn or3(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(true), _) | (_, Some(true)) => Some(true),
        (Some(false), Some(false)) => Some(false),
        _ => None,
    }
}

fn eq3(a: &Value, b: &Value) -> Option<bool> {
    if a.is_null() || b.is_null() {
        None
    } else {
        Some(a == b)
    }
}

impl Predicate {
    pub fn always() -> Self {
        Predicate::Const(true)
    }

    pub fn never() -> Self {
        Predicate::Const(false)
    }

    /// Conjunction with constant folding; nested conjunctions are flattened.
    pub fn and(items: impl IntoIterator<Item = Predicate>) -> Self {
        let mut out = Vec::new();
        for item in items {
            match item {
                Predicate::Const(true) => {}
                Predicate::Const(false) => return Predicate::Const(false),
                Predicate::And(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => Predicate::Const(true),
            1 => out.pop().unwrap_or(Predicate::Const(true)),
            _ => Predicate::And(out),
        }
    }

    /// Disjunction with constant folding; nested disjunctions are flattened.
    pub fn or(items: impl IntoIterator<Item = Predicate>) -> Self {
        let mut out = Vec::new();
        for item in items {
            match item {
                Predicate::Const(false) => {}
                Predicate::Const(true) => return Predicate::Const(true),
                Predicate::Or(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => Predicate::Const(false),
            1 => out.pop().unwrap_or(Predicate::Const(false)),
            _ => Predicate::Or(out),
        }
    }

    pub fn negate(self) -> Self {
        match self {
            Predicate::Const(b) => Predicate::Const(!b),
            Predicate::Not(inner) => *inner,
            other => Predicate::Not(Box::new(other)),
        }
    }

    /// Equality that degrades to `IS NULL` for a NULL value.
    pub fn eq_or_null(column: ColumnId, value: Value) -> Self {
        if value.is_null() {
            Predicate::IsNull(column)
        } else {
            Predicate::Eq(column, value)
        }
    }

    /// Membership in a value list, NULL-safe: NULL becomes a separate `IS NULL` disjunct.
    pub fn in_values(column: ColumnId, values: impl IntoIterator<Item = Value>) -> Self {
        let mut has_null = false;
        let mut non_null = Vec::new();
        for value in values {
            if value.is_null() {
                has_null = true;
            } else if !non_null.contains(&value) {
                non_null.push(value);
            }
        }
        let list = match non_null.len() {
            0 => Predicate::Const(false),
            1 => Predicate::Eq(column, non_null.remove(0)),
            _ => Predicate::In(column, non_null),
        };
        if has_null {
            Predicate::or([list, Predicate::IsNull(column)])
        } else {
            list
        }
    }

    pub fn is_const(&self) -> Option<bool> {
        match self {
            Predicate::Const(b) => Some(*b),
            _ => None,
        }
    }

    pub fn fingerprint(&self) -> u64 {
        stable_hash(self)
    }

    /// Every column the predicate reads.
    pub fn columns(&self) -> BTreeSet<ColumnId> {
        let mut out = BTreeSet::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut BTreeSet<ColumnId>) {
        match self {
            Predicate::Const(_) => {}
            Predicate::IsNull(c) | Predicate::Eq(c, _) | Predicate::In(c, _) => {
                out.insert(*c);
            }
            Predicate::RowIn { columns, .. } => out.extend(columns.iter().copied()),
            Predicate::And(items) | Predicate::Or(items) => {
                for item in items {
                    item.collect_columns(out);
                }
            }
            Predicate::Not(inner) => inner.collect_columns(out),
        }
    }

    /// SQL three-valued evaluation against one row; `None` is UNKNOWN.
    pub fn evaluate(&self, row: &dyn Fn(ColumnId) -> Value) -> Option<bool> {
        match self {
            Predicate::Const(b) => Some(*b),
            Predicate::IsNull(c) => Some(row(*c).is_null()),
            Predicate::Eq(c, v) => eq3(&row(*c), v),
            Predicate::In(c, values) => {
                let actual = row(*c);
                values
                    .iter()
                    .fold(Some(false), |acc, v| or3(acc, eq3(&actual, v)))
            }
            Predicate::RowIn { columns, rows } => {
                let actual: Vec<Value> = columns.iter().map(|c| row(*c)).collect();
                rows.iter().fold(Some(false), |acc, values| {
                    let row_eq = actual
                        .iter()
                        .zip(values)
                        .fold(Some(true), |acc, (a, v)| and3(acc, eq3(a, v)));
                    or3(acc, row_eq)
                })
            }
            Predicate::And(items) => items
                .iter()
                .fold(Some(true), |acc, p| and3(acc, p.evaluate(row))),
            Predicate::Or(items) => items
                .iter()
                .fold(Some(false), |acc, p| or3(acc, p.evaluate(row))),
            Predicate::Not(inner) => inner.evaluate(row).map(|b| !b),
        }
    }

    /// Whether a `WHERE` clause with this predicate keeps the row.
    pub fn matches(&self, row: &dyn Fn(ColumnId) -> Value) -> bool {
        self.evaluate(row) == Some(true)
    }

    pub fn to_sql(&self, columns: &dyn ColumnResolver, dialect: &dyn Dialect) -> String {
        let mut out = String::new();
        self.write_sql(columns, dialect, &mut out);
        out
    }

    fn write_sql(&self, columns: &dyn ColumnResolver, dialect: &dyn Dialect, out: &mut String) {
        match self {
            Predicate::Const(true) => out.push_str(dialect.true_predicate()),
            Predicate::Const(false) => out.push_str(dialect.false_predicate()),
            Predicate::IsNull(c) => {
                out.push_str(&columns.column_sql(*c));
                out.push_str(" IS NULL");
            }
            Predicate::Eq(c, v) => {
                out.push_str(&columns.column_sql(*c));
                out.push_str(" = ");
                out.push_str(&dialect.render_value(v));
            }
            Predicate::In(c, values) => {
                out.push_str(&columns.column_sql(*c));
                out.push_str(" IN (");
                let rendered: Vec<String> = values.iter().map(|v| dialect.render_value(v)).collect();
                out.push_str(&rendered.join(", "));
                out.push(')');
            }
            Predicate::RowIn { columns: cols, rows } => {
                if dialect.supports_multi_value_in() {
                    let names: Vec<String> = cols.iter().map(|c| columns.column_sql(*c)).collect();
                    out.push('(');
                    out.push_str(&names.join(", "));
                    out.push_str(") IN (");
                    let rendered: Vec<String> = rows
                        .iter()
                        .map(|row| {
                            let values: Vec<String> =
                                row.iter().map(|v| dialect.render_value(v)).collect();
                            format!("({})", values.join(", "))
                        })
                        .collect();
                    out.push_str(&rendered.join(", "));
                    out.push(')');
                } else {
                    let expanded = Predicate::or(rows.iter().map(|row| {
                        Predicate::and(
                            cols.iter()
                                .zip(row)
                                .map(|(c, v)| Predicate::Eq(*c, v.clone())),
                        )
                    }));
                    expanded.write_sql(columns, dialect, out);
                }
            }
            Predicate::And(items) | Predicate::Or(items) => {
                let sep = if matches!(self, Predicate::And(_)) {
                    " AND "
                } else {
                    " OR "
                };
                out.push('(');
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        out.push_str(sep);
                    }
                    item.write_sql(columns, dialect, out);
                }
                out.push(')');
            }
            Predicate::Not(inner) => {
                out.push_str("NOT (");
                inner.write_sql(columns, dialect, out);
                out.push(')');
            }
        }
    }
}
