//! SQL query assembly.
//!
//! A [`SqlQuery`] lists what a statement needs (grouped columns, aggregated measures, WHERE
//! predicates, HAVING conditions, ordering) in terms of star columns and measures. The
//! [`QueryAssembler`] turns it into SQL text for one source: the base star (joining exactly the
//! tables the referenced columns need) or a single aggregate table.
//!
//! The text is a pure function of the query, the source and the dialect: tables, join conditions
//! and projections are emitted in a fixed order so that equal queries produce equal SQL.

use crate::expr::{ArithOp, CompareOp};
use crate::predicate::{AggregateColumns, ColumnResolver, Predicate, StarColumns};
use rolap_model::{AggregateTable, Aggregator, ColumnId, Dialect, MeasureId, Star, TableId, Value};
use std::collections::BTreeSet;

/// An aggregated value expression.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MeasureExpr {
    /// The measure's own aggregation; with a filter, only rows matching it contribute
    /// (`SUM(CASE WHEN .. THEN col END)`).
    Aggregate {
        measure: MeasureId,
        filter: Option<Predicate>,
    },
    Literal(Value),
    Arith(ArithOp, Box<MeasureExpr>, Box<MeasureExpr>),
}

impl MeasureExpr {
    pub fn measure(measure: MeasureId) -> Self {
        MeasureExpr::Aggregate {
            measure,
            filter: None,
        }
    }

    fn collect_columns(&self, star: &Star, out: &mut BTreeSet<ColumnId>) {
        match self {
            MeasureExpr::Aggregate { measure, filter } => {
                out.extend(star.measure(*measure).column);
                if let Some(filter) = filter {
                    out.extend(filter.columns());
                }
            }
            MeasureExpr::Literal(_) => {}
            MeasureExpr::Arith(_, a, b) => {
                a.collect_columns(star, out);
                b.collect_columns(star, out);
            }
        }
    }

    pub fn measures(&self) -> BTreeSet<MeasureId> {
        let mut out = BTreeSet::new();
        self.collect_measures(&mut out);
        out
    }

    fn collect_measures(&self, out: &mut BTreeSet<MeasureId>) {
        match self {
            MeasureExpr::Aggregate { measure, .. } => {
                out.insert(*measure);
            }
            MeasureExpr::Literal(_) => {}
            MeasureExpr::Arith(_, a, b) => {
                a.collect_measures(out);
                b.collect_measures(out);
            }
        }
    }
}

/// A condition on aggregated values, rendered into `HAVING`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MeasureCondition {
    Compare(CompareOp, MeasureExpr, MeasureExpr),
    NotEmpty(MeasureExpr),
    And(Vec<MeasureCondition>),
    Or(Vec<MeasureCondition>),
    Not(Box<MeasureCondition>),
}

impl MeasureCondition {
    fn for_each_expr<'a>(&'a self, f: &mut dyn FnMut(&'a MeasureExpr)) {
        match self {
            MeasureCondition::Compare(_, a, b) => {
                f(a);
                f(b);
            }
            MeasureCondition::NotEmpty(e) => f(e),
            MeasureCondition::And(items) | MeasureCondition::Or(items) => {
                for item in items {
                    item.for_each_expr(f);
                }
            }
            MeasureCondition::Not(inner) => inner.for_each_expr(f),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SelectItem {
    Column(ColumnId),
    Measure(MeasureExpr),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OrderItem {
    /// Index into the select list.
    pub item: usize,
    pub ascending: bool,
}

/// What a statement needs, independent of where it reads from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SqlQuery {
    items: Vec<SelectItem>,
    filters: Vec<Predicate>,
    having: Vec<MeasureCondition>,
    order: Vec<OrderItem>,
    join_fact: bool,
    limit: Option<u64>,
}

impl SqlQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Project a grouped column; returns its select-list index (existing projections are reused).
    pub fn column(&mut self, column: ColumnId) -> usize {
        self.push_item(SelectItem::Column(column))
    }

    pub fn measure(&mut self, expr: MeasureExpr) -> usize {
        self.join_fact = true;
        self.push_item(SelectItem::Measure(expr))
    }

    fn push_item(&mut self, item: SelectItem) -> usize {
        if let Some(idx) = self.items.iter().position(|i| *i == item) {
            return idx;
        }
        self.items.push(item);
        self.items.len() - 1
    }

    /// Add a WHERE conjunct. Constant-true predicates are dropped.
    pub fn filter(&mut self, predicate: Predicate) {
        if predicate.is_const() != Some(true) && !self.filters.contains(&predicate) {
            self.filters.push(predicate);
        }
    }

    pub fn having(&mut self, condition: MeasureCondition) {
        self.join_fact = true;
        self.having.push(condition);
    }

    pub fn order_by(&mut self, item: usize, ascending: bool) {
        if !self.order.iter().any(|o| o.item == item) {
            self.order.push(OrderItem { item, ascending });
        }
    }

    pub fn join_fact(&mut self) {
        self.join_fact = true;
    }

    pub fn limit(&mut self, limit: u64) {
        self.limit = Some(limit);
    }

    pub fn items(&self) -> &[SelectItem] {
        &self.items
    }

    pub fn filters(&self) -> &[Predicate] {
        &self.filters
    }

    pub fn joins_fact(&self) -> bool {
        self.join_fact
    }

    /// Every base column the statement reads.
    pub fn referenced_columns(&self, star: &Star) -> BTreeSet<ColumnId> {
        let mut out = BTreeSet::new();
        for item in &self.items {
            match item {
                SelectItem::Column(c) => {
                    out.insert(*c);
                }
                SelectItem::Measure(m) => m.collect_columns(star, &mut out),
            }
        }
        for filter in &self.filters {
            out.extend(filter.columns());
        }
        for condition in &self.having {
            condition.for_each_expr(&mut |e| e.collect_columns(star, &mut out));
        }
        out
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Source<'a> {
    Fact,
    Aggregate(&'a AggregateTable),
}

pub struct QueryAssembler<'a> {
    star: &'a Star,
    dialect: &'a dyn Dialect,
    source: Source<'a>,
}

impl<'a> QueryAssembler<'a> {
    pub fn new(star: &'a Star, dialect: &'a dyn Dialect) -> Self {
        Self {
            star,
            dialect,
            source: Source::Fact,
        }
    }

    pub fn with_source(mut self, source: Source<'a>) -> Self {
        self.source = source;
        self
    }

    fn resolver(&self) -> Box<dyn ColumnResolver + '_> {
        match self.source {
            Source::Fact => Box::new(StarColumns {
                star: self.star,
                dialect: self.dialect,
            }),
            Source::Aggregate(table) => Box::new(AggregateColumns {
                table,
                star: self.star,
                dialect: self.dialect,
            }),
        }
    }

    /// Tables to join for the fact source, fact table first, then by id.
    ///
    /// Each column pulls in its table's path toward the fact table; the fact table itself only
    /// when the query needs it (measures, or an explicit fact join) or a column lives on it.
    pub fn tables(&self, query: &SqlQuery) -> Vec<TableId> {
        let mut tables = BTreeSet::new();
        for column in query.referenced_columns(self.star) {
            let table = self.star.column(column).table;
            if table == TableId::FACT {
                tables.insert(TableId::FACT);
            }
            tables.extend(self.star.path_to_fact(table));
        }
        if query.join_fact || tables.is_empty() {
            tables.insert(TableId::FACT);
        }
        tables.into_iter().collect()
    }

    pub fn assemble(&self, query: &SqlQuery) -> String {
        let resolver = self.resolver();
        let columns: &dyn ColumnResolver = resolver.as_ref();
        let d = self.dialect;

        let mut select = Vec::with_capacity(query.items.len());
        let mut group_by = Vec::new();
        for (idx, item) in query.items.iter().enumerate() {
            let expr = match item {
                SelectItem::Column(c) => {
                    let expr = columns.column_sql(*c);
                    group_by.push(expr.clone());
                    expr
                }
                SelectItem::Measure(m) => self.render_measure(m, columns),
            };
            select.push(format!("{expr} AS {}", d.quote_identifier(&alias(idx))));
        }

        let mut where_clause = Vec::new();
        let from = match self.source {
            Source::Fact => {
                let tables = self.tables(query);
                for table in &tables {
                    let parent_included = self
                        .star
                        .table(*table)
                        .join
                        .as_ref()
                        .is_some_and(|j| tables.contains(&j.parent));
                    if parent_included {
                        where_clause.extend(self.star.join_condition(*table, d));
                    }
                }
                tables
                    .iter()
                    .map(|t| self.star.table_expr(*t, d))
                    .collect::<Vec<_>>()
                    .join(", ")
            }
            Source::Aggregate(table) => {
                let name = d.quote_identifier(table.name());
                if d.allows_as_before_table_alias() {
                    format!("{name} AS {name}")
                } else {
                    format!("{name} {name}")
                }
            }
        };
        for filter in &query.filters {
            where_clause.push(filter.to_sql(columns, d));
        }

        let mut sql = format!("SELECT {} FROM {from}", select.join(", "));
        if !where_clause.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause.join(" AND "));
        }
        if !group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&group_by.join(", "));
        }
        if !query.having.is_empty() {
            let having: Vec<String> = query
                .having
                .iter()
                .map(|c| self.render_condition(c, columns))
                .collect();
            sql.push_str(" HAVING ");
            sql.push_str(&having.join(" AND "));
        }
        if !query.order.is_empty() {
            let order: Vec<String> = query
                .order
                .iter()
                .map(|o| d.order_item(&d.quote_identifier(&alias(o.item)), o.ascending))
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.join(", "));
        }
        if let Some(limit) = query.limit {
            sql.push(' ');
            sql.push_str(&d.limit_clause(limit));
        }
        sql
    }

    fn render_measure(&self, expr: &MeasureExpr, columns: &dyn ColumnResolver) -> String {
        match expr {
            MeasureExpr::Aggregate { measure, filter } => {
                let (aggregator, column) = self.measure_source(*measure);
                match filter {
                    None => aggregator.render(column.as_deref()),
                    Some(filter) => {
                        let condition = filter.to_sql(columns, self.dialect);
                        let value = column.unwrap_or_else(|| "1".to_string());
                        let case = format!("CASE WHEN {condition} THEN {value} END");
                        match aggregator {
                            // COUNT(*) counts rows; a filtered count counts the non-NULL CASE.
                            Aggregator::Count => format!("COUNT({case})"),
                            other => other.render(Some(&case)),
                        }
                    }
                }
            }
            MeasureExpr::Literal(value) => self.dialect.render_value(value),
            MeasureExpr::Arith(op, a, b) => format!(
                "({} {} {})",
                self.render_measure(a, columns),
                op.sql(),
                self.render_measure(b, columns)
            ),
        }
    }

    /// Aggregator and column to aggregate for `measure` in the current source.
    fn measure_source(&self, measure: MeasureId) -> (Aggregator, Option<String>) {
        let base = self.star.measure(measure);
        match self.source {
            Source::Fact => (
                base.aggregator,
                base.column.map(|c| self.star.column_expr(c, self.dialect)),
            ),
            Source::Aggregate(table) => match table.measure(measure) {
                Some(mapped) => (
                    mapped.rollup,
                    Some(format!(
                        "{}.{}",
                        self.dialect.quote_identifier(table.name()),
                        self.dialect.quote_identifier(&mapped.column)
                    )),
                ),
                // Counting rows of an aggregate table means summing its fact-count column.
                None if base.column.is_none() => match table.fact_count_column() {
                    Some(count) => (
                        Aggregator::Sum,
                        Some(format!(
                            "{}.{}",
                            self.dialect.quote_identifier(table.name()),
                            self.dialect.quote_identifier(count)
                        )),
                    ),
                    None => (Aggregator::Count, None),
                },
                None => (
                    base.aggregator,
                    base.column.map(|c| self.star.column_expr(c, self.dialect)),
                ),
            },
        }
    }

    fn render_condition(&self, condition: &MeasureCondition, columns: &dyn ColumnResolver) -> String {
        match condition {
            MeasureCondition::Compare(op, a, b) => format!(
                "{} {} {}",
                self.render_measure(a, columns),
                op.sql(),
                self.render_measure(b, columns)
            ),
            MeasureCondition::NotEmpty(e) => {
                format!("{} IS NOT NULL", self.render_measure(e, columns))
            }
            MeasureCondition::And(items) | MeasureCondition::Or(items) => {
                let sep = if matches!(condition, MeasureCondition::And(_)) {
                    " AND "
                } else {
                    " OR "
                };
                let parts: Vec<String> = items
                    .iter()
                    .map(|c| self.render_condition(c, columns))
                    .collect();
                format!("({})", parts.join(sep))
            }
            MeasureCondition::Not(inner) => {
                format!("NOT ({})", self.render_condition(inner, columns))
            }
        }
    }
}

fn alias(idx: usize) -> String {
    format!("c{idx}")
}
