//! Pre-computed summary (aggregate) tables and the rules that include or exclude them.

use crate::dialect::Dialect;
use crate::error::{SchemaError, SchemaResult};
use crate::star::{Aggregator, ColumnId, MeasureId, Star, StarId};
use regex::Regex;
use std::collections::BTreeMap;

/// A measure stored in an aggregate table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregateMeasure {
    pub column: String,
    /// Aggregator applied when rolling rows of the aggregate table up further.
    pub rollup: Aggregator,
}

#[derive(Clone, Debug)]
pub struct AggregateTable {
    name: String,
    star: StarId,
    columns: BTreeMap<ColumnId, String>,
    measures: BTreeMap<MeasureId, AggregateMeasure>,
    fact_count_column: Option<String>,
    approx_row_count: Option<u64>,
    enabled: bool,
}

impl AggregateTable {
    pub fn new(name: impl Into<String>, star: &Star) -> Self {
        Self {
            name: name.into(),
            star: star.id(),
            columns: BTreeMap::new(),
            measures: BTreeMap::new(),
            fact_count_column: None,
            approx_row_count: None,
            enabled: true,
        }
    }

    /// Map a base star column to a column of this table.
    pub fn with_column(mut self, base: ColumnId, column: impl Into<String>) -> Self {
        self.columns.insert(base, column.into());
        self
    }

    /// Map a base measure; its rollup aggregator is derived from the base aggregator.
    pub fn with_measure(mut self, star: &Star, measure: MeasureId, column: impl Into<String>) -> Self {
        let rollup = star.measure(measure).aggregator.rollup();
        self.measures.insert(
            measure,
            AggregateMeasure {
                column: column.into(),
                rollup,
            },
        );
        self
    }

    pub fn with_fact_count(mut self, column: impl Into<String>) -> Self {
        self.fact_count_column = Some(column.into());
        self
    }

    pub fn with_approx_row_count(mut self, rows: u64) -> Self {
        self.approx_row_count = Some(rows);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn star(&self) -> StarId {
        self.star
    }

    pub fn columns(&self) -> &BTreeMap<ColumnId, String> {
        &self.columns
    }

    pub fn column(&self, base: ColumnId) -> Option<&str> {
        self.columns.get(&base).map(String::as_str)
    }

    pub fn measures(&self) -> &BTreeMap<MeasureId, AggregateMeasure> {
        &self.measures
    }

    pub fn measure(&self, base: MeasureId) -> Option<&AggregateMeasure> {
        self.measures.get(&base)
    }

    pub fn fact_count_column(&self) -> Option<&str> {
        self.fact_count_column.as_deref()
    }

    pub fn approx_row_count(&self) -> Option<u64> {
        self.approx_row_count
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn column_expr(&self, base: ColumnId, dialect: &dyn Dialect) -> Option<String> {
        let column = self.columns.get(&base)?;
        Some(format!(
            "{}.{}",
            dialect.quote_identifier(&self.name),
            dialect.quote_identifier(column)
        ))
    }

    pub(crate) fn validate(&self, star: &Star) -> SchemaResult<()> {
        if self.star != star.id() {
            return Err(SchemaError::InvalidAggregate {
                table: self.name.clone(),
                reason: format!("declared for a different star than {}", star.name()),
            });
        }
        for base in self.columns.keys() {
            if base.index() >= star.columns().len() {
                return Err(SchemaError::InvalidAggregate {
                    table: self.name.clone(),
                    reason: format!("unknown base column #{}", base.index()),
                });
            }
        }
        for base in self.measures.keys() {
            if base.index() >= star.measures().len() {
                return Err(SchemaError::InvalidAggregate {
                    table: self.name.clone(),
                    reason: format!("unknown base measure #{}", base.index()),
                });
            }
        }
        if self.columns.is_empty() && self.measures.is_empty() {
            return Err(SchemaError::InvalidAggregate {
                table: self.name.clone(),
                reason: "maps no columns and no measures".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
enum ExcludeMatcher {
    Name(String),
    Pattern(Regex),
}

#[derive(Clone, Debug)]
struct Exclusion {
    matcher: ExcludeMatcher,
    fact_table: Option<String>,
}

/// Explicit aggregate-table exclusions.
///
/// Names match case-insensitively; patterns must match the whole table name.
#[derive(Clone, Debug, Default)]
pub struct AggregateRules {
    exclusions: Vec<Exclusion>,
}

impl AggregateRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclude_name(&mut self, name: impl Into<String>, fact_table: Option<&str>) {
        self.exclusions.push(Exclusion {
            matcher: ExcludeMatcher::Name(name.into()),
            fact_table: fact_table.map(str::to_string),
        });
    }

    pub fn exclude_pattern(&mut self, pattern: &str, fact_table: Option<&str>) -> SchemaResult<()> {
        let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(|e| SchemaError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        self.exclusions.push(Exclusion {
            matcher: ExcludeMatcher::Pattern(regex),
            fact_table: fact_table.map(str::to_string),
        });
        Ok(())
    }

    /// Whether `table` is excluded for the given fact table.
    pub fn is_excluded(&self, table: &str, fact_table: &str) -> bool {
        self.exclusions.iter().any(|e| {
            let applies = e
                .fact_table
                .as_deref()
                .map_or(true, |f| f.eq_ignore_ascii_case(fact_table));
            applies
                && match &e.matcher {
                    ExcludeMatcher::Name(name) => name.eq_ignore_ascii_case(table),
                    ExcludeMatcher::Pattern(regex) => regex.is_match(table),
                }
        })
    }
}
