//! Aggregate table selection.

use crate::cache::{CacheStats, SingleFlightCache};
use crate::error::{NativeError, NativeResult};
use crate::executor::{fetch_rows, CancellationToken, SqlExecutor};
use rolap_model::{AggregateTable, ColumnId, MeasureId, Schema, StarId};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Picks the smallest usable aggregate table for a set of required columns and measures.
///
/// Row counts not declared on a table are measured once with `SELECT COUNT(*)` and memoized
/// per (star, table) until [`AggregateTableMatcher::flush`].
#[derive(Debug)]
pub struct AggregateTableMatcher {
    schema: Arc<Schema>,
    read_row_counts: bool,
    row_counts: SingleFlightCache<(StarId, String), u64>,
}

impl AggregateTableMatcher {
    pub fn new(schema: Arc<Schema>, read_row_counts: bool) -> Self {
        Self {
            schema,
            read_row_counts,
            row_counts: SingleFlightCache::new(),
        }
    }

    pub fn choose(
        &self,
        star: StarId,
        grouped: &BTreeSet<ColumnId>,
        filtered: &BTreeSet<ColumnId>,
        measures: &BTreeSet<MeasureId>,
        executor: &dyn SqlExecutor,
        cancel: &CancellationToken,
    ) -> NativeResult<Option<Arc<AggregateTable>>> {
        let mut best: Option<(u64, &Arc<AggregateTable>)> = None;
        for table in self.schema.aggregate_tables(star) {
            if let Err(reason) = self.check(table, grouped, filtered, measures) {
                log::trace!("aggregate table {} rejected: {reason}", table.name());
                continue;
            }
            let rows = self.row_count(table, executor, cancel)?;
            let better = match best {
                None => true,
                Some((best_rows, best_table)) => {
                    rows < best_rows || (rows == best_rows && table.name() < best_table.name())
                }
            };
            if better {
                best = Some((rows, table));
            }
        }
        match best {
            Some((rows, table)) => {
                log::debug!("using aggregate table {} (~{rows} rows)", table.name());
                Ok(Some(Arc::clone(table)))
            }
            None => Ok(None),
        }
    }

    /// Why `table` can't answer a batch, if it can't.
    ///
    /// `grouped` columns appear in the `GROUP BY`; `filtered` columns are only constrained, so
    /// the statement still collapses them.
    pub fn check(
        &self,
        table: &AggregateTable,
        grouped: &BTreeSet<ColumnId>,
        filtered: &BTreeSet<ColumnId>,
        measures: &BTreeSet<MeasureId>,
    ) -> Result<(), String> {
        let star = self.schema.star(table.star());
        if !table.is_enabled() {
            return Err("disabled".to_string());
        }
        if self
            .schema
            .rules()
            .is_excluded(table.name(), &star.fact_table().name)
        {
            return Err("excluded by rule".to_string());
        }
        if let Some(missing) = grouped
            .iter()
            .chain(filtered)
            .find(|c| table.column(**c).is_none())
        {
            let column = star.column(*missing);
            return Err(format!(
                "missing column {}.{}",
                star.table(column.table).alias,
                column.name
            ));
        }
        for id in measures {
            let measure = star.measure(*id);
            let mapped = table.measure(*id).is_some()
                || (measure.column.is_none() && table.fact_count_column().is_some());
            if !mapped {
                return Err(format!("measure {} is not stored", measure.name));
            }
            if !measure.aggregator.is_distinct() {
                continue;
            }
            // Summing distinct counts is only exact when the collapsed columns partition the
            // counted entity.
            let counted = measure.counted_dimension.as_deref();
            let rolled_up = table
                .columns()
                .keys()
                .filter(|c| !grouped.contains(*c))
                .find(|c| {
                    counted.is_none() || self.schema.dimension_of_column(table.star(), **c) != counted
                });
            if let Some(column) = rolled_up {
                let column = star.column(*column);
                return Err(format!(
                    "distinct count {} would roll up across {}.{}",
                    measure.name,
                    star.table(column.table).alias,
                    column.name
                ));
            }
        }
        Ok(())
    }

    fn row_count(
        &self,
        table: &AggregateTable,
        executor: &dyn SqlExecutor,
        cancel: &CancellationToken,
    ) -> NativeResult<u64> {
        if let Some(rows) = table.approx_row_count() {
            return Ok(rows);
        }
        if !self.read_row_counts {
            return Ok(u64::MAX);
        }
        let key = (table.star(), table.name().to_string());
        self.row_counts.get_or_compute(&key, cancel, || {
            let d = executor.dialect();
            let sql = format!("SELECT COUNT(*) FROM {}", d.quote_identifier(table.name()));
            let rows = fetch_rows(executor, &sql, cancel, None, "row count")?;
            rows.first()
                .and_then(|row| row.first())
                .and_then(|v| v.as_f64())
                .map(|n| n as u64)
                .ok_or_else(|| NativeError::sql(&sql, "row count query returned no number"))
        })
    }

    pub fn flush(&self) {
        self.row_counts.flush();
    }

    pub fn row_count_stats(&self) -> CacheStats {
        self.row_counts.stats()
    }
}
