//! Cell request batching and segment loading.
//!
//! Requests are grouped by star, grouped columns and frozen predicates; each group becomes one
//! `GROUP BY` statement projecting every requested measure over every combination of the
//! requested column values. The loaded [`Segment`]s are shared through a single-flight cache, so
//! concurrent executions requesting the same batch issue one statement between them.

use crate::aggmatch::AggregateTableMatcher;
use crate::cache::{CacheStats, SingleFlightCache};
use crate::config::NativeConfig;
use crate::error::{NativeError, NativeResult};
use crate::executor::{fetch_rows, CancellationToken, SqlExecutor};
use crate::expr::ExecutionContext;
use crate::parallel;
use crate::predicate::Predicate;
use crate::query::{MeasureExpr, QueryAssembler, Source, SqlQuery};
use crate::segment::{BatchKey, CellRequest, Segment, SegmentKey};
use dashmap::DashMap;
use rolap_model::{AggregateTable, ColumnId, Schema, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct AggregationManager {
    schema: Arc<Schema>,
    config: NativeConfig,
    executor: Arc<dyn SqlExecutor>,
    matcher: AggregateTableMatcher,
    segments: SingleFlightCache<SegmentKey, Arc<Segment>>,
    /// Loaded segments per batch shape, for cell lookups.
    index: DashMap<BatchKey, Vec<Arc<Segment>>>,
    /// Bumped by every flush; a load that started before a flush must not index its segment.
    generation: AtomicU64,
    executions: AtomicU64,
}

impl fmt::Debug for AggregationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregationManager")
            .field("schema", &self.schema.name())
            .field("segments", &self.segments.stats())
            .field("executions", &self.sql_executions())
            .finish_non_exhaustive()
    }
}

impl AggregationManager {
    pub fn new(schema: Arc<Schema>, config: NativeConfig, executor: Arc<dyn SqlExecutor>) -> Self {
        let matcher = AggregateTableMatcher::new(Arc::clone(&schema), config.read_aggregate_row_counts);
        Self {
            schema,
            config,
            executor,
            matcher,
            segments: SingleFlightCache::new(),
            index: DashMap::new(),
            generation: AtomicU64::new(0),
            executions: AtomicU64::new(0),
        }
    }

    /// Load every request not already answerable from the cache.
    ///
    /// Independent batches may run concurrently; the first failing batch fails the call and
    /// nothing of a failed batch is cached.
    pub fn load_cells(&self, requests: &[CellRequest], exec: &ExecutionContext) -> NativeResult<()> {
        exec.cancel.check()?;
        let pending: Vec<&CellRequest> = requests
            .iter()
            .filter(|r| self.get_cell_from_cache(r).is_none())
            .collect();
        let batches = self.batches(pending)?;
        if batches.is_empty() {
            return Ok(());
        }
        log::debug!("loading {} cell batch(es)", batches.len());
        let results = parallel::map_ordered(&batches, self.config.parallel_batches, |key| {
            self.load(key, &exec.cancel)
        });
        results.into_iter().collect()
    }

    /// The cached value of a cell: `Some(Value::Null)` for a loaded-but-empty cell, `None` when
    /// no loaded segment covers it.
    pub fn get_cell_from_cache(&self, request: &CellRequest) -> Option<Value> {
        let segments = self.index.get(&request.batch_key())?;
        let coordinates = request.coordinates();
        segments
            .iter()
            .find_map(|segment| segment.value(&coordinates, request.measure))
    }

    /// The statements `load_cells` would issue for `requests`, ignoring the cache.
    pub fn batch_sql(&self, requests: &[CellRequest], exec: &ExecutionContext) -> NativeResult<Vec<String>> {
        let batches = self.batches(requests.iter().collect())?;
        batches
            .iter()
            .map(|key| {
                let table = self.aggregate_table(key, &exec.cancel)?;
                Ok(self.sql(key, table.as_deref()))
            })
            .collect()
    }

    /// Drop every segment and memoized aggregate row count.
    pub fn flush(&self) {
        log::debug!("flushing segment cache ({} segments)", self.segments.len());
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.segments.flush();
        self.index.clear();
        self.matcher.flush();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.segments.stats()
    }

    pub fn sql_executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    pub fn matcher(&self) -> &AggregateTableMatcher {
        &self.matcher
    }

    fn validate(&self, request: &CellRequest) -> NativeResult<()> {
        let star = self
            .schema
            .stars()
            .get(request.star.index())
            .ok_or_else(|| NativeError::InvalidRequest(format!("unknown star #{}", request.star.index())))?;
        if request.measure.index() >= star.measures().len() {
            return Err(NativeError::InvalidRequest(format!(
                "measure #{} is not a measure of {}",
                request.measure.index(),
                star.name()
            )));
        }
        if let Some(column) = request
            .constraints
            .keys()
            .find(|c| c.index() >= star.columns().len())
        {
            return Err(NativeError::InvalidRequest(format!(
                "column #{} is not a column of {}",
                column.index(),
                star.name()
            )));
        }
        Ok(())
    }

    /// Group requests into segment keys, in deterministic order.
    fn batches(&self, requests: Vec<&CellRequest>) -> NativeResult<Vec<SegmentKey>> {
        let mut groups: BTreeMap<BatchKey, SegmentKey> = BTreeMap::new();
        for request in requests {
            self.validate(request)?;
            let batch = request.batch_key();
            let key = groups.entry(batch.clone()).or_insert_with(|| SegmentKey {
                axes: vec![BTreeSet::new(); batch.columns.len()],
                batch,
                measures: BTreeSet::new(),
            });
            key.measures.insert(request.measure);
            for (axis, value) in key.axes.iter_mut().zip(request.coordinates()) {
                axis.insert(value);
            }
        }
        Ok(groups.into_values().collect())
    }

    fn load(&self, key: &SegmentKey, cancel: &CancellationToken) -> NativeResult<()> {
        let generation = self.generation.load(Ordering::SeqCst);
        let segment = self
            .segments
            .get_or_compute(key, cancel, || self.load_segment(key, cancel))?;
        // The entry guard holds the shard lock, so a flush's clear can't interleave with the
        // check and the push.
        let mut loaded = self.index.entry(key.batch.clone()).or_default();
        if self.generation.load(Ordering::SeqCst) != generation {
            log::debug!("discarding a segment loaded across a flush");
            drop(loaded);
            self.index.remove_if(&key.batch, |_, segments| segments.is_empty());
            return Ok(());
        }
        if !loaded.iter().any(|s| Arc::ptr_eq(s, &segment)) {
            loaded.push(segment);
        }
        Ok(())
    }

    fn load_segment(&self, key: &SegmentKey, cancel: &CancellationToken) -> NativeResult<Arc<Segment>> {
        let table = self.aggregate_table(key, cancel)?;
        let sql = self.sql(key, table.as_deref());
        self.executions.fetch_add(1, Ordering::Relaxed);
        let rows = fetch_rows(self.executor.as_ref(), &sql, cancel, self.config.limit(), "segment")?;
        let segment = Segment::new(key, rows);
        log::debug!(
            "loaded segment of {} measure(s) with {} cell(s)",
            key.measures.len(),
            segment.cell_count()
        );
        Ok(Arc::new(segment))
    }

    fn aggregate_table(&self, key: &SegmentKey, cancel: &CancellationToken) -> NativeResult<Option<Arc<AggregateTable>>> {
        if !self.config.use_aggregates {
            return Ok(None);
        }
        let grouped: BTreeSet<ColumnId> = key.batch.columns.iter().copied().collect();
        let mut filtered = BTreeSet::new();
        for (column, predicate) in &key.batch.predicates {
            filtered.insert(*column);
            filtered.extend(predicate.columns());
        }
        filtered.retain(|c| !grouped.contains(c));
        self.matcher.choose(
            key.batch.star,
            &grouped,
            &filtered,
            &key.measures,
            self.executor.as_ref(),
            cancel,
        )
    }

    fn query(key: &SegmentKey) -> SqlQuery {
        let mut query = SqlQuery::new();
        for column in &key.batch.columns {
            query.column(*column);
        }
        for measure in &key.measures {
            query.measure(MeasureExpr::measure(*measure));
        }
        for (column, axis) in key.batch.columns.iter().zip(&key.axes) {
            query.filter(Predicate::in_values(*column, axis.iter().cloned()));
        }
        for (_, predicate) in &key.batch.predicates {
            query.filter(Predicate::clone(predicate));
        }
        query
    }

    fn sql(&self, key: &SegmentKey, table: Option<&AggregateTable>) -> String {
        let star = self.schema.star(key.batch.star);
        let source = match table {
            Some(table) => Source::Aggregate(table),
            None => Source::Fact,
        };
        QueryAssembler::new(star, self.executor.dialect())
            .with_source(source)
            .assemble(&Self::query(key))
    }
}
