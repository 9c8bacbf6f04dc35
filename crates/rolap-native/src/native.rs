//! Native set evaluation: gate, SQL, row mapping and the shared result cache.

use crate::alert::{AlertTracker, Refusal, UnsupportedObserver};
use crate::cache::{CacheStats, SingleFlightCache};
use crate::config::NativeConfig;
use crate::error::NativeResult;
use crate::executor::{fetch_rows, SqlExecutor};
use crate::expr::{describe, EvalContext, SetExpr};
use crate::gate::{DecisionGate, GateDecision, NativeCacheKey, NativePlan, PostProcess, SetMaterializer};
use crate::predicate::stable_hash;
use crate::query::QueryAssembler;
use crate::tuple::{Tuple, TupleList};
use ahash::{AHashMap, AHashSet};
use rolap_model::{MemberRef, Schema, SchemaError, Value};
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq)]
pub enum NativeOutcome {
    Tuples(Arc<TupleList>),
    /// The caller must evaluate the expression in memory.
    Refused(Refusal),
}

impl NativeOutcome {
    pub fn tuples(&self) -> Option<&Arc<TupleList>> {
        match self {
            NativeOutcome::Tuples(tuples) => Some(tuples),
            NativeOutcome::Refused(_) => None,
        }
    }
}

/// Evaluates set expressions through SQL when the decision gate allows it.
///
/// One evaluator serves one schema and is shared by concurrent executions; results are cached
/// until [`NativeEvaluator::flush`].
pub struct NativeEvaluator {
    schema: Arc<Schema>,
    config: NativeConfig,
    executor: Arc<dyn SqlExecutor>,
    cache: SingleFlightCache<NativeCacheKey, Arc<TupleList>>,
    alerts: AlertTracker,
    observer: Option<Arc<dyn UnsupportedObserver>>,
    materializer: Option<Arc<dyn SetMaterializer>>,
    executions: AtomicU64,
}

impl fmt::Debug for NativeEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeEvaluator")
            .field("schema", &self.schema.name())
            .field("config", &self.config)
            .field("executor", &self.executor)
            .field("cache", &self.cache.stats())
            .finish_non_exhaustive()
    }
}

impl NativeEvaluator {
    pub fn new(schema: Arc<Schema>, config: NativeConfig, executor: Arc<dyn SqlExecutor>) -> Self {
        Self {
            schema,
            config,
            executor,
            cache: SingleFlightCache::new(),
            alerts: AlertTracker::default(),
            observer: None,
            materializer: None,
            executions: AtomicU64::new(0),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn UnsupportedObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// In-memory evaluator for arguments the gate may expand (`expand_non_native`).
    pub fn with_materializer(mut self, materializer: Arc<dyn SetMaterializer>) -> Self {
        self.materializer = Some(materializer);
        self
    }

    pub fn config(&self) -> &NativeConfig {
        &self.config
    }

    pub fn evaluate_native(&self, expr: &SetExpr, ctx: &EvalContext) -> NativeResult<NativeOutcome> {
        let cancel = &ctx.execution.cancel;
        cancel.check()?;
        match self.gate().decide(expr, ctx)? {
            GateDecision::Refused(reason) => {
                let refusal = Refusal {
                    expression: describe(&self.schema, expr),
                    reason,
                    fingerprint: stable_hash(expr),
                };
                self.alerts.report(
                    self.config.alert_native_unsupported,
                    &refusal,
                    self.observer.as_deref(),
                )?;
                Ok(NativeOutcome::Refused(refusal))
            }
            GateDecision::Native(plan) => {
                log::trace!("evaluating {} natively", describe(&self.schema, expr));
                let tuples = self
                    .cache
                    .get_or_compute(&plan.key, cancel, || self.run(&plan, ctx))?;
                Ok(NativeOutcome::Tuples(tuples))
            }
        }
    }

    /// The SQL `evaluate_native` would issue for `expr`, or `None` if it would be refused.
    pub fn plan_sql(&self, expr: &SetExpr, ctx: &EvalContext) -> NativeResult<Option<String>> {
        Ok(match self.gate().decide(expr, ctx)? {
            GateDecision::Native(plan) => Some(self.sql(&plan)),
            GateDecision::Refused(_) => None,
        })
    }

    /// Drop every cached result and forget which expressions were already alerted.
    pub fn flush(&self) {
        log::debug!("flushing native set cache ({} entries)", self.cache.len());
        self.cache.flush();
        self.alerts.clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn sql_executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    fn gate(&self) -> DecisionGate<'_> {
        DecisionGate::new(
            &self.schema,
            &self.config,
            self.executor.dialect(),
            self.materializer.as_deref(),
        )
    }

    fn sql(&self, plan: &NativePlan) -> String {
        QueryAssembler::new(self.schema.star(plan.star), self.executor.dialect()).assemble(&plan.query)
    }

    fn run(&self, plan: &NativePlan, ctx: &EvalContext) -> NativeResult<Arc<TupleList>> {
        let sql = self.sql(plan);
        self.executions.fetch_add(1, Ordering::Relaxed);
        let rows = fetch_rows(
            self.executor.as_ref(),
            &sql,
            &ctx.execution.cancel,
            self.config.limit(),
            "native set",
        )?;

        let mut seen = AHashSet::with_capacity(rows.len());
        let mut tuples = Vec::with_capacity(rows.len());
        for row in &rows {
            let tuple = self.tuple_of(plan, row)?;
            if seen.insert(tuple.clone()) {
                tuples.push(tuple);
            }
        }

        let tuples = match plan.post {
            PostProcess::SetOrder => {
                self.sort_by_set_order(plan, &mut tuples);
                tuples
            }
            PostProcess::Complement => Product::new(self.universe(plan, ctx))
                .filter(|t| !seen.contains(t))
                .collect(),
            PostProcess::TopCount { count, pad } => {
                let count = usize::try_from(count).unwrap_or(usize::MAX);
                if pad && tuples.len() < count {
                    let missing = count - tuples.len();
                    let padding: Vec<Tuple> = Product::new(self.universe(plan, ctx))
                        .filter(|t| !seen.contains(t))
                        .take(missing)
                        .collect();
                    tuples.extend(padding);
                }
                tuples
            }
        };
        log::debug!("native {:?} returned {} tuples", plan.kind, tuples.len());
        Ok(Arc::new(TupleList::from_tuples(plan.args.len(), tuples)?))
    }

    /// Map a result row back to member handles through each argument's key columns.
    fn tuple_of(&self, plan: &NativePlan, row: &[Value]) -> NativeResult<Tuple> {
        let mut tuple = Tuple::new();
        for ((arg, depths), items) in plan.args.iter().zip(&plan.key_depths).zip(&plan.key_items) {
            let h = self.schema.hierarchy(arg.hierarchy());
            if depths.is_empty() {
                let all = h.all_member().ok_or_else(|| SchemaError::UnknownMember {
                    hierarchy: h.name().to_string(),
                    path: "(All)".to_string(),
                })?;
                tuple.push(MemberRef::new(h.id(), all));
                continue;
            }
            let keys: Vec<Value> = items
                .iter()
                .map(|idx| row.get(*idx).cloned().unwrap_or_default())
                .collect();
            let member = h
                .find_by_keys(depths, &keys)
                .ok_or_else(|| SchemaError::UnknownMember {
                    hierarchy: h.name().to_string(),
                    path: keys.iter().map(|k| k.to_string()).collect::<Vec<_>>().join("."),
                })?;
            tuple.push(MemberRef::new(h.id(), member));
        }
        Ok(tuple)
    }

    /// Members of each argument the role can see; the SQL side applies the same restriction.
    fn universe(&self, plan: &NativePlan, ctx: &EvalContext) -> Vec<Vec<MemberRef>> {
        plan.args
            .iter()
            .map(|arg| {
                let mut members = arg.members(&self.schema);
                if let Some(role) = &ctx.role {
                    let h = self.schema.hierarchy(arg.hierarchy());
                    members.retain(|m| role.can_access(h, m.member));
                }
                members
            })
            .collect()
    }

    /// Stable sort into lexicographic set order: each position by its rank in its argument.
    fn sort_by_set_order(&self, plan: &NativePlan, tuples: &mut [Tuple]) {
        let ranks: Vec<AHashMap<MemberRef, usize>> = plan
            .args
            .iter()
            .map(|arg| {
                arg.members(&self.schema)
                    .into_iter()
                    .enumerate()
                    .map(|(rank, m)| (m, rank))
                    .collect()
            })
            .collect();
        tuples.sort_by_cached_key(|tuple| {
            tuple
                .iter()
                .zip(&ranks)
                .map(|(m, rank)| rank.get(m).copied().unwrap_or(usize::MAX))
                .collect::<SmallVec<[usize; 4]>>()
        });
    }
}

/// Cartesian product of member lists in odometer order (last position varies fastest).
struct Product {
    sets: Vec<Vec<MemberRef>>,
    cursor: Vec<usize>,
    done: bool,
}

impl Product {
    fn new(sets: Vec<Vec<MemberRef>>) -> Self {
        let done = sets.is_empty() || sets.iter().any(Vec::is_empty);
        let cursor = vec![0; sets.len()];
        Self { sets, cursor, done }
    }
}

impl Iterator for Product {
    type Item = Tuple;

    fn next(&mut self) -> Option<Tuple> {
        if self.done {
            return None;
        }
        let tuple: Tuple = self
            .cursor
            .iter()
            .zip(&self.sets)
            .map(|(i, set)| set[*i])
            .collect();
        self.done = true;
        for pos in (0..self.cursor.len()).rev() {
            self.cursor[pos] += 1;
            if self.cursor[pos] < self.sets[pos].len() {
                self.done = false;
                break;
            }
            self.cursor[pos] = 0;
        }
        Some(tuple)
    }
}
