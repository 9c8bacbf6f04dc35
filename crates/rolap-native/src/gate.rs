//! The native evaluation decision gate.
//!
//! [`DecisionGate::decide`] either refuses an expression (with a reason the alert side channel
//! reports) or produces a [`NativePlan`]: the SQL query to run, how to map its rows back to
//! member tuples, how to post-process them, and the cache key of the result.
//!
//! The first disqualifier wins. Every check happens before any SQL is issued, so a refusal
//! never leaves partial state behind.

use crate::alert::RefusalReason;
use crate::classify::{key_layout, ArgumentClassifier, Classification, SetArgument};
use crate::config::NativeConfig;
use crate::constraint::ConstraintCompiler;
use crate::error::NativeError;
use crate::expr::{
    BoolExpr, CalculatedDefinition, Definitions, EvalContext, MemberExpr, SetExpr, ValueExpr,
};
use crate::predicate::{stable_hash, Predicate};
use crate::query::{MeasureCondition, MeasureExpr, SqlQuery};
use crate::tuple::TupleList;
use rolap_model::{
    Dialect, HierarchyAccess, HierarchyId, MeasureId, MemberRef, Schema, SchemaError, StarId, Value,
};
use std::collections::{BTreeMap, BTreeSet};

/// Which construct a native result answers; part of the cache key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConstructKind {
    Members,
    CrossJoin,
    Filter,
    TopCount,
}

/// Cache key of a native set result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NativeCacheKey {
    pub kind: ConstructKind,
    /// Arguments, membership predicates (with their polarity) and measure conditions.
    pub constraint: u64,
    /// Applied context members, role restrictions and `NON EMPTY`; unrelated slicer members
    /// never contribute.
    pub context: u64,
    /// TopCount's N.
    pub count: Option<u64>,
}

/// In-memory evaluation of arguments the gate can't classify, for `expand_non_native`.
pub trait SetMaterializer: Send + Sync {
    /// Members of `expr`, or `None` when it can't be evaluated or has more than `limit` members.
    fn materialize(&self, expr: &SetExpr, ctx: &EvalContext, limit: usize) -> Option<Vec<MemberRef>>;
}

impl<F> SetMaterializer for F
where
    F: Fn(&SetExpr, &EvalContext, usize) -> Option<Vec<MemberRef>> + Send + Sync,
{
    fn materialize(&self, expr: &SetExpr, ctx: &EvalContext, limit: usize) -> Option<Vec<MemberRef>> {
        self(expr, ctx, limit)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum PostProcess {
    /// Reorder SQL rows into the set's natural order.
    SetOrder,
    /// Keep SQL order (TopCount); pad with empty tuples in set order up to `count` if `pad`.
    TopCount { count: u64, pad: bool },
    /// The SQL computed the non-empty tuples; the result is every other tuple of the set.
    Complement,
}

#[derive(Clone, Debug)]
pub(crate) struct NativePlan {
    pub kind: ConstructKind,
    pub star: StarId,
    pub args: Vec<SetArgument>,
    /// Per argument: depths whose keys identify a member, and their select-list positions.
    pub key_depths: Vec<Vec<usize>>,
    pub key_items: Vec<Vec<usize>>,
    pub query: SqlQuery,
    pub post: PostProcess,
    pub key: NativeCacheKey,
}

#[derive(Debug)]
pub(crate) enum GateDecision {
    Native(Box<NativePlan>),
    Refused(RefusalReason),
}

enum GateError {
    Refused(RefusalReason),
    Failed(NativeError),
}

impl From<SchemaError> for GateError {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::UnconstrainableMember { member, reason } => {
                GateError::Refused(RefusalReason::Unsupported(format!("{member}: {reason}")))
            }
            other => GateError::Failed(other.into()),
        }
    }
}

type GateResult<T> = Result<T, GateError>;

fn unsupported<T>(reason: impl Into<String>) -> GateResult<T> {
    Err(GateError::Refused(RefusalReason::Unsupported(reason.into())))
}

fn disabled<T>(flag: &'static str) -> GateResult<T> {
    Err(GateError::Refused(RefusalReason::FeatureDisabled(flag)))
}

/// A set expression broken into its native parts.
struct Construct<'e> {
    kind: ConstructKind,
    args: Vec<SetArgument>,
    condition: Option<&'e BoolExpr>,
    top: Option<(u64, &'e ValueExpr)>,
}

pub(crate) struct DecisionGate<'a> {
    schema: &'a Schema,
    config: &'a NativeConfig,
    dialect: &'a dyn Dialect,
    materializer: Option<&'a dyn SetMaterializer>,
}

impl<'a> DecisionGate<'a> {
    pub fn new(
        schema: &'a Schema,
        config: &'a NativeConfig,
        dialect: &'a dyn Dialect,
        materializer: Option<&'a dyn SetMaterializer>,
    ) -> Self {
        Self {
            schema,
            config,
            dialect,
            materializer,
        }
    }

    pub fn decide(&self, expr: &SetExpr, ctx: &EvalContext) -> Result<GateDecision, NativeError> {
        let result = self
            .construct(expr, ctx, &mut Vec::new())
            .and_then(|construct| self.plan(construct, ctx));
        match result {
            Ok(plan) => Ok(GateDecision::Native(Box::new(plan))),
            Err(GateError::Refused(reason)) => Ok(GateDecision::Refused(reason)),
            Err(GateError::Failed(err)) => Err(err),
        }
    }

    fn construct<'e>(
        &self,
        expr: &'e SetExpr,
        ctx: &'e EvalContext,
        visiting: &mut Vec<String>,
    ) -> GateResult<Construct<'e>> {
        match expr {
            SetExpr::NamedSet(name) => {
                let definition = self.resolve_named_set(name, &ctx.definitions, visiting)?;
                visiting.push(name.clone());
                let construct = self.construct(definition, ctx, visiting);
                visiting.pop();
                construct
            }
            SetExpr::CrossJoin(_) => {
                let args = self.set_arguments(expr, ctx, visiting)?;
                Ok(Construct {
                    kind: ConstructKind::CrossJoin,
                    args,
                    condition: None,
                    top: None,
                })
            }
            SetExpr::Filter { set, condition } => {
                if !self.config.enable_native_filter {
                    return disabled("enable_native_filter");
                }
                let args = self.set_arguments(set, ctx, visiting)?;
                Ok(Construct {
                    kind: ConstructKind::Filter,
                    args,
                    condition: Some(condition),
                    top: None,
                })
            }
            SetExpr::TopCount { set, count, order } => {
                if !self.config.enable_native_topcount {
                    return disabled("enable_native_topcount");
                }
                let count = literal_count(count)?;
                let (args, condition) = match set.as_ref() {
                    SetExpr::Filter { set, condition } => {
                        if !self.config.enable_native_filter {
                            return disabled("enable_native_filter");
                        }
                        (self.set_arguments(set, ctx, visiting)?, Some(condition))
                    }
                    other => (self.set_arguments(other, ctx, visiting)?, None),
                };
                Ok(Construct {
                    kind: ConstructKind::TopCount,
                    args,
                    condition,
                    top: Some((count, order)),
                })
            }
            SetExpr::Members(_)
            | SetExpr::Tuples(_)
            | SetExpr::LevelMembers { .. }
            | SetExpr::Children(_)
            | SetExpr::Descendants { .. }
            | SetExpr::Range { .. } => {
                if !self.config.enable_native_members {
                    return disabled("enable_native_members");
                }
                let arg = self.argument(expr, ctx, visiting)?;
                Ok(Construct {
                    kind: ConstructKind::Members,
                    args: vec![arg],
                    condition: None,
                    top: None,
                })
            }
        }
    }

    fn resolve_named_set<'d>(
        &self,
        name: &str,
        definitions: &'d Definitions,
        visiting: &[String],
    ) -> GateResult<&'d SetExpr> {
        if visiting.iter().any(|v| v == name) {
            return unsupported(format!("named set [{name}] refers to itself"));
        }
        match definitions.named_set(name) {
            Some(definition) => Ok(definition),
            None => unsupported(format!("unknown named set [{name}]")),
        }
    }

    /// Arguments of a set that is either a crossjoin or a single argument.
    fn set_arguments(
        &self,
        set: &SetExpr,
        ctx: &EvalContext,
        visiting: &mut Vec<String>,
    ) -> GateResult<Vec<SetArgument>> {
        match set {
            SetExpr::CrossJoin(items) => {
                if !self.config.enable_native_crossjoin {
                    return disabled("enable_native_crossjoin");
                }
                let mut args = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        SetExpr::CrossJoin(_) => args.extend(self.set_arguments(item, ctx, visiting)?),
                        other => args.push(self.argument(other, ctx, visiting)?),
                    }
                }
                Ok(args)
            }
            SetExpr::NamedSet(name) => {
                let definition = self.resolve_named_set(name, &ctx.definitions, visiting)?;
                visiting.push(name.clone());
                let args = self.set_arguments(definition, ctx, visiting);
                visiting.pop();
                args
            }
            other => Ok(vec![self.argument(other, ctx, visiting)?]),
        }
    }

    fn argument(&self, expr: &SetExpr, ctx: &EvalContext, visiting: &mut Vec<String>) -> GateResult<SetArgument> {
        let classifier = ArgumentClassifier::new(self.schema, &ctx.definitions);
        match classifier.classify_visiting(expr, visiting) {
            Classification::Supported(arg) => Ok(arg),
            Classification::Unsupported(reason) => match self.expand(expr, ctx) {
                Some(arg) => {
                    log::debug!("expanded non-native argument in memory: {reason}");
                    Ok(arg)
                }
                None => unsupported(reason),
            },
        }
    }

    /// Materialize an unsupported argument as a member list when allowed and safe.
    fn expand(&self, expr: &SetExpr, ctx: &EvalContext) -> Option<SetArgument> {
        if !self.config.expand_non_native {
            return None;
        }
        let limit = self.config.max_constraints;
        let members = self.materializer?.materialize(expr, ctx, limit)?;
        let first = *members.first()?;
        if members.len() > limit {
            return None;
        }
        let h = self.schema.hierarchies().get(first.hierarchy.index())?;
        let depth = h.get_member(first.member)?.depth;
        let acceptable = members.iter().all(|m| {
            m.hierarchy == first.hierarchy
                && h
                    .get_member(m.member)
                    .is_some_and(|r| r.depth == depth && !r.is_all() && !r.is_calculated())
        });
        acceptable.then(|| SetArgument::MemberList {
            hierarchy: first.hierarchy,
            depth,
            members,
        })
    }

    fn plan(&self, construct: Construct<'_>, ctx: &EvalContext) -> GateResult<NativePlan> {
        let Construct {
            kind,
            args,
            condition,
            top,
        } = construct;
        let star = self.check_arguments(&args)?;

        let projected: BTreeSet<HierarchyId> = args.iter().map(SetArgument::hierarchy).collect();
        let has_measure = top.is_some() || condition.is_some_and(mentions_measures);
        let context_applies = ctx.non_empty || has_measure;
        let context = if context_applies {
            self.applied_context(ctx, star, &projected)?
        } else {
            BTreeMap::new()
        };

        let compiler = ConstraintCompiler::new(self.schema, self.dialect);
        let mut query = SqlQuery::new();
        let mut level_order = Vec::new();
        let mut key_depths = Vec::with_capacity(args.len());
        let mut key_items = Vec::with_capacity(args.len());
        for arg in &args {
            let h = self.schema.hierarchy(arg.hierarchy());
            let depth = arg.depth(self.schema);
            if !h.level(depth).is_all {
                for d in h.first_stored_depth()..=depth {
                    if let Some(column) = h.level(d).order_column() {
                        level_order.push(query.column(column));
                    }
                }
            }
            let depths = key_layout(self.schema, arg);
            let items: Vec<usize> = depths
                .iter()
                .filter_map(|d| h.level(*d).key_column)
                .map(|c| query.column(c))
                .collect();
            if let Some(leaf) = items.last() {
                level_order.push(*leaf);
            }
            key_depths.push(depths);
            key_items.push(items);
            query.filter(arg.constraint(self.schema, &compiler)?);
        }

        let mut measure_terms = Vec::new();
        let mut complement = false;
        if let Some(condition) = condition {
            let mut conjuncts = Vec::new();
            flatten_and(condition, &mut conjuncts);
            if let [BoolExpr::IsEmpty(value)] = conjuncts.as_slice() {
                if kind == ConstructKind::TopCount {
                    return unsupported("TopCount over IsEmpty filter");
                }
                complement = true;
                let expr = self.measure_expr(value, &projected, &context, ctx, &mut Vec::new())?;
                query.having(MeasureCondition::NotEmpty(expr));
            } else {
                let mut guarded = false;
                for conjunct in conjuncts {
                    match condition_kind(conjunct) {
                        ConditionKind::Membership => {
                            query.filter(self.membership(conjunct, false, &projected, &compiler, ctx)?)
                        }
                        ConditionKind::Measure => {
                            guarded |= matches!(conjunct, BoolExpr::Not(inner) if matches!(**inner, BoolExpr::IsEmpty(_)));
                            measure_terms.push(self.measure_condition(
                                conjunct, false, &projected, &context, ctx,
                            )?);
                        }
                        ConditionKind::Mixed => {
                            return unsupported("condition mixes membership and measure tests")
                        }
                    }
                }
                if !measure_terms.is_empty() && !ctx.non_empty && !guarded {
                    return unsupported("measure filter would drop empty tuples outside NON EMPTY");
                }
            }
        }
        let constraint_filters: Vec<Predicate> = query.filters().to_vec();
        for term in measure_terms.iter().cloned() {
            query.having(term);
        }

        let mut count = None;
        if let Some((n, order)) = top {
            let expr = self.measure_expr(order, &projected, &context, ctx, &mut Vec::new())?;
            let idx = query.measure(expr);
            query.order_by(idx, false);
            query.limit(n);
            count = Some(n);
        }
        for idx in level_order {
            query.order_by(idx, true);
        }

        let mut context_filters = Vec::new();
        for members in context.values() {
            let predicate = compile_list(&compiler, members, false)?;
            context_filters.push(predicate.clone());
            query.filter(predicate);
        }
        let mut role_filters = Vec::new();
        if let Some(role) = &ctx.role {
            for hierarchy in &projected {
                if let HierarchyAccess::Restricted(members) = role.access(*hierarchy) {
                    let refs: Vec<MemberRef> =
                        members.iter().map(|m| MemberRef::new(*hierarchy, *m)).collect();
                    let predicate = compile_list(&compiler, &refs, false)?;
                    role_filters.push(predicate.clone());
                    query.filter(predicate);
                }
            }
        }

        let role_restricts = ctx.role.as_ref().is_some_and(|r| r.restricts_any());
        let join_fact = has_measure
            || (ctx.non_empty && (args.len() > 1 || !context.is_empty() || role_restricts));
        if join_fact {
            query.join_fact();
        }

        let post = match (kind, complement) {
            (_, true) => PostProcess::Complement,
            (ConstructKind::TopCount, false) => PostProcess::TopCount {
                count: count.unwrap_or_default(),
                pad: !ctx.non_empty,
            },
            _ => PostProcess::SetOrder,
        };
        let key = NativeCacheKey {
            kind,
            constraint: stable_hash(&(&args, &constraint_filters, &measure_terms, &post, &query)),
            context: stable_hash(&(ctx.non_empty, join_fact, &context_filters, &role_filters)),
            count,
        };
        Ok(NativePlan {
            kind,
            star,
            args,
            key_depths,
            key_items,
            query,
            post,
            key,
        })
    }

    fn check_arguments(&self, args: &[SetArgument]) -> GateResult<StarId> {
        let Some(first) = args.first() else {
            return unsupported("crossjoin without arguments");
        };
        let star = self.schema.hierarchy(first.hierarchy()).star();
        let mut seen = BTreeSet::new();
        for arg in args {
            if self.schema.hierarchy(arg.hierarchy()).star() != star {
                return unsupported("arguments belong to different cubes");
            }
            if !seen.insert(arg.hierarchy()) {
                return unsupported("hierarchy appears more than once");
            }
        }
        if args.iter().all(|a| a.is_all_singleton(self.schema)) {
            return unsupported("every argument is the All member");
        }
        if let Some(limit) = self.config.limit() {
            let projected = args.iter().fold(1u64, |acc, a| {
                acc.saturating_mul(a.cardinality(self.schema) as u64)
            });
            if projected > limit {
                return unsupported(format!(
                    "projected {projected} rows exceed the result limit of {limit}"
                ));
            }
        }
        Ok(star)
    }

    /// Non-All context members of hierarchies the set doesn't project, grouped by hierarchy.
    fn applied_context(
        &self,
        ctx: &EvalContext,
        star: StarId,
        projected: &BTreeSet<HierarchyId>,
    ) -> GateResult<BTreeMap<HierarchyId, Vec<MemberRef>>> {
        let mut context: BTreeMap<HierarchyId, Vec<MemberRef>> = BTreeMap::new();
        for member in &ctx.context {
            if !self.schema.member_exists(*member) {
                return Err(GateError::Failed(NativeError::InvalidRequest(format!(
                    "unknown context member #{}",
                    member.member.index()
                ))));
            }
            let h = self.schema.hierarchy(member.hierarchy);
            if projected.contains(&member.hierarchy)
                || h.star() != star
                || self.schema.is_all_member(*member)
            {
                continue;
            }
            if h.member(member.member).is_calculated() {
                return unsupported(format!(
                    "calculated context member {}",
                    self.schema.member_name(*member)
                ));
            }
            let entry = context.entry(member.hierarchy).or_default();
            if !entry.contains(member) {
                entry.push(*member);
            }
        }
        Ok(context)
    }

    /// WHERE predicate for a membership-only condition; `negate` is pushed to the leaves.
    fn membership(
        &self,
        condition: &BoolExpr,
        negate: bool,
        projected: &BTreeSet<HierarchyId>,
        compiler: &ConstraintCompiler<'_>,
        ctx: &EvalContext,
    ) -> GateResult<Predicate> {
        match condition {
            BoolExpr::InSet { hierarchy, members } if projected.contains(hierarchy) => {
                if let Some(other) = members.iter().find(|m| m.hierarchy != *hierarchy) {
                    return unsupported(format!(
                        "{} is not a member of the tested hierarchy",
                        self.schema.member_name(*other)
                    ));
                }
                compile_list(compiler, members, negate)
            }
            BoolExpr::InSet { hierarchy, members } => {
                // Not projected: CurrentMember is the context member (or All).
                let current: Vec<&MemberRef> =
                    ctx.context.iter().filter(|m| m.hierarchy == *hierarchy).collect();
                let current = match current.as_slice() {
                    [] => self.schema.all_member(*hierarchy),
                    [one] => Some(**one),
                    _ => return unsupported("CurrentMember of a compound slicer"),
                };
                let hit = current.is_some_and(|c| members.contains(&c));
                Ok(Predicate::Const(hit != negate))
            }
            BoolExpr::And(items) | BoolExpr::Or(items) => {
                let parts = items
                    .iter()
                    .map(|c| self.membership(c, negate, projected, compiler, ctx))
                    .collect::<GateResult<Vec<_>>>()?;
                let conjunction = matches!(condition, BoolExpr::And(_)) != negate;
                Ok(if conjunction {
                    Predicate::and(parts)
                } else {
                    Predicate::or(parts)
                })
            }
            BoolExpr::Not(inner) => self.membership(inner, !negate, projected, compiler, ctx),
            BoolExpr::IsEmpty(_) | BoolExpr::Compare(..) => {
                unsupported("condition mixes membership and measure tests")
            }
        }
    }

    /// HAVING condition for a measure-only condition; `negate` is pushed to the leaves.
    fn measure_condition(
        &self,
        condition: &BoolExpr,
        negate: bool,
        projected: &BTreeSet<HierarchyId>,
        context: &BTreeMap<HierarchyId, Vec<MemberRef>>,
        ctx: &EvalContext,
    ) -> GateResult<MeasureCondition> {
        match condition {
            BoolExpr::Compare(op, a, b) => {
                let a = self.measure_expr(a, projected, context, ctx, &mut Vec::new())?;
                let b = self.measure_expr(b, projected, context, ctx, &mut Vec::new())?;
                let compare = MeasureCondition::Compare(*op, a, b);
                Ok(if negate {
                    MeasureCondition::Not(Box::new(compare))
                } else {
                    compare
                })
            }
            BoolExpr::IsEmpty(value) if negate => Ok(MeasureCondition::NotEmpty(self.measure_expr(
                value,
                projected,
                context,
                ctx,
                &mut Vec::new(),
            )?)),
            BoolExpr::IsEmpty(_) => unsupported("IsEmpty combined with other conditions"),
            BoolExpr::And(items) | BoolExpr::Or(items) => {
                let parts = items
                    .iter()
                    .map(|c| self.measure_condition(c, negate, projected, context, ctx))
                    .collect::<GateResult<Vec<_>>>()?;
                let conjunction = matches!(condition, BoolExpr::And(_)) != negate;
                Ok(if conjunction {
                    MeasureCondition::And(parts)
                } else {
                    MeasureCondition::Or(parts)
                })
            }
            BoolExpr::Not(inner) => self.measure_condition(inner, !negate, projected, context, ctx),
            BoolExpr::InSet { .. } => unsupported("condition mixes membership and measure tests"),
        }
    }

    fn measure_expr(
        &self,
        value: &ValueExpr,
        projected: &BTreeSet<HierarchyId>,
        context: &BTreeMap<HierarchyId, Vec<MemberRef>>,
        ctx: &EvalContext,
        visiting: &mut Vec<String>,
    ) -> GateResult<MeasureExpr> {
        match value {
            ValueExpr::Measure(measure) => {
                self.check_measure(*measure, projected)?;
                Ok(MeasureExpr::measure(*measure))
            }
            ValueExpr::Literal(v @ Value::Number(_)) => Ok(MeasureExpr::Literal(v.clone())),
            ValueExpr::Literal(other) => unsupported(format!("non-numeric literal {other}")),
            ValueExpr::Arith(op, a, b) => Ok(MeasureExpr::Arith(
                *op,
                Box::new(self.measure_expr(a, projected, context, ctx, visiting)?),
                Box::new(self.measure_expr(b, projected, context, ctx, visiting)?),
            )),
            ValueExpr::CalculatedMeasure(name) => {
                if visiting.iter().any(|v| v == name) {
                    return unsupported(format!("calculated measure [{name}] refers to itself"));
                }
                let Some(formula) = ctx.definitions.calculated_measure(name) else {
                    return unsupported(format!("unknown calculated measure [{name}]"));
                };
                visiting.push(name.clone());
                let expr = self.measure_expr(formula, projected, context, ctx, visiting);
                visiting.pop();
                expr
            }
            ValueExpr::Tuple { members, measure } => {
                self.check_measure(*measure, projected)?;
                let mut filters = Vec::new();
                for member in members {
                    if let Some(filter) = self.tuple_member(member, projected, context, ctx)? {
                        filters.push(filter);
                    }
                }
                let filter = Predicate::and(filters);
                Ok(MeasureExpr::Aggregate {
                    measure: *measure,
                    filter: (filter.is_const() != Some(true)).then_some(filter),
                })
            }
            ValueExpr::Function { name, .. } => {
                unsupported(format!("{name} has no SQL translation"))
            }
        }
    }

    fn check_measure(&self, measure: MeasureId, projected: &BTreeSet<HierarchyId>) -> GateResult<()> {
        let star = projected
            .iter()
            .next()
            .map(|h| self.schema.hierarchy(*h).star());
        match star {
            Some(star) if measure.index() < self.schema.star(star).measures().len() => Ok(()),
            _ => unsupported(format!("measure #{} is not stored in the cube", measure.index())),
        }
    }

    /// Row filter a tuple coordinate adds to a measure's aggregation.
    fn tuple_member(
        &self,
        member: &MemberExpr,
        projected: &BTreeSet<HierarchyId>,
        context: &BTreeMap<HierarchyId, Vec<MemberRef>>,
        ctx: &EvalContext,
    ) -> GateResult<Option<Predicate>> {
        let compiler = ConstraintCompiler::new(self.schema, self.dialect);
        let overrides = |hierarchy: HierarchyId| -> GateResult<()> {
            if projected.contains(&hierarchy) {
                return unsupported("tuple overrides a member of the set being evaluated");
            }
            if context.contains_key(&hierarchy) {
                return unsupported("tuple overrides a context member");
            }
            Ok(())
        };
        match member {
            MemberExpr::CurrentMember(h) if projected.contains(h) => {
                unsupported("expression references the current member of the set being evaluated")
            }
            MemberExpr::CurrentMember(_) => Ok(None),
            MemberExpr::Member(m) => {
                overrides(m.hierarchy)?;
                if !self.schema.member_exists(*m) {
                    return unsupported(format!("unknown member #{}", m.member.index()));
                }
                if self.schema.is_all_member(*m) {
                    return Ok(None);
                }
                Ok(Some(compile_list(&compiler, &[*m], false)?))
            }
            MemberExpr::Calculated {
                hierarchy,
                name,
                definition,
            } => {
                overrides(*hierarchy)?;
                let CalculatedDefinition::Aggregate(set) = definition else {
                    return unsupported(format!("calculated member [{name}] is not an aggregation"));
                };
                let classifier = ArgumentClassifier::new(self.schema, &ctx.definitions);
                match classifier.classify(set) {
                    Classification::Supported(arg) if arg.hierarchy() == *hierarchy => {
                        Ok(Some(arg.constraint(self.schema, &compiler)?))
                    }
                    Classification::Supported(_) => unsupported(format!(
                        "calculated member [{name}] aggregates another hierarchy"
                    )),
                    Classification::Unsupported(reason) => {
                        unsupported(format!("calculated member [{name}]: {reason}"))
                    }
                }
            }
        }
    }
}

fn compile_list(
    compiler: &ConstraintCompiler<'_>,
    members: &[MemberRef],
    negate: bool,
) -> GateResult<Predicate> {
    let list = TupleList::from_members(members.iter().copied());
    Ok(compiler.compile(&list, negate)?.predicate)
}

fn literal_count(count: &ValueExpr) -> GateResult<u64> {
    match count {
        ValueExpr::Literal(Value::Number(n)) if n.0 >= 0.0 && n.0.fract() == 0.0 => Ok(n.0 as u64),
        _ => unsupported("TopCount count is not a non-negative integer literal"),
    }
}

fn flatten_and<'e>(condition: &'e BoolExpr, out: &mut Vec<&'e BoolExpr>) {
    match condition {
        BoolExpr::And(items) => {
            for item in items {
                flatten_and(item, out);
            }
        }
        other => out.push(other),
    }
}

enum ConditionKind {
    Membership,
    Measure,
    Mixed,
}

fn condition_kind(condition: &BoolExpr) -> ConditionKind {
    let mut membership = false;
    let mut measure = false;
    visit_leaves(condition, &mut |leaf| match leaf {
        BoolExpr::InSet { .. } => membership = true,
        _ => measure = true,
    });
    match (membership, measure) {
        (true, true) => ConditionKind::Mixed,
        (true, false) => ConditionKind::Membership,
        _ => ConditionKind::Measure,
    }
}

fn mentions_measures(condition: &BoolExpr) -> bool {
    let mut found = false;
    visit_leaves(condition, &mut |leaf| {
        found |= !matches!(leaf, BoolExpr::InSet { .. });
    });
    found
}

fn visit_leaves(condition: &BoolExpr, f: &mut dyn FnMut(&BoolExpr)) {
    match condition {
        BoolExpr::And(items) | BoolExpr::Or(items) => {
            for item in items {
                visit_leaves(item, f);
            }
        }
        BoolExpr::Not(inner) => visit_leaves(inner, f),
        leaf => f(leaf),
    }
}
