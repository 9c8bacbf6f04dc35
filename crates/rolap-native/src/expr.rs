//! Set, boolean and value expressions handed to the native evaluator.
//!
//! These are the already-parsed shapes of the MDX constructs the evaluator may push down to SQL.
//! Anything the parser produces that has no variant here reaches the evaluator as an opaque
//! [`ValueExpr::Function`] and is never native.

use crate::executor::CancellationToken;
use rolap_model::{HierarchyId, MeasureId, MemberRef, Role, Schema, Value};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl CompareOp {
    pub fn sql(self) -> &'static str {
        match self {
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithOp {
    pub fn sql(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MemberExpr {
    Member(MemberRef),
    /// `[Hierarchy].CurrentMember`.
    CurrentMember(HierarchyId),
    /// A calculated (non-measure) member defined in the query or schema.
    Calculated {
        hierarchy: HierarchyId,
        name: String,
        definition: CalculatedDefinition,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CalculatedDefinition {
    /// `Aggregate({set})`: the sum of the set's cells, expressible as conditional aggregation.
    Aggregate(Box<SetExpr>),
    /// Any other formula.
    Formula(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SetExpr {
    /// `{m1, m2, ...}`.
    Members(Vec<MemberExpr>),
    /// `{(a, b), (c, d)}`.
    Tuples(Vec<Vec<MemberRef>>),
    /// `[Hierarchy].[Level].Members`.
    LevelMembers { hierarchy: HierarchyId, depth: usize },
    Children(MemberRef),
    /// `Descendants(member, level)`, restricted to the members at `depth`.
    Descendants { member: MemberRef, depth: usize },
    /// `from : to`.
    Range { from: MemberRef, to: MemberRef },
    CrossJoin(Vec<SetExpr>),
    Filter {
        set: Box<SetExpr>,
        condition: BoolExpr,
    },
    TopCount {
        set: Box<SetExpr>,
        count: ValueExpr,
        order: ValueExpr,
    },
    NamedSet(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum BoolExpr {
    IsEmpty(ValueExpr),
    Compare(CompareOp, ValueExpr, ValueExpr),
    /// `[Hierarchy].CurrentMember IN {members}`.
    InSet {
        hierarchy: HierarchyId,
        members: Vec<MemberRef>,
    },
    And(Vec<BoolExpr>),
    Or(Vec<BoolExpr>),
    Not(Box<BoolExpr>),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ValueExpr {
    Measure(MeasureId),
    Literal(Value),
    /// `(member, ..., [Measures].[m])`.
    Tuple {
        members: Vec<MemberExpr>,
        measure: MeasureId,
    },
    Arith(ArithOp, Box<ValueExpr>, Box<ValueExpr>),
    /// Reference to a calculated measure registered in [`Definitions`].
    CalculatedMeasure(String),
    Function { name: String, args: Vec<Operand> },
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Operand {
    Value(ValueExpr),
    Set(SetExpr),
    Member(MemberExpr),
}

impl BoolExpr {
    pub fn not(self) -> Self {
        BoolExpr::Not(Box::new(self))
    }

    pub fn not_empty(value: ValueExpr) -> Self {
        BoolExpr::IsEmpty(value).not()
    }
}

impl SetExpr {
    pub fn filter(self, condition: BoolExpr) -> Self {
        SetExpr::Filter {
            set: Box::new(self),
            condition,
        }
    }

    pub fn top_count(self, count: u64, order: ValueExpr) -> Self {
        SetExpr::TopCount {
            set: Box::new(self),
            count: ValueExpr::Literal(Value::from(count as f64)),
            order,
        }
    }

    pub fn members(members: impl IntoIterator<Item = MemberRef>) -> Self {
        SetExpr::Members(members.into_iter().map(MemberExpr::Member).collect())
    }
}

/// Named sets and calculated measures visible to an evaluation.
#[derive(Clone, Debug, Default)]
pub struct Definitions {
    named_sets: HashMap<String, SetExpr>,
    calculated_measures: HashMap<String, ValueExpr>,
}

impl Definitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_named_set(mut self, name: impl Into<String>, set: SetExpr) -> Self {
        self.named_sets.insert(name.into(), set);
        self
    }

    pub fn with_calculated_measure(mut self, name: impl Into<String>, formula: ValueExpr) -> Self {
        self.calculated_measures.insert(name.into(), formula);
        self
    }

    pub fn named_set(&self, name: &str) -> Option<&SetExpr> {
        self.named_sets.get(name)
    }

    pub fn calculated_measure(&self, name: &str) -> Option<&ValueExpr> {
        self.calculated_measures.get(name)
    }
}

/// Per-statement state shared by native set evaluation and cell loading.
#[derive(Clone, Debug, Default)]
pub struct ExecutionContext {
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }
}

/// The evaluator state a native set is computed in.
#[derive(Clone, Debug, Default)]
pub struct EvalContext {
    /// Slicer/context members; All members and members of hierarchies projected by the set are
    /// ignored.
    pub context: Vec<MemberRef>,
    /// `NON EMPTY` semantics: only tuples with fact rows are returned.
    pub non_empty: bool,
    pub role: Option<Arc<Role>>,
    pub definitions: Arc<Definitions>,
    pub execution: ExecutionContext,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn non_empty(mut self) -> Self {
        self.non_empty = true;
        self
    }

    pub fn with_context(mut self, members: impl IntoIterator<Item = MemberRef>) -> Self {
        self.context.extend(members);
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(Arc::new(role));
        self
    }

    pub fn with_definitions(mut self, definitions: Definitions) -> Self {
        self.definitions = Arc::new(definitions);
        self
    }
}

/// Render `expr` in an MDX-like form for alerts and logs.
pub fn describe(schema: &Schema, expr: &SetExpr) -> String {
    let mut out = String::new();
    write_set(schema, expr, &mut out);
    out
}

fn level_name(schema: &Schema, hierarchy: HierarchyId, depth: usize) -> String {
    let h = schema.hierarchy(hierarchy);
    match h.levels().get(depth) {
        Some(level) => format!("[{}].[{}]", h.name(), level.name),
        None => format!("[{}].<depth {depth}>", h.name()),
    }
}

fn write_member(schema: &Schema, member: &MemberExpr, out: &mut String) {
    match member {
        MemberExpr::Member(m) if schema.member_exists(*m) => out.push_str(&schema.member_name(*m)),
        MemberExpr::Member(m) => {
            let _ = write!(out, "<member #{}>", m.member.index());
        }
        MemberExpr::CurrentMember(h) => {
            let _ = write!(out, "[{}].CurrentMember", schema.hierarchy(*h).name());
        }
        MemberExpr::Calculated {
            hierarchy, name, ..
        } => {
            let _ = write!(out, "[{}].[{name}]", schema.hierarchy(*hierarchy).name());
        }
    }
}

fn write_list<T>(items: &[T], out: &mut String, mut each: impl FnMut(&T, &mut String)) {
    for (idx, item) in items.iter().enumerate() {
        if idx > 0 {
            out.push_str(", ");
        }
        each(item, out);
    }
}

fn write_set(schema: &Schema, expr: &SetExpr, out: &mut String) {
    match expr {
        SetExpr::Members(members) => {
            out.push('{');
            write_list(members, out, |m, out| write_member(schema, m, out));
            out.push('}');
        }
        SetExpr::Tuples(tuples) => {
            out.push('{');
            write_list(tuples, out, |t, out| {
                out.push('(');
                write_list(t, out, |m, out| write_member(schema, &MemberExpr::Member(*m), out));
                out.push(')');
            });
            out.push('}');
        }
        SetExpr::LevelMembers { hierarchy, depth } => {
            let _ = write!(out, "{}.Members", level_name(schema, *hierarchy, *depth));
        }
        SetExpr::Children(m) => {
            write_member(schema, &MemberExpr::Member(*m), out);
            out.push_str(".Children");
        }
        SetExpr::Descendants { member, depth } => {
            out.push_str("Descendants(");
            write_member(schema, &MemberExpr::Member(*member), out);
            let _ = write!(out, ", {})", level_name(schema, member.hierarchy, *depth));
        }
        SetExpr::Range { from, to } => {
            write_member(schema, &MemberExpr::Member(*from), out);
            out.push_str(" : ");
            write_member(schema, &MemberExpr::Member(*to), out);
        }
        SetExpr::CrossJoin(args) => {
            out.push_str("CrossJoin(");
            write_list(args, out, |a, out| write_set(schema, a, out));
            out.push(')');
        }
        SetExpr::Filter { set, condition } => {
            out.push_str("Filter(");
            write_set(schema, set, out);
            out.push_str(", ");
            write_bool(schema, condition, out);
            out.push(')');
        }
        SetExpr::TopCount { set, count, order } => {
            out.push_str("TopCount(");
            write_set(schema, set, out);
            out.push_str(", ");
            write_value(schema, count, out);
            out.push_str(", ");
            write_value(schema, order, out);
            out.push(')');
        }
        SetExpr::NamedSet(name) => {
            let _ = write!(out, "[{name}]");
        }
    }
}

fn write_bool(schema: &Schema, expr: &BoolExpr, out: &mut String) {
    match expr {
        BoolExpr::IsEmpty(v) => {
            out.push_str("IsEmpty(");
            write_value(schema, v, out);
            out.push(')');
        }
        BoolExpr::Compare(op, a, b) => {
            write_value(schema, a, out);
            let _ = write!(out, " {} ", op.sql());
            write_value(schema, b, out);
        }
        BoolExpr::InSet { hierarchy, members } => {
            let _ = write!(out, "[{}].CurrentMember IN {{", schema.hierarchy(*hierarchy).name());
            write_list(members, out, |m, out| write_member(schema, &MemberExpr::Member(*m), out));
            out.push('}');
        }
        BoolExpr::And(items) | BoolExpr::Or(items) => {
            let sep = if matches!(expr, BoolExpr::And(_)) {
                " AND "
            } else {
                " OR "
            };
            out.push('(');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push_str(sep);
                }
                write_bool(schema, item, out);
            }
            out.push(')');
        }
        BoolExpr::Not(inner) => {
            out.push_str("NOT ");
            write_bool(schema, inner, out);
        }
    }
}

fn write_value(schema: &Schema, expr: &ValueExpr, out: &mut String) {
    let measure_name = |star_measure: MeasureId| {
        schema
            .stars()
            .iter()
            .find_map(|s| s.measures().get(star_measure.index()).map(|m| m.name.clone()))
            .unwrap_or_else(|| format!("#{}", star_measure.index()))
    };
    match expr {
        ValueExpr::Measure(m) => {
            let _ = write!(out, "[Measures].[{}]", measure_name(*m));
        }
        ValueExpr::Literal(v) => {
            let _ = write!(out, "{v}");
        }
        ValueExpr::Tuple { members, measure } => {
            out.push('(');
            for m in members {
                write_member(schema, m, out);
                out.push_str(", ");
            }
            let _ = write!(out, "[Measures].[{}])", measure_name(*measure));
        }
        ValueExpr::Arith(op, a, b) => {
            out.push('(');
            write_value(schema, a, out);
            let _ = write!(out, " {} ", op.sql());
            write_value(schema, b, out);
            out.push(')');
        }
        ValueExpr::CalculatedMeasure(name) => {
            let _ = write!(out, "[Measures].[{name}]");
        }
        ValueExpr::Function { name, args } => {
            let _ = write!(out, "{name}(");
            write_list(args, out, |a, out| match a {
                Operand::Value(v) => write_value(schema, v, out),
                Operand::Set(s) => write_set(schema, s, out),
                Operand::Member(m) => write_member(schema, m, out),
            });
            out.push(')');
        }
    }
}
