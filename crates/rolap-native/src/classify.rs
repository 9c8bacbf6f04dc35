//! Argument classification for native set evaluation.

use crate::constraint::ConstraintCompiler;
use crate::expr::{Definitions, MemberExpr, SetExpr};
use crate::predicate::Predicate;
use crate::tuple::TupleList;
use rolap_model::{HierarchyId, MemberRef, Schema, SchemaResult};

/// A set argument SQL can enumerate: one level of one hierarchy, optionally constrained.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SetArgument {
    /// Explicit stored members of a single level, in enumeration order.
    MemberList {
        hierarchy: HierarchyId,
        depth: usize,
        members: Vec<MemberRef>,
    },
    LevelMembers { hierarchy: HierarchyId, depth: usize },
    Children { parent: MemberRef },
    Descendants { ancestor: MemberRef, depth: usize },
    /// Inclusive range; both ends on the same level.
    Range { from: MemberRef, to: MemberRef },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Classification {
    Supported(SetArgument),
    Unsupported(String),
}

impl SetArgument {
    pub fn hierarchy(&self) -> HierarchyId {
        match self {
            SetArgument::MemberList { hierarchy, .. } | SetArgument::LevelMembers { hierarchy, .. } => {
                *hierarchy
            }
            SetArgument::Children { parent } => parent.hierarchy,
            SetArgument::Descendants { ancestor, .. } => ancestor.hierarchy,
            SetArgument::Range { from, .. } => from.hierarchy,
        }
    }

    /// Depth of the level whose members the argument produces.
    pub fn depth(&self, schema: &Schema) -> usize {
        match self {
            SetArgument::MemberList { depth, .. }
            | SetArgument::LevelMembers { depth, .. }
            | SetArgument::Descendants { depth, .. } => *depth,
            SetArgument::Children { parent } => {
                schema.hierarchy(parent.hierarchy).member(parent.member).depth + 1
            }
            SetArgument::Range { from, .. } => schema.hierarchy(from.hierarchy).member(from.member).depth,
        }
    }

    /// The argument's members in natural set order.
    pub fn members(&self, schema: &Schema) -> Vec<MemberRef> {
        let h = schema.hierarchy(self.hierarchy());
        let id = h.id();
        let ids = match self {
            SetArgument::MemberList { members, .. } => return members.clone(),
            SetArgument::LevelMembers { depth, .. } if h.level(*depth).is_all => {
                h.all_member().into_iter().collect()
            }
            SetArgument::LevelMembers { depth, .. } => h.level_members(*depth),
            SetArgument::Children { parent } => h.children(parent.member),
            SetArgument::Descendants { ancestor, depth } => h.descendants(ancestor.member, *depth),
            SetArgument::Range { from, to } => h.range(from.member, to.member).unwrap_or_default(),
        };
        ids.into_iter().map(|m| MemberRef::new(id, m)).collect()
    }

    /// Upper bound on the number of members, used for crossjoin row projections.
    pub fn cardinality(&self, schema: &Schema) -> usize {
        match self {
            SetArgument::MemberList { members, .. } => members.len(),
            SetArgument::LevelMembers { hierarchy, depth } => {
                let h = schema.hierarchy(*hierarchy);
                if h.level(*depth).is_all {
                    1
                } else {
                    h.level_cardinality(*depth)
                }
            }
            other => other.members(schema).len(),
        }
    }

    /// `true` when the argument is just the All member (`[H].[(All)].Members`).
    pub fn is_all_singleton(&self, schema: &Schema) -> bool {
        match self {
            SetArgument::LevelMembers { hierarchy, depth } => {
                schema.hierarchy(*hierarchy).level(*depth).is_all
            }
            _ => false,
        }
    }

    /// WHERE predicate restricting the argument's level to the argument's members.
    ///
    /// `Children` and `Descendants` constrain the ancestor's key path rather than enumerating
    /// members; ranges are expanded; `LevelMembers` is unconstrained.
    pub fn constraint(&self, schema: &Schema, compiler: &ConstraintCompiler<'_>) -> SchemaResult<Predicate> {
        let list = match self {
            SetArgument::LevelMembers { .. } => return Ok(Predicate::always()),
            SetArgument::MemberList { members, .. } => TupleList::from_members(members.iter().copied()),
            SetArgument::Children { parent } => TupleList::from_members([*parent]),
            SetArgument::Descendants { ancestor, .. } => TupleList::from_members([*ancestor]),
            SetArgument::Range { .. } => TupleList::from_members(self.members(schema)),
        };
        Ok(compiler.compile(&list, false)?.predicate)
    }
}

/// Tags set expressions as SQL-enumerable arguments or explains why they aren't.
pub struct ArgumentClassifier<'a> {
    schema: &'a Schema,
    definitions: &'a Definitions,
}

impl<'a> ArgumentClassifier<'a> {
    pub fn new(schema: &'a Schema, definitions: &'a Definitions) -> Self {
        Self {
            schema,
            definitions,
        }
    }

    pub fn classify(&self, expr: &SetExpr) -> Classification {
        self.classify_visiting(expr, &mut Vec::new())
    }

    /// Classify with the named sets already being expanded by the caller on `visiting`.
    pub(crate) fn classify_visiting(&self, expr: &SetExpr, visiting: &mut Vec<String>) -> Classification {
        let classification = match expr {
            SetExpr::Members(members) => self.classify_members(members),
            SetExpr::Tuples(_) => Classification::Unsupported("tuple-valued enumeration".to_string()),
            SetExpr::LevelMembers { hierarchy, depth } => self.classify_level(*hierarchy, *depth),
            SetExpr::Children(parent) => self.classify_children(*parent),
            SetExpr::Descendants { member, depth } => self.classify_descendants(*member, *depth),
            SetExpr::Range { from, to } => self.classify_range(*from, *to),
            SetExpr::NamedSet(name) => {
                if visiting.iter().any(|v| v == name) {
                    Classification::Unsupported(format!("named set [{name}] refers to itself"))
                } else if let Some(definition) = self.definitions.named_set(name) {
                    visiting.push(name.clone());
                    let inner = self.classify_visiting(definition, visiting);
                    visiting.pop();
                    inner
                } else {
                    Classification::Unsupported(format!("unknown named set [{name}]"))
                }
            }
            SetExpr::CrossJoin(_) | SetExpr::Filter { .. } | SetExpr::TopCount { .. } => {
                Classification::Unsupported("set function is not a simple member set".to_string())
            }
        };
        log::trace!("classified argument as {classification:?}");
        classification
    }

    fn stored(&self, member: MemberRef) -> Result<(), String> {
        if !self.schema.member_exists(member) {
            return Err(format!("unknown member #{}", member.member.index()));
        }
        let record = self.schema.hierarchy(member.hierarchy).member(member.member);
        if record.is_calculated() {
            return Err(format!("calculated member {}", self.schema.member_name(member)));
        }
        Ok(())
    }

    fn classify_members(&self, members: &[MemberExpr]) -> Classification {
        let mut refs = Vec::with_capacity(members.len());
        for member in members {
            let member = match member {
                MemberExpr::Member(m) => *m,
                MemberExpr::CurrentMember(_) => {
                    return Classification::Unsupported("CurrentMember in a member set".to_string())
                }
                MemberExpr::Calculated { name, .. } => {
                    return Classification::Unsupported(format!("calculated member [{name}]"))
                }
            };
            if let Err(reason) = self.stored(member) {
                return Classification::Unsupported(reason);
            }
            if self.schema.is_all_member(member) {
                return Classification::Unsupported("All member in a member set".to_string());
            }
            refs.push(member);
        }
        let Some(first) = refs.first().copied() else {
            return Classification::Unsupported("empty member set has no level".to_string());
        };
        let depth = self.schema.hierarchy(first.hierarchy).member(first.member).depth;
        let same_level = refs.iter().all(|m| {
            m.hierarchy == first.hierarchy
                && self.schema.hierarchy(m.hierarchy).member(m.member).depth == depth
        });
        if !same_level {
            return Classification::Unsupported("members of different levels".to_string());
        }
        Classification::Supported(SetArgument::MemberList {
            hierarchy: first.hierarchy,
            depth,
            members: refs,
        })
    }

    fn classify_level(&self, hierarchy: HierarchyId, depth: usize) -> Classification {
        match self.schema.hierarchies().get(hierarchy.index()) {
            Some(h) if depth < h.levels().len() => {
                Classification::Supported(SetArgument::LevelMembers { hierarchy, depth })
            }
            _ => Classification::Unsupported("unknown level".to_string()),
        }
    }

    fn classify_children(&self, parent: MemberRef) -> Classification {
        if let Err(reason) = self.stored(parent) {
            return Classification::Unsupported(reason);
        }
        let h = self.schema.hierarchy(parent.hierarchy);
        if h.member(parent.member).depth + 1 >= h.levels().len() {
            return Classification::Unsupported("children of a leaf member".to_string());
        }
        Classification::Supported(SetArgument::Children { parent })
    }

    fn classify_descendants(&self, ancestor: MemberRef, depth: usize) -> Classification {
        if let Err(reason) = self.stored(ancestor) {
            return Classification::Unsupported(reason);
        }
        let h = self.schema.hierarchy(ancestor.hierarchy);
        let start = h.member(ancestor.member).depth;
        if depth < start || depth >= h.levels().len() {
            return Classification::Unsupported("descendants level is not below the member".to_string());
        }
        if depth == start {
            return Classification::Supported(SetArgument::MemberList {
                hierarchy: ancestor.hierarchy,
                depth,
                members: vec![ancestor],
            });
        }
        Classification::Supported(SetArgument::Descendants { ancestor, depth })
    }

    fn classify_range(&self, from: MemberRef, to: MemberRef) -> Classification {
        for m in [from, to] {
            if let Err(reason) = self.stored(m) {
                return Classification::Unsupported(reason);
            }
            if self.schema.is_all_member(m) {
                return Classification::Unsupported("range over the All member".to_string());
            }
        }
        let h = self.schema.hierarchy(from.hierarchy);
        if from.hierarchy != to.hierarchy || h.range(from.member, to.member).is_none() {
            return Classification::Unsupported("range ends on different levels".to_string());
        }
        Classification::Supported(SetArgument::Range { from, to })
    }
}

/// Depths whose key columns identify members of an argument's level; empty for the All level.
pub(crate) fn key_layout(schema: &Schema, arg: &SetArgument) -> Vec<usize> {
    let h = schema.hierarchy(arg.hierarchy());
    let depth = arg.depth(schema);
    if h.level(depth).is_all {
        Vec::new()
    } else {
        h.disambiguating_depths(depth)
    }
}
