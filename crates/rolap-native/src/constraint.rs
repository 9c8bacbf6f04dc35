//! Compound member constraints.
//!
//! Turns an ordered list of members (or member tuples) into a compact, NULL-safe [`Predicate`]:
//!
//! 1. Per tuple position, the constrained levels are the target level plus non-unique
//!    ancestors, stopping at the first unique level (inclusive) or the first stored level.
//! 2. Tuples are grouped by their values above the lowest constrained column ("parent key").
//! 3. NULL-free tuples become rows of one IN-list (row-value IN where the dialect supports it,
//!    otherwise one `parent = .. AND leaf IN (..)` conjunction per parent group).
//! 4. Tuples with a NULL anywhere become explicit conjunctions using `IS NULL`, placed in order
//!    of first occurrence.
//! 5. Negation wraps each part in `NOT (..)` and adds `col IS NULL` escapes for every column that
//!    part compares by value, so rows that are merely NULL somewhere are only excluded when the
//!    excluded set contains that NULL combination.
//!
//! Members of different levels (or tuples of different level shapes) are compiled as separate
//! partitions and OR-ed (AND-ed when negated) in order of first occurrence.

use crate::predicate::Predicate;
use crate::tuple::TupleList;
use rolap_model::{
    ColumnId, Dialect, HierarchyId, MemberRef, Schema, SchemaError, SchemaResult, StarId, Value,
};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Result of compiling a member/tuple list.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CompiledConstraint {
    pub predicate: Predicate,
    /// Columns the predicate reads; the assembler joins whatever tables they live in.
    pub columns: BTreeSet<ColumnId>,
    pub hierarchies: BTreeSet<HierarchyId>,
    /// `None` for an empty list (the predicate is then a constant).
    pub star: Option<StarId>,
}

pub struct ConstraintCompiler<'a> {
    schema: &'a Schema,
    dialect: &'a dyn Dialect,
}

/// One tuple position inside a partition: which hierarchy and which key columns.
struct PositionLayout {
    hierarchy: HierarchyId,
    depths: Vec<usize>,
}

struct Partition {
    layout: Vec<PositionLayout>,
    columns: Vec<ColumnId>,
    /// Distinct value rows with the index of their first occurrence in the input list.
    rows: Vec<(usize, Vec<Value>)>,
    seen: HashSet<Vec<Value>>,
}

/// A disjunct of the positive predicate plus the columns it compares by value.
struct Part {
    first_index: usize,
    predicate: Predicate,
    value_columns: Vec<ColumnId>,
}

impl Part {
    fn negated(self) -> Predicate {
        Predicate::or(
            std::iter::once(self.predicate.negate())
                .chain(self.value_columns.into_iter().map(Predicate::IsNull)),
        )
    }
}

impl<'a> ConstraintCompiler<'a> {
    pub fn new(schema: &'a Schema, dialect: &'a dyn Dialect) -> Self {
        Self { schema, dialect }
    }

    /// Compile `list` into a predicate selecting rows that belong to one of its tuples, or,
    /// with `negate`, rows that belong to none of them.
    pub fn compile(&self, list: &TupleList, negate: bool) -> SchemaResult<CompiledConstraint> {
        let mut star = None;
        let mut hierarchies = BTreeSet::new();
        let mut partitions: Vec<Partition> = Vec::new();
        let mut partition_index: HashMap<Vec<(HierarchyId, usize)>, usize> = HashMap::new();

        for (index, tuple) in list.iter().enumerate() {
            let mut shape = Vec::with_capacity(tuple.len());
            for member in tuple.iter() {
                let (h, depth) = self.check_member(*member, &mut star)?;
                hierarchies.insert(h);
                shape.push((h, depth));
            }

            let slot = match partition_index.get(&shape) {
                Some(slot) => *slot,
                None => {
                    let partition = self.partition_layout(&shape);
                    partitions.push(partition);
                    partition_index.insert(shape, partitions.len() - 1);
                    partitions.len() - 1
                }
            };
            let partition = &mut partitions[slot];
            let values: Vec<Value> = tuple
                .iter()
                .zip(&partition.layout)
                .flat_map(|(member, layout)| {
                    self.schema
                        .hierarchy(layout.hierarchy)
                        .key_path(member.member, &layout.depths)
                })
                .collect();
            if partition.seen.insert(values.clone()) {
                partition.rows.push((index, values));
            }
        }

        let mut parts: Vec<Part> = Vec::new();
        for partition in &partitions {
            parts.extend(self.compile_partition(partition));
        }
        parts.sort_by_key(|p| p.first_index);

        let predicate = if negate {
            Predicate::and(parts.into_iter().map(Part::negated))
        } else {
            Predicate::or(parts.into_iter().map(|p| p.predicate))
        };
        let columns = predicate.columns();
        Ok(CompiledConstraint {
            predicate,
            columns,
            hierarchies,
            star,
        })
    }

    fn check_member(
        &self,
        member: MemberRef,
        star: &mut Option<StarId>,
    ) -> SchemaResult<(HierarchyId, usize)> {
        if !self.schema.member_exists(member) {
            return Err(SchemaError::UnknownMember {
                hierarchy: format!("#{}", member.hierarchy.index()),
                path: format!("#{}", member.member.index()),
            });
        }
        let hierarchy = self.schema.hierarchy(member.hierarchy);
        let record = hierarchy.member(member.member);
        if record.is_calculated() {
            return Err(SchemaError::UnconstrainableMember {
                member: hierarchy.unique_name(member.member),
                reason: "calculated members have no stored key".to_string(),
            });
        }
        match star {
            Some(s) if *s != hierarchy.star() => {
                return Err(SchemaError::UnconstrainableMember {
                    member: hierarchy.unique_name(member.member),
                    reason: "tuple mixes hierarchies of different stars".to_string(),
                });
            }
            Some(_) => {}
            None => *star = Some(hierarchy.star()),
        }
        Ok((member.hierarchy, record.depth))
    }

    fn partition_layout(&self, shape: &[(HierarchyId, usize)]) -> Partition {
        let mut layout = Vec::with_capacity(shape.len());
        let mut columns = Vec::new();
        for (h, depth) in shape {
            let hierarchy = self.schema.hierarchy(*h);
            // The All member imposes no constraint on its hierarchy.
            let depths = if hierarchy.level(*depth).is_all {
                Vec::new()
            } else {
                hierarchy.disambiguating_depths(*depth)
            };
            columns.extend(depths.iter().filter_map(|d| hierarchy.level(*d).key_column));
            layout.push(PositionLayout {
                hierarchy: *h,
                depths,
            });
        }
        Partition {
            layout,
            columns,
            rows: Vec::new(),
            seen: HashSet::new(),
        }
    }

    fn compile_partition(&self, partition: &Partition) -> Vec<Part> {
        let Some(first_index) = partition.rows.first().map(|(i, _)| *i) else {
            return Vec::new();
        };
        let columns = &partition.columns;
        if columns.is_empty() {
            return vec![Part {
                first_index,
                predicate: Predicate::Const(true),
                value_columns: Vec::new(),
            }];
        }

        let leaf_col = columns[columns.len() - 1];
        let parent_cols = &columns[..columns.len() - 1];

        // Group by parent key in order of first occurrence.
        let mut groups: Vec<(usize, Vec<Value>, Vec<(usize, Value)>)> = Vec::new();
        let mut group_index: HashMap<&[Value], usize> = HashMap::new();
        for (index, values) in &partition.rows {
            let (parent, leaf) = values.split_at(values.len() - 1);
            let slot = *group_index.entry(parent).or_insert_with(|| {
                groups.push((*index, parent.to_vec(), Vec::new()));
                groups.len() - 1
            });
            groups[slot].2.push((*index, leaf[0].clone()));
        }

        let mut pure: Vec<(Vec<Value>, Vec<Value>)> = Vec::new();
        let mut pure_first = None;
        let mut parts = Vec::new();
        for (group_first, parent, leaves) in groups {
            if parent.iter().any(Value::is_null) {
                let leaf_values: Vec<Value> = leaves.iter().map(|(_, v)| v.clone()).collect();
                let leaf_has_null = leaf_values.iter().any(Value::is_null);
                let leaf_has_value = leaf_values.iter().any(|v| !v.is_null());
                let mut value_columns: Vec<ColumnId> = parent_cols
                    .iter()
                    .zip(&parent)
                    .filter(|(_, v)| !v.is_null())
                    .map(|(c, _)| *c)
                    .collect();
                if leaf_has_value && !leaf_has_null {
                    value_columns.push(leaf_col);
                }
                let predicate = Predicate::and(
                    parent_cols
                        .iter()
                        .zip(parent)
                        .map(|(c, v)| Predicate::eq_or_null(*c, v))
                        .chain(std::iter::once(Predicate::in_values(leaf_col, leaf_values))),
                );
                parts.push(Part {
                    first_index: group_first,
                    predicate,
                    value_columns,
                });
                continue;
            }

            let mut non_null = Vec::new();
            for (index, leaf) in leaves {
                if leaf.is_null() {
                    let predicate = Predicate::and(
                        parent_cols
                            .iter()
                            .zip(parent.iter())
                            .map(|(c, v)| Predicate::Eq(*c, v.clone()))
                            .chain(std::iter::once(Predicate::IsNull(leaf_col))),
                    );
                    parts.push(Part {
                        first_index: index,
                        predicate,
                        value_columns: parent_cols.to_vec(),
                    });
                } else {
                    pure_first.get_or_insert(index);
                    non_null.push(leaf);
                }
            }
            if !non_null.is_empty() {
                pure.push((parent, non_null));
            }
        }

        if let Some(first_index) = pure_first {
            parts.push(Part {
                first_index,
                predicate: self.pure_predicate(columns, parent_cols, leaf_col, pure),
                value_columns: columns.clone(),
            });
        }
        parts
    }

    fn pure_predicate(
        &self,
        columns: &[ColumnId],
        parent_cols: &[ColumnId],
        leaf_col: ColumnId,
        groups: Vec<(Vec<Value>, Vec<Value>)>,
    ) -> Predicate {
        if parent_cols.is_empty() {
            let values = groups.into_iter().flat_map(|(_, leaves)| leaves);
            return Predicate::in_values(leaf_col, values);
        }

        let row_count: usize = groups.iter().map(|(_, leaves)| leaves.len()).sum();
        if row_count == 1 {
            let (parent, leaves) = &groups[0];
            return Predicate::and(
                columns
                    .iter()
                    .zip(parent.iter().chain(leaves.iter()))
                    .map(|(c, v)| Predicate::Eq(*c, v.clone())),
            );
        }

        if self.dialect.supports_multi_value_in() {
            let rows = groups
                .into_iter()
                .flat_map(|(parent, leaves)| {
                    leaves.into_iter().map(move |leaf| {
                        let mut row = parent.clone();
                        row.push(leaf);
                        row
                    })
                })
                .collect();
            return Predicate::RowIn {
                columns: columns.to_vec(),
                rows,
            };
        }

        Predicate::or(groups.into_iter().map(|(parent, leaves)| {
            Predicate::and(
                parent_cols
                    .iter()
                    .zip(parent)
                    .map(|(c, v)| Predicate::Eq(*c, v))
                    .chain(std::iter::once(Predicate::in_values(leaf_col, leaves))),
            )
        }))
    }
}
