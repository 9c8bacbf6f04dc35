//! Cell requests and the segments that answer them.

use crate::predicate::Predicate;
use rolap_model::{ColumnId, MeasureId, StarId, Value};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// How a cell request constrains one star column.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ColumnConstraint {
    /// The column equals this value (`Value::Null` means `IS NULL`).
    Value(Value),
    /// The rows contributing to the cell satisfy this predicate (typically a compiled compound
    /// member constraint).
    Predicate(Arc<Predicate>),
}

/// One measure value at one coordinate of a star.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CellRequest {
    pub star: StarId,
    pub measure: MeasureId,
    pub constraints: BTreeMap<ColumnId, ColumnConstraint>,
}

impl CellRequest {
    pub fn new(star: StarId, measure: MeasureId) -> Self {
        Self {
            star,
            measure,
            constraints: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, column: ColumnId, value: impl Into<Value>) -> Self {
        self.constraints
            .insert(column, ColumnConstraint::Value(value.into()));
        self
    }

    /// A predicate pinning `column` to one value is kept as that value, so segments grouped on
    /// the column answer the request.
    pub fn with_predicate(mut self, column: ColumnId, predicate: Predicate) -> Self {
        let constraint = match predicate {
            Predicate::Eq(c, value) if c == column => ColumnConstraint::Value(value),
            Predicate::IsNull(c) if c == column => ColumnConstraint::Value(Value::Null),
            other => ColumnConstraint::Predicate(Arc::new(other)),
        };
        self.constraints.insert(column, constraint);
        self
    }

    /// The statement shape this request belongs to.
    pub(crate) fn batch_key(&self) -> BatchKey {
        let mut columns = Vec::new();
        let mut predicates = Vec::new();
        for (column, constraint) in &self.constraints {
            match constraint {
                ColumnConstraint::Value(_) => columns.push(*column),
                ColumnConstraint::Predicate(p) => predicates.push((*column, Arc::clone(p))),
            }
        }
        BatchKey {
            star: self.star,
            columns,
            predicates,
        }
    }

    /// Values of the value-constrained columns, in column order.
    pub(crate) fn coordinates(&self) -> Coordinates {
        self.constraints
            .values()
            .filter_map(|c| match c {
                ColumnConstraint::Value(v) => Some(v.clone()),
                ColumnConstraint::Predicate(_) => None,
            })
            .collect()
    }
}

pub(crate) type Coordinates = SmallVec<[Value; 4]>;

/// Requests with equal batch keys are answered by one `GROUP BY` statement.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct BatchKey {
    pub star: StarId,
    /// Grouped columns.
    pub columns: Vec<ColumnId>,
    /// Frozen predicates, shared by every cell of the batch.
    pub predicates: Vec<(ColumnId, Arc<Predicate>)>,
}

/// Identity of one loaded segment.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct SegmentKey {
    pub batch: BatchKey,
    pub measures: BTreeSet<MeasureId>,
    /// Requested values per grouped column.
    pub axes: Vec<BTreeSet<Value>>,
}

/// A block of aggregated values: every combination of the axis values, for every measure.
///
/// Combinations missing from the SQL result are loaded-but-empty cells.
#[derive(Debug)]
pub(crate) struct Segment {
    measures: Vec<MeasureId>,
    axes: Vec<BTreeSet<Value>>,
    cells: ahash::AHashMap<Coordinates, Vec<Value>>,
}

impl Segment {
    pub fn new(key: &SegmentKey, rows: Vec<Vec<Value>>) -> Self {
        let width = key.batch.columns.len();
        let cells = rows
            .into_iter()
            .map(|mut row| {
                let values = row.split_off(width.min(row.len()));
                (Coordinates::from_vec(row), values)
            })
            .collect();
        Self {
            measures: key.measures.iter().copied().collect(),
            axes: key.axes.clone(),
            cells,
        }
    }

    /// The cell's value, `Some(Value::Null)` when it is covered but empty, `None` when this
    /// segment doesn't cover it.
    pub fn value(&self, coordinates: &[Value], measure: MeasureId) -> Option<Value> {
        let position = self.measures.iter().position(|m| *m == measure)?;
        if coordinates.len() != self.axes.len()
            || coordinates.iter().zip(&self.axes).any(|(v, axis)| !axis.contains(v))
        {
            return None;
        }
        Some(
            self.cells
                .get(coordinates)
                .and_then(|values| values.get(position).cloned())
                .unwrap_or(Value::Null),
        )
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }
}
