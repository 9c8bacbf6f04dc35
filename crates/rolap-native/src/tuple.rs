use rolap_model::{MemberRef, SchemaError, SchemaResult};
use smallvec::SmallVec;

pub type Tuple = SmallVec<[MemberRef; 4]>;

/// Ordered list of fixed-arity member tuples; arity 1 is a plain member list.
///
/// Cached native results are shared as `Arc<TupleList>`; callers that need to reorder or edit a
/// result clone it first (`Arc::unwrap_or_clone` / `(*list).clone()`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct TupleList {
    arity: usize,
    tuples: Vec<Tuple>,
}

impl TupleList {
    pub fn new(arity: usize) -> Self {
        Self {
            arity,
            tuples: Vec::new(),
        }
    }

    pub fn from_members(members: impl IntoIterator<Item = MemberRef>) -> Self {
        Self {
            arity: 1,
            tuples: members.into_iter().map(|m| SmallVec::from_slice(&[m])).collect(),
        }
    }

    pub fn from_tuples(arity: usize, tuples: Vec<Tuple>) -> SchemaResult<Self> {
        if let Some(bad) = tuples.iter().find(|t| t.len() != arity) {
            return Err(SchemaError::TupleArity {
                expected: arity,
                actual: bad.len(),
            });
        }
        Ok(Self { arity, tuples })
    }

    pub fn push(&mut self, tuple: Tuple) -> SchemaResult<()> {
        if tuple.len() != self.arity {
            return Err(SchemaError::TupleArity {
                expected: self.arity,
                actual: tuple.len(),
            });
        }
        self.tuples.push(tuple);
        Ok(())
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    pub fn tuples(&self) -> &[Tuple] {
        &self.tuples
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tuple> {
        self.tuples.iter()
    }

    /// Members of an arity-1 list.
    pub fn members(&self) -> impl Iterator<Item = MemberRef> + '_ {
        self.tuples.iter().filter_map(|t| t.first().copied())
    }

    pub fn truncate(&mut self, len: usize) {
        self.tuples.truncate(len);
    }

    pub fn contains(&self, tuple: &[MemberRef]) -> bool {
        self.tuples.iter().any(|t| t.as_slice() == tuple)
    }
}
