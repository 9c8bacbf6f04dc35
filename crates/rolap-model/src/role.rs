use crate::hierarchy::{Hierarchy, HierarchyId, MemberId};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HierarchyAccess {
    All,
    /// Only these members, their descendants and their ancestors are visible.
    Restricted(Vec<MemberId>),
}

/// A security role: per-hierarchy member access. Hierarchies without an entry are unrestricted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Role {
    name: String,
    access: BTreeMap<HierarchyId, HierarchyAccess>,
}

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            access: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn restrict(mut self, hierarchy: HierarchyId, members: Vec<MemberId>) -> Self {
        self.access
            .insert(hierarchy, HierarchyAccess::Restricted(members));
        self
    }

    pub fn access(&self, hierarchy: HierarchyId) -> &HierarchyAccess {
        self.access.get(&hierarchy).unwrap_or(&HierarchyAccess::All)
    }

    pub fn restricts(&self, hierarchy: HierarchyId) -> bool {
        matches!(self.access(hierarchy), HierarchyAccess::Restricted(_))
    }

    /// Whether `member` of `hierarchy` is visible to this role.
    pub fn can_access(&self, hierarchy: &Hierarchy, member: MemberId) -> bool {
        match self.access(hierarchy.id()) {
            HierarchyAccess::All => true,
            HierarchyAccess::Restricted(members) => members.iter().any(|granted| {
                hierarchy.is_ancestor_or_self(*granted, member)
                    || hierarchy.is_ancestor_or_self(member, *granted)
            }),
        }
    }

    pub fn restricts_any(&self) -> bool {
        self.access
            .values()
            .any(|a| matches!(a, HierarchyAccess::Restricted(_)))
    }

    pub fn restricted_hierarchies(&self) -> impl Iterator<Item = (HierarchyId, &[MemberId])> {
        self.access.iter().filter_map(|(h, a)| match a {
            HierarchyAccess::Restricted(members) => Some((*h, members.as_slice())),
            HierarchyAccess::All => None,
        })
    }
}
