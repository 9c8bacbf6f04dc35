//! Hierarchies, levels and the member arena.
//!
//! Members never point at each other directly: each [`Hierarchy`] owns a flat arena of
//! [`MemberRecord`]s and parents/children are [`MemberId`] handles into it. A member is shared
//! across caches by copying its [`MemberRef`] (hierarchy id + member id), so there are no
//! reference cycles between parents and children.

use crate::error::{SchemaError, SchemaResult};
use crate::star::{ColumnId, StarId};
use crate::value::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HierarchyId(pub(crate) u32);

impl HierarchyId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(pub(crate) u32);

impl MemberId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Schema-wide member handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberRef {
    pub hierarchy: HierarchyId,
    pub member: MemberId,
}

impl MemberRef {
    pub fn new(hierarchy: HierarchyId, member: MemberId) -> Self {
        Self { hierarchy, member }
    }
}

#[derive(Clone, Debug)]
pub struct Level {
    pub name: String,
    pub depth: usize,
    /// `None` only for the synthetic All level.
    pub key_column: Option<ColumnId>,
    pub name_column: Option<ColumnId>,
    pub ordinal_column: Option<ColumnId>,
    pub caption_column: Option<ColumnId>,
    /// Keys are unique across the whole level, so ancestors are not needed to identify a member.
    pub unique_members: bool,
    pub is_all: bool,
}

impl Level {
    pub fn new(name: impl Into<String>, key_column: ColumnId) -> Self {
        Self {
            name: name.into(),
            depth: 0,
            key_column: Some(key_column),
            name_column: None,
            ordinal_column: None,
            caption_column: None,
            unique_members: false,
            is_all: false,
        }
    }

    pub fn with_name_column(mut self, column: ColumnId) -> Self {
        self.name_column = Some(column);
        self
    }

    pub fn with_ordinal_column(mut self, column: ColumnId) -> Self {
        self.ordinal_column = Some(column);
        self
    }

    pub fn with_caption_column(mut self, column: ColumnId) -> Self {
        self.caption_column = Some(column);
        self
    }

    pub fn with_unique_members(mut self, unique: bool) -> Self {
        self.unique_members = unique;
        self
    }

    /// Column used to order members of this level: ordinal, then name, then key.
    pub fn order_column(&self) -> Option<ColumnId> {
        self.ordinal_column.or(self.name_column).or(self.key_column)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemberKind {
    All,
    Regular,
    /// A stored member whose key is NULL (displayed with the schema's null representation).
    Null,
    Calculated,
}

#[derive(Clone, Debug)]
pub struct MemberRecord {
    pub id: MemberId,
    pub depth: usize,
    pub key: Value,
    pub name: String,
    pub parent: Option<MemberId>,
    pub kind: MemberKind,
    pub order_key: Value,
}

impl MemberRecord {
    pub fn is_all(&self) -> bool {
        self.kind == MemberKind::All
    }

    pub fn is_calculated(&self) -> bool {
        self.kind == MemberKind::Calculated
    }

    pub fn is_null(&self) -> bool {
        self.kind == MemberKind::Null
    }
}

#[derive(Clone)]
pub struct Hierarchy {
    id: HierarchyId,
    name: String,
    dimension: String,
    star: StarId,
    null_member_name: String,
    levels: Vec<Level>,
    members: Vec<MemberRecord>,
    children: Vec<Vec<MemberId>>,
    roots: Vec<MemberId>,
    by_leaf_key: HashMap<(usize, Value), Vec<MemberId>>,
}

impl fmt::Debug for Hierarchy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hierarchy")
            .field("name", &self.name)
            .field("dimension", &self.dimension)
            .field("levels", &self.levels.len())
            .field("members", &self.members.len())
            .finish()
    }
}

fn cmp_order(a: &Value, b: &Value) -> Ordering {
    // NULLs collate last, matching the ORDER BY the query assembler emits.
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.cmp(b),
    }
}

impl Hierarchy {
    /// Create a hierarchy; with `has_all` it gets a synthetic All level holding one All member.
    pub fn new(
        name: impl Into<String>,
        dimension: impl Into<String>,
        star: StarId,
        has_all: bool,
    ) -> Self {
        let name = name.into();
        let mut hierarchy = Self {
            id: HierarchyId(0),
            dimension: dimension.into(),
            star,
            null_member_name: "#null".to_string(),
            levels: Vec::new(),
            members: Vec::new(),
            children: Vec::new(),
            roots: Vec::new(),
            by_leaf_key: HashMap::new(),
            name,
        };
        if has_all {
            hierarchy.levels.push(Level {
                name: "(All)".to_string(),
                depth: 0,
                key_column: None,
                name_column: None,
                ordinal_column: None,
                caption_column: None,
                unique_members: true,
                is_all: true,
            });
            let all_name = format!("All {}", hierarchy.name);
            hierarchy.push_member(None, 0, Value::Null, all_name, MemberKind::All, Value::Null);
        }
        hierarchy
    }

    pub(crate) fn set_id(&mut self, id: HierarchyId) {
        self.id = id;
    }

    pub(crate) fn set_null_member_name(&mut self, name: &str) {
        self.null_member_name = name.to_string();
        for member in self.members.iter_mut().filter(|m| m.kind == MemberKind::Null) {
            member.name = name.to_string();
        }
    }

    pub fn id(&self) -> HierarchyId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimension(&self) -> &str {
        &self.dimension
    }

    pub fn star(&self) -> StarId {
        self.star
    }

    pub fn has_all(&self) -> bool {
        self.levels.first().is_some_and(|l| l.is_all)
    }

    pub fn add_level(&mut self, mut level: Level) -> SchemaResult<usize> {
        if level.key_column.is_none() {
            return Err(SchemaError::InvalidLevel {
                hierarchy: self.name.clone(),
                level: level.name,
                reason: "only the All level may omit a key column".to_string(),
            });
        }
        if self.levels.iter().any(|l| l.name == level.name) {
            return Err(SchemaError::InvalidLevel {
                hierarchy: self.name.clone(),
                level: level.name,
                reason: "duplicate level name".to_string(),
            });
        }
        level.depth = self.levels.len();
        level.is_all = false;
        let depth = level.depth;
        self.levels.push(level);
        Ok(depth)
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn level(&self, depth: usize) -> &Level {
        &self.levels[depth]
    }

    pub fn level_by_name(&self, name: &str) -> SchemaResult<usize> {
        self.levels
            .iter()
            .position(|l| l.name == name)
            .ok_or_else(|| SchemaError::UnknownLevel {
                hierarchy: self.name.clone(),
                level: name.to_string(),
            })
    }

    /// Depth of the first level that carries a key column.
    pub fn first_stored_depth(&self) -> usize {
        usize::from(self.has_all())
    }

    pub fn all_member(&self) -> Option<MemberId> {
        self.has_all().then_some(MemberId(0))
    }

    fn push_member(
        &mut self,
        parent: Option<MemberId>,
        depth: usize,
        key: Value,
        name: String,
        kind: MemberKind,
        order_key: Value,
    ) -> MemberId {
        let id = MemberId(self.members.len() as u32);
        self.members.push(MemberRecord {
            id,
            depth,
            key: key.clone(),
            name,
            parent,
            kind,
            order_key: order_key.clone(),
        });
        self.children.push(Vec::new());

        let siblings = match parent {
            Some(p) => &mut self.children[p.index()],
            None => &mut self.roots,
        };
        let members = &self.members;
        let pos = siblings
            .iter()
            .position(|s| cmp_order(&order_key, &members[s.index()].order_key) == Ordering::Less)
            .unwrap_or(siblings.len());
        siblings.insert(pos, id);

        if kind != MemberKind::Calculated && kind != MemberKind::All {
            self.by_leaf_key.entry((depth, key)).or_default().push(id);
        }
        id
    }

    fn check_parent(&self, parent: Option<MemberId>) -> SchemaResult<usize> {
        let depth = match parent {
            Some(p) => {
                let record = self.members.get(p.index()).ok_or_else(|| SchemaError::UnknownMember {
                    hierarchy: self.name.clone(),
                    path: format!("#{}", p.index()),
                })?;
                if record.is_calculated() {
                    return Err(SchemaError::InvalidLevel {
                        hierarchy: self.name.clone(),
                        level: self.levels[record.depth].name.clone(),
                        reason: "calculated members cannot have stored children".to_string(),
                    });
                }
                record.depth + 1
            }
            None => self.first_stored_depth(),
        };
        if depth >= self.levels.len() {
            return Err(SchemaError::InvalidLevel {
                hierarchy: self.name.clone(),
                level: format!("depth {depth}"),
                reason: "member is deeper than the declared levels".to_string(),
            });
        }
        Ok(depth)
    }

    /// Add a stored member. `parent: None` places it on the first stored level.
    pub fn add_member(&mut self, parent: Option<MemberId>, key: impl Into<Value>) -> SchemaResult<MemberId> {
        let key = key.into();
        let name = key.to_string();
        self.add_member_with(parent, key, name, None)
    }

    pub fn add_member_with(
        &mut self,
        parent: Option<MemberId>,
        key: impl Into<Value>,
        name: impl Into<String>,
        ordinal: Option<Value>,
    ) -> SchemaResult<MemberId> {
        let key = key.into();
        let depth = self.check_parent(parent)?;
        let parent = parent.or(self.all_member());
        let duplicate = self
            .children_of(parent)
            .iter()
            .any(|c| self.members[c.index()].key == key && !self.members[c.index()].is_calculated());
        if duplicate {
            return Err(SchemaError::DuplicateMember {
                hierarchy: self.name.clone(),
                path: key.to_string(),
            });
        }
        let (kind, name) = if key.is_null() {
            (MemberKind::Null, self.null_member_name.clone())
        } else {
            (MemberKind::Regular, name.into())
        };
        let level = &self.levels[depth];
        let order_key = match ordinal {
            Some(ordinal) => ordinal,
            None if level.name_column.is_some() && !key.is_null() => Value::from(name.as_str()),
            None => key.clone(),
        };
        Ok(self.push_member(parent, depth, key, name, kind, order_key))
    }

    /// Add (or reuse) the chain of members identified by `keys`, root level first.
    pub fn add_member_path(&mut self, keys: &[Value]) -> SchemaResult<MemberId> {
        let mut parent: Option<MemberId> = None;
        for key in keys {
            let existing = self
                .children_of(parent.or(self.all_member()))
                .iter()
                .copied()
                .find(|c| self.members[c.index()].key == *key && !self.members[c.index()].is_calculated());
            parent = Some(match existing {
                Some(id) => id,
                None => self.add_member(parent, key.clone())?,
            });
        }
        parent.ok_or_else(|| SchemaError::UnknownMember {
            hierarchy: self.name.clone(),
            path: String::new(),
        })
    }

    pub fn add_calculated_member(
        &mut self,
        parent: Option<MemberId>,
        name: impl Into<String>,
    ) -> SchemaResult<MemberId> {
        let depth = self.check_parent(parent)?;
        let parent = parent.or(self.all_member());
        Ok(self.push_member(
            parent,
            depth,
            Value::Null,
            name.into(),
            MemberKind::Calculated,
            Value::Null,
        ))
    }

    fn children_of(&self, parent: Option<MemberId>) -> &[MemberId] {
        match parent {
            Some(p) => &self.children[p.index()],
            None => &self.roots,
        }
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn member(&self, id: MemberId) -> &MemberRecord {
        &self.members[id.index()]
    }

    pub fn get_member(&self, id: MemberId) -> Option<&MemberRecord> {
        self.members.get(id.index())
    }

    /// Stored children in level order (calculated children excluded).
    pub fn children(&self, id: MemberId) -> Vec<MemberId> {
        self.children[id.index()]
            .iter()
            .copied()
            .filter(|c| !self.members[c.index()].is_calculated())
            .collect()
    }

    pub fn ancestor_at(&self, id: MemberId, depth: usize) -> Option<MemberId> {
        let mut current = id;
        loop {
            let record = &self.members[current.index()];
            match record.depth.cmp(&depth) {
                Ordering::Equal => return Some(current),
                Ordering::Less => return None,
                Ordering::Greater => current = record.parent?,
            }
        }
    }

    pub fn is_ancestor_or_self(&self, ancestor: MemberId, id: MemberId) -> bool {
        let depth = self.members[ancestor.index()].depth;
        self.ancestor_at(id, depth) == Some(ancestor)
    }

    /// Stored members of a level in hierarchical order.
    pub fn level_members(&self, depth: usize) -> Vec<MemberId> {
        if depth >= self.levels.len() {
            return Vec::new();
        }
        let mut frontier: Vec<MemberId> = self
            .roots
            .iter()
            .copied()
            .filter(|m| !self.members[m.index()].is_calculated())
            .collect();
        let mut current_depth = frontier
            .first()
            .map(|m| self.members[m.index()].depth)
            .unwrap_or(depth);
        while current_depth < depth {
            frontier = frontier.iter().flat_map(|m| self.children(*m)).collect();
            current_depth += 1;
        }
        frontier
    }

    pub fn level_cardinality(&self, depth: usize) -> usize {
        self.level_members(depth).len()
    }

    /// Descendants of `id` at `depth` in hierarchical order (`id` itself when at that depth).
    pub fn descendants(&self, id: MemberId, depth: usize) -> Vec<MemberId> {
        let start = self.members[id.index()].depth;
        if depth < start {
            return Vec::new();
        }
        let mut frontier = vec![id];
        for _ in start..depth {
            frontier = frontier.iter().flat_map(|m| self.children(*m)).collect();
        }
        frontier
    }

    /// Members between `from` and `to` (inclusive) in level order; `None` when they sit on
    /// different levels or are not stored members.
    pub fn range(&self, from: MemberId, to: MemberId) -> Option<Vec<MemberId>> {
        let depth = self.members[from.index()].depth;
        if self.members[to.index()].depth != depth {
            return None;
        }
        let members = self.level_members(depth);
        let a = members.iter().position(|m| *m == from)?;
        let b = members.iter().position(|m| *m == to)?;
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Some(members[lo..=hi].to_vec())
    }

    /// Levels whose key columns are needed to identify members of `depth`, root first.
    ///
    /// Walks upward from `depth` while levels are not unique, stopping at the first unique
    /// level (inclusive) or at the first stored level.
    pub fn disambiguating_depths(&self, depth: usize) -> Vec<usize> {
        let mut depths = Vec::new();
        let first = self.first_stored_depth();
        let mut current = depth;
        loop {
            depths.push(current);
            if self.levels[current].unique_members || current <= first {
                break;
            }
            current -= 1;
        }
        depths.reverse();
        depths
    }

    /// Keys of `id` and its ancestors at the given depths.
    pub fn key_path(&self, id: MemberId, depths: &[usize]) -> Vec<Value> {
        depths
            .iter()
            .map(|d| {
                self.ancestor_at(id, *d)
                    .map(|a| self.members[a.index()].key.clone())
                    .unwrap_or(Value::Null)
            })
            .collect()
    }

    /// Find the stored member at `depths.last()` whose keys at `depths` equal `keys`.
    pub fn find_by_keys(&self, depths: &[usize], keys: &[Value]) -> Option<MemberId> {
        let (leaf_depth, leaf_key) = (*depths.last()?, keys.last()?);
        let candidates = self.by_leaf_key.get(&(leaf_depth, leaf_key.clone()))?;
        candidates
            .iter()
            .copied()
            .find(|c| self.key_path(*c, depths).as_slice() == keys)
    }

    /// Look a member up by its full key path from the first stored level.
    pub fn find_by_path(&self, keys: &[Value]) -> Option<MemberId> {
        if keys.is_empty() {
            return self.all_member();
        }
        let first = self.first_stored_depth();
        let depths: Vec<usize> = (first..first + keys.len()).collect();
        self.find_by_keys(&depths, keys)
    }

    /// Unique name in `[Hierarchy].[k1].[k2]` form, for diagnostics and alerts.
    pub fn unique_name(&self, id: MemberId) -> String {
        let mut parts = Vec::new();
        let mut current = Some(id);
        while let Some(m) = current {
            let record = &self.members[m.index()];
            if record.is_all() && record.id != id {
                break;
            }
            parts.push(format!("[{}]", record.name));
            current = record.parent;
        }
        parts.push(format!("[{}]", self.name));
        parts.reverse();
        parts.join(".")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::star::Star;

    fn geography() -> Hierarchy {
        let mut star = Star::new("Sales", "sales");
        let state = star.add_column("sales", "state").unwrap();
        let city = star.add_column("sales", "city").unwrap();
        let mut h = Hierarchy::new("Geography", "Geography", StarId(0), true);
        h.add_level(Level::new("State", state)).unwrap();
        h.add_level(Level::new("City", city)).unwrap();
        for (s, c) in [("WA", "Seattle"), ("OR", "Salem"), ("OR", "Portland")] {
            h.add_member_path(&[s.into(), c.into()]).unwrap();
        }
        h.add_member_path(&[Value::Null, Value::Null]).unwrap();
        h
    }

    #[test]
    fn siblings_are_ordered_with_nulls_last() {
        let h = geography();
        let names: Vec<String> = h
            .level_members(2)
            .into_iter()
            .map(|m| h.member(m).name.clone())
            .collect();
        assert_eq!(names, vec!["Portland", "Salem", "Seattle", "#null"]);
    }

    #[test]
    fn non_unique_levels_need_their_ancestors() {
        let mut h = geography();
        assert_eq!(h.disambiguating_depths(2), vec![1, 2]);
        h.levels[2].unique_members = true;
        assert_eq!(h.disambiguating_depths(2), vec![2]);
        assert_eq!(h.disambiguating_depths(1), vec![1]);
    }

    #[test]
    fn finds_members_by_key_path_including_nulls() {
        let h = geography();
        let salem = h.find_by_path(&["OR".into(), "Salem".into()]).unwrap();
        assert_eq!(h.member(salem).name, "Salem");
        let null_city = h.find_by_path(&[Value::Null, Value::Null]).unwrap();
        assert!(h.member(null_city).is_null());
        assert_eq!(h.unique_name(salem), "[Geography].[OR].[Salem]");
        assert!(h.find_by_path(&["WA".into(), "Salem".into()]).is_none());
    }

    #[test]
    fn range_spans_level_order_in_either_direction() {
        let h = geography();
        let members = h.level_members(2);
        let forward = h.range(members[0], members[2]).unwrap();
        let backward = h.range(members[2], members[0]).unwrap();
        assert_eq!(forward, backward);
        assert_eq!(forward.len(), 3);
    }
}
