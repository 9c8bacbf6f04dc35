use crate::aggregate::{AggregateRules, AggregateTable};
use crate::error::{SchemaError, SchemaResult};
use crate::hierarchy::{Hierarchy, HierarchyId, MemberRef};
use crate::star::{ColumnId, Star, StarId};
use crate::value::Value;
use std::sync::Arc;

/// Everything the native evaluator needs to know about the cube schema.
///
/// Built once at schema-load time and then shared read-only (typically as `Arc<Schema>`).
#[derive(Clone, Debug)]
pub struct Schema {
    name: String,
    stars: Vec<Star>,
    hierarchies: Vec<Hierarchy>,
    aggregates: Vec<Arc<AggregateTable>>,
    rules: AggregateRules,
    null_member_name: String,
}

impl Schema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stars: Vec::new(),
            hierarchies: Vec::new(),
            aggregates: Vec::new(),
            rules: AggregateRules::new(),
            null_member_name: "#null".to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_star(&mut self, mut star: Star) -> SchemaResult<StarId> {
        if self.stars.iter().any(|s| s.name() == star.name()) {
            return Err(SchemaError::DuplicateTable(star.name().to_string()));
        }
        let id = StarId(self.stars.len() as u32);
        star.set_id(id);
        self.stars.push(star);
        Ok(id)
    }

    pub fn add_hierarchy(&mut self, mut hierarchy: Hierarchy) -> SchemaResult<HierarchyId> {
        let star = self
            .stars
            .get(hierarchy.star().index())
            .ok_or_else(|| SchemaError::UnknownTable(format!("star #{}", hierarchy.star().index())))?;
        for level in hierarchy.levels().iter().filter(|l| !l.is_all) {
            let columns = [
                level.key_column,
                level.name_column,
                level.ordinal_column,
                level.caption_column,
            ];
            for column in columns.into_iter().flatten() {
                if column.index() >= star.columns().len() {
                    return Err(SchemaError::InvalidLevel {
                        hierarchy: hierarchy.name().to_string(),
                        level: level.name.clone(),
                        reason: format!("column #{} is not part of star {}", column.index(), star.name()),
                    });
                }
            }
        }
        if self.hierarchies.iter().any(|h| h.name() == hierarchy.name()) {
            return Err(SchemaError::InvalidLevel {
                hierarchy: hierarchy.name().to_string(),
                level: String::new(),
                reason: "duplicate hierarchy".to_string(),
            });
        }
        let id = HierarchyId(self.hierarchies.len() as u32);
        hierarchy.set_id(id);
        hierarchy.set_null_member_name(&self.null_member_name);
        self.hierarchies.push(hierarchy);
        Ok(id)
    }

    pub fn add_aggregate_table(&mut self, table: AggregateTable) -> SchemaResult<()> {
        let star = self
            .stars
            .get(table.star().index())
            .ok_or_else(|| SchemaError::InvalidAggregate {
                table: table.name().to_string(),
                reason: "unknown star".to_string(),
            })?;
        table.validate(star)?;
        if self.aggregates.iter().any(|a| a.name() == table.name()) {
            return Err(SchemaError::DuplicateTable(table.name().to_string()));
        }
        self.aggregates.push(Arc::new(table));
        Ok(())
    }

    pub fn set_null_member_name(&mut self, name: impl Into<String>) {
        self.null_member_name = name.into();
        for hierarchy in &mut self.hierarchies {
            hierarchy.set_null_member_name(&self.null_member_name);
        }
    }

    pub fn null_member_name(&self) -> &str {
        &self.null_member_name
    }

    pub fn rules(&self) -> &AggregateRules {
        &self.rules
    }

    pub fn rules_mut(&mut self) -> &mut AggregateRules {
        &mut self.rules
    }

    pub fn stars(&self) -> &[Star] {
        &self.stars
    }

    pub fn star(&self, id: StarId) -> &Star {
        &self.stars[id.index()]
    }

    pub fn star_mut(&mut self, id: StarId) -> &mut Star {
        &mut self.stars[id.index()]
    }

    pub fn hierarchies(&self) -> &[Hierarchy] {
        &self.hierarchies
    }

    pub fn hierarchy(&self, id: HierarchyId) -> &Hierarchy {
        &self.hierarchies[id.index()]
    }

    pub fn hierarchy_mut(&mut self, id: HierarchyId) -> &mut Hierarchy {
        &mut self.hierarchies[id.index()]
    }

    pub fn hierarchy_by_name(&self, name: &str) -> SchemaResult<HierarchyId> {
        self.hierarchies
            .iter()
            .find(|h| h.name() == name)
            .map(|h| h.id())
            .ok_or_else(|| SchemaError::UnknownHierarchy(name.to_string()))
    }

    /// Resolve a member by hierarchy name and key path (root level first).
    pub fn member(&self, hierarchy: &str, keys: &[Value]) -> SchemaResult<MemberRef> {
        let id = self.hierarchy_by_name(hierarchy)?;
        let member = self
            .hierarchy(id)
            .find_by_path(keys)
            .ok_or_else(|| SchemaError::UnknownMember {
                hierarchy: hierarchy.to_string(),
                path: keys.iter().map(|k| k.to_string()).collect::<Vec<_>>().join("."),
            })?;
        Ok(MemberRef::new(id, member))
    }

    pub fn all_member(&self, hierarchy: HierarchyId) -> Option<MemberRef> {
        self.hierarchy(hierarchy)
            .all_member()
            .map(|m| MemberRef::new(hierarchy, m))
    }

    pub fn member_name(&self, member: MemberRef) -> String {
        self.hierarchy(member.hierarchy).unique_name(member.member)
    }

    pub fn aggregate_tables(&self, star: StarId) -> impl Iterator<Item = &Arc<AggregateTable>> {
        self.aggregates.iter().filter(move |a| a.star() == star)
    }

    /// Dimension owning `column`, derived from the hierarchies whose levels use it.
    pub fn dimension_of_column(&self, star: StarId, column: ColumnId) -> Option<&str> {
        self.hierarchies
            .iter()
            .filter(|h| h.star() == star)
            .find(|h| {
                h.levels().iter().any(|l| {
                    [l.key_column, l.name_column, l.ordinal_column, l.caption_column]
                        .contains(&Some(column))
                })
            })
            .map(|h| h.dimension())
    }

    pub fn is_all_member(&self, member: MemberRef) -> bool {
        self.hierarchy(member.hierarchy)
            .get_member(member.member)
            .is_some_and(|m| m.is_all())
    }

    pub fn member_exists(&self, member: MemberRef) -> bool {
        self.hierarchies
            .get(member.hierarchy.index())
            .and_then(|h| h.get_member(member.member))
            .is_some()
    }
}
