use crate::dialect::Dialect;
use crate::error::{SchemaError, SchemaResult};
use std::collections::HashMap;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StarId(pub(crate) u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(pub(crate) u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnId(pub(crate) u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeasureId(pub(crate) u32);

impl StarId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl TableId {
    pub const FACT: TableId = TableId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl ColumnId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl MeasureId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// How a non-fact table hangs off its parent: `parent.foreign_key = this.key`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableJoin {
    pub parent: TableId,
    pub foreign_key: String,
    pub key: String,
}

#[derive(Clone, Debug)]
pub struct StarTable {
    pub id: TableId,
    pub name: String,
    pub alias: String,
    pub join: Option<TableJoin>,
}

#[derive(Clone, Debug)]
pub struct Column {
    pub id: ColumnId,
    pub table: TableId,
    pub name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Aggregator {
    Sum,
    Count,
    DistinctCount,
    Min,
    Max,
}

impl Aggregator {
    /// Render the aggregation over `expr`; `None` means `COUNT(*)`.
    pub fn render(self, expr: Option<&str>) -> String {
        match (self, expr) {
            (Aggregator::Sum, Some(e)) => format!("SUM({e})"),
            (Aggregator::Count, Some(e)) => format!("COUNT({e})"),
            (Aggregator::DistinctCount, Some(e)) => format!("COUNT(DISTINCT {e})"),
            (Aggregator::Min, Some(e)) => format!("MIN({e})"),
            (Aggregator::Max, Some(e)) => format!("MAX({e})"),
            (_, None) => "COUNT(*)".to_string(),
        }
    }

    /// The aggregator that combines already-aggregated values of this aggregator.
    ///
    /// Distinct counts only combine with `SUM` when the grouping being collapsed never splits
    /// a counted entity; callers must establish that before rolling one up.
    pub fn rollup(self) -> Aggregator {
        match self {
            Aggregator::Sum | Aggregator::Count | Aggregator::DistinctCount => Aggregator::Sum,
            Aggregator::Min => Aggregator::Min,
            Aggregator::Max => Aggregator::Max,
        }
    }

    pub fn is_distinct(self) -> bool {
        matches!(self, Aggregator::DistinctCount)
    }
}

impl fmt::Display for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Aggregator::Sum => "sum",
            Aggregator::Count => "count",
            Aggregator::DistinctCount => "distinct-count",
            Aggregator::Min => "min",
            Aggregator::Max => "max",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
pub struct Measure {
    pub id: MeasureId,
    pub name: String,
    pub aggregator: Aggregator,
    pub column: Option<ColumnId>,
    /// For distinct-count measures: the dimension whose members are being counted.
    pub counted_dimension: Option<String>,
}

/// A fact table plus the dimension tables reachable from it.
///
/// Tables form a tree rooted at the fact table ([`TableId::FACT`]); snowflaked dimension tables
/// join to their parent dimension table rather than to the fact table.
#[derive(Clone, Debug)]
pub struct Star {
    id: StarId,
    name: String,
    tables: Vec<StarTable>,
    table_index: HashMap<String, TableId>,
    columns: Vec<Column>,
    column_index: HashMap<(TableId, String), ColumnId>,
    measures: Vec<Measure>,
    measure_index: HashMap<String, MeasureId>,
}

impl Star {
    pub fn new(name: impl Into<String>, fact_table: impl Into<String>) -> Self {
        let fact_table = fact_table.into();
        let fact = StarTable {
            id: TableId::FACT,
            name: fact_table.clone(),
            alias: fact_table.clone(),
            join: None,
        };
        Self {
            id: StarId(0),
            name: name.into(),
            tables: vec![fact],
            table_index: HashMap::from([(fact_table, TableId::FACT)]),
            columns: Vec::new(),
            column_index: HashMap::new(),
            measures: Vec::new(),
            measure_index: HashMap::new(),
        }
    }

    pub(crate) fn set_id(&mut self, id: StarId) {
        self.id = id;
    }

    pub fn id(&self) -> StarId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fact_table(&self) -> &StarTable {
        &self.tables[0]
    }

    /// Add a dimension table joined to `parent_alias` via `parent_alias.foreign_key = alias.key`.
    pub fn add_table(
        &mut self,
        name: impl Into<String>,
        alias: impl Into<String>,
        parent_alias: &str,
        foreign_key: impl Into<String>,
        key: impl Into<String>,
    ) -> SchemaResult<TableId> {
        let name = name.into();
        let alias = alias.into();
        if self.table_index.contains_key(&alias) {
            return Err(SchemaError::DuplicateTable(alias));
        }
        let parent = self
            .table_index
            .get(parent_alias)
            .copied()
            .ok_or_else(|| SchemaError::InvalidJoin {
                table: alias.clone(),
                reason: format!("parent table {parent_alias} is not declared"),
            })?;
        let id = TableId(self.tables.len() as u32);
        self.tables.push(StarTable {
            id,
            name,
            alias: alias.clone(),
            join: Some(TableJoin {
                parent,
                foreign_key: foreign_key.into(),
                key: key.into(),
            }),
        });
        self.table_index.insert(alias, id);
        Ok(id)
    }

    pub fn add_column(&mut self, table_alias: &str, name: impl Into<String>) -> SchemaResult<ColumnId> {
        let name = name.into();
        let table = self
            .table_index
            .get(table_alias)
            .copied()
            .ok_or_else(|| SchemaError::UnknownTable(table_alias.to_string()))?;
        if self.column_index.contains_key(&(table, name.clone())) {
            return Err(SchemaError::DuplicateColumn {
                table: table_alias.to_string(),
                column: name,
            });
        }
        let id = ColumnId(self.columns.len() as u32);
        self.columns.push(Column {
            id,
            table,
            name: name.clone(),
        });
        self.column_index.insert((table, name), id);
        Ok(id)
    }

    pub fn add_measure(
        &mut self,
        name: impl Into<String>,
        aggregator: Aggregator,
        column: Option<ColumnId>,
    ) -> SchemaResult<MeasureId> {
        let name = name.into();
        if self.measure_index.contains_key(&name) {
            return Err(SchemaError::DuplicateMeasure(name));
        }
        if let Some(column) = column {
            if column.index() >= self.columns.len() {
                return Err(SchemaError::UnknownColumn {
                    table: self.fact_table().alias.clone(),
                    column: format!("#{}", column.index()),
                });
            }
        }
        let id = MeasureId(self.measures.len() as u32);
        self.measures.push(Measure {
            id,
            name: name.clone(),
            aggregator,
            column,
            counted_dimension: None,
        });
        self.measure_index.insert(name, id);
        Ok(id)
    }

    /// Declare a distinct-count measure counting members of `dimension`.
    pub fn add_distinct_count_measure(
        &mut self,
        name: impl Into<String>,
        column: ColumnId,
        dimension: impl Into<String>,
    ) -> SchemaResult<MeasureId> {
        let id = self.add_measure(name, Aggregator::DistinctCount, Some(column))?;
        self.measures[id.index()].counted_dimension = Some(dimension.into());
        Ok(id)
    }

    pub fn tables(&self) -> &[StarTable] {
        &self.tables
    }

    pub fn table(&self, id: TableId) -> &StarTable {
        &self.tables[id.index()]
    }

    pub fn table_by_alias(&self, alias: &str) -> Option<&StarTable> {
        self.table_index.get(alias).map(|id| self.table(*id))
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, id: ColumnId) -> &Column {
        &self.columns[id.index()]
    }

    pub fn column_by_name(&self, table_alias: &str, column: &str) -> SchemaResult<ColumnId> {
        let table = self
            .table_index
            .get(table_alias)
            .ok_or_else(|| SchemaError::UnknownTable(table_alias.to_string()))?;
        self.column_index
            .get(&(*table, column.to_string()))
            .copied()
            .ok_or_else(|| SchemaError::UnknownColumn {
                table: table_alias.to_string(),
                column: column.to_string(),
            })
    }

    pub fn measures(&self) -> &[Measure] {
        &self.measures
    }

    pub fn measure(&self, id: MeasureId) -> &Measure {
        &self.measures[id.index()]
    }

    pub fn measure_by_name(&self, name: &str) -> SchemaResult<MeasureId> {
        self.measure_index
            .get(name)
            .copied()
            .ok_or_else(|| SchemaError::UnknownMeasure(name.to_string()))
    }

    /// Tables from `table` up to, but excluding, the fact table; `table` first.
    pub fn path_to_fact(&self, table: TableId) -> Vec<TableId> {
        let mut path = Vec::new();
        let mut current = table;
        while current != TableId::FACT {
            path.push(current);
            match &self.table(current).join {
                Some(join) => current = join.parent,
                None => break,
            }
        }
        path
    }

    /// Qualified column expression, e.g. `"store"."store_city"`.
    pub fn column_expr(&self, column: ColumnId, dialect: &dyn Dialect) -> String {
        let column = self.column(column);
        format!(
            "{}.{}",
            dialect.quote_identifier(&self.table(column.table).alias),
            dialect.quote_identifier(&column.name)
        )
    }

    /// The `FROM` item for a table, e.g. `"store" AS "s"`.
    pub fn table_expr(&self, table: TableId, dialect: &dyn Dialect) -> String {
        let table = self.table(table);
        let name = dialect.quote_identifier(&table.name);
        let alias = dialect.quote_identifier(&table.alias);
        if dialect.allows_as_before_table_alias() {
            format!("{name} AS {alias}")
        } else {
            format!("{name} {alias}")
        }
    }

    /// Join condition linking `table` to its parent, or `None` for the fact table.
    pub fn join_condition(&self, table: TableId, dialect: &dyn Dialect) -> Option<String> {
        let child = self.table(table);
        let join = child.join.as_ref()?;
        let parent = self.table(join.parent);
        Some(format!(
            "{}.{} = {}.{}",
            dialect.quote_identifier(&parent.alias),
            dialect.quote_identifier(&join.foreign_key),
            dialect.quote_identifier(&child.alias),
            dialect.quote_identifier(&join.key)
        ))
    }
}
