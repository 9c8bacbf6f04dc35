//! Schema-load-time data model for the ROLAP native evaluation core.
//!
//! This crate holds the immutable, shared description of a cube schema:
//! - [`Star`]: a fact table, its (possibly snowflaked) dimension tables, columns and measures
//! - [`Hierarchy`]: levels plus an arena of members addressed by [`MemberId`]
//! - [`AggregateTable`] / [`AggregateRules`]: summary tables and explicit exclusions
//! - [`Dialect`]: the SQL capability interface consumed by SQL generation
//! - [`Role`]: per-hierarchy member access restrictions

#![forbid(unsafe_code)]

mod aggregate;
mod dialect;
mod error;
mod hierarchy;
mod role;
mod schema;
mod star;
mod value;

pub use crate::aggregate::{AggregateMeasure, AggregateRules, AggregateTable};
pub use crate::dialect::{AnsiDialect, Dialect, MySqlDialect, NullCollation, SqliteDialect};
pub use crate::error::{SchemaError, SchemaResult};
pub use crate::hierarchy::{Hierarchy, HierarchyId, Level, MemberId, MemberKind, MemberRecord, MemberRef};
pub use crate::role::{HierarchyAccess, Role};
pub use crate::schema::Schema;
pub use crate::star::{
    Aggregator, Column, ColumnId, Measure, MeasureId, Star, StarId, StarTable, TableId, TableJoin,
};
pub use crate::value::Value;
