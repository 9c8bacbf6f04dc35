//! Native SQL evaluation for a ROLAP engine.
//!
//! Two entry points share one executor seam ([`SqlExecutor`]) and one configuration
//! ([`NativeConfig`]):
//! - [`NativeEvaluator`] answers set expressions (crossjoins, filters, TopCount, member sets)
//!   with a single SQL statement when the decision gate allows it, caching results per
//!   [`NativeCacheKey`].
//! - [`AggregationManager`] batches [`CellRequest`]s into `GROUP BY` statements, optionally
//!   against aggregate tables, and caches the loaded segments.
//!
//! Both caches are single-flight: concurrent misses on one key run one statement.

#![forbid(unsafe_code)]

mod aggmatch;
mod aggmgr;
mod alert;
mod cache;
mod classify;
mod config;
mod constraint;
mod error;
mod executor;
mod expr;
mod gate;
mod native;
mod parallel;
mod predicate;
mod query;
mod segment;
#[cfg(feature = "sqlite")]
mod sqlite;
mod tuple;

pub use crate::aggmatch::AggregateTableMatcher;
pub use crate::aggmgr::AggregationManager;
pub use crate::alert::{Refusal, RefusalReason, UnsupportedObserver};
pub use crate::cache::{CacheStats, SingleFlightCache};
pub use crate::classify::{ArgumentClassifier, Classification, SetArgument};
pub use crate::config::{AlertLevel, NativeConfig};
pub use crate::constraint::{CompiledConstraint, ConstraintCompiler};
pub use crate::error::{NativeError, NativeResult};
pub use crate::executor::{CancellationToken, SqlExecutor};
pub use crate::expr::{
    describe, ArithOp, BoolExpr, CalculatedDefinition, CompareOp, Definitions, EvalContext,
    ExecutionContext, MemberExpr, Operand, SetExpr, ValueExpr,
};
pub use crate::gate::{ConstructKind, NativeCacheKey, SetMaterializer};
pub use crate::native::{NativeEvaluator, NativeOutcome};
pub use crate::predicate::{AggregateColumns, ColumnResolver, Predicate, StarColumns};
pub use crate::query::{
    MeasureCondition, MeasureExpr, OrderItem, QueryAssembler, SelectItem, Source, SqlQuery,
};
pub use crate::segment::{CellRequest, ColumnConstraint};
#[cfg(feature = "sqlite")]
pub use crate::sqlite::SqliteExecutor;
pub use crate::tuple::{Tuple, TupleList};
