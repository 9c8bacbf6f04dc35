pub type SchemaResult<T> = Result<T, SchemaError>;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("unknown column {table}.{column}")]
    UnknownColumn { table: String, column: String },

    #[error("unknown measure: {0}")]
    UnknownMeasure(String),

    #[error("unknown hierarchy: {0}")]
    UnknownHierarchy(String),

    #[error("unknown level {level} in hierarchy {hierarchy}")]
    UnknownLevel { hierarchy: String, level: String },

    #[error("unknown member {path} in hierarchy {hierarchy}")]
    UnknownMember { hierarchy: String, path: String },

    #[error("duplicate table: {0}")]
    DuplicateTable(String),

    #[error("duplicate column {table}.{column}")]
    DuplicateColumn { table: String, column: String },

    #[error("duplicate measure: {0}")]
    DuplicateMeasure(String),

    #[error("duplicate member {path} in hierarchy {hierarchy}")]
    DuplicateMember { hierarchy: String, path: String },

    #[error("invalid join for table {table}: {reason}")]
    InvalidJoin { table: String, reason: String },

    #[error("invalid level {level} in hierarchy {hierarchy}: {reason}")]
    InvalidLevel {
        hierarchy: String,
        level: String,
        reason: String,
    },

    #[error("invalid aggregate table {table}: {reason}")]
    InvalidAggregate { table: String, reason: String },

    #[error("invalid aggregate exclusion pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("member {member} cannot be used in a SQL constraint: {reason}")]
    UnconstrainableMember { member: String, reason: String },

    #[error("mismatched tuple arity: expected {expected}, got {actual}")]
    TupleArity { expected: usize, actual: usize },
}
