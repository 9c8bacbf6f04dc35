use rolap_model::SchemaError;

pub type NativeResult<T> = Result<T, NativeError>;

/// Errors surfaced by native evaluation and cell loading.
///
/// The type is `Clone` so that every caller waiting on a single-flight computation can observe
/// the leader's failure.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum NativeError {
    #[error("result limit of {limit} rows exceeded while {context}")]
    ResourceLimitExceeded { limit: u64, context: String },

    #[error("native evaluation unsupported for {expression}: {reason}")]
    NativeEvaluationUnsupported { expression: String, reason: String },

    #[error("sql execution failed: {message} (sql: {sql})")]
    SqlExecution { sql: String, message: String },

    #[error("execution cancelled")]
    Cancelled,

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl NativeError {
    pub(crate) fn sql(sql: &str, message: impl Into<String>) -> Self {
        NativeError::SqlExecution {
            sql: sql.to_string(),
            message: message.into(),
        }
    }
}
