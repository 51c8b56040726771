use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetricsError>;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("unknown column filter: {0}")]
    UnknownIdentifier(String),
    #[error("unsupported by dialect: {0}")]
    UnsupportedDialectFeature(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("pivot cell limit exceeded: the result exceeds {limit} cells")]
    CellLimitExceeded { limit: u64 },
    #[error("limit exceeded: the result has more than {limit} rows")]
    LimitExceeded { limit: u64 },
    #[error("execution error: {0}")]
    Execution(String),
    #[error("query timed out after {ms}ms")]
    Timeout { ms: u128 },
    #[cfg(feature = "duckdb")]
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[cfg(feature = "duckdb")]
    #[error("arrow error: {0}")]
    Arrow(#[from] duckdb::arrow::error::ArrowError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MetricsError {
    /// Wraps engine-side failures with the phase they happened in. Errors raised
    /// before execution (validation, identifiers, budgets) keep their kind.
    pub(crate) fn context(self, phase: &str) -> Self {
        match self {
            MetricsError::Execution(msg) => MetricsError::Execution(format!("{phase}: {msg}")),
            #[cfg(feature = "duckdb")]
            MetricsError::DuckDb(e) => MetricsError::Execution(format!("{phase}: {e}")),
            other => other,
        }
    }
}
