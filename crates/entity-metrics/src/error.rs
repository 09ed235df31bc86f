use thiserror::Error;

pub type MetricsResult<T> = Result<T, MetricsError>;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("metric data json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("time parse error: {0}")]
    Chrono(#[from] chrono::ParseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("storage task join error: {0}")]
    Task(String),

    #[error("invalid metrics data: {0}")]
    InvalidData(String),

    /// A user/admin subject is not of the configured user kind.
    #[error("subject must be an instance of {expected}, instance of {given} given")]
    InvalidSubjectKind { expected: String, given: String },

    #[error("unknown statistics period: {0}")]
    UnknownPeriod(String),

    #[error("unknown statistics aggregation: {0}")]
    UnknownAggregation(String),

    #[error("unknown metric kind: {0}")]
    InvalidKind(String),
}
