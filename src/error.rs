use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Source error: {0}")]
    Source(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Mismatched columns and data length: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Argument contains forbidden symbol: {0}")]
    ForbiddenSymbol(String),

    #[error("Query template error: {0}")]
    Template(String),

    #[error("Key space exhausted after {0}")]
    KeyOverflow(u64),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::Database(err.to_string())
    }
}

impl From<tokio::task::JoinError> for IngestError {
    fn from(err: tokio::task::JoinError) -> Self {
        IngestError::Pipeline(format!("Worker task failed: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
