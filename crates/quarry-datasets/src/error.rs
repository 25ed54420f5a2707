use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset not found: {0}")]
    NotFound(String),

    #[error("malformed item on line {line}: {reason}")]
    MalformedItem { line: usize, reason: String },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DatasetError>;
