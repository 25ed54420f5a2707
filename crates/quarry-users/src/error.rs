use thiserror::Error;

#[derive(Debug, Error)]
pub enum UserError {
    #[error("User not found: {0}")]
    NotFound(String),

    #[error("User already exists: {0}")]
    AlreadyExists(String),

    /// A `delete-after` value that is neither a `YYYY-MM-DD` date nor a unix
    /// timestamp.
    #[error("Invalid expiration date {0:?}")]
    InvalidExpiry(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, UserError>;
