use thiserror::Error;

/// Errors that can occur within the job queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Underlying SQLite / rusqlite error, including rows whose `details` or
    /// `status` column could not be decoded.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;
