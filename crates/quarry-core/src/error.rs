use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuarryError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid repository URL: {0}")]
    InvalidRepository(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl QuarryError {
    /// Short error code string used in structured log fields.
    pub fn code(&self) -> &'static str {
        match self {
            QuarryError::Config(_) => "CONFIG_ERROR",
            QuarryError::InvalidRepository(_) => "INVALID_REPOSITORY",
            QuarryError::Serialization(_) => "SERIALIZATION_ERROR",
            QuarryError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, QuarryError>;
