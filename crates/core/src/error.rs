use thiserror::Error;

pub type OutreachResult<T> = Result<T, OutreachError>;

#[derive(Error, Debug)]
pub enum OutreachError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Enrollment is terminal: {0}")]
    Terminal(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl OutreachError {
    /// Short machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            OutreachError::Config(_) => "configuration_error",
            OutreachError::Validation(_) => "validation_error",
            OutreachError::NotFound(_) => "not_found",
            OutreachError::Conflict(_) => "conflict",
            OutreachError::Terminal(_) => "enrollment_terminal",
            OutreachError::Persistence(_) => "persistence_error",
            OutreachError::Serialization(_) => "serialization_error",
            OutreachError::Io(_) => "io_error",
            OutreachError::Internal(_) => "internal_error",
        }
    }
}
