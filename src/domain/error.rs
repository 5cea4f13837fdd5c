use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AppError {
    Internal(String),
    NotFound(String),
    ValidationError(String),
    ParseError(String),
    LLMError(String),
    DatabaseError(String),
    IoError(String),
    /// The vector backend could not be reached or answered with an error.
    IndexUnavailable(String),
    /// The generation oracle failed after its local retries were exhausted.
    GenerationUnavailable(String),
    /// Startup-fatal misconfiguration (missing credentials, dimension mismatch, ...).
    ConfigurationError(String),
}

impl AppError {
    /// Errors that can never be recovered mid-query and must stop the process at startup.
    pub fn is_fatal_configuration(&self) -> bool {
        matches!(self, AppError::ConfigurationError(_))
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            AppError::LLMError(msg) => write!(f, "LLM error: {}", msg),
            AppError::DatabaseError(msg) => write!(f, "Database error: {}", msg),
            AppError::IoError(msg) => write!(f, "IO error: {}", msg),
            AppError::IndexUnavailable(msg) => write!(f, "Vector index unavailable: {}", msg),
            AppError::GenerationUnavailable(msg) => write!(f, "Generation unavailable: {}", msg),
            AppError::ConfigurationError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::IoError(err.to_string())
    }
}

impl From<figment::Error> for AppError {
    fn from(err: figment::Error) -> Self {
        AppError::ConfigurationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
