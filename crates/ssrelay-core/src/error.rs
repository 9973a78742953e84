//! Error types for `ssrelay` core library.

use thiserror::Error;

/// Result type alias using `ssrelay` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `ssrelay` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid user-supplied value (label, backend, expiry)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short machine-classifiable reason.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::InvalidInput(_) => "invalid_input",
            Self::Json(_) => "json",
            Self::Io(_) => "io",
        }
    }
}
