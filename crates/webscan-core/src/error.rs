//! Error types for the webscan core library

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced synchronously by the engine facade
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed target URL or unknown scanner in a custom request
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown scan id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation requires a scan state it is not in
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine bug or unrecoverable internal failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::InvalidArgument(format!("Invalid URL: {}", err))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(format!("TOML parse error: {}", err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("JSON error: {}", err))
    }
}
