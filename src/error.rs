use thiserror::Error;

/// Errors that can occur in the load generator library
#[derive(Error, Debug)]
pub enum SaylError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Data feeder error
    #[error("feeder error: {0}")]
    Feeder(String),

    /// Circuit breaker expression error
    #[error("circuit breaker error: {0}")]
    Breaker(String),

    /// HTTP client construction error
    #[error("client error: {0}")]
    Client(String),

    /// Target unreachable during preflight
    #[error("target unreachable: {0}")]
    Preflight(String),

    /// I/O error
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias using SaylError
pub type Result<T> = std::result::Result<T, SaylError>;

impl From<String> for SaylError {
    fn from(s: String) -> Self {
        SaylError::Other(s)
    }
}

impl From<&str> for SaylError {
    fn from(s: &str) -> Self {
        SaylError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for SaylError {
    fn from(err: serde_json::Error) -> Self {
        SaylError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for SaylError {
    fn from(err: serde_yaml::Error) -> Self {
        SaylError::Serialization(err.to_string())
    }
}

impl From<csv::Error> for SaylError {
    fn from(err: csv::Error) -> Self {
        SaylError::Feeder(err.to_string())
    }
}
