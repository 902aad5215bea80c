//! Error types for access log configuration
//!
//! Failures of the intercepted RPCs themselves are never wrapped here; they
//! travel as [`tonic::Status`] exactly as the user behavior produced them.

use thiserror::Error;

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the crate
///
/// Large error variants are boxed to reduce stack size
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be loaded or extracted
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// A configured field extractor name has no implementation
    #[error("Unknown access log handler: {0}")]
    UnknownHandler(String),

    /// A configured severity could not be parsed
    #[error("Invalid log level: {0}")]
    InvalidLevel(String),

    /// A strftime pattern contains an unsupported specifier
    #[error("Invalid time format: {0}")]
    InvalidTimeFormat(String),

    /// Tracing subscriber setup failed
    #[error("Tracing error: {0}")]
    Tracing(String),
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}
