//! Error types for the wantun core library.

use thiserror::Error;

/// Result type alias using the wantun core Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for wantun operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML parse error
    #[error("Failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
