//! Configuration errors
//!
//! This module defines error types for the configuration module.

use thiserror::Error;

use crate::cipher::CipherError;

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Error loading or parsing a configuration source
    #[error("Error parsing configuration: {0}")]
    ParseError(String),

    /// Invalid value for configuration option
    #[error("Invalid value for '{0}': {1}")]
    InvalidValue(String, String),

    /// Missing required configuration value
    #[error("Missing required configuration value: {0}")]
    MissingRequiredValue(String),

    /// Cipher settings that cannot be turned into a cipher
    #[error("Invalid cipher settings: {0}")]
    Cipher(#[from] CipherError),
}

/// Result type alias for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

// Convert to crate's common error type
impl From<ConfigError> for crate::common::RelayError {
    fn from(err: ConfigError) -> Self {
        crate::common::RelayError::Config(err.to_string())
    }
}
