//! Configuration module
//!
//! This module handles relay configuration, including loading from
//! different sources (files, environment variables, command line arguments),
//! validating it, and resolving it into handler metadata.

pub mod defaults;
mod error;
mod loader;
mod types;
mod validator;

pub use self::defaults::{ENV_PREFIX, LISTEN_STR};
pub use self::error::ConfigError;
pub use self::types::{ConfigOverrides, RelayConfig};
pub use self::validator::validate_config;
