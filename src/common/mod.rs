//! Common module
//!
//! This module contains shared errors, logging helpers and network utility
//! functions used throughout the relay.

pub mod error;
pub mod log;
pub mod net;

// Re-export commonly used types and functions
pub use error::{RelayError, Result};
pub use log::{init_logger, SessionLogger};
pub use net::{millis_to_deadline, parse_socket_addr, split_host_port};
