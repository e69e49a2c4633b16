//! Shadow Relay: Shadowsocks-style relay node
//!
//! Every accepted connection goes through one dispatcher that decides which
//! of three protocol variants it carries:
//!
//! - raw UDP datagrams, handed to the UDP relay
//! - UDP tunneled over the TCP stream, recognized by a sentinel byte
//! - a TCP relay request: a SOCKS5-style target address followed by payload
//!
//! Streams are optionally wrapped in a Shadowsocks AEAD cipher before
//! classification. TCP targets are checked against a bypass list and dialed
//! through a [`chain::Router`] with bounded retries.
//!
//! # Example
//!
//! ```no_run
//! use shadow_relay::{HandlerOptions, HandlerRegistry, RelayConfig, Result, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let mut config = RelayConfig::default();
//!     config.listen = "127.0.0.1:8388".to_string();
//!     config.password = "secret".to_string();
//!     config.validate()?;
//!
//!     let handler = HandlerRegistry::with_defaults()
//!         .build(&config.handler, HandlerOptions::new(config.clone()))?;
//!
//!     let server = Server::bind(config.listen_addr()?, handler, None).await?;
//!     server.run().await
//! }
//! ```

// Public modules
pub mod bypass;
pub mod chain;
pub mod cipher;
pub mod common;
pub mod config;
pub mod conn;
pub mod protocol;
pub mod proxy;

// Re-export commonly used structures and functions for convenience
pub use common::{parse_socket_addr, RelayError, Result};
pub use config::RelayConfig;
pub use proxy::{Handler, HandlerOptions, HandlerRegistry, Metadata, Server, SsHandler};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
