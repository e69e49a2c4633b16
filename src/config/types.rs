//! Configuration types
//!
//! This module contains the relay configuration and its conversion into the
//! per-handler [`Metadata`].

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cipher::ShadowCipher;
use crate::common::{millis_to_deadline, parse_socket_addr};
use crate::config::defaults;
use crate::config::error::{ConfigError, Result};
use crate::proxy::Metadata;

const REDACTED: &str = "********";

/// Relay configuration
///
/// Every field has a default, so a partial JSON file or a handful of
/// environment variables is enough to describe a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    /// Listen address (host:port), shared by the TCP and UDP listeners
    pub listen: String,

    /// Registered handler name
    pub handler: String,

    /// Cipher method; `none` disables encryption
    pub method: String,

    /// Password the master key is derived from
    pub password: String,

    /// Raw master key, used instead of the password when set
    pub key: Option<String>,

    /// Read deadline in milliseconds for classification and address decoding; 0 disables it
    pub read_timeout_ms: u64,

    /// Extra dial attempts after the first
    pub retries: u32,

    /// Enable both UDP paths
    pub udp: bool,

    /// Datagram buffer size in bytes
    pub udp_buffer_size: usize,

    /// Seconds of inactivity before a UDP association is released
    pub udp_idle_timeout: u64,

    /// Relay copy buffer size in bytes
    pub buffer_size: usize,

    /// Outbound connect timeout in seconds
    pub connection_timeout: u64,

    /// Bypass rules
    pub bypass: Vec<String>,

    /// Treat the bypass rules as a whitelist
    pub bypass_whitelist: bool,

    /// Log level
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: defaults::listen(),
            handler: defaults::handler(),
            method: defaults::method(),
            password: String::new(),
            key: None,
            read_timeout_ms: 0,
            retries: defaults::retries(),
            udp: false,
            udp_buffer_size: defaults::udp_buffer_size(),
            udp_idle_timeout: defaults::udp_idle_timeout(),
            buffer_size: defaults::buffer_size(),
            connection_timeout: defaults::connection_timeout(),
            bypass: Vec::new(),
            bypass_whitelist: false,
            log_level: defaults::log_level(),
        }
    }
}

/// Command-line overrides, the highest-priority layer
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub listen: Option<String>,
    pub handler: Option<String>,
    pub method: Option<String>,
    pub password: Option<String>,
    pub key: Option<String>,
    pub read_timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    pub udp: Option<bool>,
    pub buffer_size: Option<usize>,
    pub bypass: Option<Vec<String>>,
    pub log_level: Option<String>,
}

impl RelayConfig {
    /// Apply command-line overrides on top of the loaded layers
    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(v) = overrides.listen {
            self.listen = v;
        }
        if let Some(v) = overrides.handler {
            self.handler = v;
        }
        if let Some(v) = overrides.method {
            self.method = v;
        }
        if let Some(v) = overrides.password {
            self.password = v;
        }
        if let Some(v) = overrides.key {
            self.key = Some(v);
        }
        if let Some(v) = overrides.read_timeout_ms {
            self.read_timeout_ms = v;
        }
        if let Some(v) = overrides.retries {
            self.retries = v;
        }
        if let Some(v) = overrides.udp {
            self.udp = v;
        }
        if let Some(v) = overrides.buffer_size {
            self.buffer_size = v;
        }
        if let Some(v) = overrides.bypass {
            self.bypass = v;
        }
        if let Some(v) = overrides.log_level {
            self.log_level = v;
        }
    }

    /// Parsed listen address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        parse_socket_addr(&self.listen)
            .map_err(|e| ConfigError::InvalidValue("listen".to_string(), e.to_string()))
    }

    /// Read deadline, `None` when disabled
    pub fn read_timeout(&self) -> Option<Duration> {
        millis_to_deadline(self.read_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }

    pub fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_idle_timeout)
    }

    /// UDP buffer size clamped to a usable datagram range
    pub fn udp_buffer_size(&self) -> usize {
        self.udp_buffer_size
            .clamp(defaults::MIN_UDP_BUFFER_SIZE, defaults::MAX_UDP_BUFFER_SIZE)
    }

    /// Build the configured cipher, `None` for the plain methods
    pub fn cipher(&self) -> Result<Option<ShadowCipher>> {
        Ok(ShadowCipher::new(&self.method, &self.password, self.key.as_deref())?)
    }

    /// Resolve the handler metadata once, at construction time
    pub fn to_metadata(&self) -> Result<Metadata> {
        Ok(Metadata {
            cipher: self.cipher()?,
            enable_udp: self.udp,
            read_timeout: self.read_timeout(),
            retries: self.retries,
            udp_buffer_size: self.udp_buffer_size(),
            buffer_size: self.buffer_size,
        })
    }

    /// Effective configuration as pretty JSON with secrets masked
    pub fn to_redacted_json(&self) -> Result<String> {
        let mut shown = self.clone();
        if !shown.password.is_empty() {
            shown.password = REDACTED.to_string();
        }
        if shown.key.is_some() {
            shown.key = Some(REDACTED.to_string());
        }
        serde_json::to_string_pretty(&shown).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}
