//! Default configuration values
//!
//! Single source of truth for defaults, shared by serde, the CLI and the
//! server.

/// Environment variable prefix for all configuration options
pub const ENV_PREFIX: &str = "SHADOW_RELAY";

/// Environment variable naming the configuration file
pub const CONFIG_FILE_ENV: &str = "SHADOW_RELAY_CONFIG_FILE";

/// Default listen address as string
pub const LISTEN_STR: &str = "0.0.0.0:8388";

/// Handler used when none is configured
pub const HANDLER: &str = "ss";

/// Default cipher method
pub const METHOD: &str = "aes-256-gcm";

/// Default log level as string
pub const LOG_LEVEL_STR: &str = "info";

/// Default connection timeout in seconds
pub const CONNECTION_TIMEOUT: u64 = 30;

/// Bounds applied to the UDP buffer size
pub const MIN_UDP_BUFFER_SIZE: usize = 512;
pub const MAX_UDP_BUFFER_SIZE: usize = 65535;

pub fn listen() -> String {
    LISTEN_STR.to_string()
}

pub fn handler() -> String {
    HANDLER.to_string()
}

pub fn method() -> String {
    METHOD.to_string()
}

pub fn log_level() -> String {
    LOG_LEVEL_STR.to_string()
}

/// Default buffer size (8KB)
pub fn buffer_size() -> usize {
    8192
}

/// Default UDP buffer size, large enough for any datagram
pub fn udp_buffer_size() -> usize {
    4096
}

/// Default connection timeout in seconds
pub fn connection_timeout() -> u64 {
    CONNECTION_TIMEOUT
}

/// Idle time in seconds before a UDP association is dropped
pub fn udp_idle_timeout() -> u64 {
    60
}

/// Default number of extra dial attempts
pub fn retries() -> u32 {
    0
}
