//! Network utility functions
//!
//! This module provides utility functions for network operations.

use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

use super::error::{RelayError, Result};

/// Parse a socket address
///
/// # Arguments
///
/// * `addr` - The address string to parse
///
/// # Returns
///
/// The parsed `SocketAddr`
pub fn parse_socket_addr(addr: &str) -> Result<SocketAddr> {
    // Try direct parsing first
    if let Ok(socket_addr) = SocketAddr::from_str(addr) {
        return Ok(socket_addr);
    }

    // Try using ToSocketAddrs trait
    match addr.to_socket_addrs() {
        Ok(mut addrs) => {
            if let Some(addr) = addrs.next() {
                Ok(addr)
            } else {
                Err(RelayError::Config(format!("Failed to parse address: {}", addr)))
            }
        }
        Err(e) => Err(RelayError::Config(format!("Failed to parse address {}: {}", addr, e))),
    }
}

/// Split a `host:port` string into host and optional port.
///
/// Bracketed IPv6 (`[::1]:80`) and bare IPv6 without a port (`::1`) are
/// both accepted.
pub fn split_host_port(addr: &str) -> (&str, Option<u16>) {
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = &rest[..end];
            let port = rest[end + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse().ok());
            return (host, port);
        }
        return (addr, None);
    }

    match addr.rsplit_once(':') {
        // More than one colon without brackets: bare IPv6 address
        Some((host, _)) if host.contains(':') => (addr, None),
        Some((host, port)) => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (addr, None),
        },
        None => (addr, None),
    }
}

/// Convert a millisecond setting into an optional deadline.
///
/// Zero means "no deadline".
pub fn millis_to_deadline(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
