//! Outbound routing
//!
//! A [`Router`] turns a destination string into an established outbound
//! stream, retrying failed attempts. [`DirectRouter`] connects straight to the
//! destination; chained or load-balanced routers plug in behind the same trait.

use std::fmt;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, warn};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::common::{RelayError, Result};
use crate::conn::BoxStream;

/// Transport requested from a router
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// Outbound connection factory
///
/// `retries` is the number of additional attempts after the first, so zero
/// means exactly one attempt. Implementations log their own failures and
/// must fail fast with [`RelayError::Cancelled`] once `ctx` is cancelled.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Router: Send + Sync {
    async fn dial(
        &self,
        ctx: &CancellationToken,
        network: Network,
        address: &str,
        retries: u32,
    ) -> Result<BoxStream>;
}

/// Router that connects directly to the destination
#[derive(Debug)]
pub struct DirectRouter {
    connect_timeout: Duration,
    #[cfg(test)]
    connects: std::sync::atomic::AtomicU32,
}

impl DirectRouter {
    /// Create a router whose every attempt is bounded by `connect_timeout`
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            #[cfg(test)]
            connects: std::sync::atomic::AtomicU32::new(0),
        }
    }

    async fn connect_once(&self, address: &str) -> io::Result<TcpStream> {
        #[cfg(test)]
        self.connects
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let stream = timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "Connection timed out"))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

impl Default for DirectRouter {
    fn default() -> Self {
        Self::new(Duration::from_secs(crate::config::defaults::CONNECTION_TIMEOUT))
    }
}

#[async_trait]
impl Router for DirectRouter {
    async fn dial(
        &self,
        ctx: &CancellationToken,
        network: Network,
        address: &str,
        retries: u32,
    ) -> Result<BoxStream> {
        if network != Network::Tcp {
            return Err(RelayError::Dial {
                address: address.to_string(),
                attempts: 0,
                source: io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("{} is not supported by the direct router", network),
                ),
            });
        }

        let attempts = retries.saturating_add(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if ctx.is_cancelled() {
                return Err(RelayError::Cancelled);
            }

            let result = tokio::select! {
                _ = ctx.cancelled() => return Err(RelayError::Cancelled),
                result = self.connect_once(address) => result,
            };

            match result {
                Ok(stream) => {
                    debug!("Connected to {} on attempt {}/{}", address, attempt, attempts);
                    return Ok(Box::new(stream));
                }
                Err(e) => {
                    warn!("Dial {} attempt {}/{} failed: {}", address, attempt, attempts, e);
                    last_error = Some(e);
                }
            }
        }

        let source = last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no dial attempt made"));
        error!("Dial {} failed after {} attempt(s): {}", address, attempts, source);
        Err(RelayError::Dial {
            address: address.to_string(),
            attempts,
            source,
        })
    }
}
