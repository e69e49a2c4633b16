//! Connection handler module
//!
//! The Shadowsocks dispatcher: for every inbound connection it picks the
//! protocol variant, decodes the destination, applies the bypass policy,
//! dials through the router and relays bytes until either side closes.
//!
//! ```text
//! Start ─▶ Logged ─┬─▶ UdpPacket ──────────────────────────────────────▶ Closed
//!                  └─▶ AwaitPeek ─┬─▶ TunneledUdp ─────────────────────▶ Closed
//!                                 └─▶ PlainTcp ─▶ AddressDecoded
//!                                       ─▶ BypassChecked ─▶ Routed ─▶ Relaying ─▶ Closed
//! ```
//!
//! Every failure edge ends in `Closed`: the inbound connection is owned by
//! [`Handler::handle`] and dropped when it returns.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::debug;
use metrics::{counter, histogram};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::bypass::Bypass;
use crate::chain::{Network, Router};
use crate::cipher::{self, ShadowCipher};
use crate::common::{RelayError, Result, SessionLogger};
use crate::conn::{with_deadline, BoxStream, Inbound, PacketConn, PeekedStream};
use crate::protocol::{classify, Address, AddressError, ProtocolVariant, ShadowDetector};

use super::forwarder::transport;
use super::udp::UdpRelay;

/// Per-handler settings, resolved once and shared by every session
#[derive(Debug, Clone)]
pub struct Metadata {
    /// Stream cipher; `None` relays plaintext
    pub cipher: Option<ShadowCipher>,
    /// Accept both UDP paths
    pub enable_udp: bool,
    /// Deadline for classification and address decoding
    pub read_timeout: Option<Duration>,
    /// Extra dial attempts after the first
    pub retries: u32,
    pub udp_buffer_size: usize,
    pub buffer_size: usize,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            cipher: None,
            enable_udp: false,
            read_timeout: None,
            retries: 0,
            udp_buffer_size: crate::config::defaults::udp_buffer_size(),
            buffer_size: crate::config::defaults::buffer_size(),
        }
    }
}

/// Inbound connection handler
///
/// `handle` owns the connection; nothing escapes it, every failure is
/// logged and ends the session.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &CancellationToken, conn: Inbound);
}

/// Emits the completion line and duration on every exit path
struct SessionGuard {
    logger: SessionLogger,
    remote: SocketAddr,
    local: SocketAddr,
    start: Instant,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        histogram!("relay_session_duration_seconds").record(elapsed.as_secs_f64());
        self.logger
            .with_field("duration", format_args!("{:?}", elapsed))
            .info(format_args!("{} >< {}", self.remote, self.local));
    }
}

/// Shadowsocks protocol dispatcher
pub struct SsHandler {
    router: Arc<dyn Router>,
    bypass: Option<Arc<dyn Bypass>>,
    udp: Arc<dyn UdpRelay>,
    md: Arc<Metadata>,
    detector: ShadowDetector,
}

impl fmt::Debug for SsHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SsHandler")
            .field("md", &self.md)
            .field("bypass", &self.bypass.is_some())
            .finish()
    }
}

impl SsHandler {
    pub fn new(md: Metadata, router: Arc<dyn Router>, udp: Arc<dyn UdpRelay>) -> Self {
        Self {
            router,
            bypass: None,
            udp,
            md: Arc::new(md),
            detector: ShadowDetector,
        }
    }

    /// Consult `bypass` before every dial
    pub fn with_bypass(mut self, bypass: Arc<dyn Bypass>) -> Self {
        self.bypass = Some(bypass);
        self
    }

    /// Run one session and report how it ended.
    ///
    /// Failures are logged where they happen; the returned error only
    /// classifies the outcome. `Ok` means the session ran to completion.
    pub async fn serve(&self, ctx: &CancellationToken, conn: Inbound) -> Result<()> {
        let remote = conn.peer_addr();
        let local = conn.local_addr();
        let logger = SessionLogger::new()
            .with_field("remote", remote)
            .with_field("local", local);

        logger.info(format_args!("{} <> {}", remote, local));
        let _guard = SessionGuard {
            logger: logger.clone(),
            remote,
            local,
            start: Instant::now(),
        };

        match conn {
            Inbound::Datagram(conn) => self.serve_datagram(ctx, conn, &logger).await,
            Inbound::Stream(conn) => self.serve_stream(ctx, conn.into_stream(), remote, &logger).await,
        }
    }

    async fn serve_datagram(
        &self,
        ctx: &CancellationToken,
        conn: PacketConn,
        logger: &SessionLogger,
    ) -> Result<()> {
        if !self.md.enable_udp {
            logger.error(RelayError::UdpDisabled);
            return Err(RelayError::UdpDisabled);
        }
        let peer = conn.peer_addr();
        self.udp.handle_raw_udp(ctx, peer, conn).await;
        Ok(())
    }

    async fn serve_stream(
        &self,
        ctx: &CancellationToken,
        stream: BoxStream,
        remote: SocketAddr,
        logger: &SessionLogger,
    ) -> Result<()> {
        let mut stream = cipher::wrap(stream, self.md.cipher.as_ref());

        let classified = classify(&self.detector, &mut stream, self.md.read_timeout)
            .await
            .map(|(variant, peeked)| (variant, peeked.into_parts().0));
        let (variant, prefix) = match classified {
            Ok(classified) => classified,
            Err(e) => return Err(self.reject(logger, &mut stream, e).await),
        };
        debug!("Classified {} as {}", remote, variant);
        let mut stream = PeekedStream::new(prefix, stream);

        if variant == ProtocolVariant::TunneledUdp {
            if !self.md.enable_udp {
                logger.error(RelayError::UdpDisabled);
                return Err(RelayError::UdpDisabled);
            }
            self.udp.handle_tunneled_udp(ctx, Box::new(stream)).await;
            return Ok(());
        }

        let decoded = with_deadline(self.md.read_timeout, Address::read_from(&mut stream)).await;
        let address = match decoded {
            Ok((address, _)) => address,
            Err(AddressError::Io(e)) => {
                return Err(self.reject(logger, &mut stream, RelayError::from_read(e)).await)
            }
            Err(e) => return Err(self.reject(logger, &mut stream, e.into()).await),
        };

        let logger = logger.with_field("dst", &address);
        logger.info(format_args!("{} >> {}", remote, address));

        let canonical = address.to_string();
        if self.bypass.as_ref().map_or(false, |b| b.contains(&canonical)) {
            logger.info(format_args!("bypass: {}", canonical));
            return Err(RelayError::Bypassed(canonical));
        }

        // The router logs its own failures.
        let outbound = self
            .router
            .dial(ctx, Network::Tcp, &canonical, self.md.retries)
            .await?;

        let started = Instant::now();
        logger.info(format_args!("{} <-> {}", remote, address));
        match transport(stream, outbound, self.md.buffer_size).await {
            Ok((sent, received)) => logger.debug(format_args!(
                "relayed {} bytes out, {} bytes back",
                sent, received
            )),
            Err(e) => logger.debug(format_args!("relay ended: {}", e)),
        }
        logger
            .with_field("duration", format_args!("{:?}", started.elapsed()))
            .info(format_args!("{} >-< {}", remote, address));
        Ok(())
    }

    /// Log a read-side failure, drain what the peer still sends, hand back the error.
    async fn reject<S>(&self, logger: &SessionLogger, stream: &mut S, err: RelayError) -> RelayError
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        logger.error(&err);
        self.discard(stream).await;
        err
    }

    /// Read and drop the remaining input, bounded by the read timeout when set
    async fn discard<S>(&self, stream: &mut S)
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        let mut sink = tokio::io::sink();
        match with_deadline(self.md.read_timeout, tokio::io::copy(stream, &mut sink)).await {
            Ok(n) => debug!("Discarded {} bytes", n),
            Err(e) => debug!("Discard stopped: {}", e),
        }
    }
}

#[async_trait]
impl Handler for SsHandler {
    async fn handle(&self, ctx: &CancellationToken, conn: Inbound) {
        counter!("relay_sessions_total").increment(1);

        match self.serve(ctx, conn).await {
            Ok(()) => {}
            Err(RelayError::Bypassed(_)) => counter!("relay_sessions_bypassed_total").increment(1),
            Err(RelayError::UdpDisabled) => counter!("relay_udp_disabled_total").increment(1),
            Err(RelayError::Dial { .. }) | Err(RelayError::Cancelled) => {
                counter!("relay_dial_failures_total").increment(1)
            }
            Err(e) => debug!("Session ended with error: {}", e),
        }
    }
}
