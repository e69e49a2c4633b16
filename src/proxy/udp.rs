//! UDP relays
//!
//! Two inbound shapes carry datagrams:
//!
//! * raw UDP: every datagram from the peer is `[address][payload]`, sealed
//!   as a whole when a cipher is configured
//! * UDP-over-stream: datagrams are framed inside the (already decrypted)
//!   byte stream as
//!
//! ```text
//! +-----+------+----------+----------+
//! | LEN | 0xFF | ADDRESS  | PAYLOAD  |
//! +-----+------+----------+----------+
//! |  2  |  1   | variable |   LEN    |
//! +-----+------+----------+----------+
//! ```
//!
//! Replies travel back in the same shape with the responding endpoint as the
//! address. An association ends on peer close, idle timeout or cancellation.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::bypass::Bypass;
use crate::cipher::ShadowCipher;
use crate::common::{RelayError, Result};
use crate::conn::{BoxStream, PacketConn};
use crate::protocol::{Address, AddressError, UDP_TUN_SENTINEL};

/// Bytes preceding the address in a tunnel frame
pub const TUNNEL_HEADER_LEN: usize = 3;

/// Datagram handling collaborator of the dispatcher
///
/// Both operations own the connection for the rest of the session and
/// report nothing back; failures are logged here.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UdpRelay: Send + Sync {
    /// Relay datagrams arriving on a packet connection
    async fn handle_raw_udp(&self, ctx: &CancellationToken, peer: SocketAddr, conn: PacketConn);

    /// Relay datagrams framed inside a stream
    async fn handle_tunneled_udp(&self, ctx: &CancellationToken, stream: BoxStream);
}

/// One decoded UDP-over-stream frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelFrame<'a> {
    pub address: Address,
    pub payload: &'a [u8],
    /// Total bytes the frame occupies in the buffer
    pub frame_len: usize,
}

/// Append one UDP-over-stream frame to `buf`
pub fn encode_tunnel_frame(buf: &mut BytesMut, address: &Address, payload: &[u8]) -> Result<()> {
    let len = u16::try_from(payload.len()).map_err(|_| {
        RelayError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("datagram of {} bytes does not fit a frame", payload.len()),
        ))
    })?;
    buf.reserve(TUNNEL_HEADER_LEN + address.serialized_len() + payload.len());
    buf.put_u16(len);
    buf.put_u8(UDP_TUN_SENTINEL);
    address.write_to(buf);
    buf.put_slice(payload);
    Ok(())
}

/// Decode the frame at the front of `buf`.
///
/// `Ok(None)` means more bytes are needed.
pub fn decode_tunnel_frame(buf: &[u8]) -> Result<Option<TunnelFrame<'_>>> {
    if buf.len() < TUNNEL_HEADER_LEN {
        return Ok(None);
    }
    if buf[2] != UDP_TUN_SENTINEL {
        return Err(RelayError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad tunnel frame marker {:#04x}", buf[2]),
        )));
    }
    let payload_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;

    let (address, addr_len) = match Address::parse(&buf[TUNNEL_HEADER_LEN..]) {
        Ok(parsed) => parsed,
        Err(AddressError::Truncated { .. }) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let start = TUNNEL_HEADER_LEN + addr_len;
    let frame_len = start + payload_len;
    if buf.len() < frame_len {
        return Ok(None);
    }
    Ok(Some(TunnelFrame {
        address,
        payload: &buf[start..frame_len],
        frame_len,
    }))
}

/// Resolve a decoded destination to a socket address
async fn resolve(address: &Address) -> io::Result<SocketAddr> {
    match address {
        Address::Ip(addr) => Ok(*addr),
        Address::Domain(host, port) => lookup_host((host.as_str(), *port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", host))
            }),
    }
}

/// Outbound sockets, bound lazily per address family
#[derive(Default)]
struct OutboundSockets {
    v4: Option<UdpSocket>,
    v6: Option<UdpSocket>,
}

impl OutboundSockets {
    async fn send_to(&mut self, payload: &[u8], target: SocketAddr) -> io::Result<usize> {
        let (slot, bind) = match target {
            SocketAddr::V4(_) => (&mut self.v4, "0.0.0.0:0"),
            SocketAddr::V6(_) => (&mut self.v6, "[::]:0"),
        };
        if slot.is_none() {
            let socket = UdpSocket::bind(bind).await?;
            debug!("Bound outbound UDP socket {}", socket.local_addr()?);
            *slot = Some(socket);
        }
        let socket = slot
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "outbound socket missing"))?;
        socket.send_to(payload, target).await
    }

    /// Receive from whichever socket is ready; pends while none is bound.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match (&self.v4, &self.v6) {
            (None, None) => std::future::pending().await,
            (Some(socket), None) | (None, Some(socket)) => socket.recv_from(buf).await,
            (Some(v4), Some(v6)) => loop {
                let socket = tokio::select! {
                    ready = v4.readable() => { ready?; v4 }
                    ready = v6.readable() => { ready?; v6 }
                };
                match socket.try_recv_from(buf) {
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    result => return result,
                }
            },
        }
    }
}

/// Default UDP relay over real sockets
pub struct SocketUdpRelay {
    cipher: Option<ShadowCipher>,
    buffer_size: usize,
    idle_timeout: Duration,
    bypass: Option<Arc<dyn Bypass>>,
}

impl SocketUdpRelay {
    pub fn new(cipher: Option<ShadowCipher>, buffer_size: usize, idle_timeout: Duration) -> Self {
        Self {
            cipher,
            buffer_size,
            idle_timeout,
            bypass: None,
        }
    }

    /// Apply `bypass` to every datagram destination
    pub fn with_bypass(mut self, bypass: Arc<dyn Bypass>) -> Self {
        self.bypass = Some(bypass);
        self
    }

    /// Send one `[address][payload]` datagram to its destination
    async fn forward(&self, outbound: &mut OutboundSockets, datagram: &[u8]) -> Result<()> {
        let (address, addr_len) = Address::parse(datagram)?;
        let canonical = address.to_string();
        if self.bypass.as_ref().map_or(false, |b| b.contains(&canonical)) {
            return Err(RelayError::Bypassed(canonical));
        }
        let target = resolve(&address).await?;
        let payload = &datagram[addr_len..];
        outbound.send_to(payload, target).await?;
        debug!("UDP {} bytes >> {}", payload.len(), canonical);
        Ok(())
    }

    fn log_forward_error(&self, peer: &str, err: RelayError) {
        match err {
            RelayError::Bypassed(addr) => info!("bypass: {} remote={}", addr, peer),
            err => warn!("UDP forward failed: {} remote={}", err, peer),
        }
    }

    async fn raw_reply(&self, conn: &PacketConn, from: SocketAddr, payload: &[u8]) -> Result<()> {
        let address = Address::from(from);
        let mut datagram = BytesMut::with_capacity(address.serialized_len() + payload.len());
        address.write_to(&mut datagram);
        datagram.put_slice(payload);

        match &self.cipher {
            Some(cipher) => conn.send(&cipher.encrypt_packet(&datagram)?).await?,
            None => conn.send(&datagram).await?,
        };
        Ok(())
    }
}

#[async_trait]
impl UdpRelay for SocketUdpRelay {
    async fn handle_raw_udp(&self, ctx: &CancellationToken, peer: SocketAddr, mut conn: PacketConn) {
        let peer_str = peer.to_string();
        debug!("UDP association started remote={}", peer_str);

        let mut outbound = OutboundSockets::default();
        let mut buf = vec![0u8; self.buffer_size];
        let (mut packets_out, mut packets_in) = (0u64, 0u64);
        let idle = sleep(self.idle_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    debug!("UDP association cancelled remote={}", peer_str);
                    break;
                }
                _ = &mut idle => {
                    debug!("UDP association idle remote={}", peer_str);
                    break;
                }
                packet = conn.recv() => {
                    let Some(packet) = packet else { break };
                    idle.as_mut().reset(Instant::now() + self.idle_timeout);

                    let datagram = match &self.cipher {
                        Some(cipher) => match cipher.decrypt_packet(&packet) {
                            Ok(plain) => plain,
                            Err(e) => {
                                warn!("Dropping undecryptable datagram: {} remote={}", e, peer_str);
                                continue;
                            }
                        },
                        None => packet.to_vec(),
                    };
                    match self.forward(&mut outbound, &datagram).await {
                        Ok(()) => packets_out += 1,
                        Err(e) => self.log_forward_error(&peer_str, e),
                    }
                }
                received = outbound.recv_from(&mut buf) => {
                    let (n, from) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            warn!("UDP receive failed: {} remote={}", e, peer_str);
                            break;
                        }
                    };
                    idle.as_mut().reset(Instant::now() + self.idle_timeout);
                    match self.raw_reply(&conn, from, &buf[..n]).await {
                        Ok(()) => packets_in += 1,
                        Err(e) => warn!("UDP reply failed: {} remote={}", e, peer_str),
                    }
                }
            }
        }

        debug!(
            "UDP association ended remote={} packets_out={} packets_in={}",
            peer_str, packets_out, packets_in
        );
    }

    async fn handle_tunneled_udp(&self, ctx: &CancellationToken, mut stream: BoxStream) {
        debug!("UDP-over-TCP association started");

        let mut outbound = OutboundSockets::default();
        let mut inbound = BytesMut::with_capacity(self.buffer_size);
        let mut reply = BytesMut::with_capacity(self.buffer_size + 64);
        let mut buf = vec![0u8; self.buffer_size];
        let max_frame = TUNNEL_HEADER_LEN + u8::MAX as usize + 4 + self.buffer_size;
        let (mut packets_out, mut packets_in) = (0u64, 0u64);
        let idle = sleep(self.idle_timeout);
        tokio::pin!(idle);

        'session: loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = &mut idle => {
                    debug!("UDP-over-TCP association idle");
                    break;
                }
                read = stream.read_buf(&mut inbound) => {
                    match read {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(e) => {
                            warn!("UDP-over-TCP read failed: {}", e);
                            break;
                        }
                    }
                    idle.as_mut().reset(Instant::now() + self.idle_timeout);

                    loop {
                        let frame = match decode_tunnel_frame(&inbound) {
                            Ok(Some(frame)) => frame,
                            Ok(None) if inbound.len() > max_frame => {
                                warn!("UDP-over-TCP frame exceeds {} bytes", max_frame);
                                break 'session;
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!("Invalid UDP-over-TCP frame: {}", e);
                                break 'session;
                            }
                        };
                        let frame_len = frame.frame_len;
                        let datagram = &inbound[TUNNEL_HEADER_LEN..frame_len];
                        match self.forward(&mut outbound, datagram).await {
                            Ok(()) => packets_out += 1,
                            Err(e) => self.log_forward_error("tunnel", e),
                        }
                        inbound.advance(frame_len);
                    }
                }
                received = outbound.recv_from(&mut buf) => {
                    let (n, from) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            warn!("UDP receive failed: {}", e);
                            break;
                        }
                    };
                    idle.as_mut().reset(Instant::now() + self.idle_timeout);

                    reply.clear();
                    if let Err(e) = encode_tunnel_frame(&mut reply, &Address::from(from), &buf[..n]) {
                        warn!("UDP reply dropped: {}", e);
                        continue;
                    }
                    let written = async {
                        stream.write_all(&reply).await?;
                        stream.flush().await
                    }
                    .await;
                    if let Err(e) = written {
                        warn!("UDP-over-TCP write failed: {}", e);
                        break;
                    }
                    packets_in += 1;
                }
            }
        }

        let _ = stream.shutdown().await;
        debug!(
            "UDP-over-TCP association ended packets_out={} packets_in={}",
            packets_out, packets_in
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bypass::MockBypass;
    use bytes::Bytes;
    use tokio::io::duplex;
    use tokio::sync::mpsc;

    async fn udp_echo() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let (n, from) = socket.recv_from(&mut buf).await.unwrap();
                socket.send_to(&buf[..n], from).await.unwrap();
            }
        });
        addr
    }

    #[test]
    fn test_tunnel_frame_partial_and_complete() {
        let address = Address::Domain("example.com".to_string(), 53);
        let mut buf = BytesMut::new();
        encode_tunnel_frame(&mut buf, &address, b"query").unwrap();
        assert_eq!(&buf[..3], &[0x00, 0x05, 0xFF]);

        for cut in 0..buf.len() {
            assert!(decode_tunnel_frame(&buf[..cut]).unwrap().is_none());
        }
        let frame = decode_tunnel_frame(&buf).unwrap().unwrap();
        assert_eq!(frame.address, address);
        assert_eq!(frame.payload, b"query");
        assert_eq!(frame.frame_len, buf.len());
    }

    #[test]
    fn test_tunnel_frame_bad_marker() {
        assert!(decode_tunnel_frame(&[0x00, 0x01, 0x00, 0x01]).is_err());
        assert!(decode_tunnel_frame(&[0x00, 0x01, 0xFF, 0x09, 0x00]).is_err());
    }

    #[tokio::test]
    async fn test_tunneled_udp_echo() {
        let echo = udp_echo().await;
        let relay = SocketUdpRelay::new(None, 2048, Duration::from_secs(5));
        let (mut client, server) = duplex(4096);
        let ctx = CancellationToken::new();

        let session = tokio::spawn(async move {
            relay.handle_tunneled_udp(&ctx, Box::new(server)).await;
        });

        let mut frame = BytesMut::new();
        encode_tunnel_frame(&mut frame, &Address::from(echo), b"ping").unwrap();
        client.write_all(&frame).await.unwrap();

        let mut header = [0u8; 3];
        client.read_exact(&mut header).await.unwrap();
        assert_eq!(header, [0x00, 0x04, 0xFF]);
        let mut rest = vec![0u8; Address::from(echo).serialized_len() + 4];
        client.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest[rest.len() - 4..], b"ping");

        drop(client);
        session.await.unwrap();
    }

    #[tokio::test]
    async fn test_raw_udp_echo_encrypted() {
        let echo = udp_echo().await;
        let cipher = ShadowCipher::new("aes-128-gcm", "pw", None).unwrap().unwrap();
        let relay = SocketUdpRelay::new(Some(cipher.clone()), 2048, Duration::from_secs(5));

        let listener = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = client.local_addr().unwrap();
        let (tx, rx) = mpsc::channel(8);
        let conn = PacketConn::new(rx, listener.clone(), peer, listener.local_addr().unwrap());

        let ctx = CancellationToken::new();
        let session_ctx = ctx.clone();
        let session = tokio::spawn(async move {
            relay.handle_raw_udp(&session_ctx, peer, conn).await;
        });

        let mut datagram = BytesMut::new();
        Address::from(echo).write_to(&mut datagram);
        datagram.put_slice(b"hello");
        tx.send(Bytes::from(cipher.encrypt_packet(&datagram).unwrap())).await.unwrap();

        let mut buf = [0u8; 2048];
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        let plain = cipher.decrypt_packet(&buf[..n]).unwrap();
        let (from, addr_len) = Address::parse(&plain).unwrap();
        assert_eq!(from, Address::from(echo));
        assert_eq!(&plain[addr_len..], b"hello");

        ctx.cancel();
        session.await.unwrap();
    }

    #[tokio::test]
    async fn test_bypassed_datagram_is_dropped() {
        let mut bypass = MockBypass::new();
        bypass.expect_contains().returning(|_| true);
        let relay = SocketUdpRelay::new(None, 2048, Duration::from_secs(5))
            .with_bypass(Arc::new(bypass));

        let mut outbound = OutboundSockets::default();
        let mut datagram = BytesMut::new();
        Address::Domain("blocked.example".to_string(), 53).write_to(&mut datagram);
        datagram.put_slice(b"x");

        let result = relay.forward(&mut outbound, &datagram).await;
        assert!(matches!(result, Err(RelayError::Bypassed(_))));
        assert!(outbound.v4.is_none() && outbound.v6.is_none());
    }
}
