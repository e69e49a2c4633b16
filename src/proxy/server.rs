//! Relay server module
//!
//! Accepts inbound connections and hands each one to the configured
//! [`Handler`] in its own task. TCP connections become
//! [`Inbound::Stream`]; when UDP is enabled, datagrams arriving on the same
//! port are demultiplexed per peer into [`Inbound::Datagram`] connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cipher::{MAX_SALT_LEN, TAG_LEN};
use crate::common::{RelayError, Result};
use crate::conn::{Inbound, PacketConn, StreamConn};
use crate::protocol::MAX_ADDRESS_LEN;

use super::handler::Handler;

/// Datagrams queued per UDP peer before new ones are dropped
const UDP_QUEUE_DEPTH: usize = 64;

const LISTEN_BACKLOG: i32 = 1024;

/// Bytes a sealed datagram carries on top of its payload
const DATAGRAM_OVERHEAD: usize = MAX_SALT_LEN + MAX_ADDRESS_LEN + TAG_LEN;

/// Relay server
///
/// Binding happens in [`Server::bind`], so the local address is known
/// before [`Server::run`] starts accepting.
pub struct Server {
    listener: TcpListener,
    udp: Option<Arc<UdpSocket>>,
    udp_buffer_size: usize,
    handler: Arc<dyn Handler>,
    shutdown: CancellationToken,
}

/// Create a TCP listener with SO_REUSEADDR set
fn tcp_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into()).map_err(|e| {
        RelayError::Config(format!("Failed to bind listener to {}: {}", addr, e))
    })?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(TcpListener::from_std(socket.into())?)
}

impl Server {
    /// Bind the TCP listener and, when `udp_buffer_size` is given, a UDP
    /// socket on the same address.
    ///
    /// # Parameters
    ///
    /// * `listen_addr` - Address to listen on; port 0 picks a free port
    /// * `handler` - Handler for every accepted connection
    /// * `udp_buffer_size` - Largest datagram payload, `None` disables the UDP
    ///   listener. The receive buffer adds room for salt, address and tag.
    pub async fn bind(
        listen_addr: SocketAddr,
        handler: Arc<dyn Handler>,
        udp_buffer_size: Option<usize>,
    ) -> Result<Self> {
        let listener = tcp_listener(listen_addr)?;
        let local = listener.local_addr()?;

        let udp = match udp_buffer_size {
            Some(_) => Some(Arc::new(UdpSocket::bind(local).await?)),
            None => None,
        };

        Ok(Self {
            listener,
            udp,
            udp_buffer_size: udp_buffer_size.unwrap_or_default(),
            handler,
            shutdown: CancellationToken::new(),
        })
    }

    /// Address the TCP listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Token that stops the server when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until the shutdown token is cancelled.
    ///
    /// Every session runs under a child token of the shutdown token.
    /// Sessions still running at shutdown are aborted.
    pub async fn run(self) -> Result<()> {
        let local = self.local_addr()?;
        info!("Relay server started, listening on {}", local);

        let mut tasks = JoinSet::new();

        if let Some(socket) = self.udp.clone() {
            info!("UDP relay listening on {}", local);
            tasks.spawn(serve_udp(
                socket,
                self.handler.clone(),
                self.shutdown.clone(),
                self.udp_buffer_size,
            ));
        }

        loop {
            // Reap finished sessions and log any panics
            while let Some(result) = tasks.try_join_next() {
                if let Err(e) = result {
                    error!("Task error: {}", e);
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                        }
                        let local = stream.local_addr().unwrap_or(local);
                        let conn = Inbound::Stream(StreamConn::new(stream, peer, local));
                        let handler = self.handler.clone();
                        let ctx = self.shutdown.child_token();
                        tasks.spawn(async move {
                            handler.handle(&ctx, conn).await;
                        });
                    }
                    Err(e) => error!("Error accepting connection: {}", e),
                },
            }
        }

        info!("Relay server on {} shutting down, {} task(s) left", local, tasks.len());
        tasks.shutdown().await;
        Ok(())
    }
}

/// Demultiplex datagrams per peer into packet connections
async fn serve_udp(
    socket: Arc<UdpSocket>,
    handler: Arc<dyn Handler>,
    shutdown: CancellationToken,
    buffer_size: usize,
) {
    let local = match socket.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!("UDP listener has no local address: {}", e);
            return;
        }
    };

    let mut peers: HashMap<SocketAddr, mpsc::Sender<Bytes>> = HashMap::new();
    let mut sessions: JoinSet<SocketAddr> = JoinSet::new();
    let mut buf = vec![0u8; buffer_size + DATAGRAM_OVERHEAD];

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                match finished {
                    Ok(peer) => {
                        // A newer session for the same peer keeps its entry.
                        if peers.get(&peer).map_or(false, |tx| tx.is_closed()) {
                            peers.remove(&peer);
                        }
                    }
                    Err(e) => error!("UDP session error: {}", e),
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (n, peer) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("UDP receive failed: {}", e);
                        continue;
                    }
                };
                let mut packet = Bytes::copy_from_slice(&buf[..n]);

                if let Some(tx) = peers.get(&peer) {
                    match tx.try_send(packet) {
                        Ok(()) => continue,
                        Err(TrySendError::Full(_)) => {
                            debug!("UDP queue for {} is full, dropping datagram", peer);
                            continue;
                        }
                        // Session ended; start a fresh one below.
                        Err(TrySendError::Closed(returned)) => packet = returned,
                    }
                }

                let (tx, rx) = mpsc::channel(UDP_QUEUE_DEPTH);
                if tx.try_send(packet).is_err() {
                    continue;
                }
                peers.insert(peer, tx);

                let conn = PacketConn::new(rx, socket.clone(), peer, local);
                let handler = handler.clone();
                let ctx = shutdown.child_token();
                sessions.spawn(async move {
                    handler.handle(&ctx, Inbound::Datagram(conn)).await;
                    peer
                });
            }
        }
    }

    sessions.shutdown().await;
    debug!("UDP listener on {} stopped", local);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    /// Records the shape of every inbound connection it sees
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(bool, SocketAddr)>>,
    }

    #[async_trait]
    impl Handler for Recorder {
        async fn handle(&self, _ctx: &CancellationToken, conn: Inbound) {
            self.seen
                .lock()
                .unwrap()
                .push((conn.is_datagram(), conn.peer_addr()));
            if let Inbound::Datagram(mut conn) = conn {
                while let Some(packet) = conn.recv().await {
                    conn.send(&packet).await.unwrap();
                }
            }
        }
    }

    #[tokio::test]
    async fn test_datagram_overhead_is_not_truncated() {
        let handler = Arc::new(Recorder::default());
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), handler, Some(512))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let token = server.shutdown_token();
        let running = tokio::spawn(server.run());

        // A full payload plus the sealing overhead of the widest method
        let packet = vec![0x5a; 512 + MAX_SALT_LEN + 7 + TAG_LEN];
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        udp.send_to(&packet, addr).await.unwrap();

        let mut buf = vec![0u8; 2048];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), udp.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], &packet[..]);

        token.cancel();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_and_shutdown() {
        let handler = Arc::new(Recorder::default());
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), handler, None)
            .await
            .unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);

        let token = server.shutdown_token();
        let running = tokio::spawn(server.run());
        token.cancel();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tcp_and_udp_dispatch() {
        let handler = Arc::new(Recorder::default());
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), handler.clone(), Some(2048))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let token = server.shutdown_token();
        let running = tokio::spawn(server.run());

        let mut tcp = TcpStream::connect(addr).await.unwrap();
        tcp.write_all(b"x").await.unwrap();

        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        udp.send_to(b"one", addr).await.unwrap();
        udp.send_to(b"two", addr).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = udp.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"one");
        assert_eq!(from, addr);
        let (n, _) = udp.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"two");

        tokio::time::sleep(Duration::from_millis(50)).await;
        {
            let seen = handler.seen.lock().unwrap();
            assert!(seen.iter().any(|(datagram, _)| !datagram));
            // Both datagrams went to one per-peer connection.
            let udp_peer = udp.local_addr().unwrap();
            assert_eq!(seen.iter().filter(|(d, p)| *d && *p == udp_peer).count(), 1);
        }

        token.cancel();
        running.await.unwrap().unwrap();
    }
}
