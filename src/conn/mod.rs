//! Connection model
//!
//! An inbound connection is either a byte stream or a per-peer datagram
//! channel. The listener that accepts it decides which, so the dispatcher
//! branches on the [`Inbound`] variant instead of probing the transport.

mod peeked;

pub use peeked::PeekedStream;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Bidirectional byte stream usable across tasks
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type-erased stream, the currency between cipher, classifier, router and relay
pub type BoxStream = Box<dyn Stream>;

/// Stream-oriented inbound connection
pub struct StreamConn {
    io: BoxStream,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
}

impl StreamConn {
    pub fn new<S: Stream + 'static>(io: S, peer_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        Self {
            io: Box::new(io),
            peer_addr,
            local_addr,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Give up the endpoint identity and keep the stream
    pub fn into_stream(self) -> BoxStream {
        self.io
    }
}

/// Datagram-oriented inbound connection for one peer.
///
/// The listener owns the socket and pushes every datagram from `peer_addr`
/// into this connection's queue; replies go out through the shared socket.
pub struct PacketConn {
    rx: mpsc::Receiver<Bytes>,
    socket: Arc<UdpSocket>,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
}

impl PacketConn {
    pub fn new(
        rx: mpsc::Receiver<Bytes>,
        socket: Arc<UdpSocket>,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Self {
        Self {
            rx,
            socket,
            peer_addr,
            local_addr,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next datagram from the peer; `None` once the listener dropped the queue
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Send one datagram back to the peer
    pub async fn send(&self, data: &[u8]) -> io::Result<usize> {
        self.socket.send_to(data, self.peer_addr).await
    }
}

/// Inbound connection with its transport capability fixed at creation
pub enum Inbound {
    Stream(StreamConn),
    Datagram(PacketConn),
}

impl Inbound {
    pub fn peer_addr(&self) -> SocketAddr {
        match self {
            Inbound::Stream(conn) => conn.peer_addr(),
            Inbound::Datagram(conn) => conn.peer_addr(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Inbound::Stream(conn) => conn.local_addr(),
            Inbound::Datagram(conn) => conn.local_addr(),
        }
    }

    pub fn is_datagram(&self) -> bool {
        matches!(self, Inbound::Datagram(_))
    }
}

/// Run `fut` under an optional read deadline.
///
/// The deadline exists only for the duration of the call, so it is cleared on
/// every exit path. A zero duration means no deadline, like `None`. Expiry is
/// reported as an `io::ErrorKind::TimedOut` error converted into the future's
/// error type.
pub async fn with_deadline<T, E, F>(deadline: Option<Duration>, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<io::Error>,
{
    match deadline {
        Some(limit) if !limit.is_zero() => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("read deadline of {:?} exceeded", limit),
            )
            .into()),
        },
        _ => fut.await,
    }
}
