//! Protocol detector implementation
//!
//! Decides which handling path an inbound stream takes by examining its first
//! three bytes. The bytes are read once and replayed through a
//! [`PeekedStream`], so the address decoder or UDP relay that runs next sees
//! the stream exactly as the client sent it.

use std::fmt;
use std::time::Duration;

use log::trace;
use tokio::io::AsyncRead;

use crate::common::{RelayError, Result};
use crate::conn::{with_deadline, PeekedStream};

/// Number of bytes inspected for classification
pub const PEEK_LEN: usize = 3;

/// Value at [`SENTINEL_OFFSET`] that selects UDP-over-stream framing
pub const UDP_TUN_SENTINEL: u8 = 0xFF;

/// Offset of the sentinel inside the peeked prefix
pub const SENTINEL_OFFSET: usize = 2;

/// Handling path selected for an inbound connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVariant {
    /// Datagram transport; each packet carries its own destination
    RawUdp,
    /// Datagrams framed inside the byte stream
    TunneledUdp,
    /// Plain tunneled TCP: address header followed by payload
    Tcp,
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVariant::RawUdp => write!(f, "udp"),
            ProtocolVariant::TunneledUdp => write!(f, "udp-over-tcp"),
            ProtocolVariant::Tcp => write!(f, "tcp"),
        }
    }
}

/// Protocol detector trait
///
/// Implementations inspect a prefix of a byte stream and pick a variant.
/// Datagram connections never reach a detector: their variant is
/// [`ProtocolVariant::RawUdp`] by construction.
pub trait ProtocolDetector: Send + Sync {
    /// Classify a stream from its peeked prefix
    fn variant_of(&self, prefix: &[u8]) -> ProtocolVariant;
}

/// Detector for the Shadowsocks stream family.
///
/// A `0xFF` at offset 2 marks UDP-over-TCP; anything else is plain TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShadowDetector;

impl ProtocolDetector for ShadowDetector {
    fn variant_of(&self, prefix: &[u8]) -> ProtocolVariant {
        if prefix.get(SENTINEL_OFFSET) == Some(&UDP_TUN_SENTINEL) {
            ProtocolVariant::TunneledUdp
        } else {
            ProtocolVariant::Tcp
        }
    }
}

/// Peek [`PEEK_LEN`] bytes from `stream` and classify it.
///
/// The read runs under `deadline` when one is given. Fewer than
/// [`PEEK_LEN`] bytes, an I/O failure, an expired deadline or a decryption
/// failure all end in an error; the returned stream is only available on
/// success.
///
/// # Parameters
///
/// * `detector` - Classification rule
/// * `stream` - Stream to classify (already decrypted if a cipher is configured)
/// * `deadline` - Optional bound on the peek read
///
/// # Returns
///
/// The selected variant and a stream that replays the peeked bytes
pub async fn classify<D, S>(
    detector: &D,
    stream: S,
    deadline: Option<Duration>,
) -> Result<(ProtocolVariant, PeekedStream<S>)>
where
    D: ProtocolDetector + ?Sized,
    S: AsyncRead + Unpin,
{
    let peeked = with_deadline(deadline, PeekedStream::peek(stream, PEEK_LEN))
        .await
        .map_err(RelayError::from_read)?;

    trace!("Peeked {} bytes: {:02X?}", PEEK_LEN, peeked.prefix());
    let variant = detector.variant_of(peeked.prefix());
    Ok((variant, peeked))
}
