//! Peek-and-replay stream decorator.
//!
//! A protocol classifier has to look at the first bytes of a connection
//! before deciding who gets to read it. [`PeekedStream`] keeps those bytes
//! and yields them before delegating to the inner stream, so every
//! downstream reader sees the connection from offset zero.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// A stream wrapper that yields a peeked prefix before reading from the inner stream.
pub struct PeekedStream<S> {
    prefix: Bytes,
    pos: usize,
    inner: S,
}

impl<S> PeekedStream<S> {
    /// Wrap `inner`, replaying `prefix` to the first reads.
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }

    /// The full peeked prefix, whether or not it has been replayed yet
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// Split into the unreplayed prefix and the inner stream
    pub fn into_parts(self) -> (Bytes, S) {
        let pos = self.pos.min(self.prefix.len());
        (self.prefix.slice(pos..), self.inner)
    }
}

impl<S: AsyncRead + Unpin> PeekedStream<S> {
    /// Read exactly `len` bytes from `inner` and keep them for replay.
    ///
    /// Fails with `UnexpectedEof` if the stream ends first.
    pub async fn peek(mut inner: S, len: usize) -> io::Result<Self> {
        let mut buf = vec![0u8; len];
        inner.read_exact(&mut buf).await?;
        Ok(Self::new(Bytes::from(buf), inner))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.prefix.len() {
            let remaining = &self.prefix[self.pos..];
            let to_copy = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            self.pos += to_copy;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn test_peek_replays_prefix() {
        let (mut client, server) = duplex(1024);
        client.write_all(b"abcdef").await.unwrap();
        drop(client);

        let mut peeked = PeekedStream::peek(server, 3).await.unwrap();
        assert_eq!(peeked.prefix(), b"abc");

        let mut all = Vec::new();
        peeked.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"abcdef");
        assert!(peeked.into_parts().0.is_empty());
    }

    #[tokio::test]
    async fn test_peek_short_stream() {
        let (mut client, server) = duplex(1024);
        client.write_all(b"ab").await.unwrap();
        drop(client);

        let err = PeekedStream::peek(server, 3).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_partial_reads() {
        let (_client, server) = duplex(1024);
        let mut peeked = PeekedStream::new(Bytes::from_static(b"hello"), server);

        let mut buf = [0u8; 2];
        assert_eq!(peeked.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf, b"he");
        assert_eq!(peeked.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf, b"ll");
        assert_eq!(peeked.read(&mut buf).await.unwrap(), 1);
        assert_eq!(&buf[..1], b"o");
    }

    #[tokio::test]
    async fn test_into_parts_keeps_unread_prefix() {
        let (_client, server) = duplex(64);
        let mut peeked = PeekedStream::new(Bytes::from_static(b"abc"), server);

        let mut buf = [0u8; 1];
        peeked.read_exact(&mut buf).await.unwrap();
        let (prefix, _inner) = peeked.into_parts();
        assert_eq!(&prefix[..], b"bc");
    }

    #[tokio::test]
    async fn test_write_passthrough() {
        let (mut client, server) = duplex(1024);
        let mut peeked = PeekedStream::new(Bytes::from_static(b"xyz"), server);

        peeked.write_all(b"reply").await.unwrap();

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");
    }
}
