//! AEAD stream wrapper.
//!
//! Wire format per direction:
//!
//! ```text
//! [salt] { [len (2) + tag (16)] [payload (len) + tag (16)] }*
//! ```
//!
//! Reads never pull more ciphertext from the inner stream than the current
//! chunk needs; writes buffer at most one sealed chunk.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{random_salt, AeadState, CipherError, ShadowCipher, MAX_PAYLOAD_LEN, TAG_LEN};

const SCRATCH_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Salt,
    Length,
    Payload(usize),
    Eof,
}

/// Stream whose reads yield plaintext and whose writes are encrypted
pub struct AeadStream<S> {
    inner: S,
    cipher: ShadowCipher,
    read_state: ReadState,
    decoder: Option<AeadState>,
    incoming: BytesMut,
    plain: BytesMut,
    encoder: Option<AeadState>,
    outgoing: BytesMut,
}

impl<S> AeadStream<S> {
    pub fn new(inner: S, cipher: ShadowCipher) -> Self {
        Self {
            inner,
            cipher,
            read_state: ReadState::Salt,
            decoder: None,
            incoming: BytesMut::new(),
            plain: BytesMut::new(),
            encoder: None,
            outgoing: BytesMut::new(),
        }
    }

    fn bytes_needed(&self) -> usize {
        match self.read_state {
            ReadState::Salt => self.cipher.kind().salt_len(),
            ReadState::Length => 2 + TAG_LEN,
            ReadState::Payload(len) => len + TAG_LEN,
            ReadState::Eof => 0,
        }
    }

    /// Consume one complete unit (salt, length or payload) from `incoming`.
    fn decode_unit(&mut self, need: usize) -> Result<(), CipherError> {
        let unit = self.incoming.split_to(need);
        match self.read_state {
            ReadState::Salt => {
                let subkey = self.cipher.derive_subkey(&unit)?;
                self.decoder = Some(AeadState::new(self.cipher.kind(), subkey));
                self.read_state = ReadState::Length;
            }
            ReadState::Length => {
                let decoder = self.decoder.as_mut().ok_or(CipherError::Decrypt)?;
                let raw = decoder.open(&unit)?;
                let len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
                if len == 0 || len > MAX_PAYLOAD_LEN {
                    return Err(CipherError::InvalidChunkLength(len));
                }
                self.read_state = ReadState::Payload(len);
            }
            ReadState::Payload(_) => {
                let decoder = self.decoder.as_mut().ok_or(CipherError::Decrypt)?;
                let payload = decoder.open(&unit)?;
                self.plain.extend_from_slice(&payload);
                self.read_state = ReadState::Length;
            }
            ReadState::Eof => {}
        }
        Ok(())
    }

    /// Seal `data` (at most one chunk) into `outgoing`, prefixing the salt on first use.
    fn encode_chunk(&mut self, data: &[u8]) -> Result<(), CipherError> {
        if self.encoder.is_none() {
            let salt = random_salt(self.cipher.kind())?;
            let subkey = self.cipher.derive_subkey(&salt)?;
            self.outgoing.extend_from_slice(&salt);
            self.encoder = Some(AeadState::new(self.cipher.kind(), subkey));
        }
        let encoder = self.encoder.as_mut().ok_or(CipherError::Encrypt)?;
        let len = (data.len() as u16).to_be_bytes();
        let sealed_len = encoder.seal(&len)?;
        let sealed_payload = encoder.seal(data)?;
        self.outgoing.extend_from_slice(&sealed_len);
        self.outgoing.extend_from_slice(&sealed_payload);
        Ok(())
    }
}

impl<S: AsyncRead + Unpin> AeadStream<S> {
    /// Read more ciphertext, never past `need` buffered bytes.
    ///
    /// Resolves to the number of bytes read; zero means EOF.
    fn poll_fill(&mut self, cx: &mut Context<'_>, need: usize) -> Poll<io::Result<usize>> {
        let want = need.saturating_sub(self.incoming.len()).min(SCRATCH_LEN);
        let mut scratch = [0u8; SCRATCH_LEN];
        let mut buf = ReadBuf::new(&mut scratch[..want]);
        ready!(Pin::new(&mut self.inner).poll_read(cx, &mut buf))?;
        let n = buf.filled().len();
        self.incoming.extend_from_slice(buf.filled());
        Poll::Ready(Ok(n))
    }
}

impl<S: AsyncWrite + Unpin> AeadStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.outgoing.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.outgoing))?;
            if n == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write sealed chunk",
                )));
            }
            self.outgoing.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for AeadStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.plain.is_empty() {
                let n = this.plain.len().min(buf.remaining());
                buf.put_slice(&this.plain[..n]);
                this.plain.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.read_state == ReadState::Eof {
                return Poll::Ready(Ok(()));
            }

            let need = this.bytes_needed();
            while this.incoming.len() < need {
                let n = ready!(this.poll_fill(cx, need))?;
                if n == 0 {
                    let at_boundary = this.incoming.is_empty()
                        && matches!(this.read_state, ReadState::Salt | ReadState::Length);
                    if at_boundary {
                        this.read_state = ReadState::Eof;
                        return Poll::Ready(Ok(()));
                    }
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended inside an encrypted chunk",
                    )));
                }
            }

            this.decode_unit(need)?;
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for AeadStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = data.len().min(MAX_PAYLOAD_LEN);
        this.encode_chunk(&data[..n])?;

        // The chunk is accepted; push what the socket takes now, the rest on flush.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
