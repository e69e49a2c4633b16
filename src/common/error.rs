//! Error handling module
//!
//! This module defines the error types and result type aliases used by the relay.
//! Every session-level failure is mapped onto one of the [`RelayError`] variants so
//! the dispatcher can log it and close the inbound connection.

use thiserror::Error;
use std::io;

use crate::cipher::CipherError;
use crate::protocol::AddressError;

/// Shadow relay error type
#[derive(Error, Debug)]
pub enum RelayError {
    /// I/O failure or deadline expiry while classifying or decoding the address
    #[error("read error: {0}")]
    Read(#[source] io::Error),

    /// Decryption failure on an encrypted stream
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),

    /// Malformed or truncated destination encoding
    #[error("address decode error: {0}")]
    AddressDecode(#[from] AddressError),

    /// Outbound connection could not be established after all retries
    #[error("dial {address} failed after {attempts} attempt(s): {source}")]
    Dial {
        /// Destination that was dialed
        address: String,
        /// Number of attempts made
        attempts: u32,
        /// Last error observed
        #[source]
        source: io::Error,
    },

    /// Destination matched the bypass policy (deliberate no-op termination)
    #[error("bypass: {0}")]
    Bypassed(String),

    /// A UDP path was selected while UDP relaying is disabled
    #[error("UDP relay is disabled")]
    UdpDisabled,

    /// The session context was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error outside of the classification/decoding reads
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Map an error raised by a read on the inbound stream.
    ///
    /// Decryption failures travel through `io::Error` (the cipher sits behind
    /// `AsyncRead`), so they are unwrapped back into [`RelayError::Cipher`] here.
    pub fn from_read(err: io::Error) -> Self {
        if err.get_ref().map_or(false, |inner| inner.is::<CipherError>()) {
            if let Some(inner) = err.into_inner() {
                if let Ok(cipher) = inner.downcast::<CipherError>() {
                    return RelayError::Cipher(*cipher);
                }
            }
            return RelayError::Cipher(CipherError::Decrypt);
        }
        RelayError::Read(err)
    }
}

/// Result type alias
///
/// This is a `Result` type alias that uses our custom `RelayError`.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let relay_err: RelayError = io_err.into();

        match relay_err {
            RelayError::Io(_) => {}
            _ => panic!("Should convert to IO error"),
        }
    }

    #[test]
    fn test_from_read_unwraps_cipher_error() {
        let err: io::Error = CipherError::Decrypt.into();
        match RelayError::from_read(err) {
            RelayError::Cipher(CipherError::Decrypt) => {}
            other => panic!("expected cipher error, got {:?}", other),
        }

        let err = io::Error::new(io::ErrorKind::TimedOut, "deadline elapsed");
        assert!(matches!(RelayError::from_read(err), RelayError::Read(_)));
    }

    #[test]
    fn test_error_display() {
        let err = RelayError::Config("Invalid configuration".to_string());
        assert!(err.to_string().contains("Invalid configuration"));

        let err = RelayError::Dial {
            address: "example.com:80".to_string(),
            attempts: 3,
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        let text = err.to_string();
        assert!(text.contains("example.com:80"));
        assert!(text.contains("3 attempt"));
    }
}
