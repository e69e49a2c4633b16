//! Cipher adapter
//!
//! Optional transparent encryption of inbound connections using the
//! Shadowsocks AEAD construction on top of OpenSSL primitives:
//!
//! - master key from the password via `EVP_BytesToKey` (MD5), or the raw key
//! - per-direction random salt, session subkey via HKDF-SHA1 (`"ss-subkey"`)
//! - 12-byte little-endian nonce counter, 16-byte tags
//!
//! When no cipher is configured, [`wrap`] returns the stream unchanged.

mod aead;

pub use aead::AeadStream;

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;

use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::md::Md;
use openssl::pkey::Id;
use openssl::pkey_ctx::PkeyCtx;
use openssl::symm::{self, Cipher};
use thiserror::Error;

use crate::conn::BoxStream;

/// AEAD tag length for every supported method
pub const TAG_LEN: usize = 16;
/// Nonce length for every supported method
pub const NONCE_LEN: usize = 12;
/// Longest salt of the supported methods
pub const MAX_SALT_LEN: usize = 32;
/// Largest payload carried by one stream chunk
pub const MAX_PAYLOAD_LEN: usize = 0x3FFF;

const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// Cipher error type
#[derive(Error, Debug)]
pub enum CipherError {
    #[error("unsupported cipher method: {0}")]
    UnsupportedMethod(String),

    #[error("cipher {0} requires a password or key")]
    MissingKey(CipherKind),

    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("decryption failed")]
    Decrypt,

    #[error("encryption failed")]
    Encrypt,

    #[error("invalid chunk length {0}")]
    InvalidChunkLength(usize),

    #[error("packet too short")]
    PacketTooShort,

    #[error("OpenSSL error: {0}")]
    Ssl(#[from] ErrorStack),
}

impl From<CipherError> for io::Error {
    fn from(err: CipherError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

/// Supported AEAD methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherKind {
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherKind {
    pub fn key_len(&self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes192Gcm => 24,
            CipherKind::Aes256Gcm | CipherKind::ChaCha20Poly1305 => 32,
        }
    }

    /// Salt length equals the key length for the AEAD methods
    pub fn salt_len(&self) -> usize {
        self.key_len()
    }

    fn openssl(&self) -> Cipher {
        match self {
            CipherKind::Aes128Gcm => Cipher::aes_128_gcm(),
            CipherKind::Aes192Gcm => Cipher::aes_192_gcm(),
            CipherKind::Aes256Gcm => Cipher::aes_256_gcm(),
            CipherKind::ChaCha20Poly1305 => Cipher::chacha20_poly1305(),
        }
    }
}

impl FromStr for CipherKind {
    type Err = CipherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "aes-128-gcm" | "aead_aes_128_gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-192-gcm" | "aead_aes_192_gcm" => Ok(CipherKind::Aes192Gcm),
            "aes-256-gcm" | "aead_aes_256_gcm" => Ok(CipherKind::Aes256Gcm),
            "chacha20-ietf-poly1305" | "chacha20-poly1305" | "aead_chacha20_poly1305" => {
                Ok(CipherKind::ChaCha20Poly1305)
            }
            other => Err(CipherError::UnsupportedMethod(other.to_string())),
        }
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CipherKind::Aes128Gcm => "aes-128-gcm",
            CipherKind::Aes192Gcm => "aes-192-gcm",
            CipherKind::Aes256Gcm => "aes-256-gcm",
            CipherKind::ChaCha20Poly1305 => "chacha20-ietf-poly1305",
        };
        f.write_str(name)
    }
}

/// Whether `method` means "no encryption"
pub fn is_plain_method(method: &str) -> bool {
    matches!(method.trim().to_lowercase().as_str(), "" | "none" | "plain" | "dummy")
}

/// Configured cipher: method plus master key
#[derive(Clone)]
pub struct ShadowCipher {
    kind: CipherKind,
    key: Arc<[u8]>,
}

impl ShadowCipher {
    /// Build a cipher from configuration.
    ///
    /// Returns `Ok(None)` for the plain methods. A non-empty `key` is used
    /// verbatim as the master key and must match the method's key length;
    /// otherwise the key is derived from `password`.
    pub fn new(method: &str, password: &str, key: Option<&str>) -> Result<Option<Self>, CipherError> {
        if is_plain_method(method) {
            return Ok(None);
        }
        let kind: CipherKind = method.trim().parse()?;

        let key: Vec<u8> = match key.filter(|k| !k.is_empty()) {
            Some(raw) => {
                if raw.len() != kind.key_len() {
                    return Err(CipherError::InvalidKeyLength {
                        expected: kind.key_len(),
                        actual: raw.len(),
                    });
                }
                raw.as_bytes().to_vec()
            }
            None if password.is_empty() => return Err(CipherError::MissingKey(kind)),
            None => evp_bytes_to_key(kind, password.as_bytes())?,
        };

        Ok(Some(Self {
            kind,
            key: key.into(),
        }))
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Wrap a stream so reads decrypt and writes encrypt
    pub fn wrap<S>(&self, inner: S) -> AeadStream<S> {
        AeadStream::new(inner, self.clone())
    }

    /// Seal one datagram: `salt | ciphertext | tag` with a zero nonce
    pub fn encrypt_packet(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let salt = random_salt(self.kind)?;
        let mut state = AeadState::new(self.kind, self.derive_subkey(&salt)?);

        let mut out = Vec::with_capacity(salt.len() + plaintext.len() + TAG_LEN);
        out.extend_from_slice(&salt);
        out.extend_from_slice(&state.seal(plaintext)?);
        Ok(out)
    }

    /// Open one datagram sealed by [`ShadowCipher::encrypt_packet`]
    pub fn decrypt_packet(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        let salt_len = self.kind.salt_len();
        if data.len() < salt_len + TAG_LEN {
            return Err(CipherError::PacketTooShort);
        }
        let (salt, sealed) = data.split_at(salt_len);
        let mut state = AeadState::new(self.kind, self.derive_subkey(salt)?);
        state.open(sealed)
    }

    fn derive_subkey(&self, salt: &[u8]) -> Result<Vec<u8>, CipherError> {
        hkdf_sha1(&self.key, salt, self.kind.key_len()).map_err(CipherError::from)
    }
}

impl fmt::Debug for ShadowCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShadowCipher")
            .field("kind", &self.kind)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Wrap `stream` with `cipher`, or hand it back untouched when there is none
pub fn wrap(stream: BoxStream, cipher: Option<&ShadowCipher>) -> BoxStream {
    match cipher {
        Some(cipher) => Box::new(cipher.wrap(stream)),
        None => stream,
    }
}

/// Nonce counter plus subkey for one direction
pub(crate) struct AeadState {
    kind: CipherKind,
    subkey: Vec<u8>,
    nonce: [u8; NONCE_LEN],
}

impl AeadState {
    pub(crate) fn new(kind: CipherKind, subkey: Vec<u8>) -> Self {
        Self {
            kind,
            subkey,
            nonce: [0u8; NONCE_LEN],
        }
    }

    /// Encrypt `plaintext`, returning ciphertext followed by the tag
    pub(crate) fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut tag = [0u8; TAG_LEN];
        let mut out = symm::encrypt_aead(
            self.kind.openssl(),
            &self.subkey,
            Some(&self.nonce),
            &[],
            plaintext,
            &mut tag,
        )
        .map_err(|_| CipherError::Encrypt)?;
        out.extend_from_slice(&tag);
        increment_nonce(&mut self.nonce);
        Ok(out)
    }

    /// Decrypt `sealed` (ciphertext followed by the tag)
    pub(crate) fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
        if sealed.len() < TAG_LEN {
            return Err(CipherError::Decrypt);
        }
        let (data, tag) = sealed.split_at(sealed.len() - TAG_LEN);
        let plain = symm::decrypt_aead(
            self.kind.openssl(),
            &self.subkey,
            Some(&self.nonce),
            &[],
            data,
            tag,
        )
        .map_err(|_| CipherError::Decrypt)?;
        increment_nonce(&mut self.nonce);
        Ok(plain)
    }
}

fn increment_nonce(nonce: &mut [u8]) {
    for byte in nonce.iter_mut() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

pub(crate) fn random_salt(kind: CipherKind) -> Result<Vec<u8>, CipherError> {
    let mut salt = vec![0u8; kind.salt_len()];
    openssl::rand::rand_bytes(&mut salt)?;
    Ok(salt)
}

fn evp_bytes_to_key(kind: CipherKind, password: &[u8]) -> Result<Vec<u8>, CipherError> {
    let pair = openssl::pkcs5::bytes_to_key(kind.openssl(), MessageDigest::md5(), password, None, 1)?;
    Ok(pair.key)
}

fn hkdf_sha1(key: &[u8], salt: &[u8], len: usize) -> Result<Vec<u8>, ErrorStack> {
    let mut ctx = PkeyCtx::new_id(Id::HKDF)?;
    ctx.derive_init()?;
    ctx.set_hkdf_md(Md::sha1())?;
    ctx.set_hkdf_key(key)?;
    ctx.set_hkdf_salt(salt)?;
    ctx.add_hkdf_info(SUBKEY_INFO)?;
    let mut out = vec![0u8; len];
    ctx.derive(Some(&mut out))?;
    Ok(out)
}
