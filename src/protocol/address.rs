//! Destination address codec
//!
//! Destinations are carried in the SOCKS5 address form used by Shadowsocks:
//!
//! ```text
//! +------+----------+------+
//! | ATYP |   ADDR   | PORT |
//! +------+----------+------+
//! |  1   | variable |  2   |
//! +------+----------+------+
//! ```
//!
//! `ATYP` is `0x01` (IPv4, 4 bytes), `0x03` (domain, 1 length byte followed by
//! the name) or `0x04` (IPv6, 16 bytes). The port is big-endian.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// IPv4 address type
pub const ATYP_IPV4: u8 = 0x01;
/// Domain name address type
pub const ATYP_DOMAIN: u8 = 0x03;
/// IPv6 address type
pub const ATYP_IPV6: u8 = 0x04;
/// Longest encoding: type, length byte, 255-byte domain, port
pub const MAX_ADDRESS_LEN: usize = 1 + 1 + 255 + 2;

/// Address decoding error
#[derive(Error, Debug)]
pub enum AddressError {
    /// Unknown `ATYP` byte
    #[error("unsupported address type {0:#04x}")]
    UnsupportedType(u8),

    /// Zero-length or non UTF-8 domain
    #[error("invalid domain name")]
    InvalidDomain,

    /// Input ended before the encoding was complete
    #[error("truncated address: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes the encoding requires
        needed: usize,
        /// Bytes that were available
        available: usize,
    },

    /// I/O failure while reading the encoding
    #[error("read address: {0}")]
    Io(#[from] io::Error),
}

/// Decoded destination
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// Literal IP destination
    Ip(SocketAddr),
    /// Domain destination, resolved by whoever dials it
    Domain(String, u16),
}

impl Address {
    /// Destination port
    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Host part without port
    pub fn host(&self) -> String {
        match self {
            Address::Ip(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// Number of bytes the wire encoding occupies
    pub fn serialized_len(&self) -> usize {
        match self {
            Address::Ip(SocketAddr::V4(_)) => 1 + 4 + 2,
            Address::Ip(SocketAddr::V6(_)) => 1 + 16 + 2,
            Address::Domain(domain, _) => 1 + 1 + domain.len() + 2,
        }
    }

    /// Append the wire encoding to `buf`
    ///
    /// Domains longer than 255 bytes cannot be encoded and are truncated to
    /// the first 255 bytes; callers only encode addresses they decoded or
    /// obtained from a socket.
    pub fn write_to(&self, buf: &mut BytesMut) {
        match self {
            Address::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::Ip(SocketAddr::V6(addr)) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::Domain(domain, port) => {
                let name = &domain.as_bytes()[..domain.len().min(u8::MAX as usize)];
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(name.len() as u8);
                buf.put_slice(name);
                buf.put_u16(*port);
            }
        }
    }

    /// Decode an address from the front of `data`.
    ///
    /// Returns the address and the number of bytes consumed.
    pub fn parse(data: &[u8]) -> Result<(Address, usize), AddressError> {
        let atyp = *data.first().ok_or(AddressError::Truncated { needed: 1, available: 0 })?;
        let need = |needed: usize| -> Result<(), AddressError> {
            if data.len() < needed {
                Err(AddressError::Truncated { needed, available: data.len() })
            } else {
                Ok(())
            }
        };

        match atyp {
            ATYP_IPV4 => {
                need(7)?;
                let ip = Ipv4Addr::new(data[1], data[2], data[3], data[4]);
                let port = u16::from_be_bytes([data[5], data[6]]);
                Ok((Address::Ip(SocketAddr::new(IpAddr::V4(ip), port)), 7))
            }
            ATYP_IPV6 => {
                need(19)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[1..17]);
                let port = u16::from_be_bytes([data[17], data[18]]);
                Ok((Address::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)), 19))
            }
            ATYP_DOMAIN => {
                need(2)?;
                let len = data[1] as usize;
                need(2 + len + 2)?;
                let domain = domain_from_bytes(&data[2..2 + len])?;
                let port = u16::from_be_bytes([data[2 + len], data[3 + len]]);
                Ok((Address::Domain(domain, port), 2 + len + 2))
            }
            other => Err(AddressError::UnsupportedType(other)),
        }
    }

    /// Decode an address directly from a reader.
    ///
    /// Reads exactly the bytes of the encoding and nothing more, so whatever
    /// follows stays in the stream for the relay. An EOF in the middle of the
    /// encoding is reported as [`AddressError::Truncated`].
    pub async fn read_from<R>(reader: &mut R) -> Result<(Address, usize), AddressError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut atyp = [0u8; 1];
        read_exact(reader, &mut atyp, 1, 0).await?;

        match atyp[0] {
            ATYP_IPV4 => {
                let mut buf = [0u8; 6];
                read_exact(reader, &mut buf, 7, 1).await?;
                let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
                let port = u16::from_be_bytes([buf[4], buf[5]]);
                Ok((Address::Ip(SocketAddr::new(IpAddr::V4(ip), port)), 7))
            }
            ATYP_IPV6 => {
                let mut buf = [0u8; 18];
                read_exact(reader, &mut buf, 19, 1).await?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[..16]);
                let port = u16::from_be_bytes([buf[16], buf[17]]);
                Ok((Address::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)), 19))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                read_exact(reader, &mut len, 2, 1).await?;
                let len = len[0] as usize;
                let total = 2 + len + 2;
                let mut buf = vec![0u8; len + 2];
                read_exact(reader, &mut buf, total, 2).await?;
                let domain = domain_from_bytes(&buf[..len])?;
                let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
                Ok((Address::Domain(domain, port), total))
            }
            other => Err(AddressError::UnsupportedType(other)),
        }
    }
}

/// Fill `buf` from `reader`; `already` counts encoding bytes read before it.
///
/// On EOF the error reports every byte of the encoding that did arrive.
async fn read_exact<R>(
    reader: &mut R,
    buf: &mut [u8],
    needed: usize,
    already: usize,
) -> Result<(), AddressError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => {
                return Err(AddressError::Truncated {
                    needed,
                    available: already + filled,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(AddressError::Io(e)),
        }
    }
    Ok(())
}

fn domain_from_bytes(raw: &[u8]) -> Result<String, AddressError> {
    if raw.is_empty() {
        return Err(AddressError::InvalidDomain);
    }
    std::str::from_utf8(raw)
        .map(str::to_owned)
        .map_err(|_| AddressError::InvalidDomain)
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Ip(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn encode(addr: &Address) -> Vec<u8> {
        let mut buf = BytesMut::new();
        addr.write_to(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn test_parse_ipv4() {
        let data = [0x01, 127, 0, 0, 1, 0x1f, 0x90, 0xaa];
        let (addr, used) = Address::parse(&data).unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:8080");
        assert_eq!(used, 7);
    }

    #[test]
    fn test_parse_domain() {
        let addr = Address::Domain("example.com".to_string(), 80);
        let data = encode(&addr);
        assert_eq!(data.len(), addr.serialized_len());

        let (parsed, used) = Address::parse(&data).unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(used, data.len());
        assert_eq!(parsed.to_string(), "example.com:80");
    }

    #[test]
    fn test_ipv6_canonical_form() {
        let addr = Address::from("[::1]:443".parse::<SocketAddr>().unwrap());
        let (parsed, _) = Address::parse(&encode(&addr)).unwrap();
        assert_eq!(parsed.to_string(), "[::1]:443");
        assert_eq!(parsed.host(), "::1");
        assert_eq!(parsed.port(), 443);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Address::parse(&[]), Err(AddressError::Truncated { .. })));
        assert!(matches!(Address::parse(&[0x05, 0x01, 0x00]), Err(AddressError::UnsupportedType(0x05))));
        assert!(matches!(Address::parse(&[0x03, 0x00, 0x00, 0x50]), Err(AddressError::InvalidDomain)));
        assert!(matches!(Address::parse(&[0x03, 0x05, b'a', b'b']), Err(AddressError::Truncated { .. })));
        assert!(matches!(Address::parse(&[0x03, 0x02, 0xff, 0xfe, 0, 80]), Err(AddressError::InvalidDomain)));
    }

    #[tokio::test]
    async fn test_read_from_leaves_payload() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let mut data = encode(&Address::Domain("example.com".into(), 443));
        data.extend_from_slice(b"payload");
        client.write_all(&data).await.unwrap();
        drop(client);

        let (addr, used) = Address::read_from(&mut server).await.unwrap();
        assert_eq!(addr.to_string(), "example.com:443");
        assert_eq!(used, 2 + 11 + 2);

        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"payload");
    }

    #[tokio::test]
    async fn test_read_from_is_deterministic() {
        let data = encode(&Address::Domain("example.com".into(), 80));
        let (a, _) = Address::read_from(&mut &data[..]).await.unwrap();
        let (b, _) = Address::read_from(&mut &data[..]).await.unwrap();
        assert_eq!(a.to_string(), b.to_string());
    }

    #[tokio::test]
    async fn test_read_from_truncated() {
        let data = [0x01, 10, 0, 0];
        let err = Address::read_from(&mut &data[..]).await.unwrap_err();
        assert!(matches!(err, AddressError::Truncated { needed: 7, available: 4 }));

        let data = [0x03, 0x0b, b'e', b'x'];
        let err = Address::read_from(&mut &data[..]).await.unwrap_err();
        assert!(matches!(err, AddressError::Truncated { needed: 15, available: 4 }));
    }
}
