//! Wire-level protocol pieces
//!
//! Classification of inbound streams and the SOCKS5-style address encoding
//! shared by the TCP, UDP-over-stream and raw UDP paths.

pub mod address;
mod detector;

pub use address::{Address, AddressError, MAX_ADDRESS_LEN};
pub use detector::{
    classify, ProtocolDetector, ProtocolVariant, ShadowDetector, PEEK_LEN, SENTINEL_OFFSET,
    UDP_TUN_SENTINEL,
};
