//! Relay service module
//!
//! This module implements the per-connection dispatcher and everything it
//! drives: the listener, the bidirectional stream relay and the UDP relay.

mod forwarder;
mod handler;
mod registry;
mod server;
mod udp;

pub use forwarder::transport;
pub use handler::{Handler, Metadata, SsHandler};
pub use registry::{new_ss_handler, HandlerFactory, HandlerOptions, HandlerRegistry};
pub use server::Server;
pub use udp::{
    decode_tunnel_frame, encode_tunnel_frame, SocketUdpRelay, TunnelFrame, UdpRelay,
    TUNNEL_HEADER_LEN,
};
