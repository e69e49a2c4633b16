//! Data forwarding module
//!
//! This module handles data forwarding between two streams.

use std::io;

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Copy `reader` into `writer` until EOF, then shut the writer down.
async fn copy_half<R, W>(mut reader: R, mut writer: W, buffer_size: usize, label: &str) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut total_bytes = 0u64;

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n]).await?;
        writer.flush().await?;
        total_bytes += n as u64;
    }

    // The peer may already be gone; the byte count is what matters here.
    let _ = writer.shutdown().await;
    debug!("{} transferred {} bytes total", label, total_bytes);
    Ok(total_bytes)
}

/// Relay bytes between two streams in both directions
///
/// Each direction half-closes its destination when its source reaches EOF.
/// Returns once both directions have finished, or as soon as either fails.
///
/// # Parameters
///
/// * `inbound` - Client-side stream
/// * `outbound` - Destination-side stream
/// * `buffer_size` - Copy buffer size per direction
///
/// # Returns
///
/// Bytes copied inbound→outbound and outbound→inbound
pub async fn transport<A, B>(inbound: A, outbound: B, buffer_size: usize) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (inbound_reader, inbound_writer) = tokio::io::split(inbound);
    let (outbound_reader, outbound_writer) = tokio::io::split(outbound);

    let client_to_target = copy_half(inbound_reader, outbound_writer, buffer_size, "Client to target");
    let target_to_client = copy_half(outbound_reader, inbound_writer, buffer_size, "Target to client");

    tokio::try_join!(client_to_target, target_to_client)
}
