//! # Socket Plumbing Shared by the Peer and Controller Transports
//!
//! Both network surfaces of the runtime speak length-prefixed frames over
//! long-lived TCP connections. This module holds the pieces they share:
//! low-latency socket configuration and the framed read/write helpers.
//! Receivers block on full-frame reads (a partial read simply resumes
//! inside `read_exact`), and a connection that dies mid-frame surfaces as
//! an I/O error whose cleanup policy belongs to the calling transport.

pub mod controller;
pub mod peer;

use crate::error::{CoreError, CoreResult};
use crate::message::{Envelope, PeerFrameHeader, PEER_HEADER_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Apply the standard socket options to a runtime connection.
///
/// `TCP_NODELAY` keeps envelope latency flat; explicit kernel buffer sizes
/// keep backpressure behavior comparable across deployments.
pub fn configure_stream(stream: &TcpStream) -> CoreResult<()> {
    let sock = socket2::SockRef::from(stream);
    sock.set_nodelay(true)?;
    sock.set_recv_buffer_size(crate::defaults::SOCKET_BUFFER_SIZE)?;
    sock.set_send_buffer_size(crate::defaults::SOCKET_BUFFER_SIZE)?;
    Ok(())
}

/// Read one complete peer frame, blocking until every byte arrived.
///
/// Returns the decoded envelope without an origin stamp; the caller knows
/// which peer the connection belongs to.
pub async fn read_envelope<R>(reader: &mut R) -> CoreResult<Envelope>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; PEER_HEADER_LEN];
    reader.read_exact(&mut header_buf).await?;
    let header = PeerFrameHeader::parse(&header_buf)?;
    let mut payload = vec![0u8; header.payload_len as usize];
    if !payload.is_empty() {
        reader.read_exact(&mut payload).await?;
    }
    Ok(Envelope::new(header.dst_msu_id, header.key, payload))
}

/// Write one complete peer frame.
pub async fn write_envelope<W>(writer: &mut W, env: &Envelope) -> CoreResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&env.to_frame()).await?;
    writer.flush().await?;
    Ok(())
}

/// Classify an I/O error as a clean end-of-stream.
pub(crate) fn is_eof(err: &CoreError) -> bool {
    matches!(
        err,
        CoreError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof
    )
}
