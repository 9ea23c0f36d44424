//! Byte pump between a local socket and one tunnel stream

use super::{StreamEvent, StreamHandle, StreamReceiver, StreamSender, TunnelError};
use crate::protocol::ErrorReason;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Bytes moved by a finished pump
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    /// Local socket -> tunnel
    pub sent: u64,
    /// Tunnel -> local socket
    pub received: u64,
}

/// Relay bytes in both directions until both are closed.
///
/// Local EOF half-closes the stream; a remote CLOSE shuts down only the
/// local write side. Each direction runs independently so a stalled send
/// never holds up delivery the other way.
pub async fn pump<S>(socket: S, handle: StreamHandle) -> Result<PumpStats, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(socket);
    let (tx, mut rx) = handle.into_split();

    let (sent, received) = tokio::try_join!(
        upstream(&mut reader, &tx),
        downstream(&mut writer, &mut rx)
    )?;
    Ok(PumpStats { sent, received })
}

async fn upstream<R>(reader: &mut R, tx: &StreamSender) -> Result<u64, TunnelError>
where
    R: AsyncRead + Unpin,
{
    let chunk = tx.chunk_size();
    let mut buf = BytesMut::with_capacity(chunk);
    let mut sent = 0u64;
    loop {
        buf.reserve(chunk);
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                trace!("Stream {} local EOF", tx.id());
                tx.close()?;
                return Ok(sent);
            }
            Ok(n) => {
                sent += n as u64;
                tx.send(buf.split().freeze()).await?;
            }
            Err(e) => {
                tx.reset(ErrorReason::GeneralFailure);
                return Err(e.into());
            }
        }
    }
}

async fn downstream<W>(writer: &mut W, rx: &mut StreamReceiver) -> Result<u64, TunnelError>
where
    W: AsyncWrite + Unpin,
{
    let mut received = 0u64;
    loop {
        match rx.recv().await {
            Some(StreamEvent::Data(data)) => {
                if let Err(e) = writer.write_all(&data).await {
                    rx.reset(ErrorReason::Cancelled);
                    return Err(e.into());
                }
                received += data.len() as u64;
                rx.consumed(data.len());
            }
            Some(StreamEvent::Close) => {
                trace!("Stream {} remote EOF", rx.id());
                // The local peer may already be gone; nothing left to deliver
                let _ = writer.shutdown().await;
                return Ok(received);
            }
            Some(StreamEvent::Opened) => {}
            Some(StreamEvent::Error(reason)) => return Err(TunnelError::Rejected(reason)),
            None => return Err(TunnelError::Unavailable),
        }
    }
}
