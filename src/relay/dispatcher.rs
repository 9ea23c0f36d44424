//! Relay dispatcher
//!
//! Serves one stream opened by the client: dial the destination, acknowledge
//! or refuse the open, then relay bytes until both directions are closed.

use crate::protocol::ErrorReason;
use crate::proxy::Address;
use crate::tunnel::{pump, PumpStats, StreamHandle, TunnelError};
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Connect to a destination, mapping failures to wire reasons
pub async fn dial(destination: &Address, timeout: Duration) -> Result<TcpStream, ErrorReason> {
    match tokio::time::timeout(timeout, connect(destination)).await {
        Ok(result) => result,
        Err(_) => Err(ErrorReason::TimedOut),
    }
}

async fn connect(destination: &Address) -> Result<TcpStream, ErrorReason> {
    let host = destination.host();
    let addrs: Vec<_> = tokio::net::lookup_host((host.as_str(), destination.port()))
        .await
        .map_err(|e| {
            debug!("Resolving {} failed: {}", host, e);
            ErrorReason::HostUnreachable
        })?
        .collect();
    if addrs.is_empty() {
        return Err(ErrorReason::HostUnreachable);
    }

    let mut last_error: Option<io::Error> = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                // Disable Nagle's algorithm on destination connection too
                stream.set_nodelay(true).ok();
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error
        .map(|e| ErrorReason::from_io_error(&e))
        .unwrap_or(ErrorReason::HostUnreachable))
}

/// Serve one client-opened stream to completion
pub async fn serve_stream(
    handle: StreamHandle,
    dial_timeout: Duration,
) -> Result<PumpStats, TunnelError> {
    let stream_id = handle.id();
    let destination = handle.destination().clone();

    if let Err(e) = destination.validate() {
        debug!("Stream {} refused: {}", stream_id, e);
        handle.reject(ErrorReason::InvalidDestination);
        return Err(TunnelError::Rejected(ErrorReason::InvalidDestination));
    }

    let target = match dial(&destination, dial_timeout).await {
        Ok(target) => target,
        Err(reason) => {
            info!(
                "Stream {} failed to connect to {}: {}",
                stream_id, destination, reason
            );
            handle.reject(reason);
            return Err(TunnelError::Rejected(reason));
        }
    };

    info!("Stream {} connected to {}", stream_id, destination);
    handle.accept()?;

    let stats = pump(target, handle).await?;
    debug!(
        "Stream {} finished: {} bytes up, {} bytes down",
        stream_id, stats.received, stats.sent
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{Frame, FrameType, Multiplexer, MuxConfig, Role};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = dial(&Address::Ipv4([127, 0, 0, 1], port), Duration::from_secs(2)).await;
        assert_eq!(result.err(), Some(ErrorReason::ConnectionRefused));
    }

    #[tokio::test]
    async fn test_dial_unresolvable_host() {
        let destination = Address::Domain("does-not-exist.invalid".to_string(), 80);
        let result = dial(&destination, Duration::from_secs(5)).await;
        assert!(matches!(
            result.err(),
            Some(ErrorReason::HostUnreachable) | Some(ErrorReason::TimedOut)
        ));
    }

    #[tokio::test]
    async fn test_invalid_destination_is_rejected() {
        let (mut mux, mut commands) = Multiplexer::new(Role::Relay, MuxConfig::default());
        let destination = Address::Domain(String::new(), 80);
        let handle = mux
            .handle_frame(Frame::open(1, destination.encode()))
            .unwrap()
            .unwrap();

        let result = serve_stream(handle, Duration::from_secs(1)).await;
        assert!(matches!(
            result,
            Err(TunnelError::Rejected(ErrorReason::InvalidDestination))
        ));

        while let Ok(cmd) = commands.try_recv() {
            mux.handle_command(cmd);
        }
        let frame = mux.next_outbound().unwrap();
        assert_eq!(frame.frame_type, FrameType::Error);
        assert_eq!(frame.stream_id, 1);
        assert_eq!(frame.error_reason().0, ErrorReason::InvalidDestination);
    }

    #[tokio::test]
    async fn test_dial_success_acknowledges_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let target = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"hello").await.unwrap();
            let mut rest = Vec::new();
            socket.read_to_end(&mut rest).await.unwrap();
        });

        let (mut mux, mut commands) = Multiplexer::new(Role::Relay, MuxConfig::default());
        let destination = Address::Ipv4([127, 0, 0, 1], port);
        let handle = mux
            .handle_frame(Frame::open(7, destination.encode()))
            .unwrap()
            .unwrap();
        let served = tokio::spawn(serve_stream(handle, Duration::from_secs(2)));

        // Acknowledgement first, then the destination's greeting
        let mut seen = Vec::new();
        while seen.len() < 2 {
            let cmd = commands.recv().await.unwrap();
            mux.handle_command(cmd);
            while let Some(frame) = mux.next_outbound() {
                seen.push(frame);
            }
        }
        assert_eq!(seen[0], Frame::open_ack(7));
        assert_eq!(seen[1].frame_type, FrameType::Data);
        assert_eq!(&seen[1].payload[..], b"hello");

        // Client closes its side; destination sees EOF and closes too
        mux.handle_frame(Frame::close(7)).unwrap();
        let feed = tokio::spawn(async move {
            while let Some(cmd) = commands.recv().await {
                mux.handle_command(cmd);
                if mux.stream_count() == 0 {
                    break;
                }
            }
            mux
        });

        target.await.unwrap();
        let stats = served.await.unwrap().unwrap();
        assert_eq!(stats.sent, 5);
        feed.abort();
    }
}
