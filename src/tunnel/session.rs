//! Session driver: one task per transport connection
//!
//! The driver owns the multiplexer exclusively. A reader task feeds it
//! decoded frames and a writer task is the single serialized writer of the
//! transport; the driver moves frames between them, applies stream commands,
//! runs keepalive and handles draining.

use super::{Multiplexer, StreamCommand, StreamHandle, TunnelError};
use crate::protocol::{ErrorReason, DRAIN_TIMEOUT, KEEPALIVE_INTERVAL, PONG_TIMEOUT};
use crate::transport::{FrameTransport, TransportError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Inbound frames buffered between the reader task and the driver
const READER_QUEUE: usize = 64;

/// Frames buffered between the driver and the writer task
const WRITER_QUEUE: usize = 16;

/// How this end detects a dead peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveMode {
    /// Send PINGs and expect PONGs (client)
    Active,
    /// Expect any inbound traffic, answer PINGs (relay)
    Passive,
}

/// Session timing
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub drain_timeout: Duration,
    pub keepalive: KeepaliveMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(KEEPALIVE_INTERVAL),
            pong_timeout: Duration::from_secs(PONG_TIMEOUT),
            drain_timeout: Duration::from_secs(DRAIN_TIMEOUT),
            keepalive: KeepaliveMode::Active,
        }
    }
}

/// Why a session ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Shutdown was requested and the session drained
    Drained,
    /// The peer closed the transport
    PeerClosed,
}

/// Drive one transport session until it ends.
///
/// `on_open` receives every stream the peer opens. On exit every remaining
/// stream is failed locally, with `ShuttingDown` after a requested shutdown
/// and `TunnelReconnected` otherwise.
pub async fn run_session<F>(
    transport: FrameTransport,
    mut mux: Multiplexer,
    mut commands: mpsc::UnboundedReceiver<StreamCommand>,
    config: SessionConfig,
    mut shutdown: watch::Receiver<bool>,
    mut on_open: F,
) -> crate::Result<SessionEnd>
where
    F: FnMut(StreamHandle) + Send,
{
    let FrameTransport {
        mut sink,
        mut source,
    } = transport;

    let (inbound_tx, mut inbound_rx) = mpsc::channel(READER_QUEUE);
    let reader = tokio::spawn(async move {
        loop {
            let item = source.recv().await;
            let last = !matches!(item, Ok(Some(_)));
            if inbound_tx.send(item).await.is_err() || last {
                break;
            }
        }
    });

    let (outbound_tx, mut outbound_rx) = mpsc::channel(WRITER_QUEUE);
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            sink.send(frame).await?;
        }
        sink.close().await
    });

    let mut ticker = tokio::time::interval_at(
        Instant::now() + config.ping_interval,
        config.ping_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut drain_deadline: Option<Instant> = None;
    if *shutdown.borrow() {
        mux.begin_drain();
        drain_deadline = Some(Instant::now() + config.drain_timeout);
    }

    let result: crate::Result<SessionEnd> = loop {
        if drain_deadline.is_some() && mux.is_idle() {
            debug!("Session drained");
            break Ok(SessionEnd::Drained);
        }

        tokio::select! {
            permit = outbound_tx.reserve(), if mux.has_outbound() => {
                let Ok(permit) = permit else {
                    break Err(TransportError::Closed.into());
                };
                if let Some(frame) = mux.next_outbound() {
                    trace!(
                        "-> {:?} stream={} len={}",
                        frame.frame_type,
                        frame.stream_id,
                        frame.payload.len()
                    );
                    permit.send(frame);
                }
            }
            Some(cmd) = commands.recv() => {
                mux.handle_command(cmd);
            }
            inbound = inbound_rx.recv() => match inbound {
                Some(Ok(Some(frame))) => match mux.handle_frame(frame) {
                    Ok(Some(handle)) => on_open(handle),
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Protocol violation from peer: {}", e);
                        break Err(e.into());
                    }
                },
                Some(Ok(None)) | None => {
                    info!("Transport closed by peer");
                    break Ok(SessionEnd::PeerClosed);
                }
                Some(Err(e)) => break Err(e.into()),
            },
            _ = ticker.tick() => {
                match config.keepalive {
                    KeepaliveMode::Active => {
                        if mux.last_pong_at().elapsed() > config.pong_timeout {
                            break Err(TunnelError::KeepaliveTimeout(config.pong_timeout).into());
                        }
                        mux.queue_ping();
                    }
                    KeepaliveMode::Passive => {
                        if mux.last_inbound_at().elapsed() > config.pong_timeout {
                            break Err(TunnelError::KeepaliveTimeout(config.pong_timeout).into());
                        }
                    }
                }
            }
            changed = shutdown.changed(), if drain_deadline.is_none() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Draining session with {} open streams", mux.stream_count());
                    mux.begin_drain();
                    drain_deadline = Some(Instant::now() + config.drain_timeout);
                }
            }
            _ = tokio::time::sleep_until(drain_deadline.unwrap_or_else(Instant::now)),
                if drain_deadline.is_some() => {
                warn!("Drain timeout with {} streams still open", mux.stream_count());
                break Ok(SessionEnd::Drained);
            }
        }
    };

    let reason = if mux.is_draining() {
        ErrorReason::ShuttingDown
    } else {
        ErrorReason::TunnelReconnected
    };
    let failed = mux.fail_all(reason);
    if failed > 0 {
        warn!("Force-closed {} streams ({})", failed, reason);
    }

    reader.abort();
    drop(outbound_tx);
    if matches!(result, Ok(SessionEnd::Drained)) {
        // Let the writer flush and close the transport
        match tokio::time::timeout(config.drain_timeout, &mut writer).await {
            Ok(Ok(Err(e))) => debug!("Transport close failed: {}", e),
            Ok(_) => {}
            Err(_) => warn!("Transport close timed out"),
        }
    }
    writer.abort();

    result
}
