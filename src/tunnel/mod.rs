//! Tunnel layer - multiplexed streams over one transport connection
//!
//! Provides:
//! - Frame encoding/decoding
//! - Stream table and per-stream state
//! - Stream multiplexing with credit-based backpressure
//! - The per-connection session driver and the socket pump

mod backoff;
mod frame;
mod multiplexer;
mod pump;
mod session;
mod stream;

pub use backoff::Backoff;
pub use frame::{Frame, FrameCodec, FrameType, FRAME_HEADER_SIZE};
pub use multiplexer::{
    Multiplexer, MuxConfig, Role, StreamCommand, StreamEvent, StreamHandle, StreamReceiver,
    StreamSender,
};
pub use pump::{pump, PumpStats};
pub use session::{run_session, KeepaliveMode, SessionConfig, SessionEnd};
pub use stream::{Slot, StreamState, StreamTable, TunnelStream};

use crate::protocol::{ErrorReason, ProtocolError};
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Peer exceeded the stream receive window")]
    FlowControlViolation,

    #[error("Stream ID space exhausted")]
    StreamIdsExhausted,

    #[error("Too many streams ({0})")]
    TooManyStreams(usize),

    #[error("Tunnel is shutting down")]
    ShuttingDown,

    #[error("Tunnel unavailable")]
    Unavailable,

    #[error("Stream rejected: {0}")]
    Rejected(ErrorReason),

    #[error("Keepalive timeout after {0:?}")]
    KeepaliveTimeout(std::time::Duration),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Reason to report to the peer or the local caller for this error
    pub fn reason(&self) -> ErrorReason {
        match self {
            TunnelError::Rejected(reason) => *reason,
            TunnelError::TooManyStreams(_) => ErrorReason::TooManyStreams,
            TunnelError::ShuttingDown => ErrorReason::ShuttingDown,
            TunnelError::FlowControlViolation => ErrorReason::FlowControl,
            TunnelError::KeepaliveTimeout(_) => ErrorReason::TunnelReconnected,
            TunnelError::FrameTooLarge(..)
            | TunnelError::InvalidFrame(_)
            | TunnelError::Protocol(_) => ErrorReason::ProtocolViolation,
            _ => ErrorReason::GeneralFailure,
        }
    }
}
