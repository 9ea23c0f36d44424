//! Protocol definitions and constants

use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid window update payload ({0} bytes)")]
    InvalidWindowUpdate(usize),

    #[error("Invalid keepalive payload ({0} bytes)")]
    InvalidKeepalive(usize),
}

/// Default maximum frame payload (1 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Default per-stream receive window (256 KiB)
pub const DEFAULT_STREAM_WINDOW: u32 = 256 * 1024;

/// Default size of a single local read turned into a DATA frame
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Default maximum number of live streams per session
pub const DEFAULT_MAX_STREAMS: usize = 1024;

/// Keepalive interval in seconds
pub const KEEPALIVE_INTERVAL: u64 = 30;

/// Pong grace window in seconds (3x the keepalive interval)
pub const PONG_TIMEOUT: u64 = 90;

/// Transport connect timeout in seconds
pub const CONNECT_TIMEOUT: u64 = 30;

/// Relay-side destination dial timeout in seconds
pub const DIAL_TIMEOUT: u64 = 10;

/// Grace period for streams while a session drains, in seconds
pub const DRAIN_TIMEOUT: u64 = 5;

/// Machine-readable reason carried by an ERROR frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorReason {
    GeneralFailure = 0x01,
    ConnectionRefused = 0x02,
    HostUnreachable = 0x03,
    NetworkUnreachable = 0x04,
    TimedOut = 0x05,
    InvalidDestination = 0x06,
    TooManyStreams = 0x07,
    FlowControl = 0x08,
    ProtocolViolation = 0x09,
    TunnelReconnected = 0x0A,
    ShuttingDown = 0x0B,
    Cancelled = 0x0C,
}

impl ErrorReason {
    /// Decode a reason code. Unknown codes degrade to `GeneralFailure`.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x02 => ErrorReason::ConnectionRefused,
            0x03 => ErrorReason::HostUnreachable,
            0x04 => ErrorReason::NetworkUnreachable,
            0x05 => ErrorReason::TimedOut,
            0x06 => ErrorReason::InvalidDestination,
            0x07 => ErrorReason::TooManyStreams,
            0x08 => ErrorReason::FlowControl,
            0x09 => ErrorReason::ProtocolViolation,
            0x0A => ErrorReason::TunnelReconnected,
            0x0B => ErrorReason::ShuttingDown,
            0x0C => ErrorReason::Cancelled,
            _ => ErrorReason::GeneralFailure,
        }
    }

    /// Wire code
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Map a failed destination dial to a reason
    pub fn from_io_error(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::ConnectionRefused => ErrorReason::ConnectionRefused,
            ErrorKind::TimedOut => ErrorReason::TimedOut,
            ErrorKind::HostUnreachable => ErrorReason::HostUnreachable,
            ErrorKind::NetworkUnreachable | ErrorKind::AddrNotAvailable => {
                ErrorReason::NetworkUnreachable
            }
            // getaddrinfo failures surface as uncategorized errors
            ErrorKind::NotFound | ErrorKind::Other => ErrorReason::HostUnreachable,
            _ => ErrorReason::GeneralFailure,
        }
    }
}

impl std::fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ErrorReason::GeneralFailure => "general failure",
            ErrorReason::ConnectionRefused => "connection refused",
            ErrorReason::HostUnreachable => "host unreachable",
            ErrorReason::NetworkUnreachable => "network unreachable",
            ErrorReason::TimedOut => "timed out",
            ErrorReason::InvalidDestination => "invalid destination",
            ErrorReason::TooManyStreams => "too many streams",
            ErrorReason::FlowControl => "flow control violation",
            ErrorReason::ProtocolViolation => "protocol violation",
            ErrorReason::TunnelReconnected => "tunnel reconnected, stream lost",
            ErrorReason::ShuttingDown => "shutting down",
            ErrorReason::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}
