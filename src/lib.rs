//! # Bridge Tunnel
//!
//! A local SOCKS5 proxy whose connections are carried to a remote relay over
//! one persistent, multiplexed WebSocket (normally over TLS), so the traffic
//! looks like ordinary secure-web browsing.
//!
//! ## Features
//!
//! - **SOCKS5 ingress** (CONNECT, IPv4/IPv6/domain, no authentication)
//! - **Stream multiplexing** with per-stream credit-based flow control
//! - **Session lifecycle**: keepalive, reconnect with exponential backoff,
//!   graceful draining
//! - **Relay** with on-demand outbound dialing and an HTTP liveness endpoint
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Application Layer                   │
//! │        (SOCKS5 ingress / relay dispatcher)           │
//! ├─────────────────────────────────────────────────────┤
//! │                  Multiplexing Layer                  │
//! │     (Stream table, fair scheduling, flow control)    │
//! ├─────────────────────────────────────────────────────┤
//! │                   Session Layer                      │
//! │   (Framing, keepalive, reconnect, generations)       │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │        (WebSocket over TLS, framed TCP)              │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod logging;
pub mod protocol;
pub mod proxy;
pub mod relay;
pub mod transport;
pub mod tunnel;

pub use client::TunnelClient;
pub use config::Config;
pub use relay::RelayServer;

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Relay error: {0}")]
    Relay(#[from] relay::RelayError),

    #[error("Configuration error: {0}")]
    Config(String),
}
