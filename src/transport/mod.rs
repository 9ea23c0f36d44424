//! Transport layer implementations
//!
//! Provides the pluggable carriers a tunnel session runs over:
//! - WebSocket, plain or over TLS (one frame per binary message)
//! - Raw byte stream with length-prefixed framing (for testing)
//!
//! plus the session manager that keeps one transport connected.

mod connection;
mod tcp;
mod tls;
mod websocket;

pub use connection::{
    ManagerConfig, SessionLink, SessionManager, SessionState, TunnelHandle, TunnelStatus,
};
pub use tcp::{framed, TcpConnector};
pub use tls::{build_client_config, build_server_acceptor, load_certs, load_private_key};
pub use websocket::{accept_websocket, ws_config, WsConnector};

use crate::tunnel::{Frame, TunnelError};
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite;
use url::Url;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Malformed frame: {0}")]
    Malformed(#[from] TunnelError),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,

    #[error("Gave up after {0} connection attempts")]
    RetriesExhausted(u32),
}

/// Any bidirectional byte stream a transport can run over
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Write half of a connected transport
#[async_trait]
pub trait FrameSink: Send {
    /// Send one frame
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Close the connection gracefully
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a connected transport
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next frame; `None` once the peer closed cleanly
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;
}

/// A connected transport, already split into halves
pub struct FrameTransport {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

impl FrameTransport {
    pub fn new(sink: impl FrameSink + 'static, source: impl FrameSource + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            source: Box::new(source),
        }
    }
}

/// Establishes new transport connections to one relay
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a fresh connection
    async fn connect(&self) -> Result<FrameTransport, TransportError>;

    /// Human-readable target, for logs
    fn describe(&self) -> String;
}

/// Transport URI scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// WebSocket over TLS
    Wss,
    /// Plain WebSocket
    Ws,
    /// Raw framed TCP
    Tcp,
}

/// A parsed transport endpoint (`wss://host[:port]/path`, `ws://...`, `tcp://host:port`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
    url: Url,
}

impl Endpoint {
    pub fn parse(input: &str) -> Result<Self, TransportError> {
        let url = Url::parse(input)
            .map_err(|e| TransportError::InvalidEndpoint(format!("{}: {}", input, e)))?;

        let scheme = match url.scheme() {
            "wss" => Scheme::Wss,
            "ws" => Scheme::Ws,
            "tcp" => Scheme::Tcp,
            other => {
                return Err(TransportError::InvalidEndpoint(format!(
                    "Unsupported scheme: {}",
                    other
                )))
            }
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TransportError::InvalidEndpoint(format!("Missing host: {}", input)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let port = url
            .port_or_known_default()
            .ok_or_else(|| TransportError::InvalidEndpoint(format!("Missing port: {}", input)))?;

        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        Ok(Self {
            scheme,
            host,
            port,
            path,
            url,
        })
    }

    /// Whether the endpoint needs TLS
    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::Wss
    }

    /// Full URL as used for the WebSocket handshake
    pub fn url(&self) -> &str {
        self.url.as_str()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout in seconds (TCP, TLS and upgrade together)
    pub connect_timeout: u64,
    /// Maximum frame payload accepted from the peer
    pub max_frame_size: usize,
    /// Disable Nagle on the underlying socket
    pub nodelay: bool,
    /// TLS client context, required for `wss://`
    pub tls: Option<Arc<rustls::ClientConfig>>,
    /// Override for the TLS server name
    pub server_name: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: crate::protocol::CONNECT_TIMEOUT,
            max_frame_size: crate::protocol::DEFAULT_MAX_FRAME_SIZE,
            nodelay: true,
            tls: None,
            server_name: None,
        }
    }
}

/// Build the connector matching an endpoint's scheme
pub fn connector_for(
    endpoint: Endpoint,
    config: TransportConfig,
) -> Result<Box<dyn Connector>, TransportError> {
    match endpoint.scheme {
        Scheme::Wss | Scheme::Ws => Ok(Box::new(WsConnector::new(endpoint, config)?)),
        Scheme::Tcp => Ok(Box::new(TcpConnector::new(endpoint, config))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wss_endpoint() {
        let ep = Endpoint::parse("wss://relay.example.com/ws").unwrap();
        assert_eq!(ep.scheme, Scheme::Wss);
        assert_eq!(ep.host, "relay.example.com");
        assert_eq!(ep.port, 443);
        assert_eq!(ep.path, "/ws");
        assert!(ep.is_tls());
    }

    #[test]
    fn test_parse_ipv6_and_explicit_port() {
        let ep = Endpoint::parse("ws://[::1]:8080/tunnel?x=1").unwrap();
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.port, 8080);
        assert_eq!(ep.path, "/tunnel?x=1");
        assert!(!ep.is_tls());
    }

    #[test]
    fn test_parse_tcp_requires_port() {
        let ep = Endpoint::parse("tcp://127.0.0.1:9000").unwrap();
        assert_eq!(ep.scheme, Scheme::Tcp);
        assert_eq!(ep.port, 9000);
        assert!(Endpoint::parse("tcp://127.0.0.1").is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        assert!(matches!(
            Endpoint::parse("http://example.com/ws"),
            Err(TransportError::InvalidEndpoint(_))
        ));
        assert!(Endpoint::parse("not a url").is_err());
    }
}
