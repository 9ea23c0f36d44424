//! WebSocket transport
//!
//! Every tunnel frame travels as exactly one binary WebSocket message.
//! The client side performs the full handshake (optionally over TLS); the
//! relay side completes an upgrade whose request head was already parsed
//! by the HTTP front.

use super::{
    BoxedStream, Connector, Endpoint, FrameSink, FrameSource, FrameTransport, TransportConfig,
    TransportError,
};
use crate::tunnel::{Frame, TunnelError, FRAME_HEADER_SIZE};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{client_async_with_config, WebSocketStream};
use tracing::debug;

/// WebSocket limits for a given maximum frame payload
pub fn ws_config(max_frame_size: usize) -> WebSocketConfig {
    let max_message = max_frame_size + FRAME_HEADER_SIZE;
    WebSocketConfig::default()
        .max_message_size(Some(max_message))
        .max_frame_size(Some(max_message))
}

struct WsSink {
    inner: SplitSink<WebSocketStream<BoxedStream>, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.inner
            .send(Message::Binary(frame.encode().freeze()))
            .await
            .map_err(TransportError::from)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.inner.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

struct WsSource {
    inner: SplitStream<WebSocketStream<BoxedStream>>,
    max_frame_size: usize,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            let message = match self.inner.next().await {
                None => return Ok(None),
                Some(Err(WsError::ConnectionClosed))
                | Some(Err(WsError::AlreadyClosed))
                | Some(Err(WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake))) => {
                    return Ok(None)
                }
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(message)) => message,
            };

            match message {
                Message::Binary(data) => {
                    return Frame::decode_message(data, self.max_frame_size)
                        .map(Some)
                        .map_err(TransportError::Malformed)
                }
                Message::Close(reason) => {
                    debug!("WebSocket closed by peer: {:?}", reason);
                    return Ok(None);
                }
                Message::Text(_) => {
                    return Err(TransportError::Malformed(TunnelError::InvalidFrame(
                        "Unexpected text message".to_string(),
                    )))
                }
                // Control messages are answered by tungstenite itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }
}

fn into_transport(ws: WebSocketStream<BoxedStream>, max_frame_size: usize) -> FrameTransport {
    let (sink, source) = ws.split();
    FrameTransport::new(
        WsSink { inner: sink },
        WsSource {
            inner: source,
            max_frame_size,
        },
    )
}

/// Complete a server-side upgrade.
///
/// `key` is the client's `Sec-WebSocket-Key`; `leftover` holds any bytes read
/// past the end of the request head.
pub async fn accept_websocket(
    mut stream: BoxedStream,
    key: &[u8],
    leftover: Vec<u8>,
    max_frame_size: usize,
) -> Result<FrameTransport, TransportError> {
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        derive_accept_key(key)
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;

    let ws = WebSocketStream::from_partially_read(
        stream,
        leftover,
        Role::Server,
        Some(ws_config(max_frame_size)),
    )
    .await;
    Ok(into_transport(ws, max_frame_size))
}

/// Connector for `ws://` and `wss://` endpoints
pub struct WsConnector {
    endpoint: Endpoint,
    config: TransportConfig,
}

impl WsConnector {
    /// Create a new WebSocket connector. `wss://` needs a TLS context.
    pub fn new(endpoint: Endpoint, config: TransportConfig) -> Result<Self, TransportError> {
        if endpoint.is_tls() && config.tls.is_none() {
            return Err(TransportError::Tls(format!(
                "{} requires a TLS context",
                endpoint
            )));
        }
        Ok(Self { endpoint, config })
    }

    async fn establish(&self) -> Result<FrameTransport, TransportError> {
        let tcp = TcpStream::connect((self.endpoint.host.as_str(), self.endpoint.port)).await?;
        if self.config.nodelay {
            tcp.set_nodelay(true).ok();
        }

        let stream: BoxedStream = match &self.config.tls {
            Some(tls) if self.endpoint.is_tls() => {
                let name = self
                    .config
                    .server_name
                    .clone()
                    .unwrap_or_else(|| self.endpoint.host.clone());
                let server_name = ServerName::try_from(name.clone())
                    .map_err(|_| TransportError::Tls(format!("Invalid server name: {}", name)))?;
                let tls_stream = TlsConnector::from(tls.clone())
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| TransportError::Tls(e.to_string()))?;
                Box::new(tls_stream)
            }
            _ => Box::new(tcp),
        };

        let (ws, response) = client_async_with_config(
            self.endpoint.url(),
            stream,
            Some(ws_config(self.config.max_frame_size)),
        )
        .await?;

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(TransportError::Handshake(format!(
                "Unexpected status {}",
                response.status()
            )));
        }

        Ok(into_transport(ws, self.config.max_frame_size))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<FrameTransport, TransportError> {
        let timeout = Duration::from_secs(self.config.connect_timeout);
        tokio::time::timeout(timeout, self.establish())
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    fn describe(&self) -> String {
        self.endpoint.to_string()
    }
}
