//! Relay side of the tunnel
//!
//! Accepts transport connections (optionally over TLS), routes the HTTP
//! request by path and runs one tunnel session per upgraded connection.
//! Streams opened by the client are served by the dispatcher.

mod dispatcher;
mod http;

pub use dispatcher::{dial, serve_stream};
pub use http::{
    banner_body, read_request_head, status_body, write_response, RequestHead, MAX_HEAD_SIZE,
};

use crate::protocol::{CONNECT_TIMEOUT, DEFAULT_MAX_FRAME_SIZE, DIAL_TIMEOUT};
use crate::transport::{accept_websocket, framed, BoxedStream, FrameTransport, TransportError};
use crate::tunnel::{
    run_session, KeepaliveMode, Multiplexer, MuxConfig, Role, SessionConfig, SessionEnd,
    StreamHandle,
};
use std::future::Future;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("TLS accept failed: {0}")]
    Tls(String),

    #[error("Handshake not completed within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// How the relay listener speaks to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// HTTP front with WebSocket upgrade
    #[default]
    Websocket,
    /// Length-prefixed frames directly on the stream
    Raw,
}

/// Relay runtime options
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub mode: RelayMode,
    pub ws_path: String,
    pub status_path: String,
    pub max_connections: usize,
    pub max_frame_size: usize,
    pub dial_timeout: Duration,
    /// Bound on the TLS handshake and request head of a new connection
    pub handshake_timeout: Duration,
    pub mux: MuxConfig,
    pub session: SessionConfig,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            mode: RelayMode::Websocket,
            ws_path: "/ws".to_string(),
            status_path: "/status".to_string(),
            max_connections: 1000,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            dial_timeout: Duration::from_secs(DIAL_TIMEOUT),
            handshake_timeout: Duration::from_secs(CONNECT_TIMEOUT),
            mux: MuxConfig::default(),
            session: SessionConfig {
                keepalive: KeepaliveMode::Passive,
                ..SessionConfig::default()
            },
        }
    }
}

/// State shared across connections
struct RelayState {
    options: RelayOptions,
    tls: Option<TlsAcceptor>,
    /// Connection semaphore for limiting concurrent connections
    conn_semaphore: Semaphore,
    /// Live tunnel sessions
    sessions: AtomicUsize,
}

/// Decrements the session count when a session ends
struct SessionGuard(Arc<RelayState>);

impl SessionGuard {
    fn new(state: Arc<RelayState>) -> Self {
        state.sessions.fetch_add(1, Ordering::Relaxed);
        Self(state)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.sessions.fetch_sub(1, Ordering::Relaxed);
    }
}

/// The relay listener
pub struct RelayServer {
    listener: TcpListener,
    state: Arc<RelayState>,
}

impl RelayServer {
    /// Bind the relay listener
    pub async fn bind(
        addr: &str,
        options: RelayOptions,
        tls: Option<TlsAcceptor>,
    ) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr).await?;
        info!(
            "Relay listening on {} ({:?}, TLS {})",
            listener.local_addr()?,
            options.mode,
            if tls.is_some() { "enabled" } else { "disabled" }
        );

        let state = Arc::new(RelayState {
            conn_semaphore: Semaphore::new(options.max_connections),
            options,
            tls,
            sessions: AtomicUsize::new(0),
        });
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Number of live tunnel sessions
    pub fn connections(&self) -> usize {
        self.state.sessions.load(Ordering::Relaxed)
    }

    /// Accept connections until shutdown, then let sessions drain
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), RelayError> {
        let mut tasks = JoinSet::new();
        let conn_shutdown = shutdown.clone();

        loop {
            // Reap finished connection tasks
            while tasks.try_join_next().is_some() {}

            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!("New connection from {}", peer_addr);
                            let state = Arc::clone(&self.state);
                            let shutdown = conn_shutdown.clone();
                            tasks.spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, state, shutdown).await {
                                    debug!("Connection from {} failed: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("Relay shutting down, {} sessions open", self.connections());
                    break;
                }
            }
        }

        drop(self.listener);
        let grace = self.state.options.session.drain_timeout + Duration::from_secs(1);
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Aborting {} connections after drain timeout", tasks.len());
            tasks.abort_all();
        }
        Ok(())
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<RelayState>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), RelayError> {
    let _permit = state
        .conn_semaphore
        .acquire()
        .await
        .map_err(|_| RelayError::BadRequest("relay closed".into()))?;

    // Disable Nagle's algorithm to avoid delays on small frames
    stream.set_nodelay(true)?;

    let options = &state.options;
    let limit = options.handshake_timeout;
    let opened = tokio::time::timeout(limit, open_transport(stream, peer_addr, &state))
        .await
        .map_err(|_| RelayError::HandshakeTimeout(limit))??;
    let Some(transport) = opened else {
        return Ok(());
    };

    let _session = SessionGuard::new(Arc::clone(&state));
    info!("Client connected from {}", peer_addr);
    let result = serve_transport(transport, options, shutdown)
        .instrument(info_span!("relay_session", peer = %peer_addr))
        .await;
    match result {
        Ok(end) => info!("Client {} disconnected ({:?})", peer_addr, end),
        Err(e) => warn!("Session with {} ended: {}", peer_addr, e),
    }
    Ok(())
}

/// TLS handshake and request routing. `None` when the request was answered
/// directly instead of becoming a tunnel session.
async fn open_transport(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: &RelayState,
) -> Result<Option<FrameTransport>, RelayError> {
    let mut stream: BoxedStream = match &state.tls {
        Some(acceptor) => {
            let tls_stream = acceptor
                .accept(stream)
                .await
                .map_err(|e| RelayError::Tls(e.to_string()))?;
            debug!("TLS handshake complete with {}", peer_addr);
            Box::new(tls_stream)
        }
        None => Box::new(stream),
    };

    let options = &state.options;
    if options.mode == RelayMode::Raw {
        return Ok(Some(framed(stream, options.max_frame_size)));
    }

    let (head, leftover) = match read_request_head(&mut stream).await {
        Ok(parsed) => parsed,
        Err(e) => {
            write_response(&mut stream, 400, "Bad Request", "text/plain", "bad request\n")
                .await
                .ok();
            return Err(e);
        }
    };
    debug!("{} {} from {}", head.method, head.path, peer_addr);

    let route = head.route();
    if route == options.status_path && head.method == "GET" {
        let body = status_body(state.sessions.load(Ordering::Relaxed));
        write_response(&mut stream, 200, "OK", "application/json", &body).await?;
        return Ok(None);
    }
    if route != options.ws_path {
        if route == "/" && head.method == "GET" {
            let body = banner_body(&options.ws_path);
            write_response(&mut stream, 200, "OK", "application/json", &body).await?;
        } else {
            write_response(&mut stream, 404, "Not Found", "text/plain", "not found\n").await?;
        }
        return Ok(None);
    }

    let key = match head.websocket_key() {
        Ok(key) => key.to_string(),
        Err(e) => {
            write_response(&mut stream, 400, "Bad Request", "text/plain", "bad request\n")
                .await
                .ok();
            return Err(e);
        }
    };
    let transport = accept_websocket(stream, key.as_bytes(), leftover, options.max_frame_size).await?;
    Ok(Some(transport))
}

/// Run a relay-side tunnel session over an established transport
pub async fn serve_transport(
    transport: FrameTransport,
    options: &RelayOptions,
    shutdown: watch::Receiver<bool>,
) -> crate::Result<SessionEnd> {
    let dial_timeout = options.dial_timeout;
    run_streams(transport, options, shutdown, move |handle| async move {
        let stream_id = handle.id();
        if let Err(e) = serve_stream(handle, dial_timeout).await {
            debug!("Stream {} ended: {}", stream_id, e);
        }
    })
    .await
}

/// How long finished streams get to flush to their destination once the
/// session is over
const STREAM_FLUSH_GRACE: Duration = Duration::from_millis(500);

/// Serve every opened stream on its own task. Stream tasks outlive the
/// session by at most `STREAM_FLUSH_GRACE`; the rest are aborted along with
/// their in-flight dials.
async fn run_streams<F, Fut>(
    transport: FrameTransport,
    options: &RelayOptions,
    shutdown: watch::Receiver<bool>,
    mut serve: F,
) -> crate::Result<SessionEnd>
where
    F: FnMut(StreamHandle) -> Fut + Send,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (mux, commands) = Multiplexer::new(Role::Relay, options.mux.clone());
    let mut streams = JoinSet::new();

    let result = run_session(
        transport,
        mux,
        commands,
        options.session.clone(),
        shutdown,
        |handle| {
            while streams.try_join_next().is_some() {}
            streams.spawn(serve(handle));
        },
    )
    .await;

    let flushed = tokio::time::timeout(STREAM_FLUSH_GRACE, async {
        while streams.join_next().await.is_some() {}
    })
    .await;
    if flushed.is_err() {
        debug!("Aborting {} stream tasks left by the session", streams.len());
        streams.abort_all();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::Address;
    use crate::transport::{
        Endpoint, ManagerConfig, SessionManager, TcpConnector, TransportConfig,
    };
    use crate::tunnel::StreamEvent;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn spawn_relay(options: RelayOptions) -> (SocketAddr, watch::Sender<bool>) {
        let server = RelayServer::bind("127.0.0.1:0", options, None).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(server.run(shutdown_rx));
        (addr, shutdown_tx)
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: relay\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let (addr, _shutdown) = spawn_relay(RelayOptions::default()).await;

        let response = http_get(addr, "/status").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("application/json"));
        let body = response.split("\r\n\r\n").nth(1).unwrap();
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["connections"], 0);
    }

    #[tokio::test]
    async fn test_unknown_path_and_bad_upgrade() {
        let (addr, _shutdown) = spawn_relay(RelayOptions::default()).await;

        assert!(http_get(addr, "/missing").await.starts_with("HTTP/1.1 404"));
        // Tunnel path without upgrade headers
        assert!(http_get(addr, "/ws").await.starts_with("HTTP/1.1 400"));
    }

    #[tokio::test]
    async fn test_root_banner() {
        let (addr, _shutdown) = spawn_relay(RelayOptions::default()).await;

        let response = http_get(addr, "/").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        let body = response.split("\r\n\r\n").nth(1).unwrap();
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["websocket_endpoint"], "/ws");
    }

    #[tokio::test]
    async fn test_silent_connection_is_dropped() {
        let options = RelayOptions {
            max_connections: 1,
            handshake_timeout: Duration::from_millis(200),
            ..RelayOptions::default()
        };
        let (addr, _shutdown) = spawn_relay(options).await;

        // Holds the only connection slot without sending a request
        let mut silent = TcpStream::connect(addr).await.unwrap();
        let mut rest = Vec::new();
        let closed = tokio::time::timeout(Duration::from_secs(2), silent.read_to_end(&mut rest))
            .await
            .expect("relay kept the silent connection open");
        assert_eq!(closed.unwrap(), 0);

        // The slot is free again
        assert!(http_get(addr, "/status").await.starts_with("HTTP/1.1 200 OK"));
    }

    #[tokio::test]
    async fn test_stream_tasks_end_with_session() {
        let (client_io, relay_io) = tokio::io::duplex(64 * 1024);
        let (_keep, shutdown) = watch::channel(false);
        let (alive_tx, mut alive_rx) = tokio::sync::mpsc::unbounded_channel::<()>();

        let relay = tokio::spawn(async move {
            let options = RelayOptions::default();
            run_streams(
                framed(relay_io, DEFAULT_MAX_FRAME_SIZE),
                &options,
                shutdown,
                move |handle| {
                    let alive = alive_tx.clone();
                    async move {
                        // Stands in for a dial that never completes
                        let _handle = handle;
                        alive.send(()).unwrap();
                        std::future::pending::<()>().await;
                    }
                },
            )
            .await
        });

        let mut client = framed(client_io, DEFAULT_MAX_FRAME_SIZE);
        let destination = Address::Ipv4([10, 255, 255, 1], 9);
        client
            .sink
            .send(crate::tunnel::Frame::open(1, destination.encode()))
            .await
            .unwrap();
        assert_eq!(alive_rx.recv().await, Some(()));

        // Session ends; the pending stream task must not outlive it
        drop(client);
        let ended = tokio::time::timeout(Duration::from_secs(3), alive_rx.recv()).await;
        assert_eq!(ended.unwrap(), None);
        let _ = relay.await.unwrap();
    }

    #[tokio::test]
    async fn test_raw_mode_session() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = echo.accept().await.unwrap();
            let (mut r, mut w) = socket.split();
            tokio::io::copy(&mut r, &mut w).await.unwrap();
        });

        let options = RelayOptions {
            mode: RelayMode::Raw,
            ..RelayOptions::default()
        };
        let (addr, _shutdown) = spawn_relay(options).await;

        let endpoint = Endpoint::parse(&format!("tcp://{}", addr)).unwrap();
        let connector = TcpConnector::new(endpoint, TransportConfig::default());
        let manager = SessionManager::new(Box::new(connector), ManagerConfig::default());
        let tunnel = manager.handle();
        let (client_stop, client_shutdown) = watch::channel(false);
        let client = tokio::spawn(manager.run(client_shutdown));

        let handle = tunnel
            .open_stream(Address::Ipv4([127, 0, 0, 1], echo_port))
            .await
            .unwrap();
        let (tx, mut rx) = handle.into_split();
        tx.send(Bytes::from_static(b"through the relay")).await.unwrap();

        let mut echoed = Vec::new();
        while echoed.len() < 17 {
            match rx.recv().await {
                Some(StreamEvent::Data(data)) => {
                    rx.consumed(data.len());
                    echoed.extend_from_slice(&data);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(echoed, b"through the relay");

        tx.close().unwrap();
        assert_eq!(rx.recv().await, Some(StreamEvent::Close));

        client_stop.send(true).unwrap();
        client.await.unwrap().unwrap();
    }
}
