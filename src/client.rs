//! Client orchestrator
//!
//! Runs the local SOCKS5 listener next to the session manager. Every
//! accepted connection opens one tunnel stream; the SOCKS5 reply is sent
//! only once the relay has answered the open.

use crate::proxy::{Reply, Socks5Conn, Socks5Server};
use crate::transport::{Connector, ManagerConfig, SessionManager, TunnelHandle, TunnelStatus};
use crate::tunnel::{pump, PumpStats};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Local proxy plus the tunnel it feeds
pub struct TunnelClient {
    proxy: Socks5Server,
    manager: SessionManager,
}

impl TunnelClient {
    /// Bind the SOCKS5 listener; the tunnel connects once `run` starts
    pub async fn bind(
        socks_addr: &str,
        connector: Box<dyn Connector>,
        config: ManagerConfig,
    ) -> crate::Result<Self> {
        let proxy = Socks5Server::bind(socks_addr).await?;
        Ok(Self {
            proxy,
            manager: SessionManager::new(connector, config),
        })
    }

    /// Address of the SOCKS5 listener
    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.proxy.local_addr()?)
    }

    pub fn tunnel(&self) -> TunnelHandle {
        self.manager.handle()
    }

    /// Subscribe to tunnel status changes
    pub fn status(&self) -> watch::Receiver<TunnelStatus> {
        self.manager.status()
    }

    /// Serve until shutdown. Fails when the tunnel gives up reconnecting.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> crate::Result<()> {
        let tunnel = self.manager.handle();
        let manager = self.manager.run(shutdown.clone());
        tokio::pin!(manager);

        tokio::select! {
            result = &mut manager => return result.map_err(Into::into),
            _ = accept_loop(&self.proxy, tunnel, shutdown) => {}
        }

        // Let the session drain
        manager.await?;
        Ok(())
    }
}

async fn accept_loop(proxy: &Socks5Server, tunnel: TunnelHandle, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = proxy.accept() => match accepted {
                Ok((conn, peer_addr)) => {
                    let tunnel = tunnel.clone();
                    tokio::spawn(async move {
                        match serve_connection(conn, tunnel).await {
                            Ok(stats) => debug!(
                                "SOCKS5 connection from {} done ({} up, {} down)",
                                peer_addr, stats.sent, stats.received
                            ),
                            Err(e) => debug!("SOCKS5 connection from {} failed: {}", peer_addr, e),
                        }
                    });
                }
                Err(e) => warn!("SOCKS5 accept error: {}", e),
            },
            _ = shutdown.wait_for(|stop| *stop) => {
                info!("SOCKS5 listener stopped");
                return;
            }
        }
    }
}

/// Handle one SOCKS5 connection from handshake to the end of relaying
pub async fn serve_connection<S>(
    mut conn: Socks5Conn<S>,
    tunnel: TunnelHandle,
) -> crate::Result<PumpStats>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let destination = conn.handshake().await?;
    debug!("SOCKS5 CONNECT to {} via tunnel", destination);

    let handle = match tunnel.open_stream(destination.clone()).await {
        Ok(handle) => handle,
        Err(e) => {
            info!("Failed to open tunnel stream to {}: {}", destination, e);
            conn.reject(Reply::from(e.reason())).await?;
            return Err(e.into());
        }
    };
    debug!("Tunnel stream {} opened to {}", handle.id(), destination);

    // Dropping the handle on failure resets the stream
    let socket = conn.accept().await?;
    Ok(pump(socket, handle).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
    use crate::relay::{serve_transport, RelayOptions};
    use crate::transport::{framed, FrameTransport, TransportError};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Hands out in-memory transports served by a relay session
    struct InMemoryRelay {
        // Keeps relay sessions from seeing a shutdown
        _keep: watch::Sender<bool>,
        shutdown: watch::Receiver<bool>,
    }

    impl InMemoryRelay {
        fn new() -> Self {
            let (keep, shutdown) = watch::channel(false);
            Self {
                _keep: keep,
                shutdown,
            }
        }
    }

    #[async_trait]
    impl Connector for InMemoryRelay {
        async fn connect(&self) -> Result<FrameTransport, TransportError> {
            let (client, relay) = duplex(256 * 1024);
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                let options = RelayOptions {
                    dial_timeout: Duration::from_secs(2),
                    ..RelayOptions::default()
                };
                let _ = serve_transport(framed(relay, DEFAULT_MAX_FRAME_SIZE), &options, shutdown)
                    .await;
            });
            Ok(framed(client, DEFAULT_MAX_FRAME_SIZE))
        }

        fn describe(&self) -> String {
            "in-memory relay".to_string()
        }
    }

    async fn connected_tunnel() -> (TunnelHandle, watch::Sender<bool>) {
        let manager = SessionManager::new(Box::new(InMemoryRelay::new()), ManagerConfig::default());
        let tunnel = manager.handle();
        let (stop, shutdown) = watch::channel(false);
        tokio::spawn(manager.run(shutdown));
        tunnel.wait_connected().await.unwrap();
        (tunnel, stop)
    }

    fn connect_request(port: u16) -> Vec<u8> {
        let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        request.extend_from_slice(&port.to_be_bytes());
        request
    }

    #[tokio::test]
    async fn test_socks_connection_through_tunnel() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = echo.accept().await.unwrap();
            let (mut r, mut w) = socket.split();
            tokio::io::copy(&mut r, &mut w).await.unwrap();
        });

        let (tunnel, _stop) = connected_tunnel().await;
        let (mut app, local) = duplex(64 * 1024);
        let served = tokio::spawn(serve_connection(Socks5Conn::new(local), tunnel));

        app.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        app.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        app.write_all(&connect_request(port)).await.unwrap();
        let mut reply = [0u8; 10];
        app.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x00);

        app.write_all(b"ping through socks").await.unwrap();
        let mut echoed = [0u8; 18];
        app.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping through socks");

        app.shutdown().await.unwrap();
        let mut rest = Vec::new();
        app.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let stats = served.await.unwrap().unwrap();
        assert_eq!(stats.sent, 18);
        assert_eq!(stats.received, 18);
    }

    #[tokio::test]
    async fn test_refused_destination_maps_to_reply() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let (tunnel, _stop) = connected_tunnel().await;
        let (mut app, local) = duplex(1024);
        let served = tokio::spawn(serve_connection(Socks5Conn::new(local), tunnel));

        app.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        app.read_exact(&mut method).await.unwrap();
        app.write_all(&connect_request(port)).await.unwrap();

        let mut reply = [0u8; 10];
        app.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        assert!(served.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_client_exits_when_relay_unreachable() {
        struct Unreachable;

        #[async_trait]
        impl Connector for Unreachable {
            async fn connect(&self) -> Result<FrameTransport, TransportError> {
                Err(TransportError::ConnectionFailed("refused".to_string()))
            }

            fn describe(&self) -> String {
                "nowhere".to_string()
            }
        }

        let config = ManagerConfig {
            backoff: crate::tunnel::Backoff::new(
                Duration::from_millis(1),
                1.5,
                Duration::from_millis(5),
            ),
            max_reconnect_attempts: 2,
            ..ManagerConfig::default()
        };
        let client = TunnelClient::bind("127.0.0.1:0", Box::new(Unreachable), config)
            .await
            .unwrap();
        let (_stop, shutdown) = watch::channel(false);

        let result = client.run(shutdown).await;
        assert!(matches!(
            result,
            Err(crate::Error::Transport(TransportError::RetriesExhausted(3)))
        ));
    }
}
