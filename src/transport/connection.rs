//! Connection management for the tunnel
//!
//! Keeps exactly one transport session alive on the client:
//! - connect with timeout, retry with exponential backoff
//! - hand each established session to the session driver
//! - reconnect when a session dies, fail after too many attempts
//!
//! Every established session gets a new generation. Streams hold the command
//! channel of the generation they were opened on and die with it.

use super::{Connector, TransportError};
use crate::protocol::{ErrorReason, CONNECT_TIMEOUT};
use crate::proxy::Address;
use crate::tunnel::{
    run_session, Backoff, Multiplexer, MuxConfig, Role, SessionConfig, SessionEnd, StreamCommand,
    StreamHandle, TunnelError,
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, info_span, warn, Instrument};

/// Lifecycle state of the client's transport session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not connected
    Disconnected,
    /// Transport connect in progress
    Connecting,
    /// Session established
    Connected,
    /// Shutdown requested, streams finishing
    Draining,
    /// Gave up reconnecting
    Failed,
}

/// Snapshot published on every state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelStatus {
    pub state: SessionState,
    /// Generation of the current or last session (0 before the first)
    pub generation: u64,
    /// Consecutive failed connection attempts
    pub attempt: u32,
    /// Sessions re-established after a loss
    pub reconnects: u64,
}

impl Default for TunnelStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Disconnected,
            generation: 0,
            attempt: 0,
            reconnects: 0,
        }
    }
}

/// Command channel of one live session generation
#[derive(Debug, Clone)]
pub struct SessionLink {
    pub generation: u64,
    commands: mpsc::UnboundedSender<StreamCommand>,
}

/// Session manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub mux: MuxConfig,
    pub session: SessionConfig,
    pub backoff: Backoff,
    /// Failed attempts tolerated after the first one before giving up
    pub max_reconnect_attempts: u32,
    /// How long opening a stream may take, including the relay's dial
    pub open_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            mux: MuxConfig::default(),
            session: SessionConfig::default(),
            backoff: Backoff::new(Duration::from_secs(5), 1.5, Duration::from_secs(300)),
            max_reconnect_attempts: 5,
            open_timeout: Duration::from_secs(CONNECT_TIMEOUT),
        }
    }
}

/// Owns the client's transport session across reconnects
pub struct SessionManager {
    connector: Box<dyn Connector>,
    config: ManagerConfig,
    link_tx: watch::Sender<Option<SessionLink>>,
    status_tx: watch::Sender<TunnelStatus>,
    status: TunnelStatus,
}

impl SessionManager {
    pub fn new(connector: Box<dyn Connector>, config: ManagerConfig) -> Self {
        let (link_tx, _) = watch::channel(None);
        let (status_tx, _) = watch::channel(TunnelStatus::default());
        Self {
            connector,
            config,
            link_tx,
            status_tx,
            status: TunnelStatus::default(),
        }
    }

    /// Handle for opening streams on whatever session is current
    pub fn handle(&self) -> TunnelHandle {
        TunnelHandle {
            link: self.link_tx.subscribe(),
            status: self.status_tx.subscribe(),
            open_timeout: self.config.open_timeout,
        }
    }

    /// Subscribe to status changes
    pub fn status(&self) -> watch::Receiver<TunnelStatus> {
        self.status_tx.subscribe()
    }

    fn set_state(&mut self, state: SessionState) {
        self.status.state = state;
        self.status_tx.send_replace(self.status);
    }

    /// Connect and keep reconnecting until shutdown or until attempts run out
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), TransportError> {
        loop {
            if *shutdown.borrow() {
                self.set_state(SessionState::Disconnected);
                return Ok(());
            }

            self.set_state(SessionState::Connecting);
            info!(
                "Connecting to {} (attempt {})",
                self.connector.describe(),
                self.status.attempt + 1
            );

            let connected = tokio::select! {
                result = self.connector.connect() => Some(result),
                _ = wait_for_shutdown(&mut shutdown) => None,
            };

            let transport = match connected {
                None => {
                    self.set_state(SessionState::Disconnected);
                    return Ok(());
                }
                Some(Ok(transport)) => transport,
                Some(Err(e)) => {
                    self.status.attempt += 1;
                    if self.status.attempt > self.config.max_reconnect_attempts {
                        error!(
                            "Giving up on {} after {} attempts: {}",
                            self.connector.describe(),
                            self.status.attempt,
                            e
                        );
                        self.set_state(SessionState::Failed);
                        return Err(TransportError::RetriesExhausted(self.status.attempt));
                    }

                    let delay = self.config.backoff.delay(self.status.attempt - 1);
                    warn!(
                        "Connection failed: {} (attempt {}/{}), retrying in {:?}",
                        e,
                        self.status.attempt,
                        self.config.max_reconnect_attempts + 1,
                        delay
                    );
                    self.set_state(SessionState::Disconnected);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = wait_for_shutdown(&mut shutdown) => return Ok(()),
                    }
                }
            };

            self.status.attempt = 0;
            if self.status.generation > 0 {
                self.status.reconnects += 1;
            }
            self.status.generation += 1;
            let generation = self.status.generation;

            let (mux, commands) = Multiplexer::new(Role::Client, self.config.mux.clone());
            self.link_tx.send_replace(Some(SessionLink {
                generation,
                commands: mux.command_sender(),
            }));
            self.set_state(SessionState::Connected);
            info!("Tunnel connected (generation {})", generation);

            let session = run_session(
                transport,
                mux,
                commands,
                self.config.session.clone(),
                shutdown.clone(),
                |_| {},
            )
            .instrument(info_span!("session", generation));
            tokio::pin!(session);

            let mut draining = false;
            let result = loop {
                tokio::select! {
                    result = &mut session => break result,
                    _ = wait_for_shutdown(&mut shutdown), if !draining => {
                        draining = true;
                        self.link_tx.send_replace(None);
                        self.set_state(SessionState::Draining);
                    }
                }
            };
            self.link_tx.send_replace(None);

            match result {
                Ok(SessionEnd::Drained) => {
                    info!("Tunnel drained (generation {})", generation);
                }
                Ok(SessionEnd::PeerClosed) => {
                    warn!("Relay closed session {}", generation);
                }
                Err(e) => {
                    warn!("Session {} lost: {}", generation, e);
                }
            }
            self.set_state(SessionState::Disconnected);

            if draining || *shutdown.borrow() {
                return Ok(());
            }
            info!("Reconnecting");
        }
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender counts as a shutdown request
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Cloneable client-side entry point to the tunnel
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    link: watch::Receiver<Option<SessionLink>>,
    status: watch::Receiver<TunnelStatus>,
    open_timeout: Duration,
}

impl TunnelHandle {
    /// Current status snapshot
    pub fn status(&self) -> TunnelStatus {
        *self.status.borrow()
    }

    /// Generation of the live session, if any
    pub fn generation(&self) -> Option<u64> {
        self.link.borrow().as_ref().map(|link| link.generation)
    }

    /// Wait until a session is connected
    pub async fn wait_connected(&self) -> Result<u64, TunnelError> {
        let mut link = self.link.clone();
        let current = link
            .wait_for(|link| link.is_some())
            .await
            .map_err(|_| TunnelError::Unavailable)?
            .as_ref()
            .map(|link| link.generation);
        current.ok_or(TunnelError::Unavailable)
    }

    /// Open a stream and wait for the relay to confirm it.
    ///
    /// Waits for a session if the tunnel is reconnecting. The whole operation
    /// is bounded by the open timeout.
    pub async fn open_stream(&self, destination: Address) -> Result<StreamHandle, TunnelError> {
        match tokio::time::timeout(self.open_timeout, self.open_inner(destination)).await {
            Ok(result) => result,
            Err(_) => Err(TunnelError::Rejected(ErrorReason::TimedOut)),
        }
    }

    async fn open_inner(&self, destination: Address) -> Result<StreamHandle, TunnelError> {
        let mut link = self.link.clone();
        let current = link
            .wait_for(|link| link.is_some())
            .await
            .map_err(|_| TunnelError::Unavailable)?
            .clone();
        let Some(current) = current else {
            return Err(TunnelError::Unavailable);
        };

        let (reply, response) = oneshot::channel();
        current
            .commands
            .send(StreamCommand::Open { destination, reply })
            .map_err(|_| TunnelError::Unavailable)?;
        let mut handle = response.await.map_err(|_| TunnelError::Unavailable)??;
        handle.wait_open().await?;
        Ok(handle)
    }
}
