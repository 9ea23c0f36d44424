//! Configuration management

use crate::protocol::{
    CONNECT_TIMEOUT, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_STREAMS,
    DEFAULT_STREAM_WINDOW, DIAL_TIMEOUT, DRAIN_TIMEOUT, KEEPALIVE_INTERVAL, PONG_TIMEOUT,
};
use crate::relay::{RelayMode, RelayOptions};
use crate::transport::{build_client_config, Endpoint, ManagerConfig, TransportConfig};
use crate::tunnel::{Backoff, KeepaliveMode, MuxConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Client configuration
    pub client: ClientConfig,
    /// Relay configuration
    pub relay: RelayConfig,
    /// Tunnel protocol tuning, shared by both ends
    pub tunnel: TunnelConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.tunnel.validate()?;

        if self.relay.tls_cert.is_some() != self.relay.tls_key.is_some() {
            return Err(invalid("relay.tls_cert and relay.tls_key must be set together"));
        }
        if self.relay.max_connections == 0 {
            return Err(invalid("relay.max_connections must be at least 1"));
        }
        for (name, path) in [
            ("relay.ws_path", &self.relay.ws_path),
            ("relay.status_path", &self.relay.status_path),
        ] {
            if !path.starts_with('/') {
                return Err(invalid(format!("{} must start with '/'", name)));
            }
        }
        if self.relay.ws_path == self.relay.status_path {
            return Err(invalid("relay.ws_path and relay.status_path must differ"));
        }
        Ok(())
    }

    /// Parse the relay endpoint the client connects to
    pub fn endpoint(&self) -> Result<Endpoint, crate::Error> {
        Ok(Endpoint::parse(&self.client.server)?)
    }

    /// Transport settings for the client, including the TLS context for `wss://`
    pub fn transport_config(&self, endpoint: &Endpoint) -> Result<TransportConfig, crate::Error> {
        let tls = if endpoint.is_tls() {
            let tls = build_client_config(self.client.insecure, self.client.ca_cert.as_deref())?;
            Some(Arc::new(tls))
        } else {
            None
        };

        Ok(TransportConfig {
            connect_timeout: self.tunnel.connect_timeout_secs,
            max_frame_size: self.tunnel.max_frame_size,
            nodelay: true,
            tls,
            server_name: self.client.tls_sni.clone(),
        })
    }

    /// Session manager settings for the client
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            mux: self.tunnel.mux_config(),
            session: self.tunnel.session_config(KeepaliveMode::Active),
            backoff: self.tunnel.backoff(),
            max_reconnect_attempts: self.tunnel.max_reconnect_attempts,
            open_timeout: Duration::from_secs(self.tunnel.connect_timeout_secs),
        }
    }

    /// Runtime options for the relay
    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            mode: self.relay.transport,
            ws_path: self.relay.ws_path.clone(),
            status_path: self.relay.status_path.clone(),
            max_connections: self.relay.max_connections,
            max_frame_size: self.tunnel.max_frame_size,
            dial_timeout: Duration::from_secs(self.tunnel.dial_timeout_secs),
            handshake_timeout: Duration::from_secs(self.tunnel.connect_timeout_secs),
            mux: self.tunnel.mux_config(),
            session: self.tunnel.session_config(KeepaliveMode::Passive),
        }
    }
}

fn invalid(message: impl Into<String>) -> crate::Error {
    crate::Error::Config(message.into())
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay endpoint (`wss://`, `ws://` or `tcp://`)
    pub server: String,
    /// Local SOCKS5 proxy address
    pub socks5_listen: String,
    /// Skip certificate and hostname verification
    pub insecure: bool,
    /// Extra CA certificate to trust (PEM)
    pub ca_cert: Option<PathBuf>,
    /// TLS server name override
    pub tls_sni: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "wss://127.0.0.1:8443/ws".to_string(),
            socks5_listen: "127.0.0.1:1080".to_string(),
            insecure: false,
            ca_cert: None,
            tls_sni: None,
        }
    }
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Listen address
    pub listen: String,
    /// TLS certificate path (PEM)
    pub tls_cert: Option<PathBuf>,
    /// TLS key path (PEM)
    pub tls_key: Option<PathBuf>,
    /// Path that accepts the tunnel upgrade
    pub ws_path: String,
    /// Path of the JSON liveness endpoint
    pub status_path: String,
    /// Listener protocol
    pub transport: RelayMode,
    /// Maximum concurrent connections
    pub max_connections: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8443".to_string(),
            tls_cert: None,
            tls_key: None,
            ws_path: "/ws".to_string(),
            status_path: "/status".to_string(),
            transport: RelayMode::Websocket,
            max_connections: 1000,
        }
    }
}

/// Tunnel protocol tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub max_frame_size: usize,
    /// Per-stream window; both ends must agree
    pub stream_window: u32,
    pub chunk_size: usize,
    pub max_streams: usize,
    pub ping_interval_secs: u64,
    pub pong_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub dial_timeout_secs: u64,
    pub drain_timeout_secs: u64,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_secs: u64,
    /// Failed attempts tolerated after the first before giving up
    pub max_reconnect_attempts: u32,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            stream_window: DEFAULT_STREAM_WINDOW,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_streams: DEFAULT_MAX_STREAMS,
            ping_interval_secs: KEEPALIVE_INTERVAL,
            pong_timeout_secs: PONG_TIMEOUT,
            connect_timeout_secs: CONNECT_TIMEOUT,
            dial_timeout_secs: DIAL_TIMEOUT,
            drain_timeout_secs: DRAIN_TIMEOUT,
            initial_backoff_ms: 5000,
            backoff_multiplier: 1.5,
            max_backoff_secs: 300,
            max_reconnect_attempts: 5,
        }
    }
}

impl TunnelConfig {
    fn validate(&self) -> Result<(), crate::Error> {
        if self.max_frame_size == 0 || self.stream_window == 0 || self.chunk_size == 0 {
            return Err(invalid("frame size, window and chunk size must be non-zero"));
        }
        if self.chunk_size > self.max_frame_size {
            return Err(invalid("tunnel.chunk_size exceeds tunnel.max_frame_size"));
        }
        if self.chunk_size > (self.stream_window / 2) as usize {
            return Err(invalid("tunnel.chunk_size exceeds half of tunnel.stream_window"));
        }
        if self.max_streams == 0 {
            return Err(invalid("tunnel.max_streams must be at least 1"));
        }
        if self.ping_interval_secs == 0
            || self.pong_timeout_secs == 0
            || self.connect_timeout_secs == 0
            || self.dial_timeout_secs == 0
        {
            return Err(invalid("tunnel timeouts and intervals must be non-zero"));
        }
        if self.pong_timeout_secs < self.ping_interval_secs {
            return Err(invalid(
                "tunnel.pong_timeout_secs is shorter than tunnel.ping_interval_secs",
            ));
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(invalid("tunnel.backoff_multiplier must be at least 1.0"));
        }
        if self.initial_backoff_ms > self.max_backoff_secs.saturating_mul(1000) {
            return Err(invalid("tunnel.initial_backoff_ms exceeds tunnel.max_backoff_secs"));
        }
        Ok(())
    }

    pub fn mux_config(&self) -> MuxConfig {
        MuxConfig {
            max_streams: self.max_streams,
            window: self.stream_window,
            max_payload: self.max_frame_size,
            chunk_size: self.chunk_size,
        }
    }

    pub fn session_config(&self, keepalive: KeepaliveMode) -> SessionConfig {
        SessionConfig {
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            pong_timeout: Duration::from_secs(self.pong_timeout_secs),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            keepalive,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.initial_backoff_ms),
            self.backoff_multiplier,
            Duration::from_secs(self.max_backoff_secs),
        )
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,
    /// Log format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        client: ClientConfig {
            server: "wss://relay.example.com:8443/ws".to_string(),
            ..ClientConfig::default()
        },
        relay: RelayConfig {
            tls_cert: Some(PathBuf::from("certs/server.crt")),
            tls_key: Some(PathBuf::from("certs/server.key")),
            ..RelayConfig::default()
        },
        tunnel: TunnelConfig::default(),
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.client.socks5_listen, "127.0.0.1:1080");
        assert_eq!(config.relay.ws_path, "/ws");
        assert_eq!(config.tunnel.stream_window, 256 * 1024);
        assert_eq!(config.tunnel.max_reconnect_attempts, 5);
        generate_example_config().validate().unwrap();
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[client]
server = "ws://127.0.0.1:9000/tunnel"
insecure = true

[relay]
transport = "raw"

[tunnel]
ping_interval_secs = 10
pong_timeout_secs = 30

[logging]
format = "compact"
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.client.server, "ws://127.0.0.1:9000/tunnel");
        assert!(config.client.insecure);
        assert_eq!(config.client.socks5_listen, "127.0.0.1:1080");
        assert_eq!(config.relay.transport, RelayMode::Raw);
        assert_eq!(config.tunnel.ping_interval_secs, 10);
        assert_eq!(config.tunnel.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.logging.format, LogFormat::Compact);

        let manager = config.manager_config();
        assert_eq!(manager.session.ping_interval, Duration::from_secs(10));
        assert_eq!(manager.session.keepalive, KeepaliveMode::Active);
        assert_eq!(config.relay_options().session.keepalive, KeepaliveMode::Passive);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.toml");
        let config = generate_example_config();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.client.server, config.client.server);
        assert_eq!(loaded.relay.tls_key, config.relay.tls_key);
    }

    #[test]
    fn test_load_errors() {
        assert!(Config::load("/nonexistent/config.toml").is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[tunnel]\nmax_streams = \"many\"\n").unwrap();
        assert!(matches!(Config::load(&path), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_inconsistent_values() {
        let mut config = Config::default();
        config.tunnel.chunk_size = config.tunnel.stream_window as usize + 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tunnel.stream_window = 1000;
        config.tunnel.chunk_size = 1000;
        assert!(config.validate().is_err());
        config.tunnel.chunk_size = 500;
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.tunnel.pong_timeout_secs = 5;
        config.tunnel.ping_interval_secs = 30;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tunnel.ping_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tunnel.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.relay.tls_cert = Some(PathBuf::from("cert.pem"));
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.relay.status_path = "/ws".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_transport_config_for_endpoint() {
        let mut config = Config::default();
        config.client.server = "ws://127.0.0.1:9000/ws".to_string();
        let endpoint = config.endpoint().unwrap();
        let transport = config.transport_config(&endpoint).unwrap();
        assert!(transport.tls.is_none());

        config.client.server = "wss://relay.example.com/ws".to_string();
        config.client.tls_sni = Some("cdn.example.com".to_string());
        let endpoint = config.endpoint().unwrap();
        let transport = config.transport_config(&endpoint).unwrap();
        assert!(transport.tls.is_some());
        assert_eq!(transport.server_name.as_deref(), Some("cdn.example.com"));
    }
}
