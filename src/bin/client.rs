//! Bridge Tunnel Client
//!
//! Runs a local SOCKS5 proxy and carries every accepted connection to the
//! relay over one multiplexed WebSocket session.

use anyhow::{Context, Result};
use bridge_tunnel::{
    config::{generate_example_config, Config},
    logging::init_logging,
    transport::{connector_for, SessionState},
    TunnelClient,
};
use clap::Parser;
use std::path::Path;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Bridge Tunnel Client - SOCKS5 over a multiplexed WebSocket tunnel
#[derive(Parser, Debug)]
#[command(name = "bridge-client")]
#[command(about = "Bridge Tunnel Client - SOCKS5 over a multiplexed WebSocket tunnel")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Print an example configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Relay endpoint, e.g. wss://relay.example.com/ws (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Local SOCKS5 proxy address (overrides config)
    #[arg(long)]
    socks5: Option<String>,

    /// Skip TLS certificate verification
    #[arg(long)]
    insecure: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        let example = toml::to_string_pretty(&generate_example_config())
            .context("Failed to render example config")?;
        println!("{}", example);
        return Ok(());
    }

    // A missing file means defaults plus flags
    let mut config = if Path::new(&args.config).exists() {
        Config::load(&args.config).context("Failed to load configuration")?
    } else {
        Config::default()
    };
    if let Some(server) = args.server {
        config.client.server = server;
    }
    if let Some(socks5) = args.socks5 {
        config.client.socks5_listen = socks5;
    }
    if args.insecure {
        config.client.insecure = true;
    }

    init_logging(&config.logging, args.log_level.as_deref())
        .context("Failed to initialize logging")?;
    config.validate().context("Invalid configuration")?;

    info!("Bridge Tunnel Client v{}", bridge_tunnel::VERSION);

    let endpoint = config.endpoint().context("Invalid relay endpoint")?;
    let transport = config
        .transport_config(&endpoint)
        .context("Failed to set up TLS")?;
    let connector = connector_for(endpoint, transport).context("Failed to set up transport")?;

    let client = TunnelClient::bind(
        &config.client.socks5_listen,
        connector,
        config.manager_config(),
    )
    .await
    .context("Failed to bind SOCKS5 listener")?;

    let mut status = client.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            if current.state == SessionState::Connected && current.reconnects > 0 {
                warn!(
                    "Tunnel re-established (generation {}, {} reconnects)",
                    current.generation, current.reconnects
                );
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            let _ = shutdown_tx.send(true);
        }
    });

    if let Err(e) = client.run(shutdown_rx).await {
        error!("Tunnel failed: {}", e);
        return Err(e).context("Tunnel failed");
    }

    info!("Client stopped");
    Ok(())
}
