//! Bridge Tunnel Relay
//!
//! Accepts tunnel sessions from clients (WebSocket, optionally over TLS),
//! dials the destinations they ask for and relays the bytes.

use anyhow::{Context, Result};
use bridge_tunnel::{
    config::{generate_example_config, Config},
    logging::init_logging,
    transport::build_server_acceptor,
    RelayServer,
};
use clap::Parser;
use std::path::Path;
use tokio::sync::watch;
use tracing::info;

/// Bridge Tunnel Relay - exit point of the multiplexed WebSocket tunnel
#[derive(Parser, Debug)]
#[command(name = "bridge-relay")]
#[command(about = "Bridge Tunnel Relay - exit point of the multiplexed WebSocket tunnel")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Print an example configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

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

    let mut config = if Path::new(&args.config).exists() {
        Config::load(&args.config).context("Failed to load configuration")?
    } else {
        Config::default()
    };
    if let Some(listen) = args.listen {
        config.relay.listen = listen;
    }

    init_logging(&config.logging, args.log_level.as_deref())
        .context("Failed to initialize logging")?;
    config.validate().context("Invalid configuration")?;

    // Build TLS acceptor if cert/key are configured
    let tls_acceptor = match (&config.relay.tls_cert, &config.relay.tls_key) {
        (Some(cert_path), Some(key_path)) => Some(
            build_server_acceptor(cert_path, key_path)
                .context("Failed to build TLS server config")?,
        ),
        _ => {
            info!("TLS disabled (no tls_cert/tls_key configured)");
            None
        }
    };

    info!("Bridge Tunnel Relay v{}", bridge_tunnel::VERSION);

    let server = RelayServer::bind(&config.relay.listen, config.relay_options(), tls_acceptor)
        .await
        .context("Failed to bind to address")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            let _ = shutdown_tx.send(true);
        }
    });

    server.run(shutdown_rx).await.context("Relay failed")?;
    info!("Relay stopped");
    Ok(())
}
