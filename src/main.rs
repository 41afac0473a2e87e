use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

mod alpaca_server;
mod capability_sync;
mod config;
mod discovery_server;
mod errors;
mod port_discovery;
mod protocol;
mod serial_manager;
mod transport;

use crate::alpaca_server::create_alpaca_server;
use crate::config::ConfigStore;
use crate::discovery_server::start_discovery_server;
use crate::serial_manager::{ConnectionEvent, SerialManager};
use crate::transport::SerialLinkFactory;

#[derive(Parser, Debug)]
#[command(name = "powerbox_alpaca_bridge")]
#[command(about = "ASCOM Alpaca bridge for a JSON-over-serial powerbox controller")]
#[command(version)]
struct Args {
    /// Serial port (e.g., COM3, /dev/ttyUSB0, /dev/ttyACM0); overrides the
    /// configured port for this run
    #[arg(short, long)]
    port: Option<String>,

    /// HTTP server bind address (overrides the configured address)
    #[arg(long)]
    bind: Option<String>,

    /// HTTP server port for ASCOM Alpaca (overrides the configured port)
    #[arg(long)]
    http_port: Option<u16>,

    /// Disable the UDP discovery responder
    #[arg(long)]
    no_discovery: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Arc::new(ConfigStore::load_default().context("loading proxy configuration")?);

    // A port given on the command line becomes the configured port, so the
    // connection supervisor targets it on every cycle.
    if let Some(port) = &args.port {
        config
            .update(|c| {
                c.serial_port_name = port.clone();
                c.auto_detect_port = false;
            })
            .await
            .context("persisting serial port override")?;
    }

    let settings = {
        let mut settings = config.get().await;
        if let Some(bind) = &args.bind {
            settings.listen_address = bind.clone();
        }
        if let Some(http_port) = args.http_port {
            settings.network_port = http_port;
        }
        settings
    };

    let log_level = if args.debug {
        "debug".to_string()
    } else {
        settings.log_level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(format!("powerbox_alpaca_bridge={}", log_level))
        .init();

    info!("Starting Powerbox Alpaca Bridge v{}", env!("CARGO_PKG_VERSION"));
    if let Some(port) = &args.port {
        info!("Serial port fixed to {} via command line", port);
    }

    let (manager, mut events) = SerialManager::new(config.clone(), Arc::new(SerialLinkFactory));
    manager.start().await;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Connected => info!("Powerbox connected"),
                ConnectionEvent::Disconnected => error!("Powerbox disconnected"),
            }
        }
    });

    if !args.no_discovery {
        let alpaca_port = settings.network_port;
        tokio::spawn(async move {
            if let Err(e) = start_discovery_server(alpaca_port).await {
                error!("Discovery server failed: {}", e);
            }
        });
    }

    let server_handle = tokio::spawn(create_alpaca_server(
        settings.listen_address.clone(),
        settings.network_port,
        manager.clone(),
        config.clone(),
    ));

    info!(
        "ASCOM Alpaca endpoint: http://{}:{}/api/v1/switch/0/",
        settings.listen_address, settings.network_port
    );
    info!("Press Ctrl+C to stop");

    tokio::select! {
        result = server_handle => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            manager.release_port().await;
        }
    }

    Ok(())
}
