//! ASCOM Alpaca UDP discovery responder.
//!
//! Listens on the well-known discovery port and answers the discovery magic
//! with the JSON port advertisement, so clients can find the bridge without
//! manual configuration.

use serde_json::json;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, error, info};

const DISCOVERY_PORT: u16 = 32227;
const DISCOVERY_MESSAGE: &str = "alpacadiscovery1";

pub async fn start_discovery_server(
    alpaca_port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let bind_addr = format!("0.0.0.0:{}", DISCOVERY_PORT);
    let socket = UdpSocket::bind(&bind_addr).await?;

    info!(
        "Alpaca discovery listening on UDP {} (advertising port {})",
        bind_addr, alpaca_port
    );

    let mut buf = [0; 1024];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, addr)) => {
                let message = String::from_utf8_lossy(&buf[..len]);
                if message.trim() == DISCOVERY_MESSAGE {
                    respond(&socket, addr, alpaca_port).await;
                } else {
                    debug!("Ignoring non-discovery datagram from {}", addr);
                }
            }
            Err(e) => {
                error!("Discovery socket error: {}", e);
            }
        }
    }
}

async fn respond(socket: &UdpSocket, addr: SocketAddr, alpaca_port: u16) {
    let response = json!({ "AlpacaPort": alpaca_port }).to_string();
    match socket.send_to(response.as_bytes(), addr).await {
        Ok(_) => debug!("Answered discovery request from {}", addr),
        Err(e) => error!("Failed to answer discovery request from {}: {}", addr, e),
    }
}
