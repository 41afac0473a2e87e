//! USB serial port enumeration and device probing.
//!
//! Only USB-attached ports are probed: opening onboard or Bluetooth serial
//! hardware can hang for a long time and the powerbox is always USB.

use crate::errors::{BridgeError, Result};
use crate::protocol::{BAUD_RATE, CMD_PROBE};
use crate::transport::LinkFactory;
use serde::Serialize;
use serialport::SerialPortType;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(4);
const PROBE_READ_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
    pub manufacturer: Option<String>,
    pub vid_pid: Option<String>,
    pub is_usb: bool,
}

/// Lists all system serial ports for the management API.
pub fn list_ports() -> Result<Vec<PortInfo>> {
    let ports = serialport::available_ports().map_err(|e| BridgeError::Config(e.to_string()))?;

    let mut infos = Vec::with_capacity(ports.len());
    for port in ports {
        let info = match &port.port_type {
            SerialPortType::UsbPort(usb) => {
                let vid_pid = format!("VID:{:04X} PID:{:04X}", usb.vid, usb.pid);
                PortInfo {
                    name: port.port_name,
                    description: usb
                        .product
                        .clone()
                        .unwrap_or_else(|| format!("USB Serial Device - {}", vid_pid)),
                    manufacturer: usb.manufacturer.clone(),
                    vid_pid: Some(vid_pid),
                    is_usb: true,
                }
            }
            SerialPortType::BluetoothPort => PortInfo {
                name: port.port_name,
                description: "Bluetooth Serial Port".to_string(),
                manufacturer: None,
                vid_pid: None,
                is_usb: false,
            },
            SerialPortType::PciPort => PortInfo {
                name: port.port_name,
                description: "PCI Serial Port".to_string(),
                manufacturer: None,
                vid_pid: None,
                is_usb: false,
            },
            SerialPortType::Unknown => PortInfo {
                name: port.port_name,
                description: "Unknown Serial Device".to_string(),
                manufacturer: None,
                vid_pid: None,
                is_usb: false,
            },
        };
        infos.push(info);
    }
    Ok(infos)
}

/// Probes every USB serial port and returns the first one that answers the
/// probe command with a syntactically valid JSON line. Exhausting all
/// candidates is reported as `DeviceNotFound` and retried by the supervisor.
pub async fn find_port(factory: Arc<dyn LinkFactory>) -> Result<String> {
    let ports = list_ports()?;
    if ports.is_empty() {
        return Err(BridgeError::DeviceNotFound);
    }

    info!("Found {} serial ports. Probing for powerbox...", ports.len());
    for port in ports {
        if !port.is_usb {
            debug!("Skipping port {}: not a USB port", port.name);
            continue;
        }
        info!("Probing port: {}", port.name);
        if probe_port(factory.clone(), &port.name, PROBE_TIMEOUT).await {
            return Ok(port.name);
        }
    }
    Err(BridgeError::DeviceNotFound)
}

/// Probes one port inside a supervised task. The outer timeout aborts the
/// task, which drops and thereby closes the port handle even when the probe
/// itself is stuck in open or read.
pub async fn probe_port(
    factory: Arc<dyn LinkFactory>,
    port_name: &str,
    probe_timeout: Duration,
) -> bool {
    let name = port_name.to_string();
    let mut probe_task = tokio::spawn(async move {
        let mut link = match factory.open(&name, BAUD_RATE).await {
            Ok(link) => link,
            Err(e) => {
                warn!("Could not open port {} to probe: {}", name, e);
                return false;
            }
        };

        if let Err(e) = link.write_line(CMD_PROBE).await {
            debug!("Port {}: probe write failed: {}", name, e);
            return false;
        }

        let line = match link.read_line(PROBE_READ_TIMEOUT).await {
            Ok(line) => line,
            Err(e) => {
                debug!("Port {}: probe read failed or timed out: {}", name, e);
                return false;
            }
        };

        // Any parseable JSON is accepted; content is not validated further.
        if serde_json::from_str::<serde_json::Value>(&line).is_ok() {
            info!("Successfully probed port: {}", name);
            true
        } else {
            debug!("Port {}: response was not valid JSON: {}", name, line);
            false
        }
    });

    match timeout(probe_timeout, &mut probe_task).await {
        Ok(Ok(success)) => success,
        Ok(Err(e)) => {
            warn!("Port {}: probe task failed: {}", port_name, e);
            false
        }
        Err(_) => {
            warn!(
                "Port {}: probe timed out after {:?}. Forcing cleanup.",
                port_name, probe_timeout
            );
            probe_task.abort();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{DeviceLink, StreamLink};
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::Instant;

    /// Factory whose links echo a scripted line once, or never answer.
    struct ScriptedFactory {
        reply: Option<&'static str>,
    }

    #[async_trait]
    impl LinkFactory for ScriptedFactory {
        async fn open(&self, _port_name: &str, _baud_rate: u32) -> Result<Box<dyn DeviceLink>> {
            let (client, mut server) = tokio::io::duplex(256);
            if let Some(reply) = self.reply {
                let line = format!("{}\n", reply);
                tokio::spawn(async move {
                    // Swallow the probe command, then answer and keep the
                    // stream open so the read does not EOF early.
                    let mut buf = [0u8; 256];
                    let _ = server.read(&mut buf).await;
                    let _ = server.write_all(line.as_bytes()).await;
                    tokio::time::sleep(Duration::from_secs(30)).await;
                });
            } else {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    drop(server);
                });
            }
            Ok(Box::new(StreamLink::new(client)))
        }
    }

    #[tokio::test]
    async fn probe_accepts_valid_json_reply() {
        let factory = Arc::new(ScriptedFactory {
            reply: Some(r#"{"v":12.1,"i":800}"#),
        });
        assert!(probe_port(factory, "COM9", Duration::from_secs(4)).await);
    }

    #[tokio::test]
    async fn probe_rejects_non_json_reply() {
        let factory = Arc::new(ScriptedFactory {
            reply: Some("powerbox booting..."),
        });
        assert!(!probe_port(factory, "COM9", Duration::from_secs(4)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_terminates_within_timeout_on_silent_port() {
        let factory = Arc::new(ScriptedFactory { reply: None });
        let started = Instant::now();
        let ok = probe_port(factory, "COM9", Duration::from_secs(4)).await;
        assert!(!ok);
        assert!(started.elapsed() <= Duration::from_secs(5));
    }
}
