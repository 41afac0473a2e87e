//! Proxy configuration, persisted as JSON in the user config directory.
//!
//! Missing fields get per-field defaults on load; a corrupt file is logged
//! and replaced by defaults in memory without touching the file. The only
//! hard failure is being unable to create the config directory at startup.

use crate::errors::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

fn default_auto_detect() -> bool {
    true
}

fn default_listen_address() -> String {
    "127.0.0.1".to_string()
}

fn default_network_port() -> u16 {
    32241
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    #[serde(rename = "serialPortName")]
    pub serial_port_name: String,
    #[serde(rename = "autoDetectPort")]
    pub auto_detect_port: bool,
    #[serde(rename = "listenAddress")]
    pub listen_address: String,
    #[serde(rename = "networkPort")]
    pub network_port: u16,
    #[serde(rename = "logLevel")]
    pub log_level: String,
    /// Custom ASCOM display names keyed by internal switch name.
    #[serde(rename = "switchNames")]
    pub switch_names: HashMap<String, String>,
    /// Expose the lens temperature sensor even when no heater mode needs it.
    #[serde(rename = "alwaysShowLensTemp")]
    pub always_show_lens_temp: bool,
    /// Allow the adjustable voltage output to be driven via Alpaca.
    #[serde(rename = "enableAlpacaVoltageControl")]
    pub enable_alpaca_voltage_control: bool,
    /// Append the master power switch to the switch table.
    #[serde(rename = "enableMasterPower")]
    pub enable_master_power: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            serial_port_name: String::new(),
            auto_detect_port: default_auto_detect(),
            listen_address: default_listen_address(),
            network_port: default_network_port(),
            log_level: default_log_level(),
            switch_names: HashMap::new(),
            always_show_lens_temp: false,
            enable_alpaca_voltage_control: false,
            enable_master_power: false,
        }
    }
}

pub struct ConfigStore {
    path: PathBuf,
    inner: RwLock<ProxyConfig>,
}

impl ConfigStore {
    /// Loads the config from the default location, creating the application
    /// config directory if needed.
    pub fn load_default() -> Result<Self> {
        let base = dirs::config_dir()
            .ok_or_else(|| BridgeError::Config("no user config directory".to_string()))?;
        let app_dir = base.join("powerbox-alpaca-bridge");
        std::fs::create_dir_all(&app_dir).map_err(|e| {
            BridgeError::Config(format!(
                "could not create config directory '{}': {}",
                app_dir.display(),
                e
            ))
        })?;
        Ok(Self::load_from(app_dir.join("proxy_config.json")))
    }

    /// Loads from an explicit path. Missing or corrupt files fall back to
    /// defaults; a missing file is written back so first run leaves a
    /// complete config on disk.
    pub fn load_from(path: PathBuf) -> Self {
        let config = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<ProxyConfig>(&raw) {
                Ok(mut config) => {
                    // An explicitly configured port with auto-detect off but
                    // no port name would never connect; fall back to scanning.
                    if !config.auto_detect_port && config.serial_port_name.is_empty() {
                        warn!("Config has auto-detect off but no port name; enabling auto-detect");
                        config.auto_detect_port = true;
                    }
                    info!("Loaded proxy config from '{}'", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "Proxy config '{}' is not valid JSON ({}); using defaults",
                        path.display(),
                        e
                    );
                    ProxyConfig::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "Proxy config '{}' not found; using default settings",
                    path.display()
                );
                let config = ProxyConfig::default();
                if let Err(e) = write_config(&path, &config) {
                    warn!("Could not write initial proxy config: {}", e);
                }
                config
            }
            Err(e) => {
                warn!("Could not read proxy config '{}': {}", path.display(), e);
                ProxyConfig::default()
            }
        };

        Self {
            path,
            inner: RwLock::new(config),
        }
    }

    pub async fn get(&self) -> ProxyConfig {
        self.inner.read().await.clone()
    }

    /// Applies a mutation and persists the result.
    pub async fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut ProxyConfig),
    {
        let snapshot = {
            let mut config = self.inner.write().await;
            mutate(&mut config);
            config.clone()
        };
        write_config(&self.path, &snapshot)
    }

    /// Records the last known-good serial port so reconnection tries it first.
    pub async fn set_serial_port(&self, port_name: &str) {
        let port_name = port_name.to_string();
        if let Err(e) = self.update(move |c| c.serial_port_name = port_name).await {
            warn!("Failed to persist serial port name: {}", e);
        }
    }

    /// Forgets a configured port that no longer answers, so future
    /// supervisor cycles go straight to discovery.
    pub async fn clear_serial_port(&self) {
        if let Err(e) = self.update(|c| c.serial_port_name.clear()).await {
            warn!("Failed to persist cleared serial port name: {}", e);
        }
    }
}

fn write_config(path: &PathBuf, config: &ProxyConfig) -> Result<()> {
    let data = serde_json::to_string_pretty(config)?;
    std::fs::write(path, data)?;
    debug!("Saved proxy config to '{}'", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("powerbox_bridge_test_{}_{}.json", name, std::process::id()));
        path
    }

    #[tokio::test]
    async fn sparse_file_gets_per_field_defaults() {
        let path = temp_config_path("sparse");
        std::fs::write(&path, r#"{"serialPortName":"/dev/ttyUSB0"}"#).unwrap();

        let store = ConfigStore::load_from(path.clone());
        let config = store.get().await;
        assert_eq!(config.serial_port_name, "/dev/ttyUSB0");
        assert!(config.auto_detect_port);
        assert_eq!(config.network_port, 32241);
        assert_eq!(config.listen_address, "127.0.0.1");

        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn corrupt_file_falls_back_to_defaults() {
        let path = temp_config_path("corrupt");
        std::fs::write(&path, "{not json").unwrap();

        let store = ConfigStore::load_from(path.clone());
        let config = store.get().await;
        assert!(config.serial_port_name.is_empty());
        assert!(config.auto_detect_port);

        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn port_name_round_trips_through_save() {
        let path = temp_config_path("roundtrip");
        std::fs::remove_file(&path).ok();

        let store = ConfigStore::load_from(path.clone());
        store.set_serial_port("COM7").await;

        let reloaded = ConfigStore::load_from(path.clone());
        assert_eq!(reloaded.get().await.serial_port_name, "COM7");

        store.clear_serial_port().await;
        let reloaded = ConfigStore::load_from(path.clone());
        assert!(reloaded.get().await.serial_port_name.is_empty());

        std::fs::remove_file(path).ok();
    }
}
