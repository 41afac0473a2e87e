//! Logical switch table and its synchronization with firmware capabilities.
//!
//! After every fresh connect (and after a firmware configuration write) the
//! table is rebuilt from `{"get":"config"}`: disabled hardware channels are
//! hidden and optional sensor channels are inserted. IDs are dense and
//! assigned in a fixed declared order; they are NOT stable across rebuilds
//! when the set of enabled channels changes. ASCOM clients are expected to
//! re-enumerate after a configuration change.

use crate::protocol::{
    FirmwareConfig, VersionResponse, CMD_GET_CONFIG, CMD_GET_VERSION, HEATER_MODE_DISABLED,
    HEATER_MODE_MIN_TEMP, HEATER_MODE_PID_LENS, STARTUP_STATE_DISABLED,
};
use crate::config::ProxyConfig;
use crate::serial_manager::{Priority, SerialManager};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{error, info, warn};

pub const SENSOR_VOLTAGE_KEY: &str = "sensor_voltage";
pub const SENSOR_CURRENT_KEY: &str = "sensor_current";
pub const SENSOR_POWER_KEY: &str = "sensor_power";
pub const SENSOR_LENS_TEMP_KEY: &str = "sensor_lens_temp";
pub const SENSOR_PWM1_KEY: &str = "sensor_pwm1";
pub const SENSOR_PWM2_KEY: &str = "sensor_pwm2";

/// Read-only sensor channels; they can never be set or renamed.
pub fn is_sensor_switch(key: &str) -> bool {
    matches!(
        key,
        SENSOR_VOLTAGE_KEY
            | SENSOR_CURRENT_KEY
            | SENSOR_POWER_KEY
            | SENSOR_LENS_TEMP_KEY
            | SENSOR_PWM1_KEY
            | SENSOR_PWM2_KEY
    )
}

/// Standard power channels in declared order: (internal name, device key).
const STANDARD_CHANNELS: [(&str, &str); 8] = [
    ("dc1", "d1"),
    ("dc2", "d2"),
    ("dc3", "d3"),
    ("dc4", "d4"),
    ("dc5", "d5"),
    ("usbc12", "u12"),
    ("usb345", "u34"),
    ("adj_conv", "adj"),
];

/// Two parallel maps over dense logical switch IDs: long internal names for
/// display/config lookup and the short device-protocol keys for commands and
/// cache reads.
#[derive(Debug, Clone, Default)]
pub struct SwitchTable {
    names: BTreeMap<u32, String>,
    short_keys: BTreeMap<u32, String>,
}

impl SwitchTable {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, id: u32) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    pub fn short_key(&self, id: u32) -> Option<&str> {
        self.short_keys.get(&id).map(String::as_str)
    }

    /// Short keys of all channels, used for the master-power aggregation.
    pub fn short_keys(&self) -> impl Iterator<Item = &str> {
        self.short_keys.values().map(String::as_str)
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.names.values().any(|n| n == name)
    }

    fn push(&mut self, name: &str, short_key: &str) {
        let id = self.names.len() as u32;
        self.names.insert(id, name.to_string());
        self.short_keys.insert(id, short_key.to_string());
    }

    /// Static table used until the first capability sync: all channels
    /// visible, no optional sensors beyond the fixed three.
    pub fn default_table() -> Self {
        let mut table = Self::default();
        table.push(SENSOR_VOLTAGE_KEY, SENSOR_VOLTAGE_KEY);
        table.push(SENSOR_CURRENT_KEY, SENSOR_CURRENT_KEY);
        table.push(SENSOR_POWER_KEY, SENSOR_POWER_KEY);
        for (name, short_key) in STANDARD_CHANNELS {
            table.push(name, short_key);
        }
        table.push("pwm1", "pwm1");
        table.push("pwm2", "pwm2");
        table
    }
}

/// Rebuilds the switch table from a firmware config report. Declared order:
/// fixed sensors, optional lens-temp sensor, optional heater level sensors,
/// standard power channels, heater channels, optional master power.
pub fn build_switch_table(firmware: &FirmwareConfig, config: &ProxyConfig) -> SwitchTable {
    let mut table = SwitchTable::default();

    // Fixed sensors are always at IDs 0, 1, 2.
    table.push(SENSOR_VOLTAGE_KEY, SENSOR_VOLTAGE_KEY);
    table.push(SENSOR_CURRENT_KEY, SENSOR_CURRENT_KEY);
    table.push(SENSOR_POWER_KEY, SENSOR_POWER_KEY);

    let h1_mode = firmware.heater_mode(0);
    let h2_mode = firmware.heater_mode(1);

    // Lens temperature is shown when at least one heater mode needs it, or
    // when forced by proxy configuration.
    let lens_modes = [HEATER_MODE_PID_LENS, HEATER_MODE_MIN_TEMP];
    if lens_modes.contains(&h1_mode) || lens_modes.contains(&h2_mode) || config.always_show_lens_temp
    {
        table.push(SENSOR_LENS_TEMP_KEY, SENSOR_LENS_TEMP_KEY);
    }

    if h1_mode != HEATER_MODE_DISABLED {
        table.push(SENSOR_PWM1_KEY, SENSOR_PWM1_KEY);
    }
    if h2_mode != HEATER_MODE_DISABLED {
        table.push(SENSOR_PWM2_KEY, SENSOR_PWM2_KEY);
    }

    // Standard power channels, skipping rails the firmware reports as
    // permanently disabled.
    for (name, short_key) in STANDARD_CHANNELS {
        if firmware.ps.for_short_key(short_key) == STARTUP_STATE_DISABLED {
            continue;
        }
        table.push(name, short_key);
    }

    // Heater channels, hidden when their mode is Disabled.
    for (index, heater) in firmware.dh.iter().enumerate() {
        if heater.m == HEATER_MODE_DISABLED {
            continue;
        }
        let name = format!("pwm{}", index + 1);
        table.push(&name, &name);
    }

    if config.enable_master_power {
        table.push("master_power", "all");
    }

    table
}

impl SerialManager {
    /// Fetches the firmware configuration and swaps in a freshly built
    /// switch table. Runs detached after every connect and after any
    /// firmware configuration write.
    pub async fn sync_capabilities(&self) {
        // Let the fresh connection settle before queueing the first command.
        tokio::time::sleep(Duration::from_secs(1)).await;

        info!("Syncing switch configuration with firmware...");
        let response = match self
            .send_command(CMD_GET_CONFIG, Priority::Low, Some(Duration::from_secs(5)))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!("Failed to sync firmware config: {}", e);
                return;
            }
        };

        let firmware: FirmwareConfig = match serde_json::from_str(&response) {
            Ok(firmware) => firmware,
            Err(e) => {
                error!("Failed to parse firmware config for sync: {}", e);
                return;
            }
        };

        let config = self.config().get().await;
        let table = build_switch_table(&firmware, &config);
        info!(
            "Switch configuration sync complete. Total switches: {}",
            table.len()
        );
        self.replace_switch_table(table).await;
    }

    /// Requests the firmware version once the connection has stabilized.
    pub async fn fetch_firmware_version(&self) {
        tokio::time::sleep(Duration::from_secs(3)).await;

        info!("Requesting firmware version from device...");
        let response = match self.send_command(CMD_GET_VERSION, Priority::Low, None).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Could not get firmware version: {}", e);
                return;
            }
        };

        match serde_json::from_str::<VersionResponse>(&response) {
            Ok(version) => {
                info!("Firmware version: {}", version.version);
                self.set_firmware_version(version.version).await;
            }
            Err(e) => warn!("Could not parse firmware version response: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn firmware(h1: i64, h2: i64) -> FirmwareConfig {
        serde_json::from_str(&format!(r#"{{"dh":[{{"m":{}}},{{"m":{}}}]}}"#, h1, h2)).unwrap()
    }

    #[test]
    fn disabled_heater_is_hidden() {
        let fw = firmware(1, 5);
        let table = build_switch_table(&fw, &ProxyConfig::default());

        assert!(table.contains_name("pwm1"));
        assert!(!table.contains_name("pwm2"), "mode-5 heater must be hidden");
        assert!(table.contains_name(SENSOR_PWM1_KEY));
        assert!(!table.contains_name(SENSOR_PWM2_KEY));
    }

    #[test]
    fn lens_temp_follows_heater_modes() {
        let manual = build_switch_table(&firmware(0, 0), &ProxyConfig::default());
        assert!(!manual.contains_name(SENSOR_LENS_TEMP_KEY));

        let pid = build_switch_table(&firmware(1, 0), &ProxyConfig::default());
        assert!(pid.contains_name(SENSOR_LENS_TEMP_KEY));

        let min_temp = build_switch_table(&firmware(0, 4), &ProxyConfig::default());
        assert!(min_temp.contains_name(SENSOR_LENS_TEMP_KEY));

        let mut config = ProxyConfig::default();
        config.always_show_lens_temp = true;
        let forced = build_switch_table(&firmware(0, 0), &config);
        assert!(forced.contains_name(SENSOR_LENS_TEMP_KEY));
    }

    #[test]
    fn disabled_power_rail_is_hidden() {
        let fw: FirmwareConfig =
            serde_json::from_str(r#"{"dh":[{"m":0},{"m":0}],"ps":{"d3":2,"u12":2}}"#).unwrap();
        let table = build_switch_table(&fw, &ProxyConfig::default());

        assert!(table.contains_name("dc1"));
        assert!(!table.contains_name("dc3"));
        assert!(!table.contains_name("usbc12"));
        assert!(table.contains_name("usb345"));
    }

    #[test]
    fn master_power_is_appended_last_when_enabled() {
        let mut config = ProxyConfig::default();
        config.enable_master_power = true;
        let table = build_switch_table(&firmware(0, 0), &config);

        let last_id = table.len() as u32 - 1;
        assert_eq!(table.name(last_id), Some("master_power"));
        assert_eq!(table.short_key(last_id), Some("all"));
    }

    #[test]
    fn ids_are_dense_and_contiguous() {
        let fw = firmware(1, 5);
        let table = build_switch_table(&fw, &ProxyConfig::default());
        for id in 0..table.len() as u32 {
            assert!(table.name(id).is_some(), "gap at id {}", id);
            assert!(table.short_key(id).is_some(), "gap at id {}", id);
        }
        assert!(table.name(table.len() as u32).is_none());
    }

    #[test]
    fn fixed_sensors_keep_ids_0_to_2() {
        let table = build_switch_table(&firmware(5, 5), &ProxyConfig::default());
        assert_eq!(table.name(0), Some(SENSOR_VOLTAGE_KEY));
        assert_eq!(table.name(1), Some(SENSOR_CURRENT_KEY));
        assert_eq!(table.name(2), Some(SENSOR_POWER_KEY));
    }
}
