//! Wire protocol types for the powerbox JSON serial protocol.
//!
//! The device speaks newline-delimited single-line JSON at 115200 baud.
//! Responses are either a bare object (sensors, version) or an object with a
//! nested "status" object plus an optional sibling "dm" (dew mode) array.

use crate::errors::{BridgeError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

pub const BAUD_RATE: u32 = 115_200;

pub const CMD_GET_STATUS: &str = r#"{"get":"status"}"#;
pub const CMD_GET_SENSORS: &str = r#"{"get":"sensors"}"#;
pub const CMD_GET_CONFIG: &str = r#"{"get":"config"}"#;
pub const CMD_GET_VERSION: &str = r#"{"get":"version"}"#;

/// The probe command doubles as a harmless read during port discovery.
pub const CMD_PROBE: &str = CMD_GET_SENSORS;

/// Heater modes reported in the firmware config ("dh[].m") and in the
/// status "dm" array. 0=Manual, 1=PID(Lens), 2=AmbientTracking, 3=PID-Sync,
/// 4=MinTemp, 5=Disabled.
pub const HEATER_MODE_MANUAL: i64 = 0;
pub const HEATER_MODE_PID_LENS: i64 = 1;
pub const HEATER_MODE_MIN_TEMP: i64 = 4;
pub const HEATER_MODE_DISABLED: i64 = 5;

/// Power rail startup states ("ps"). 0=Off, 1=On, 2=Disabled.
pub const STARTUP_STATE_DISABLED: i64 = 2;

/// A single scalar or array value as emitted by the device.
///
/// The firmware mixes types freely: a powered-off adjustable output reports
/// `false` while a powered-on one reports its voltage as a float, and the
/// "dm" field is an array of heater modes. Decoding into a closed variant
/// set keeps the cache free of unchecked `serde_json::Value` downcasts.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Number(f64),
    Bool(bool),
    NumberArray(Vec<f64>),
}

impl FieldValue {
    pub fn from_json(value: &serde_json::Value) -> Option<FieldValue> {
        match value {
            serde_json::Value::Number(n) => n.as_f64().map(FieldValue::Number),
            serde_json::Value::Bool(b) => Some(FieldValue::Bool(*b)),
            serde_json::Value::Array(items) => {
                let mut numbers = Vec::with_capacity(items.len());
                for item in items {
                    numbers.push(item.as_f64()?);
                }
                Some(FieldValue::NumberArray(numbers))
            }
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[f64]> {
        match self {
            FieldValue::NumberArray(items) => Some(items),
            _ => None,
        }
    }

    /// A channel counts as "on" when the firmware reports boolean true or a
    /// level of at least 1.0 (active PWM percentage or voltage).
    pub fn is_on(&self) -> bool {
        match self {
            FieldValue::Bool(b) => *b,
            FieldValue::Number(n) => *n >= 1.0,
            FieldValue::NumberArray(_) => false,
        }
    }
}

/// Field map used by both read caches.
pub type FieldMap = HashMap<String, FieldValue>;

fn decode_object(object: &serde_json::Map<String, serde_json::Value>) -> FieldMap {
    let mut fields = FieldMap::with_capacity(object.len());
    for (key, value) in object {
        match FieldValue::from_json(value) {
            Some(decoded) => {
                fields.insert(key.clone(), decoded);
            }
            None => {
                debug!("Skipping undecodable field '{}': {}", key, value);
            }
        }
    }
    fields
}

/// Parses a status-shaped response: an object with a nested "status" object
/// and an optional sibling "dm" array. Returns the decoded status fields and
/// the raw "dm" value (if present) so the caller can apply the merge rule.
pub fn parse_status_response(raw: &str) -> Result<(FieldMap, Option<FieldValue>)> {
    let root: serde_json::Value = serde_json::from_str(raw)?;
    let status = root
        .get("status")
        .and_then(|v| v.as_object())
        .ok_or_else(|| BridgeError::InvalidResponse("missing 'status' object".to_string()))?;

    let dew_modes = root.get("dm").and_then(FieldValue::from_json);
    Ok((decode_object(status), dew_modes))
}

/// Parses a bare-object response (sensors).
pub fn parse_conditions_response(raw: &str) -> Result<FieldMap> {
    let root: serde_json::Value = serde_json::from_str(raw)?;
    let object = root
        .as_object()
        .ok_or_else(|| BridgeError::InvalidResponse("response is not a JSON object".to_string()))?;
    Ok(decode_object(object))
}

/// Startup state of the standard power rails, part of the firmware config.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct PowerStartupStates {
    #[serde(default)]
    pub d1: i64,
    #[serde(default)]
    pub d2: i64,
    #[serde(default)]
    pub d3: i64,
    #[serde(default)]
    pub d4: i64,
    #[serde(default)]
    pub d5: i64,
    #[serde(default)]
    pub u12: i64,
    #[serde(default)]
    pub u34: i64,
    #[serde(default)]
    pub adj: i64,
}

impl PowerStartupStates {
    pub fn for_short_key(&self, short_key: &str) -> i64 {
        match short_key {
            "d1" => self.d1,
            "d2" => self.d2,
            "d3" => self.d3,
            "d4" => self.d4,
            "d5" => self.d5,
            "u12" => self.u12,
            "u34" => self.u34,
            "adj" => self.adj,
            _ => 0,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct HeaterConfig {
    /// Heater mode, see the HEATER_MODE_* constants.
    #[serde(default)]
    pub m: i64,
}

/// The subset of `{"get":"config"}` the proxy needs for capability sync.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct FirmwareConfig {
    #[serde(default)]
    pub dh: Vec<HeaterConfig>,
    #[serde(default)]
    pub ps: PowerStartupStates,
}

impl FirmwareConfig {
    pub fn heater_mode(&self, index: usize) -> i64 {
        self.dh.get(index).map(|h| h.m).unwrap_or(HEATER_MODE_MANUAL)
    }
}

#[derive(Debug, Deserialize)]
pub struct VersionResponse {
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_scalars_and_arrays() {
        assert_eq!(
            FieldValue::from_json(&serde_json::json!(12.4)),
            Some(FieldValue::Number(12.4))
        );
        assert_eq!(
            FieldValue::from_json(&serde_json::json!(false)),
            Some(FieldValue::Bool(false))
        );
        assert_eq!(
            FieldValue::from_json(&serde_json::json!([0, 3])),
            Some(FieldValue::NumberArray(vec![0.0, 3.0]))
        );
        assert_eq!(FieldValue::from_json(&serde_json::json!("text")), None);
        assert_eq!(FieldValue::from_json(&serde_json::json!([1, "x"])), None);
    }

    #[test]
    fn is_on_treats_levels_as_active() {
        assert!(FieldValue::Bool(true).is_on());
        assert!(FieldValue::Number(75.0).is_on());
        assert!(!FieldValue::Number(0.0).is_on());
        assert!(!FieldValue::Bool(false).is_on());
    }

    #[test]
    fn parses_status_with_dew_modes() {
        let raw = r#"{"status":{"d1":true,"pwm1":55,"adj":12.0},"dm":[0,5]}"#;
        let (fields, dm) = parse_status_response(raw).unwrap();
        assert_eq!(fields.get("d1"), Some(&FieldValue::Bool(true)));
        assert_eq!(fields.get("pwm1"), Some(&FieldValue::Number(55.0)));
        assert_eq!(dm, Some(FieldValue::NumberArray(vec![0.0, 5.0])));
    }

    #[test]
    fn parses_status_without_dew_modes() {
        let raw = r#"{"status":{"d1":false}}"#;
        let (fields, dm) = parse_status_response(raw).unwrap();
        assert_eq!(fields.get("d1"), Some(&FieldValue::Bool(false)));
        assert!(dm.is_none());
    }

    #[test]
    fn rejects_status_without_status_object() {
        let raw = r#"{"v":12.1}"#;
        assert!(parse_status_response(raw).is_err());
    }

    #[test]
    fn parses_firmware_config() {
        let raw = r#"{"dh":[{"m":1},{"m":5}],"ps":{"d1":1,"d2":0,"u12":2}}"#;
        let fw: FirmwareConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(fw.heater_mode(0), 1);
        assert_eq!(fw.heater_mode(1), 5);
        assert_eq!(fw.ps.for_short_key("u12"), STARTUP_STATE_DISABLED);
        // Missing heaters default to manual so the channels stay visible.
        assert_eq!(fw.heater_mode(2), HEATER_MODE_MANUAL);
    }
}
