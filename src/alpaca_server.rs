// src/alpaca_server.rs
// ASCOM Alpaca surface: one Switch device and one ObservingConditions device,
// both reading the serial manager's caches instead of touching the wire.

use crate::capability_sync::{
    is_sensor_switch, SENSOR_CURRENT_KEY, SENSOR_LENS_TEMP_KEY, SENSOR_POWER_KEY,
    SENSOR_PWM1_KEY, SENSOR_PWM2_KEY, SENSOR_VOLTAGE_KEY,
};
use crate::config::ConfigStore;
use crate::protocol::FieldValue;
use crate::serial_manager::{Priority, SerialManager};
use axum::{
    extract::{Path, Query, State},
    routing::{get, put},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

const ERR_INVALID_VALUE: u32 = 0x400;
const ERR_VALUE_NOT_SET: u32 = 0x401;
const ERR_NOT_IMPLEMENTED: u32 = 0x40C;
const ERR_DRIVER: u32 = 0x500;

// Global server transaction ID counter
static SERVER_TRANSACTION_ID: AtomicU32 = AtomicU32::new(0);

fn next_server_transaction_id() -> u32 {
    SERVER_TRANSACTION_ID.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
}

// ASCOM Alpaca response structure with proper case sensitivity
#[derive(Serialize)]
struct AlpacaResponse<T> {
    #[serde(rename = "Value")]
    value: T,
    #[serde(rename = "ClientTransactionID")]
    client_transaction_id: u32,
    #[serde(rename = "ServerTransactionID")]
    server_transaction_id: u32,
    #[serde(rename = "ErrorNumber")]
    error_number: u32,
    #[serde(rename = "ErrorMessage")]
    error_message: String,
}

impl<T> AlpacaResponse<T> {
    fn success(value: T, client_transaction_id: u32) -> Self {
        Self {
            value,
            client_transaction_id,
            server_transaction_id: next_server_transaction_id(),
            error_number: 0,
            error_message: String::new(),
        }
    }

    fn error(value: T, client_transaction_id: u32, error_number: u32, error_message: String) -> Self {
        Self {
            value,
            client_transaction_id,
            server_transaction_id: next_server_transaction_id(),
            error_number,
            error_message,
        }
    }
}

/// Alpaca clients are inconsistent about parameter casing, so all query and
/// form parameters are looked up case-insensitively.
type Params = HashMap<String, String>;

fn param<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

fn client_transaction_id(params: &Params) -> u32 {
    param(params, "ClientTransactionID")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Accepts "12,5" as well as "12.5"; some clients localize decimals.
fn parse_float(raw: &str) -> Option<f64> {
    raw.replace(',', ".").parse().ok()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Clone)]
struct AppState {
    manager: SerialManager,
    config: Arc<ConfigStore>,
    switch_uid: String,
    obscond_uid: String,
}

pub async fn create_alpaca_server(
    bind_address: String,
    port: u16,
    manager: SerialManager,
    config: Arc<ConfigStore>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let state = AppState {
        manager,
        config,
        switch_uid: uuid::Uuid::new_v4().to_string(),
        obscond_uid: uuid::Uuid::new_v4().to_string(),
    };
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", bind_address, port)).await?;
    info!("ASCOM Alpaca server listening on {}:{}", bind_address, port);
    axum::serve(listener, app).await?;
    Ok(())
}

fn create_router(state: AppState) -> Router {
    Router::new()
        // Web/management API
        .route("/api/status", get(api_status))
        .route("/api/ports", get(api_ports))
        .route("/api/command", put(api_send_command))
        .route("/api/release_port", put(api_release_port))
        .route("/api/resume_reconnect", put(api_resume_reconnect))
        .route("/api/reconnect", put(api_reconnect))
        // ASCOM Management API
        .route("/management/apiversions", get(get_management_api_versions))
        .route("/management/v1/description", get(get_management_description))
        .route("/management/v1/configureddevices", get(get_configured_devices))
        // Switch device - common endpoints
        .route("/api/v1/switch/:device_number/connected", get(get_connected).put(put_connected))
        .route("/api/v1/switch/:device_number/description", get(get_switch_description_prop))
        .route("/api/v1/switch/:device_number/driverinfo", get(get_driver_info))
        .route("/api/v1/switch/:device_number/driverversion", get(get_driver_version))
        .route("/api/v1/switch/:device_number/interfaceversion", get(get_interface_version))
        .route("/api/v1/switch/:device_number/name", get(get_switch_device_name))
        .route("/api/v1/switch/:device_number/supportedactions", get(get_switch_supported_actions))
        .route("/api/v1/switch/:device_number/action", put(put_switch_action))
        // Switch device - switch endpoints
        .route("/api/v1/switch/:device_number/maxswitch", get(get_max_switch))
        .route("/api/v1/switch/:device_number/canwrite", get(get_can_write))
        .route("/api/v1/switch/:device_number/getswitch", get(get_switch))
        .route("/api/v1/switch/:device_number/getswitchdescription", get(get_switch_description))
        .route("/api/v1/switch/:device_number/getswitchname", get(get_switch_name))
        .route("/api/v1/switch/:device_number/getswitchvalue", get(get_switch_value))
        .route("/api/v1/switch/:device_number/minswitchvalue", get(get_min_switch_value))
        .route("/api/v1/switch/:device_number/maxswitchvalue", get(get_max_switch_value))
        .route("/api/v1/switch/:device_number/switchstep", get(get_switch_step))
        .route("/api/v1/switch/:device_number/setswitch", put(put_set_switch))
        .route("/api/v1/switch/:device_number/setswitchname", put(put_set_switch_name))
        .route("/api/v1/switch/:device_number/setswitchvalue", put(put_set_switch_value))
        // ObservingConditions device
        .route("/api/v1/observingconditions/:device_number/connected", get(get_connected).put(put_connected))
        .route("/api/v1/observingconditions/:device_number/description", get(get_obscond_description_prop))
        .route("/api/v1/observingconditions/:device_number/driverinfo", get(get_driver_info))
        .route("/api/v1/observingconditions/:device_number/driverversion", get(get_driver_version))
        .route("/api/v1/observingconditions/:device_number/interfaceversion", get(get_interface_version))
        .route("/api/v1/observingconditions/:device_number/name", get(get_obscond_device_name))
        .route("/api/v1/observingconditions/:device_number/supportedactions", get(get_obscond_supported_actions))
        .route("/api/v1/observingconditions/:device_number/action", put(put_obscond_action))
        .route("/api/v1/observingconditions/:device_number/temperature", get(get_temperature))
        .route("/api/v1/observingconditions/:device_number/humidity", get(get_humidity))
        .route("/api/v1/observingconditions/:device_number/dewpoint", get(get_dew_point))
        .route("/api/v1/observingconditions/:device_number/averageperiod", get(not_implemented).put(not_implemented))
        .route("/api/v1/observingconditions/:device_number/timesincelastupdate", get(not_implemented))
        .route("/api/v1/observingconditions/:device_number/sensordescription", get(not_implemented))
        .route("/api/v1/observingconditions/:device_number/cloudcover", get(not_implemented))
        .route("/api/v1/observingconditions/:device_number/pressure", get(not_implemented))
        .route("/api/v1/observingconditions/:device_number/rainrate", get(not_implemented))
        .route("/api/v1/observingconditions/:device_number/skybrightness", get(not_implemented))
        .route("/api/v1/observingconditions/:device_number/skyquality", get(not_implemented))
        .route("/api/v1/observingconditions/:device_number/skytemperature", get(not_implemented))
        .route("/api/v1/observingconditions/:device_number/starfwhm", get(not_implemented))
        .route("/api/v1/observingconditions/:device_number/windspeed", get(not_implemented))
        .route("/api/v1/observingconditions/:device_number/winddirection", get(not_implemented))
        .route("/api/v1/observingconditions/:device_number/windgust", get(not_implemented))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// --- Web/management API handlers ---

#[derive(Serialize)]
struct BridgeStatus {
    connected: bool,
    firmware_version: String,
    serial_port: String,
    reconnect_paused: bool,
    switch_count: usize,
}

async fn api_status(State(state): State<AppState>) -> Json<BridgeStatus> {
    let config = state.config.get().await;
    Json(BridgeStatus {
        connected: state.manager.is_connected().await,
        firmware_version: state.manager.firmware_version().await,
        serial_port: config.serial_port_name,
        reconnect_paused: state.manager.is_reconnect_paused().await,
        switch_count: state.manager.switch_table().await.len(),
    })
}

#[derive(Serialize)]
struct PortListResponse {
    ports: Vec<crate::port_discovery::PortInfo>,
}

async fn api_ports() -> Json<PortListResponse> {
    match crate::port_discovery::list_ports() {
        Ok(ports) => Json(PortListResponse { ports }),
        Err(_) => Json(PortListResponse { ports: vec![] }),
    }
}

#[derive(Deserialize)]
struct CommandRequest {
    command: String,
}

#[derive(Serialize)]
struct CommandResponse {
    success: bool,
    response: Option<String>,
    message: String,
}

async fn api_send_command(
    State(state): State<AppState>,
    Json(request): Json<CommandRequest>,
) -> Json<CommandResponse> {
    match state
        .manager
        .send_command(&request.command, Priority::High, None)
        .await
    {
        Ok(response) => {
            // A full-config write changes the enabled channel set, so the
            // switch table must be rebuilt.
            if request.command.contains(r#""sc""#) {
                let manager = state.manager.clone();
                tokio::spawn(async move { manager.sync_capabilities().await });
            }
            Json(CommandResponse {
                success: true,
                response: Some(response),
                message: "Command executed".to_string(),
            })
        }
        Err(e) => Json(CommandResponse {
            success: false,
            response: None,
            message: e.to_string(),
        }),
    }
}

#[derive(Serialize)]
struct ActionResponse {
    success: bool,
    message: String,
}

async fn api_release_port(State(state): State<AppState>) -> Json<ActionResponse> {
    state.manager.release_port().await;
    Json(ActionResponse {
        success: true,
        message: "Serial port released; auto-reconnect paused".to_string(),
    })
}

async fn api_resume_reconnect(State(state): State<AppState>) -> Json<ActionResponse> {
    state.manager.resume_reconnect().await;
    Json(ActionResponse {
        success: true,
        message: "Auto-reconnect resumed".to_string(),
    })
}

#[derive(Deserialize)]
struct ReconnectRequest {
    #[serde(default)]
    port: String,
}

async fn api_reconnect(
    State(state): State<AppState>,
    Json(request): Json<ReconnectRequest>,
) -> Json<ActionResponse> {
    state.manager.force_reconnect(&request.port).await;
    let message = if request.port.is_empty() {
        "Disconnected".to_string()
    } else {
        format!("Reconnect attempted on {}", request.port)
    };
    Json(ActionResponse {
        success: true,
        message,
    })
}

// --- ASCOM Management API handlers ---

async fn get_management_api_versions(Query(query): Query<Params>) -> Json<AlpacaResponse<Vec<u32>>> {
    Json(AlpacaResponse::success(vec![1], client_transaction_id(&query)))
}

async fn get_management_description(Query(query): Query<Params>) -> Json<AlpacaResponse<serde_json::Value>> {
    let description = serde_json::json!({
        "ServerName": "Powerbox Alpaca Bridge",
        "Manufacturer": "Powerbox Alpaca Bridge project",
        "ManufacturerVersion": env!("CARGO_PKG_VERSION"),
        "Location": "Local"
    });
    Json(AlpacaResponse::success(description, client_transaction_id(&query)))
}

async fn get_configured_devices(
    Query(query): Query<Params>,
    State(state): State<AppState>,
) -> Json<AlpacaResponse<Vec<serde_json::Value>>> {
    let devices = vec![
        serde_json::json!({
            "DeviceName": "Powerbox Switch",
            "DeviceType": "Switch",
            "DeviceNumber": 0,
            "UniqueID": state.switch_uid
        }),
        serde_json::json!({
            "DeviceName": "Powerbox Conditions",
            "DeviceType": "ObservingConditions",
            "DeviceNumber": 0,
            "UniqueID": state.obscond_uid
        }),
    ];
    Json(AlpacaResponse::success(devices, client_transaction_id(&query)))
}

// --- Common device handlers ---

fn check_device_number<T>(device_number: u32, value: T, ctid: u32) -> Option<Json<AlpacaResponse<T>>> {
    if device_number != 0 {
        Some(Json(AlpacaResponse::error(
            value,
            ctid,
            ERR_INVALID_VALUE,
            format!("Invalid device number: {}", device_number),
        )))
    } else {
        None
    }
}

async fn get_connected(
    Path(device_number): Path<u32>,
    Query(query): Query<Params>,
    State(state): State<AppState>,
) -> Json<AlpacaResponse<bool>> {
    let ctid = client_transaction_id(&query);
    if let Some(err) = check_device_number(device_number, false, ctid) {
        return err;
    }
    Json(AlpacaResponse::success(state.manager.is_connected().await, ctid))
}

/// The serial connection is managed automatically; a PUT only verifies the
/// hardware is reachable when a client asks to connect.
async fn put_connected(
    Path(device_number): Path<u32>,
    State(state): State<AppState>,
    Form(form): Form<Params>,
) -> Json<AlpacaResponse<()>> {
    let ctid = client_transaction_id(&form);
    if let Some(err) = check_device_number(device_number, (), ctid) {
        return err;
    }

    let Some(connected) = param(&form, "Connected").and_then(parse_bool) else {
        return Json(AlpacaResponse::error(
            (),
            ctid,
            ERR_INVALID_VALUE,
            "Missing or invalid Connected parameter".to_string(),
        ));
    };

    if connected && !state.manager.is_connected().await {
        return Json(AlpacaResponse::error(
            (),
            ctid,
            ERR_INVALID_VALUE,
            "Powerbox not connected. Please check the USB connection.".to_string(),
        ));
    }
    Json(AlpacaResponse::success((), ctid))
}

async fn get_driver_info(
    Path(device_number): Path<u32>,
    Query(query): Query<Params>,
    State(state): State<AppState>,
) -> Json<AlpacaResponse<String>> {
    let ctid = client_transaction_id(&query);
    if let Some(err) = check_device_number(device_number, String::new(), ctid) {
        return err;
    }
    let info = format!(
        "Powerbox Alpaca Bridge v{} (firmware {})",
        env!("CARGO_PKG_VERSION"),
        state.manager.firmware_version().await
    );
    Json(AlpacaResponse::success(info, ctid))
}

async fn get_driver_version(
    Path(device_number): Path<u32>,
    Query(query): Query<Params>,
) -> Json<AlpacaResponse<String>> {
    let ctid = client_transaction_id(&query);
    if let Some(err) = check_device_number(device_number, String::new(), ctid) {
        return err;
    }
    Json(AlpacaResponse::success(env!("CARGO_PKG_VERSION").to_string(), ctid))
}

async fn get_interface_version(
    Path(device_number): Path<u32>,
    Query(query): Query<Params>,
) -> Json<AlpacaResponse<u32>> {
    let ctid = client_transaction_id(&query);
    if let Some(err) = check_device_number(device_number, 0, ctid) {
        return err;
    }
    Json(AlpacaResponse::success(1, ctid))
}

async fn get_switch_device_name(
    Path(device_number): Path<u32>,
    Query(query): Query<Params>,
) -> Json<AlpacaResponse<String>> {
    let ctid = client_transaction_id(&query);
    if let Some(err) = check_device_number(device_number, String::new(), ctid) {
        return err;
    }
    Json(AlpacaResponse::success("Powerbox Switch".to_string(), ctid))
}

async fn get_obscond_device_name(
    Path(device_number): Path<u32>,
    Query(query): Query<Params>,
) -> Json<AlpacaResponse<String>> {
    let ctid = client_transaction_id(&query);
    if let Some(err) = check_device_number(device_number, String::new(), ctid) {
        return err;
    }
    Json(AlpacaResponse::success("Powerbox Conditions".to_string(), ctid))
}

async fn get_switch_description_prop(
    Path(device_number): Path<u32>,
    Query(query): Query<Params>,
) -> Json<AlpacaResponse<String>> {
    let ctid = client_transaction_id(&query);
    if let Some(err) = check_device_number(device_number, String::new(), ctid) {
        return err;
    }
    Json(AlpacaResponse::success(
        "USB power distribution and dew heater controller".to_string(),
        ctid,
    ))
}

async fn get_obscond_description_prop(
    Path(device_number): Path<u32>,
    Query(query): Query<Params>,
) -> Json<AlpacaResponse<String>> {
    let ctid = client_transaction_id(&query);
    if let Some(err) = check_device_number(device_number, String::new(), ctid) {
        return err;
    }
    Json(AlpacaResponse::success(
        "Ambient temperature, humidity and dew point sensors of the powerbox".to_string(),
        ctid,
    ))
}

async fn get_switch_supported_actions(
    Path(device_number): Path<u32>,
    Query(query): Query<Params>,
) -> Json<AlpacaResponse<Vec<String>>> {
    let ctid = client_transaction_id(&query);
    if let Some(err) = check_device_number(device_number, vec![], ctid) {
        return err;
    }
    Json(AlpacaResponse::success(
        vec!["MasterSwitchOn".to_string(), "MasterSwitchOff".to_string()],
        ctid,
    ))
}

async fn put_switch_action(
    Path(device_number): Path<u32>,
    State(state): State<AppState>,
    Form(form): Form<Params>,
) -> Json<AlpacaResponse<String>> {
    let ctid = client_transaction_id(&form);
    if let Some(err) = check_device_number(device_number, String::new(), ctid) {
        return err;
    }
    let Some(action) = param(&form, "Action") else {
        return Json(AlpacaResponse::error(
            String::new(),
            ctid,
            ERR_INVALID_VALUE,
            "Missing Action parameter".to_string(),
        ));
    };

    match action.to_ascii_lowercase().as_str() {
        "masterswitchon" | "masterswitchoff" => {
            let on = action.eq_ignore_ascii_case("masterswitchon");
            info!("Executing ASCOM action: {}", action);
            let manager = state.manager.clone();
            // Respond immediately with an empty value per the ASCOM spec.
            tokio::spawn(async move {
                let command = format!(r#"{{"set":{{"all":{}}}}}"#, if on { 1 } else { 0 });
                if let Err(e) = manager.send_command(&command, Priority::High, None).await {
                    warn!("Master switch action failed: {}", e);
                }
            });
            Json(AlpacaResponse::success(String::new(), ctid))
        }
        other => Json(AlpacaResponse::error(
            String::new(),
            ctid,
            ERR_INVALID_VALUE,
            format!("Action '{}' is not supported.", other),
        )),
    }
}

// --- Switch endpoints ---

/// Resolves the Id parameter against the current switch table, returning the
/// internal name. IDs are only valid against the table generation the client
/// last enumerated; a stale ID after a capability rebuild simply misses.
async fn resolve_switch(
    state: &AppState,
    params: &Params,
) -> std::result::Result<(u32, String), String> {
    let id: u32 = param(params, "Id")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| "Missing or invalid Id parameter".to_string())?;
    let table = state.manager.switch_table().await;
    match table.name(id) {
        Some(name) => Ok((id, name.to_string())),
        None => Err(format!("Switch id {} out of range", id)),
    }
}

async fn get_max_switch(
    Path(device_number): Path<u32>,
    Query(query): Query<Params>,
    State(state): State<AppState>,
) -> Json<AlpacaResponse<u32>> {
    let ctid = client_transaction_id(&query);
    if let Some(err) = check_device_number(device_number, 0, ctid) {
        return err;
    }
    let count = state.manager.switch_table().await.len() as u32;
    Json(AlpacaResponse::success(count, ctid))
}

async fn get_can_write(
    Path(device_number): Path<u32>,
    Query(query): Query<Params>,
    State(state): State<AppState>,
) -> Json<AlpacaResponse<bool>> {
    let ctid = client_transaction_id(&query);
    if let Some(err) = check_device_number(device_number, false, ctid) {
        return err;
    }
    match resolve_switch(&state, &query).await {
        Ok((_, name)) => Json(AlpacaResponse::success(!is_sensor_switch(&name), ctid)),
        Err(msg) => Json(AlpacaResponse::error(false, ctid, ERR_INVALID_VALUE, msg)),
    }
}

async fn get_switch_name(
    Path(device_number): Path<u32>,
    Query(query): Query<Params>,
    State(state): State<AppState>,
) -> Json<AlpacaResponse<String>> {
    let ctid = client_transaction_id(&query);
    if let Some(err) = check_device_number(device_number, String::new(), ctid) {
        return err;
    }
    let (_, name) = match resolve_switch(&state, &query).await {
        Ok(resolved) => resolved,
        Err(msg) => {
            return Json(AlpacaResponse::error(String::new(), ctid, ERR_INVALID_VALUE, msg))
        }
    };

    let display = match name.as_str() {
        SENSOR_VOLTAGE_KEY => "Input Voltage".to_string(),
        SENSOR_CURRENT_KEY => "Total Current".to_string(),
        SENSOR_POWER_KEY => "Total Power".to_string(),
        SENSOR_LENS_TEMP_KEY => "Lens Temperature".to_string(),
        SENSOR_PWM1_KEY => "Dew Heater 1".to_string(),
        SENSOR_PWM2_KEY => "Dew Heater 2".to_string(),
        _ => {
            let config = state.config.get().await;
            config
                .switch_names
                .get(&name)
                .filter(|custom| !custom.is_empty())
                .cloned()
                .unwrap_or(name)
        }
    };
    Json(AlpacaResponse::success(display, ctid))
}

async fn get_switch_description(
    Path(device_number): Path<u32>,
    Query(query): Query<Params>,
    State(state): State<AppState>,
) -> Json<AlpacaResponse<String>> {
    let ctid = client_transaction_id(&query);
    if let Some(err) = check_device_number(device_number, String::new(), ctid) {
        return err;
    }
    let (_, name) = match resolve_switch(&state, &query).await {
        Ok(resolved) => resolved,
        Err(msg) => {
            return Json(AlpacaResponse::error(String::new(), ctid, ERR_INVALID_VALUE, msg))
        }
    };

    let description = match name.as_str() {
        SENSOR_VOLTAGE_KEY => "Input voltage in Volts (V)",
        SENSOR_CURRENT_KEY => "Total current draw in Amperes (A)",
        SENSOR_POWER_KEY => "Total power consumption in Watts (W)",
        SENSOR_LENS_TEMP_KEY => "Lens/Objective temperature in degrees C",
        SENSOR_PWM1_KEY => "Dew Heater 1 power output in %",
        SENSOR_PWM2_KEY => "Dew Heater 2 power output in %",
        other => other,
    };
    Json(AlpacaResponse::success(description.to_string(), ctid))
}

/// Index of the heater behind a channel name, if it is a heater channel.
fn heater_index(name: &str) -> Option<usize> {
    match name {
        "pwm1" => Some(0),
        "pwm2" => Some(1),
        _ => None,
    }
}

/// A heater in dew mode 0 (Manual) exposes its raw 0-100 level instead of a
/// binary on/off.
fn is_manual_heater(status: &crate::protocol::FieldMap, name: &str) -> bool {
    let Some(index) = heater_index(name) else {
        return false;
    };
    status
        .get("dm")
        .and_then(FieldValue::as_array)
        .and_then(|modes| modes.get(index).copied())
        .map(|mode| mode as i64 == crate::protocol::HEATER_MODE_MANUAL)
        .unwrap_or(false)
}

/// True when every non-sensor channel in the table reports "on".
fn all_channels_on(
    status: &crate::protocol::FieldMap,
    table: &crate::capability_sync::SwitchTable,
) -> bool {
    for key in table.short_keys() {
        if key == "all" || is_sensor_switch(key) {
            continue;
        }
        match status.get(key) {
            Some(value) if value.is_on() => {}
            // A missing channel status cannot be confirmed on; assume off.
            _ => return false,
        }
    }
    true
}

async fn get_switch(
    Path(device_number): Path<u32>,
    Query(query): Query<Params>,
    State(state): State<AppState>,
) -> Json<AlpacaResponse<bool>> {
    let ctid = client_transaction_id(&query);
    if let Some(err) = check_device_number(device_number, false, ctid) {
        return err;
    }
    let (id, name) = match resolve_switch(&state, &query).await {
        Ok(resolved) => resolved,
        Err(msg) => return Json(AlpacaResponse::error(false, ctid, ERR_INVALID_VALUE, msg)),
    };

    // Sensors are "on" whenever the device is connected.
    if is_sensor_switch(&name) {
        return Json(AlpacaResponse::success(true, ctid));
    }

    let table = state.manager.switch_table().await;
    let short_key = match table.short_key(id) {
        Some(key) => key.to_string(),
        None => {
            return Json(AlpacaResponse::error(
                false,
                ctid,
                ERR_INVALID_VALUE,
                format!("Switch id {} out of range", id),
            ))
        }
    };

    let status = state.manager.status().await;
    if short_key == "all" {
        return Json(AlpacaResponse::success(all_channels_on(&status, &table), ctid));
    }

    match status.get(&short_key) {
        Some(value) => Json(AlpacaResponse::success(value.is_on(), ctid)),
        None => Json(AlpacaResponse::error(
            false,
            ctid,
            ERR_INVALID_VALUE,
            "Could not read switch status from cache".to_string(),
        )),
    }
}

async fn get_switch_value(
    Path(device_number): Path<u32>,
    Query(query): Query<Params>,
    State(state): State<AppState>,
) -> Json<AlpacaResponse<f64>> {
    let ctid = client_transaction_id(&query);
    if let Some(err) = check_device_number(device_number, 0.0, ctid) {
        return err;
    }
    let (id, name) = match resolve_switch(&state, &query).await {
        Ok(resolved) => resolved,
        Err(msg) => return Json(AlpacaResponse::error(0.0, ctid, ERR_INVALID_VALUE, msg)),
    };

    if is_sensor_switch(&name) {
        return Json(AlpacaResponse::success(sensor_value(&state, &name).await, ctid));
    }

    let table = state.manager.switch_table().await;
    let short_key = match table.short_key(id) {
        Some(key) => key.to_string(),
        None => {
            return Json(AlpacaResponse::error(
                0.0,
                ctid,
                ERR_INVALID_VALUE,
                format!("Switch id {} out of range", id),
            ))
        }
    };

    let config = state.config.get().await;
    let status = state.manager.status().await;

    if short_key == "all" {
        let value = if all_channels_on(&status, &table) { 1.0 } else { 0.0 };
        return Json(AlpacaResponse::success(value, ctid));
    }

    let Some(value) = status.get(&short_key) else {
        return Json(AlpacaResponse::error(
            0.0,
            ctid,
            ERR_INVALID_VALUE,
            "Could not read switch value from cache".to_string(),
        ));
    };

    // The adjustable output conflates on/off with its level: the firmware
    // reports boolean false when off and a voltage when on, so the cached
    // user intent is the authoritative level while the output is on.
    if short_key == "adj" && config.enable_alpaca_voltage_control {
        if let FieldValue::Bool(false) = value {
            return Json(AlpacaResponse::success(0.0, ctid));
        }
        let target = state.manager.voltage_target().await;
        let level = if target >= 0.0 {
            target
        } else {
            value.as_f64().unwrap_or(0.0)
        };
        return Json(AlpacaResponse::success(level, ctid));
    }

    let level = match value {
        FieldValue::Number(n) if is_manual_heater(&status, &name) => *n,
        FieldValue::Number(n) if *n >= 1.0 => 1.0,
        FieldValue::Bool(true) => 1.0,
        _ => 0.0,
    };
    Json(AlpacaResponse::success(level, ctid))
}

/// Sensor channels read from the conditions cache, except the heater level
/// sensors which live in the status cache.
async fn sensor_value(state: &AppState, name: &str) -> f64 {
    if name == SENSOR_PWM1_KEY || name == SENSOR_PWM2_KEY {
        let short_key = if name == SENSOR_PWM1_KEY { "pwm1" } else { "pwm2" };
        let status = state.manager.status().await;
        return status
            .get(short_key)
            .and_then(FieldValue::as_f64)
            .unwrap_or(0.0);
    }

    let conditions = state.manager.conditions().await;
    match name {
        SENSOR_VOLTAGE_KEY => conditions
            .get("v")
            .and_then(FieldValue::as_f64)
            .map(round2)
            .unwrap_or(0.0),
        // Current is reported in mA.
        SENSOR_CURRENT_KEY => conditions
            .get("i")
            .and_then(FieldValue::as_f64)
            .map(|ma| round2(ma / 1000.0))
            .unwrap_or(0.0),
        SENSOR_POWER_KEY => conditions
            .get("p")
            .and_then(FieldValue::as_f64)
            .map(round2)
            .unwrap_or(0.0),
        SENSOR_LENS_TEMP_KEY => conditions
            .get("t_lens")
            .and_then(FieldValue::as_f64)
            .unwrap_or(-273.15),
        _ => 0.0,
    }
}

async fn get_min_switch_value(
    Path(device_number): Path<u32>,
    Query(query): Query<Params>,
    State(state): State<AppState>,
) -> Json<AlpacaResponse<f64>> {
    let ctid = client_transaction_id(&query);
    if let Some(err) = check_device_number(device_number, 0.0, ctid) {
        return err;
    }
    match resolve_switch(&state, &query).await {
        Ok((_, name)) if name == SENSOR_LENS_TEMP_KEY => {
            Json(AlpacaResponse::success(-273.15, ctid))
        }
        Ok(_) => Json(AlpacaResponse::success(0.0, ctid)),
        Err(msg) => Json(AlpacaResponse::error(0.0, ctid, ERR_INVALID_VALUE, msg)),
    }
}

async fn get_max_switch_value(
    Path(device_number): Path<u32>,
    Query(query): Query<Params>,
    State(state): State<AppState>,
) -> Json<AlpacaResponse<f64>> {
    let ctid = client_transaction_id(&query);
    if let Some(err) = check_device_number(device_number, 0.0, ctid) {
        return err;
    }
    let (_, name) = match resolve_switch(&state, &query).await {
        Ok(resolved) => resolved,
        Err(msg) => return Json(AlpacaResponse::error(0.0, ctid, ERR_INVALID_VALUE, msg)),
    };

    let voltage_control = state.config.get().await.enable_alpaca_voltage_control;
    let max = match name.as_str() {
        SENSOR_VOLTAGE_KEY => 15.0,
        SENSOR_CURRENT_KEY => 10.0,
        SENSOR_POWER_KEY => 150.0,
        SENSOR_LENS_TEMP_KEY => 100.0,
        SENSOR_PWM1_KEY | SENSOR_PWM2_KEY => 100.0,
        "adj_conv" if voltage_control => 15.0,
        other => {
            let status = state.manager.status().await;
            if is_manual_heater(&status, other) {
                100.0
            } else {
                1.0
            }
        }
    };
    Json(AlpacaResponse::success(max, ctid))
}

async fn get_switch_step(
    Path(device_number): Path<u32>,
    Query(query): Query<Params>,
    State(state): State<AppState>,
) -> Json<AlpacaResponse<f64>> {
    let ctid = client_transaction_id(&query);
    if let Some(err) = check_device_number(device_number, 0.0, ctid) {
        return err;
    }
    let (_, name) = match resolve_switch(&state, &query).await {
        Ok(resolved) => resolved,
        Err(msg) => return Json(AlpacaResponse::error(0.0, ctid, ERR_INVALID_VALUE, msg)),
    };

    let step = if is_sensor_switch(&name) {
        0.1
    } else if name == "adj_conv" && state.config.get().await.enable_alpaca_voltage_control {
        0.1
    } else {
        1.0
    };
    Json(AlpacaResponse::success(step, ctid))
}

/// The device command for one switch write, plus the voltage target to
/// record when the write changes the adjustable output level.
pub(crate) fn build_set_command(
    name: &str,
    short_key: &str,
    value: Option<f64>,
    state: bool,
    manual_heater: bool,
    voltage_control: bool,
) -> (String, Option<f64>) {
    if manual_heater {
        return match value {
            Some(level) => (format!(r#"{{"set":{{"{}":{:.0}}}}}"#, short_key, level), None),
            // true/false lets the firmware apply its default manual power.
            None => (format!(r#"{{"set":{{"{}":{}}}}}"#, short_key, state), None),
        };
    }

    if name == "adj_conv" && voltage_control {
        return match value {
            Some(volts) => (
                format!(r#"{{"set":{{"{}":{:.2}}}}}"#, short_key, volts),
                Some(volts),
            ),
            // Booleans avoid the firmware reading "1" as 1 volt.
            None => (format!(r#"{{"set":{{"{}":{}}}}}"#, short_key, state), None),
        };
    }

    if name == "master_power" {
        let state_int = if state { 1 } else { 0 };
        return (format!(r#"{{"set":{{"{}":{}}}}}"#, short_key, state_int), None);
    }

    (format!(r#"{{"set":{{"{}":{}}}}}"#, short_key, state), None)
}

async fn put_set_switch(
    Path(device_number): Path<u32>,
    State(state): State<AppState>,
    Form(form): Form<Params>,
) -> Json<AlpacaResponse<()>> {
    handle_switch_write(device_number, state, form).await
}

async fn put_set_switch_value(
    Path(device_number): Path<u32>,
    State(state): State<AppState>,
    Form(form): Form<Params>,
) -> Json<AlpacaResponse<()>> {
    handle_switch_write(device_number, state, form).await
}

async fn handle_switch_write(
    device_number: u32,
    state: AppState,
    form: Params,
) -> Json<AlpacaResponse<()>> {
    let ctid = client_transaction_id(&form);
    if let Some(err) = check_device_number(device_number, (), ctid) {
        return err;
    }
    let (id, name) = match resolve_switch(&state, &form).await {
        Ok(resolved) => resolved,
        Err(msg) => return Json(AlpacaResponse::error((), ctid, ERR_INVALID_VALUE, msg)),
    };

    if is_sensor_switch(&name) {
        return Json(AlpacaResponse::error(
            (),
            ctid,
            ERR_INVALID_VALUE,
            "Sensor switches are read-only and cannot be set".to_string(),
        ));
    }

    // Either a numeric Value or a boolean State must be present.
    let value = param(&form, "Value").and_then(parse_float);
    let on = match (value, param(&form, "State").and_then(parse_bool)) {
        (Some(level), _) => level >= 1.0,
        (None, Some(flag)) => flag,
        (None, None) => {
            return Json(AlpacaResponse::error(
                (),
                ctid,
                ERR_INVALID_VALUE,
                "Missing Value or State parameter".to_string(),
            ))
        }
    };

    let (short_key, manual_heater) = {
        let table = state.manager.switch_table().await;
        let Some(short_key) = table.short_key(id).map(str::to_string) else {
            return Json(AlpacaResponse::error(
                (),
                ctid,
                ERR_INVALID_VALUE,
                format!("Switch id {} out of range", id),
            ));
        };
        let status = state.manager.status().await;
        (short_key, is_manual_heater(&status, &name))
    };

    let voltage_control = state.config.get().await.enable_alpaca_voltage_control;
    let (command, new_voltage_target) =
        build_set_command(&name, &short_key, value, on, manual_heater, voltage_control);

    let response = match state.manager.send_command(&command, Priority::High, None).await {
        Ok(response) => response,
        Err(e) => {
            return Json(AlpacaResponse::error(
                (),
                ctid,
                ERR_DRIVER,
                format!("Failed to send command: {}", e),
            ))
        }
    };

    if let Some(target) = new_voltage_target {
        state.manager.set_voltage_target(target).await;
    }

    // Read-your-writes: the set reply carries the new status, so the cache
    // reflects the change before the next periodic refresh.
    if let Err(e) = state.manager.apply_status_response(&response).await {
        warn!("Could not apply status from set response: {}. Raw data: {}", e, response);
    }

    Json(AlpacaResponse::success((), ctid))
}

async fn put_set_switch_name(
    Path(device_number): Path<u32>,
    State(state): State<AppState>,
    Form(form): Form<Params>,
) -> Json<AlpacaResponse<()>> {
    let ctid = client_transaction_id(&form);
    if let Some(err) = check_device_number(device_number, (), ctid) {
        return err;
    }
    let (id, name) = match resolve_switch(&state, &form).await {
        Ok(resolved) => resolved,
        Err(msg) => return Json(AlpacaResponse::error((), ctid, ERR_INVALID_VALUE, msg)),
    };

    if is_sensor_switch(&name) {
        return Json(AlpacaResponse::error(
            (),
            ctid,
            ERR_INVALID_VALUE,
            "Sensor switches have fixed names and cannot be renamed".to_string(),
        ));
    }

    let Some(new_name) = param(&form, "Name").map(str::to_string) else {
        return Json(AlpacaResponse::error(
            (),
            ctid,
            ERR_INVALID_VALUE,
            "Missing Name parameter".to_string(),
        ));
    };

    info!("Set custom name for switch {} ('{}') to '{}'", id, name, new_name);
    let result = state
        .config
        .update(move |config| {
            config.switch_names.insert(name, new_name);
        })
        .await;
    match result {
        Ok(()) => Json(AlpacaResponse::success((), ctid)),
        Err(e) => Json(AlpacaResponse::error(
            (),
            ctid,
            ERR_DRIVER,
            format!("Failed to save configuration: {}", e),
        )),
    }
}

// --- ObservingConditions endpoints ---

async fn get_obscond_supported_actions(
    Path(device_number): Path<u32>,
    Query(query): Query<Params>,
) -> Json<AlpacaResponse<Vec<String>>> {
    let ctid = client_transaction_id(&query);
    if let Some(err) = check_device_number(device_number, vec![], ctid) {
        return err;
    }
    Json(AlpacaResponse::success(vec!["getlenstemperature".to_string()], ctid))
}

async fn put_obscond_action(
    Path(device_number): Path<u32>,
    State(state): State<AppState>,
    Form(form): Form<Params>,
) -> Json<AlpacaResponse<String>> {
    let ctid = client_transaction_id(&form);
    if let Some(err) = check_device_number(device_number, String::new(), ctid) {
        return err;
    }
    let Some(action) = param(&form, "Action") else {
        return Json(AlpacaResponse::error(
            String::new(),
            ctid,
            ERR_INVALID_VALUE,
            "Missing Action parameter".to_string(),
        ));
    };

    if action.eq_ignore_ascii_case("getlenstemperature") {
        let conditions = state.manager.conditions().await;
        return match conditions.get("t_lens").and_then(FieldValue::as_f64) {
            Some(temp) => Json(AlpacaResponse::success(format!("{}", temp), ctid)),
            None => Json(AlpacaResponse::error(
                String::new(),
                ctid,
                ERR_VALUE_NOT_SET,
                "Sensor not available or failed to read.".to_string(),
            )),
        };
    }

    Json(AlpacaResponse::error(
        String::new(),
        ctid,
        ERR_INVALID_VALUE,
        format!("Action '{}' is not supported.", action),
    ))
}

async fn condition_field(
    state: &AppState,
    query: &Params,
    key: &str,
) -> Json<AlpacaResponse<f64>> {
    let ctid = client_transaction_id(query);
    let conditions = state.manager.conditions().await;
    match conditions.get(key).and_then(FieldValue::as_f64) {
        Some(value) => Json(AlpacaResponse::success(value, ctid)),
        None => Json(AlpacaResponse::error(
            0.0,
            ctid,
            ERR_VALUE_NOT_SET,
            "Sensor not available or failed to read.".to_string(),
        )),
    }
}

async fn get_temperature(
    Path(device_number): Path<u32>,
    Query(query): Query<Params>,
    State(state): State<AppState>,
) -> Json<AlpacaResponse<f64>> {
    let ctid = client_transaction_id(&query);
    if let Some(err) = check_device_number(device_number, 0.0, ctid) {
        return err;
    }
    condition_field(&state, &query, "t_amb").await
}

async fn get_humidity(
    Path(device_number): Path<u32>,
    Query(query): Query<Params>,
    State(state): State<AppState>,
) -> Json<AlpacaResponse<f64>> {
    let ctid = client_transaction_id(&query);
    if let Some(err) = check_device_number(device_number, 0.0, ctid) {
        return err;
    }
    condition_field(&state, &query, "h_amb").await
}

async fn get_dew_point(
    Path(device_number): Path<u32>,
    Query(query): Query<Params>,
    State(state): State<AppState>,
) -> Json<AlpacaResponse<f64>> {
    let ctid = client_transaction_id(&query);
    if let Some(err) = check_device_number(device_number, 0.0, ctid) {
        return err;
    }
    condition_field(&state, &query, "d").await
}

async fn not_implemented(Query(query): Query<Params>) -> Json<AlpacaResponse<f64>> {
    Json(AlpacaResponse::error(
        0.0,
        client_transaction_id(&query),
        ERR_NOT_IMPLEMENTED,
        "Property not implemented by this driver.".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_localized_decimals() {
        assert_eq!(parse_float("12,5"), Some(12.5));
        assert_eq!(parse_float("12.5"), Some(12.5));
        assert_eq!(parse_float("nope"), None);
    }

    #[test]
    fn set_command_for_plain_channel_uses_booleans() {
        let (cmd, target) = build_set_command("dc1", "d1", None, true, false, false);
        assert_eq!(cmd, r#"{"set":{"d1":true}}"#);
        assert!(target.is_none());

        // A numeric Value on a non-manual channel still collapses to a bool.
        let (cmd, _) = build_set_command("dc1", "d1", Some(1.0), true, false, false);
        assert_eq!(cmd, r#"{"set":{"d1":true}}"#);
    }

    #[test]
    fn set_command_for_manual_heater_passes_level() {
        let (cmd, target) = build_set_command("pwm1", "pwm1", Some(75.0), true, true, false);
        assert_eq!(cmd, r#"{"set":{"pwm1":75}}"#);
        assert!(target.is_none());

        let (cmd, _) = build_set_command("pwm1", "pwm1", None, false, true, false);
        assert_eq!(cmd, r#"{"set":{"pwm1":false}}"#);
    }

    #[test]
    fn set_command_for_adjustable_voltage_records_target() {
        let (cmd, target) = build_set_command("adj_conv", "adj", Some(12.5), true, false, true);
        assert_eq!(cmd, r#"{"set":{"adj":12.50}}"#);
        assert_eq!(target, Some(12.5));

        // Without voltage control the channel behaves like a plain switch.
        let (cmd, target) = build_set_command("adj_conv", "adj", Some(12.5), true, false, false);
        assert_eq!(cmd, r#"{"set":{"adj":true}}"#);
        assert!(target.is_none());
    }

    #[test]
    fn set_command_for_master_power_uses_integers() {
        let (cmd, _) = build_set_command("master_power", "all", None, true, false, false);
        assert_eq!(cmd, r#"{"set":{"all":1}}"#);
        let (cmd, _) = build_set_command("master_power", "all", None, false, false, false);
        assert_eq!(cmd, r#"{"set":{"all":0}}"#);
    }

    #[test]
    fn manual_heater_detection_reads_dew_modes() {
        let mut status = crate::protocol::FieldMap::new();
        status.insert("dm".to_string(), FieldValue::NumberArray(vec![0.0, 3.0]));
        assert!(is_manual_heater(&status, "pwm1"));
        assert!(!is_manual_heater(&status, "pwm2"));
        assert!(!is_manual_heater(&status, "dc1"));

        status.remove("dm");
        assert!(!is_manual_heater(&status, "pwm1"));
    }

    #[test]
    fn case_insensitive_param_lookup() {
        let mut params = Params::new();
        params.insert("clienttransactionid".to_string(), "42".to_string());
        params.insert("ID".to_string(), "3".to_string());
        assert_eq!(client_transaction_id(&params), 42);
        assert_eq!(param(&params, "Id"), Some("3"));
    }
}
