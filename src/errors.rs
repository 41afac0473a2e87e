use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout waiting for device response")]
    Timeout,

    #[error("Serial port is not open")]
    NotConnected,

    #[error("Could not find powerbox on any USB serial port")]
    DeviceNotFound,

    #[error("Invalid response from device: {0}")]
    InvalidResponse(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Command processor is not running")]
    WorkerGone,

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
