//! Transport error types

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during transport operations
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("not connected to device")]
    NotConnected,

    #[error("no device to connect to, run a scan first")]
    NoDevice,

    #[error("no Bluetooth adapter available")]
    NoAdapter,

    #[error("GATT characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("no response to {command}")]
    Timeout { command: String },

    #[error("bluetooth error: {0}")]
    Ble(#[from] btleplug::Error),
}
