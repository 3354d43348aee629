//! Transport layer for Chargie BLE charging limiters
//!
//! This crate provides the AT line protocol spoken by Chargie devices
//! and a serialized request/response transport on top of a GATT
//! write/notify characteristic pair:
//!
//! ```text
//!        [btleplug adapter]         ← raw GATT I/O
//!               |
//!         [BleTransport]            ← response matching, send lock, spacing
//!               |
//!         [charge engine]
//! ```

pub mod ble;
pub mod error;
pub mod protocol;

pub use ble::{
    BleTransport, ConnectionState, FoundDevice, Transport, COMMAND_SPACING, CONNECT_TIMEOUT,
    RESPONSE_TIMEOUT, SCAN_TIMEOUT,
};
pub use error::TransportError;
pub use protocol::{Capabilities, DeviceInfo, ParseError, Telemetry};

use std::sync::Arc;

/// Type alias for a shared transport handle
pub type BoxedTransport = Arc<dyn Transport>;
