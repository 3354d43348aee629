//! AT command protocol for Chargie BLE devices.
//!
//! Commands are ASCII strings prefixed `AT+`, terminated by `?` for
//! queries or a single digit for setters. Responses are ASCII
//! `OK+KEY` or `OK+KEY:VALUE`, one frame per BLE notification.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Primary service UUID advertised by Chargie devices.
pub const SERVICE_UUID_PRIMARY: Uuid = Uuid::from_u128(0x0000ffd6_0000_1000_8000_00805f9b34fb);
/// Alternate service UUID seen on some hardware revisions.
pub const SERVICE_UUID_ALT: Uuid = Uuid::from_u128(0x0000ffaa_0000_1000_8000_00805f9b34fb);
/// UUIDs accepted during scanning. Name-based filtering is never used.
pub const SCAN_SERVICE_UUIDS: [Uuid; 2] = [SERVICE_UUID_PRIMARY, SERVICE_UUID_ALT];

/// Single characteristic used for both writes and notifications.
pub const CHAR_UUID: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

pub const CMD_STAT: &str = "AT+STAT?";
pub const CMD_CAPA: &str = "AT+CAPA?";
pub const CMD_FWVR: &str = "AT+FWVR?";
pub const CMD_HWVR: &str = "AT+HWVR?";
pub const CMD_ISPD: &str = "AT+ISPD?";

/// Cut USB-C power (stop charging).
pub const CMD_POWER_OFF: &str = "AT+PIO20";
/// Restore USB-C power (start charging).
pub const CMD_POWER_ON: &str = "AT+PIO21";

/// Half PD, reduced voltage/wattage.
pub const CMD_PD_MODE_1: &str = "AT+PDMO1";
/// Full PD, maximum negotiated voltage/wattage.
pub const CMD_PD_MODE_2: &str = "AT+PDMO2";

/// PD is considered active only above this voltage. USB base is 5 V,
/// so anything strictly above confirms a negotiated step-up. Empirical
/// threshold validated against real hardware.
pub const PD_MIN_VOLTS: f64 = 5.5;

/// How long to poll STAT before declaring a PD attempt failed.
pub const PD_CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);
/// Settle time after cutting the relay.
pub const PD_RELAY_OFF_DELAY: Duration = Duration::from_secs(1);
/// Settle time after closing the relay, before PD commands.
pub const PD_RELAY_ON_DELAY: Duration = Duration::from_secs(2);

const CAPA_BIT_PD: u32 = 0;
const CAPA_BIT_FET2: u32 = 1;
const CAPA_BIT_AUTO: u32 = 2;

/// Setter commands whose final digit encodes a parameter. Their
/// response key is the command body minus that digit (`PIO21` answers
/// `OK+PIO2:1`).
const STRIP_LAST_DIGIT: [&str; 4] = ["PIO20", "PIO21", "PDMO1", "PDMO2"];

/// Response key a command is expected to be answered with.
///
/// Purely syntactic: strip `AT+`, strip a trailing `?`, and for the
/// digit-parameter setter family strip the final digit.
pub fn expected_response_key(command: &str) -> &str {
    let body = command.strip_prefix("AT+").unwrap_or(command);
    let body = body.strip_suffix('?').unwrap_or(body);
    if STRIP_LAST_DIGIT.contains(&body) {
        &body[..body.len() - 1]
    } else {
        body
    }
}

/// Key of an `OK+KEY[:VALUE]` frame.
pub fn response_key(response: &str) -> &str {
    let body = response.strip_prefix("OK+").unwrap_or(response);
    match body.split_once(':') {
        Some((key, _)) => key,
        None => body,
    }
}

/// Decoded device capability bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Raw bitmask as reported, kept for round-tripping.
    pub raw: u32,
    /// Supports USB Power Delivery.
    pub pd: bool,
    /// Has a second FET (dual-channel).
    pub fet2: bool,
    /// Supports auto mode.
    pub auto: bool,
}

/// One voltage/current reading from the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Telemetry {
    pub volts: f64,
    pub amps: f64,
}

impl Telemetry {
    /// Derived power, rounded to two decimals.
    pub fn watts(&self) -> f64 {
        (self.volts * self.amps * 100.0).round() / 100.0
    }
}

/// Firmware/hardware identity, populated once after verification.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub firmware: String,
    pub hardware: String,
    pub capabilities: Capabilities,
}

/// A device response that could not be decoded. Carries the raw text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("not an OK+ response: {raw:?}")]
    NotOk { raw: String },

    #[error("expected {expected} response, got {got}: {raw:?}")]
    KeyMismatch {
        expected: &'static str,
        got: String,
        raw: String,
    },

    #[error("bad {key} payload: {raw:?}")]
    BadPayload { key: &'static str, raw: String },
}

/// Split a raw frame into `(key, value)`. The value is empty for
/// frames without a `:`.
pub fn parse_response(raw: &str) -> Result<(&str, &str), ParseError> {
    let trimmed = raw.trim();
    let body = trimmed.strip_prefix("OK+").ok_or_else(|| ParseError::NotOk {
        raw: raw.to_string(),
    })?;
    Ok(match body.split_once(':') {
        Some((key, value)) => (key, value),
        None => (body, ""),
    })
}

fn expect_key<'a>(
    raw: &'a str,
    expected: &'static str,
) -> Result<(&'a str, &'a str), ParseError> {
    let (key, value) = parse_response(raw)?;
    if key != expected {
        return Err(ParseError::KeyMismatch {
            expected,
            got: key.to_string(),
            raw: raw.to_string(),
        });
    }
    Ok((key, value))
}

/// Decode an `OK+STAT:A/V` frame. The on-wire order is amps first,
/// volts second.
pub fn parse_telemetry(raw: &str) -> Result<Telemetry, ParseError> {
    let (_, value) = expect_key(raw, "STAT")?;
    let bad = || ParseError::BadPayload {
        key: "STAT",
        raw: raw.to_string(),
    };
    let (amps_s, volts_s) = value.split_once('/').ok_or_else(bad)?;
    let amps: f64 = amps_s.parse().map_err(|_| bad())?;
    let volts: f64 = volts_s.parse().map_err(|_| bad())?;
    Ok(Telemetry { volts, amps })
}

/// Decode an `OK+CAPA:<decimal>` bitmask frame.
pub fn parse_capabilities(raw: &str) -> Result<Capabilities, ParseError> {
    let (_, value) = expect_key(raw, "CAPA")?;
    let bitmask: u32 = value.parse().map_err(|_| ParseError::BadPayload {
        key: "CAPA",
        raw: raw.to_string(),
    })?;
    Ok(Capabilities {
        raw: bitmask,
        pd: bitmask & (1 << CAPA_BIT_PD) != 0,
        fet2: bitmask & (1 << CAPA_BIT_FET2) != 0,
        auto: bitmask & (1 << CAPA_BIT_AUTO) != 0,
    })
}

/// Decode an `OK+PIO2:0|1` relay-state frame. `true` means power on.
pub fn parse_power_state(raw: &str) -> Result<bool, ParseError> {
    let (_, value) = expect_key(raw, "PIO2")?;
    match value {
        "1" => Ok(true),
        "0" => Ok(false),
        _ => Err(ParseError::BadPayload {
            key: "PIO2",
            raw: raw.to_string(),
        }),
    }
}

/// Firmware version string, verbatim.
pub fn parse_firmware(raw: &str) -> Result<String, ParseError> {
    let (_, value) = expect_key(raw, "FWVR")?;
    Ok(value.to_string())
}

/// Hardware revision string, verbatim.
pub fn parse_hardware(raw: &str) -> Result<String, ParseError> {
    let (_, value) = expect_key(raw, "HWVR")?;
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_key_queries() {
        assert_eq!(expected_response_key(CMD_STAT), "STAT");
        assert_eq!(expected_response_key(CMD_CAPA), "CAPA");
        assert_eq!(expected_response_key(CMD_FWVR), "FWVR");
        assert_eq!(expected_response_key(CMD_HWVR), "HWVR");
        assert_eq!(expected_response_key(CMD_ISPD), "ISPD");
    }

    #[test]
    fn test_expected_key_strips_setter_digit() {
        assert_eq!(expected_response_key(CMD_POWER_OFF), "PIO2");
        assert_eq!(expected_response_key(CMD_POWER_ON), "PIO2");
        assert_eq!(expected_response_key(CMD_PD_MODE_1), "PDMO");
        assert_eq!(expected_response_key(CMD_PD_MODE_2), "PDMO");
    }

    #[test]
    fn test_response_key() {
        assert_eq!(response_key("OK+STAT:1.50/12.00"), "STAT");
        assert_eq!(response_key("OK+PIO2:1"), "PIO2");
        assert_eq!(response_key("OK+ISPD"), "ISPD");
    }

    #[test]
    fn test_parse_telemetry_amps_first() {
        // On-wire order is A/V
        let t = parse_telemetry("OK+STAT:1.50/12.00").unwrap();
        assert_eq!(t.amps, 1.5);
        assert_eq!(t.volts, 12.0);
        assert_eq!(t.watts(), 18.0);
    }

    #[test]
    fn test_watts_rounded_two_decimals() {
        let t = Telemetry {
            volts: 9.01,
            amps: 1.11,
        };
        assert_eq!(t.watts(), 10.0);
    }

    #[test]
    fn test_parse_telemetry_rejects_garbage() {
        assert!(matches!(
            parse_telemetry("OK+STAT:abc"),
            Err(ParseError::BadPayload { key: "STAT", .. })
        ));
        assert!(matches!(
            parse_telemetry("OK+CAPA:7"),
            Err(ParseError::KeyMismatch {
                expected: "STAT",
                ..
            })
        ));
        assert!(matches!(
            parse_telemetry("ERROR"),
            Err(ParseError::NotOk { .. })
        ));
    }

    #[test]
    fn test_parse_capabilities_bits() {
        let caps = parse_capabilities("OK+CAPA:7").unwrap();
        assert_eq!(caps.raw, 7);
        assert!(caps.pd);
        assert!(caps.fet2);
        assert!(caps.auto);

        let caps = parse_capabilities("OK+CAPA:1").unwrap();
        assert!(caps.pd);
        assert!(!caps.fet2);
        assert!(!caps.auto);

        let caps = parse_capabilities("OK+CAPA:0").unwrap();
        assert!(!caps.pd && !caps.fet2 && !caps.auto);
    }

    #[test]
    fn test_parse_capabilities_bad_payload() {
        assert!(matches!(
            parse_capabilities("OK+CAPA:x"),
            Err(ParseError::BadPayload { key: "CAPA", .. })
        ));
    }

    #[test]
    fn test_parse_power_state() {
        assert!(parse_power_state("OK+PIO2:1").unwrap());
        assert!(!parse_power_state("OK+PIO2:0").unwrap());
        assert!(matches!(
            parse_power_state("OK+PIO2:2"),
            Err(ParseError::BadPayload { key: "PIO2", .. })
        ));
    }

    #[test]
    fn test_parse_versions_verbatim() {
        assert_eq!(parse_firmware("OK+FWVR:3.1.7").unwrap(), "3.1.7");
        assert_eq!(parse_hardware("OK+HWVR:rev C").unwrap(), "rev C");
    }

    #[test]
    fn test_parse_response_trims_frame() {
        let (key, value) = parse_response("OK+STAT:0.00/5.00\r\n").unwrap();
        assert_eq!(key, "STAT");
        assert_eq!(value, "0.00/5.00");
    }

    #[test]
    fn test_error_carries_raw_text() {
        let err = parse_telemetry("BADFRAME").unwrap_err();
        assert!(err.to_string().contains("BADFRAME"));
    }
}
