//! Configuration loading (TOML) and persisted runtime state (JSON).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Default HTTP port of the daemon.
pub const DEFAULT_PORT: u16 = 7380;

/// Configuration validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("charge_max must be 20-100, got {0}")]
    MaxOutOfRange(u8),

    #[error("charge_min must be 20-100, got {0}")]
    MinOutOfRange(u8),

    #[error("charge_min must be below charge_max, got min={min} max={max}")]
    WindowInverted { min: u8, max: u8 },

    #[error("pd_mode must be 1 or 2, got {0}")]
    BadPdMode(u8),

    #[error("{0} must be at least 1 second")]
    BadInterval(&'static str),

    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
}

/// USB Power Delivery negotiation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdMode {
    /// Reduced voltage/wattage contract.
    Half = 1,
    /// Maximum negotiated contract.
    Full = 2,
}

impl PdMode {
    pub fn from_int(value: u8) -> Result<Self, ConfigError> {
        match value {
            1 => Ok(Self::Half),
            2 => Ok(Self::Full),
            other => Err(ConfigError::BadPdMode(other)),
        }
    }

    pub fn as_int(&self) -> u8 {
        *self as u8
    }
}

/// Validated charge-window settings. Immutable after construction;
/// the engine replaces the whole value on update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeConfig {
    pub charge_max: u8,
    pub charge_min: u8,
    pub pd_mode: PdMode,
    /// Battery sysfs poll period, seconds.
    pub poll_interval: u64,
    /// Telemetry keep-alive period, seconds.
    pub telemetry_interval: u64,
    pub auto_reconnect: bool,
}

impl ChargeConfig {
    pub fn new(
        charge_max: u8,
        charge_min: u8,
        pd_mode: PdMode,
        poll_interval: u64,
        telemetry_interval: u64,
        auto_reconnect: bool,
    ) -> Result<Self, ConfigError> {
        if !(20..=100).contains(&charge_max) {
            return Err(ConfigError::MaxOutOfRange(charge_max));
        }
        if !(20..=100).contains(&charge_min) {
            return Err(ConfigError::MinOutOfRange(charge_min));
        }
        if charge_min >= charge_max {
            return Err(ConfigError::WindowInverted {
                min: charge_min,
                max: charge_max,
            });
        }
        if poll_interval == 0 {
            return Err(ConfigError::BadInterval("poll_interval"));
        }
        if telemetry_interval == 0 {
            return Err(ConfigError::BadInterval("telemetry_interval"));
        }
        Ok(Self {
            charge_max,
            charge_min,
            pd_mode,
            poll_interval,
            telemetry_interval,
            auto_reconnect,
        })
    }
}

impl Default for ChargeConfig {
    fn default() -> Self {
        Self {
            charge_max: 80,
            charge_min: 75,
            pd_mode: PdMode::Full,
            poll_interval: 3,
            telemetry_interval: 30,
            auto_reconnect: true,
        }
    }
}

/// Daemon-level settings.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub port: u16,
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub charge: ChargeConfig,
    pub daemon: DaemonConfig,
}

// Raw serde mirror of the TOML file; validated into the real structs.
#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    charge: RawChargeConfig,
    #[serde(default)]
    daemon: RawDaemonConfig,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawChargeConfig {
    #[serde(default = "default_charge_max")]
    charge_max: u8,
    #[serde(default = "default_charge_min")]
    charge_min: u8,
    #[serde(default = "default_pd_mode")]
    pd_mode: u8,
    #[serde(default = "default_poll_interval")]
    poll_interval: u64,
    #[serde(default = "default_telemetry_interval")]
    telemetry_interval: u64,
    #[serde(default = "default_true")]
    auto_reconnect: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDaemonConfig {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_log_level")]
    log_level: String,
}

fn default_charge_max() -> u8 {
    ChargeConfig::default().charge_max
}
fn default_charge_min() -> u8 {
    ChargeConfig::default().charge_min
}
fn default_pd_mode() -> u8 {
    2
}
fn default_poll_interval() -> u64 {
    ChargeConfig::default().poll_interval
}
fn default_telemetry_interval() -> u64 {
    ChargeConfig::default().telemetry_interval
}
fn default_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RawChargeConfig {
    fn default() -> Self {
        Self {
            charge_max: default_charge_max(),
            charge_min: default_charge_min(),
            pd_mode: default_pd_mode(),
            poll_interval: default_poll_interval(),
            telemetry_interval: default_telemetry_interval(),
            auto_reconnect: true,
        }
    }
}

impl Default for RawDaemonConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            log_level: default_log_level(),
        }
    }
}

fn validate(raw: RawConfig) -> Result<Config, ConfigError> {
    let charge = ChargeConfig::new(
        raw.charge.charge_max,
        raw.charge.charge_min,
        PdMode::from_int(raw.charge.pd_mode)?,
        raw.charge.poll_interval,
        raw.charge.telemetry_interval,
        raw.charge.auto_reconnect,
    )?;
    Ok(Config {
        charge,
        daemon: DaemonConfig {
            port: raw.daemon.port,
            log_level: raw.daemon.log_level,
        },
    })
}

/// Parse and validate a TOML config document.
pub fn parse_config(text: &str) -> Result<Config, ConfigError> {
    validate(toml::from_str(text)?)
}

fn config_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(dir));
    }
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config"))
}

fn state_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_STATE_HOME") {
        return Some(PathBuf::from(dir));
    }
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/state"))
}

/// Default location of the persisted-state file.
pub fn default_state_path() -> Option<PathBuf> {
    state_dir().map(|dir| dir.join("chargie/state.json"))
}

/// Load the config file, searching the usual locations when no
/// explicit path is given. Missing files fall back to defaults;
/// malformed or invalid files are an error.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let candidates: Vec<PathBuf> = match path {
        Some(p) => vec![p.to_path_buf()],
        None => {
            let mut list = Vec::new();
            if let Some(dir) = config_dir() {
                list.push(dir.join("chargie/config.toml"));
            }
            list.push(PathBuf::from("/etc/chargie/config.toml"));
            list
        }
    };

    for candidate in &candidates {
        if candidate.is_file() {
            info!("Loading config from {}", candidate.display());
            let text = fs::read_to_string(candidate)?;
            return parse_config(&text);
        }
    }

    info!("No config file found, using defaults");
    Ok(Config::default())
}

/// Runtime state persisted across daemon restarts.
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct StateFile {
    pub charge_max: Option<u8>,
    pub charge_min: Option<u8>,
    pub telemetry_interval: Option<u64>,
    pub pd_mode: Option<u8>,
}

/// Merge persisted state over the loaded config. Invalid or
/// unreadable state is logged and ignored, keeping config values.
pub fn load_state(config: &mut Config, path: &Path) {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(_) => return,
    };
    let state: StateFile = match serde_json::from_str(&text) {
        Ok(state) => state,
        Err(e) => {
            warn!("Ignoring malformed state file {}: {e}", path.display());
            return;
        }
    };

    let pd_mode = match state.pd_mode {
        Some(raw) => match PdMode::from_int(raw) {
            Ok(mode) => mode,
            Err(e) => {
                warn!("Ignoring persisted state: {e}");
                return;
            }
        },
        None => config.charge.pd_mode,
    };

    match ChargeConfig::new(
        state.charge_max.unwrap_or(config.charge.charge_max),
        state.charge_min.unwrap_or(config.charge.charge_min),
        pd_mode,
        config.charge.poll_interval,
        state
            .telemetry_interval
            .unwrap_or(config.charge.telemetry_interval),
        config.charge.auto_reconnect,
    ) {
        Ok(charge) => {
            info!(
                "Restored state: max={}% min={}% pd={} telemetry_interval={}s",
                charge.charge_max,
                charge.charge_min,
                charge.pd_mode.as_int(),
                charge.telemetry_interval
            );
            config.charge = charge;
        }
        Err(e) => warn!("Ignoring persisted state: {e}"),
    }
}

/// Write the persisted-state file for the given settings.
pub fn save_state(path: &Path, charge: &ChargeConfig) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let state = StateFile {
        charge_max: Some(charge.charge_max),
        charge_min: Some(charge.charge_min),
        telemetry_interval: Some(charge.telemetry_interval),
        pd_mode: Some(charge.pd_mode.as_int()),
    };
    let text = serde_json::to_string_pretty(&state).map_err(io::Error::other)?;
    fs::write(path, text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.charge.charge_max, 80);
        assert_eq!(config.charge.charge_min, 75);
        assert_eq!(config.charge.pd_mode, PdMode::Full);
        assert_eq!(config.charge.poll_interval, 3);
        assert_eq!(config.charge.telemetry_interval, 30);
        assert!(config.charge.auto_reconnect);
        assert_eq!(config.daemon.port, DEFAULT_PORT);
    }

    #[test]
    fn test_window_boundaries() {
        // One percent of hysteresis is enough
        assert!(ChargeConfig::new(81, 80, PdMode::Full, 3, 30, true).is_ok());
        assert!(matches!(
            ChargeConfig::new(80, 80, PdMode::Full, 3, 30, true),
            Err(ConfigError::WindowInverted { .. })
        ));
        assert!(matches!(
            ChargeConfig::new(101, 75, PdMode::Full, 3, 30, true),
            Err(ConfigError::MaxOutOfRange(101))
        ));
        assert!(matches!(
            ChargeConfig::new(80, 19, PdMode::Full, 3, 30, true),
            Err(ConfigError::MinOutOfRange(19))
        ));
        assert!(ChargeConfig::new(100, 20, PdMode::Half, 3, 30, true).is_ok());
    }

    #[test]
    fn test_pd_mode_values() {
        assert_eq!(PdMode::from_int(1).unwrap(), PdMode::Half);
        assert_eq!(PdMode::from_int(2).unwrap(), PdMode::Full);
        assert!(matches!(PdMode::from_int(3), Err(ConfigError::BadPdMode(3))));
    }

    #[test]
    fn test_parse_toml() {
        let config = parse_config(
            r#"
            [charge]
            charge_max = 90
            charge_min = 60
            pd_mode = 1

            [daemon]
            port = 9000
            log_level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.charge.charge_max, 90);
        assert_eq!(config.charge.charge_min, 60);
        assert_eq!(config.charge.pd_mode, PdMode::Half);
        // Unspecified values keep defaults
        assert_eq!(config.charge.poll_interval, 3);
        assert_eq!(config.daemon.port, 9000);
        assert_eq!(config.daemon.log_level, "debug");
    }

    #[test]
    fn test_parse_toml_rejects_bad_window() {
        let err = parse_config("[charge]\ncharge_max = 60\ncharge_min = 70\n").unwrap_err();
        assert!(matches!(err, ConfigError::WindowInverted { .. }));
    }

    #[test]
    fn test_parse_toml_rejects_unknown_keys() {
        assert!(parse_config("[charge]\nlimit = 80\n").is_err());
    }

    #[test]
    fn test_state_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");

        let charge = ChargeConfig::new(85, 70, PdMode::Half, 3, 60, true).unwrap();
        save_state(&path, &charge).unwrap();

        let mut config = Config::default();
        load_state(&mut config, &path);
        assert_eq!(config.charge.charge_max, 85);
        assert_eq!(config.charge.charge_min, 70);
        assert_eq!(config.charge.pd_mode, PdMode::Half);
        assert_eq!(config.charge.telemetry_interval, 60);
    }

    #[test]
    fn test_invalid_state_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");

        fs::write(&path, r#"{"charge_max": 50, "charge_min": 90}"#).unwrap();
        let mut config = Config::default();
        load_state(&mut config, &path);
        assert_eq!(config.charge.charge_max, 80);
        assert_eq!(config.charge.charge_min, 75);

        fs::write(&path, "not json").unwrap();
        load_state(&mut config, &path);
        assert_eq!(config.charge.charge_max, 80);
    }

    #[test]
    fn test_missing_state_file_is_silent() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        load_state(&mut config, &tmp.path().join("nope.json"));
        assert_eq!(config.charge, ChargeConfig::default());
    }
}
