// chargied - Chargie charge management daemon
// Charge engine, battery sysfs reader, config, and HTTP control surface

pub mod battery;
pub mod config;
pub mod engine;
pub mod server;

pub use battery::{BatteryReader, BatteryStatus};
pub use config::{ChargeConfig, Config, ConfigError, DaemonConfig, PdMode};
pub use engine::{ChargeEngine, ChartHistory, ConfigUpdate, EngineError, EngineStatus, Phase};
