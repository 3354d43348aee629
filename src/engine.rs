//! Charge engine: state machine and control logic for Chargie devices.
//!
//! The engine owns a single BLE transport, enforces the configured
//! charge window from battery sysfs readings, and publishes every
//! state or telemetry change on a broadcast bus.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use chargie_transport::protocol::{
    self, PD_CONFIRM_TIMEOUT, PD_MIN_VOLTS, PD_RELAY_OFF_DELAY, PD_RELAY_ON_DELAY,
};
use chargie_transport::{
    ConnectionState, DeviceInfo, ParseError, Telemetry, Transport, TransportError,
    RESPONSE_TIMEOUT, SCAN_TIMEOUT,
};

use crate::battery::{BatteryReader, BatteryStatus};
use crate::config::{ChargeConfig, ConfigError, PdMode};

/// Chart ring capacity. At one point per percent change this covers
/// days of typical cycling.
const CHART_CAPACITY: usize = 2400;

/// Reconnect backoff schedule, seconds. Attempts beyond the end reuse
/// the final delay indefinitely.
const RECONNECT_DELAYS: [u64; 5] = [5, 10, 20, 40, 60];

/// PD-on attempts before giving up on negotiation.
const PD_ATTEMPTS: u32 = 3;

/// Settle time after a PDMO command, before confirming via STAT.
const PD_RENEGOTIATE_DELAY: Duration = Duration::from_secs(2);

/// Fast keep-alive polling after an active-phase transition.
const TRANSITION_POLL: Duration = Duration::from_millis(1500);
const TRANSITION_FAST_WINDOW: Duration = Duration::from_secs(15);

/// How long the confirmation tasks wait for sysfs to agree.
const SYSFS_CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);

/// Engine operating phases, as observed by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Scanning,
    Connecting,
    Verifying,
    /// PD confirmed, waiting for the laptop to accept charge.
    NegotiatingCharge,
    Charging,
    /// Charge limit reached, power cut.
    Paused,
    Disconnected,
    Reconnecting,
}

impl Phase {
    /// Phases with a live BLE session where limit enforcement applies.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::NegotiatingCharge | Self::Charging | Self::Paused)
    }
}

/// Manual override suppressing automatic limit enforcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideMode {
    On,
    Off,
}

/// Errors surfaced by engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("override mode must be 'on', 'off', or 'auto', got {0:?}")]
    InvalidOverride(String),

    #[error("not connected to device")]
    NotConnected,

    /// The device is reachable but not behaving as a verified relay
    /// (claims the opposite power state, or PD never came up).
    #[error("{0}")]
    Connection(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Partial settings update, all fields optional.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ConfigUpdate {
    pub charge_max: Option<u8>,
    pub charge_min: Option<u8>,
    pub pd_mode: Option<u8>,
    pub telemetry_interval: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TelemetrySnapshot {
    pub volts: f64,
    pub amps: f64,
    pub watts: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CapabilitiesSnapshot {
    pub pd: bool,
    pub fet2: bool,
    pub auto: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub name: Option<String>,
    pub firmware: String,
    pub hardware: String,
    pub capabilities: CapabilitiesSnapshot,
}

/// Externally observable engine state, emitted on every update.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub phase: Phase,
    pub battery_percent: Option<u8>,
    pub is_charging: bool,
    #[serde(rename = "override")]
    pub override_mode: Option<OverrideMode>,
    pub charge_max: u8,
    pub charge_min: u8,
    pub pd_mode: u8,
    pub telemetry_interval: u64,
    pub telemetry: Option<TelemetrySnapshot>,
    pub device: Option<DeviceSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_delay: Option<u64>,
}

/// Chart ring contents as five parallel sequences.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChartHistory {
    pub timestamps: Vec<f64>,
    pub percent: Vec<u8>,
    pub charge_max: Vec<u8>,
    pub charge_min: Vec<u8>,
    pub charging: Vec<bool>,
}

#[derive(Debug, Clone, Copy)]
struct ChartPoint {
    timestamp: f64,
    percent: u8,
    charging: bool,
    charge_max: u8,
    charge_min: u8,
}

struct EngineState {
    phase: Phase,
    config: ChargeConfig,
    telemetry: Option<Telemetry>,
    device_info: Option<DeviceInfo>,
    charging: bool,
    override_mode: Option<OverrideMode>,
    reconnect_attempt: u32,
    reconnect_delay: u64,
    stopped: bool,
    chart: VecDeque<ChartPoint>,
    chart_last_percent: Option<u8>,
    sysfs_task: Option<JoinHandle<()>>,
    keepalive_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
}

type PersistHook = Box<dyn Fn(&ChargeConfig) + Send + Sync>;

/// Top-level charge controller.
///
/// State lives behind one mutex that is never held across a
/// suspension point; command sequences are serialized by `op_lock` so
/// the device never sees interleaved operation sequences.
pub struct ChargeEngine {
    transport: Arc<dyn Transport>,
    battery: Arc<BatteryReader>,
    state: Mutex<EngineState>,
    op_lock: tokio::sync::Mutex<()>,
    /// Signals the keep-alive loop on active-phase transitions.
    transition: Notify,
    update_tx: broadcast::Sender<EngineStatus>,
    persist: Mutex<Option<PersistHook>>,
    /// Self-handle for spawning owned tasks.
    weak: Weak<ChargeEngine>,
}

impl ChargeEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        battery: Arc<BatteryReader>,
        config: ChargeConfig,
    ) -> Arc<Self> {
        let (update_tx, _) = broadcast::channel(32);
        let engine = Arc::new_cyclic(|weak| Self {
            transport,
            battery,
            state: Mutex::new(EngineState {
                phase: Phase::Idle,
                config,
                telemetry: None,
                device_info: None,
                charging: false,
                override_mode: None,
                reconnect_attempt: 0,
                reconnect_delay: 0,
                stopped: false,
                chart: VecDeque::with_capacity(CHART_CAPACITY),
                chart_last_percent: None,
                sysfs_task: None,
                keepalive_task: None,
                reconnect_task: None,
            }),
            op_lock: tokio::sync::Mutex::new(()),
            transition: Notify::new(),
            update_tx,
            persist: Mutex::new(None),
            weak: weak.clone(),
        });

        let watcher = Arc::clone(&engine);
        let mut ble_states = watcher.transport.subscribe_state();
        tokio::spawn(async move {
            loop {
                match ble_states.recv().await {
                    Ok(ConnectionState::Disconnected) => watcher.handle_ble_disconnect(),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        engine
    }

    /// Install the hook invoked with the new settings whenever a
    /// config update changes anything.
    pub fn set_persist_hook<F>(&self, hook: F)
    where
        F: Fn(&ChargeConfig) + Send + Sync + 'static,
    {
        *self.persist.lock() = Some(Box::new(hook));
    }

    /// Status updates; lagging subscribers lose oldest snapshots.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineStatus> {
        self.update_tx.subscribe()
    }

    pub fn charge_config(&self) -> ChargeConfig {
        self.state.lock().config
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Scan, connect, verify, negotiate PD, and begin supervision.
    ///
    /// Finding no device is not an error (the engine simply returns to
    /// IDLE); verification and PD failures are.
    pub async fn start(&self) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock();
            state.stopped = false;
            Self::stop_reconnect_locked(&mut state);
        }
        let _guard = self.op_lock.lock().await;

        self.set_phase(Phase::Scanning);
        let found = match self.transport.scan(SCAN_TIMEOUT).await {
            Ok(found) => found,
            Err(e) => {
                self.set_phase(Phase::Idle);
                return Err(e.into());
            }
        };
        if found.is_none() {
            self.set_phase(Phase::Idle);
            return Ok(());
        }

        self.set_phase(Phase::Connecting);
        match self.transport.connect().await {
            Ok(true) => {}
            Ok(false) => {
                self.set_phase(Phase::Idle);
                return Ok(());
            }
            Err(e) => {
                self.set_phase(Phase::Idle);
                return Err(e.into());
            }
        }

        self.set_phase(Phase::Verifying);
        if !self.verify_device().await {
            error!("Device verification failed");
            let _ = self.transport.disconnect().await;
            self.set_phase(Phase::Idle);
            return Err(EngineError::Connection(
                "device failed power-cycle verification".to_string(),
            ));
        }

        self.query_device_info().await;

        if let Err(e) = self.power_on().await {
            error!("PD mode configuration failed: {e}");
            // The relay may have been left on by the failed sequence
            self.state.lock().charging = false;
            let _ = self.transport.disconnect().await;
            self.set_phase(Phase::Idle);
            return Err(e);
        }

        self.set_phase(Phase::NegotiatingCharge);
        self.start_polling();
        self.spawn_await_sysfs_charging();
        Ok(())
    }

    /// Cancel supervision, clear device state, and disconnect.
    pub async fn stop(&self) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock();
            state.stopped = true;
            Self::stop_polling_locked(&mut state);
            Self::stop_reconnect_locked(&mut state);
            state.charging = false;
            state.override_mode = None;
            state.telemetry = None;
            state.device_info = None;
        }
        self.set_phase(Phase::Idle);
        self.transport.disconnect().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Control surface
    // ------------------------------------------------------------------

    /// The full observable snapshot. Never fails.
    pub fn status(&self) -> EngineStatus {
        let percent = self.battery.read_percent();
        let state = self.state.lock();
        self.status_locked(&state, percent)
    }

    /// Apply a partial settings update. Persists via the hook when the
    /// effective settings changed.
    pub fn update_config(&self, update: ConfigUpdate) -> Result<(), ConfigError> {
        let current = self.state.lock().config;
        let pd_mode = match update.pd_mode {
            Some(raw) => PdMode::from_int(raw)?,
            None => current.pd_mode,
        };
        let new = ChargeConfig::new(
            update.charge_max.unwrap_or(current.charge_max),
            update.charge_min.unwrap_or(current.charge_min),
            pd_mode,
            current.poll_interval,
            update.telemetry_interval.unwrap_or(current.telemetry_interval),
            current.auto_reconnect,
        )?;

        self.state.lock().config = new;
        info!(
            "Config updated: max={}, min={}, pd={}, telemetry_interval={}",
            new.charge_max,
            new.charge_min,
            new.pd_mode.as_int(),
            new.telemetry_interval
        );

        if new != current {
            let persist = self.persist.lock();
            if let Some(hook) = persist.as_ref() {
                hook(&new);
            }
        }
        self.notify();
        Ok(())
    }

    /// Set or clear the manual override.
    ///
    /// `"auto"` clears the override and immediately re-runs limit
    /// enforcement; `"on"`/`"off"` require an active phase.
    pub async fn set_override(&self, mode: &str) -> Result<(), EngineError> {
        match mode {
            "auto" => {
                self.state.lock().override_mode = None;
                info!("Override cleared, returning to auto control");
                if let Some(percent) = self.battery.read_percent() {
                    let _guard = self.op_lock.lock().await;
                    self.enforce_limit(percent).await?;
                }
            }
            "on" | "off" => {
                if !self.state.lock().phase.is_active() {
                    return Err(EngineError::NotConnected);
                }
                let _guard = self.op_lock.lock().await;
                if mode == "on" {
                    self.state.lock().override_mode = Some(OverrideMode::On);
                    info!("Override: forcing charge ON");
                    self.power_on().await?;
                    self.set_phase(Phase::NegotiatingCharge);
                    self.spawn_await_sysfs_charging();
                } else {
                    self.state.lock().override_mode = Some(OverrideMode::Off);
                    info!("Override: forcing charge OFF");
                    self.power_off().await?;
                    self.set_phase(Phase::Paused);
                }
            }
            other => return Err(EngineError::InvalidOverride(other.to_string())),
        }
        self.notify();
        Ok(())
    }

    /// Manual telemetry poll; only valid while a session exists.
    pub async fn poll_telemetry(&self) -> Result<(), EngineError> {
        if !self.state.lock().phase.is_active() {
            return Err(EngineError::NotConnected);
        }
        let raw = self
            .transport
            .send_command(protocol::CMD_STAT, RESPONSE_TIMEOUT)
            .await?;
        let telemetry = protocol::parse_telemetry(&raw)?;
        self.state.lock().telemetry = Some(telemetry);
        self.notify();
        Ok(())
    }

    pub fn chart_history(&self) -> ChartHistory {
        let state = self.state.lock();
        let mut history = ChartHistory::default();
        for point in &state.chart {
            history.timestamps.push(point.timestamp);
            history.percent.push(point.percent);
            history.charge_max.push(point.charge_max);
            history.charge_min.push(point.charge_min);
            history.charging.push(point.charging);
        }
        history
    }

    // ------------------------------------------------------------------
    // Power helpers
    // ------------------------------------------------------------------

    /// Power-cycle handshake: the relay must actuate, not merely
    /// acknowledge. A device that answers with the wrong state fails.
    async fn verify_device(&self) -> bool {
        match self.run_verification().await {
            Ok(()) => {
                info!("Device verification passed");
                true
            }
            Err(e) => {
                error!("Verification failed: {e}");
                false
            }
        }
    }

    async fn run_verification(&self) -> Result<(), EngineError> {
        let resp = self
            .transport
            .send_command(protocol::CMD_POWER_OFF, RESPONSE_TIMEOUT)
            .await?;
        if protocol::parse_power_state(&resp)? {
            return Err(EngineError::Connection(
                "power-off accepted but device reports ON".to_string(),
            ));
        }
        tokio::time::sleep(PD_RELAY_OFF_DELAY).await;

        let resp = self
            .transport
            .send_command(protocol::CMD_POWER_ON, RESPONSE_TIMEOUT)
            .await?;
        if !protocol::parse_power_state(&resp)? {
            return Err(EngineError::Connection(
                "power-on accepted but device reports OFF".to_string(),
            ));
        }
        Ok(())
    }

    /// PD-on sequence: off, on, set PD mode, then confirm by observing
    /// a stepped-up voltage. The device may accept the PDMO command yet
    /// fail to renegotiate with the host, so only a voltage reading is
    /// authoritative.
    async fn power_on(&self) -> Result<(), EngineError> {
        for attempt in 1..=PD_ATTEMPTS {
            self.power_off().await?;
            tokio::time::sleep(PD_RELAY_OFF_DELAY).await;

            let resp = self
                .transport
                .send_command(protocol::CMD_POWER_ON, RESPONSE_TIMEOUT)
                .await?;
            if !protocol::parse_power_state(&resp)? {
                return Err(EngineError::Connection(
                    "power-on accepted but device reports OFF".to_string(),
                ));
            }
            self.state.lock().charging = true;
            tokio::time::sleep(PD_RELAY_ON_DELAY).await;

            if let Err(e) = self
                .transport
                .send_command(protocol::CMD_ISPD, RESPONSE_TIMEOUT)
                .await
            {
                debug!("ISPD query failed: {e}");
            }

            let pd_mode = self.state.lock().config.pd_mode;
            let cmd = match pd_mode {
                PdMode::Half => protocol::CMD_PD_MODE_1,
                PdMode::Full => protocol::CMD_PD_MODE_2,
            };
            self.transport.send_command(cmd, RESPONSE_TIMEOUT).await?;
            tokio::time::sleep(PD_RENEGOTIATE_DELAY).await;

            if self.confirm_pd_active().await {
                info!(
                    "Power on with PD mode {} (attempt {attempt})",
                    pd_mode.as_int()
                );
                return Ok(());
            }
            warn!("PD negotiation attempt {attempt} failed, retrying");
        }
        Err(EngineError::Connection(format!(
            "PD negotiation failed after {PD_ATTEMPTS} attempts"
        )))
    }

    async fn confirm_pd_active(&self) -> bool {
        let deadline = Instant::now() + PD_CONFIRM_TIMEOUT;
        while Instant::now() < deadline {
            match self
                .transport
                .send_command(protocol::CMD_STAT, RESPONSE_TIMEOUT)
                .await
            {
                Ok(raw) => match protocol::parse_telemetry(&raw) {
                    Ok(telemetry) => {
                        info!(
                            "PD confirm: {:.2}V {:.2}A (need >{:.1}V)",
                            telemetry.volts, telemetry.amps, PD_MIN_VOLTS
                        );
                        if telemetry.volts > PD_MIN_VOLTS {
                            self.state.lock().telemetry = Some(telemetry);
                            return true;
                        }
                    }
                    Err(e) => warn!("STAT parse during PD confirm failed: {e}"),
                },
                Err(e) => warn!("STAT poll during PD confirm failed: {e}"),
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        false
    }

    async fn power_off(&self) -> Result<(), EngineError> {
        let resp = self
            .transport
            .send_command(protocol::CMD_POWER_OFF, RESPONSE_TIMEOUT)
            .await?;
        if protocol::parse_power_state(&resp)? {
            return Err(EngineError::Connection(
                "power-off accepted but device reports ON".to_string(),
            ));
        }
        self.state.lock().charging = false;
        Ok(())
    }

    async fn query_device_info(&self) {
        let result: Result<DeviceInfo, EngineError> = async {
            let capa_raw = self
                .transport
                .send_command(protocol::CMD_CAPA, RESPONSE_TIMEOUT)
                .await?;
            let fw_raw = self
                .transport
                .send_command(protocol::CMD_FWVR, RESPONSE_TIMEOUT)
                .await?;
            let hw_raw = self
                .transport
                .send_command(protocol::CMD_HWVR, RESPONSE_TIMEOUT)
                .await?;
            Ok(DeviceInfo {
                firmware: protocol::parse_firmware(&fw_raw)?,
                hardware: protocol::parse_hardware(&hw_raw)?,
                capabilities: protocol::parse_capabilities(&capa_raw)?,
            })
        }
        .await;

        match result {
            Ok(device) => {
                info!(
                    "Device: FW={} HW={} PD={}",
                    device.firmware, device.hardware, device.capabilities.pd
                );
                self.state.lock().device_info = Some(device);
            }
            Err(e) => warn!("Failed to query device info: {e}"),
        }
    }

    // ------------------------------------------------------------------
    // Sysfs confirmation tasks
    // ------------------------------------------------------------------

    /// Wait for sysfs to agree with the commanded relay state.
    /// Diagnostic only; a mismatch is logged, never acted on.
    async fn confirm_sysfs_charging(&self, expected_charging: bool) {
        let deadline = Instant::now() + SYSFS_CONFIRM_TIMEOUT;
        while Instant::now() < deadline {
            let charging = self.battery.read_status() == Some(BatteryStatus::Charging);
            if charging == expected_charging {
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        warn!(
            "sysfs status did not confirm charging={expected_charging} within {}s",
            SYSFS_CONFIRM_TIMEOUT.as_secs()
        );
    }

    fn spawn_await_sysfs_charging(&self) {
        let Some(engine) = self.weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            engine.confirm_sysfs_charging(true).await;
            let promote = engine.state.lock().phase == Phase::NegotiatingCharge;
            if promote {
                engine.set_phase(Phase::Charging);
            }
        });
    }

    fn spawn_confirm_not_charging(&self) {
        let Some(engine) = self.weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            engine.confirm_sysfs_charging(false).await;
        });
    }

    // ------------------------------------------------------------------
    // Polling loops
    // ------------------------------------------------------------------

    fn start_polling(&self) {
        let Some(engine) = self.weak.upgrade() else {
            return;
        };
        let mut state = self.state.lock();
        if state.sysfs_task.is_none() {
            let engine = Arc::clone(&engine);
            state.sysfs_task = Some(tokio::spawn(async move { engine.sysfs_loop().await }));
        }
        if state.keepalive_task.is_none() {
            state.keepalive_task = Some(tokio::spawn(async move { engine.keepalive_loop().await }));
        }
    }

    fn stop_polling_locked(state: &mut EngineState) {
        if let Some(task) = state.sysfs_task.take() {
            task.abort();
        }
        if let Some(task) = state.keepalive_task.take() {
            task.abort();
        }
    }

    async fn sysfs_loop(self: Arc<Self>) {
        info!(
            "sysfs polling started (every {}s)",
            self.state.lock().config.poll_interval
        );
        loop {
            if let Some(percent) = self.battery.read_percent() {
                let _guard = self.op_lock.lock().await;
                if let Err(e) = self.enforce_limit(percent).await {
                    warn!("Charge enforcement failed: {e}");
                }
            }
            self.notify();
            let interval = self.state.lock().config.poll_interval;
            tokio::time::sleep(Duration::from_secs(interval)).await;
        }
    }

    async fn keepalive_loop(self: Arc<Self>) {
        info!(
            "BLE keep-alive started (every {}s, fast {:.1}s after transitions)",
            self.state.lock().config.telemetry_interval,
            TRANSITION_POLL.as_secs_f64()
        );
        let mut fast_until = Instant::now();
        loop {
            match self
                .transport
                .send_command(protocol::CMD_STAT, RESPONSE_TIMEOUT)
                .await
            {
                Ok(raw) => match protocol::parse_telemetry(&raw) {
                    Ok(telemetry) => {
                        self.state.lock().telemetry = Some(telemetry);
                        self.notify();
                    }
                    Err(e) => debug!("STAT parse failed (non-fatal): {e}"),
                },
                Err(TransportError::Timeout { .. }) => debug!("STAT timeout (non-fatal)"),
                Err(e) => {
                    warn!("Lost connection during keep-alive: {e}");
                    self.set_phase(Phase::Disconnected);
                    return;
                }
            }

            if Instant::now() < fast_until {
                tokio::time::sleep(TRANSITION_POLL).await;
            } else {
                let interval = self.state.lock().config.telemetry_interval;
                let transitioned = tokio::time::timeout(
                    Duration::from_secs(interval),
                    self.transition.notified(),
                )
                .await
                .is_ok();
                if transitioned {
                    fast_until = Instant::now() + TRANSITION_FAST_WINDOW;
                    debug!(
                        "Transition detected, fast-polling for {}s",
                        TRANSITION_FAST_WINDOW.as_secs()
                    );
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Charge control
    // ------------------------------------------------------------------

    async fn enforce_limit(&self, percent: u8) -> Result<(), EngineError> {
        let (phase, charging, overridden, config) = {
            let state = self.state.lock();
            (
                state.phase,
                state.charging,
                state.override_mode.is_some(),
                state.config,
            )
        };
        if overridden {
            return Ok(());
        }

        if phase == Phase::Charging && percent >= config.charge_max {
            info!(
                "Battery at {percent}% >= max {}%, cutting power",
                config.charge_max
            );
            self.power_off().await?;
            self.set_phase(Phase::Paused);
            self.spawn_confirm_not_charging();
        } else if phase == Phase::Paused && percent <= config.charge_min {
            info!(
                "Battery at {percent}% <= min {}%, restoring power",
                config.charge_min
            );
            self.power_on().await?;
            self.set_phase(Phase::NegotiatingCharge);
            self.spawn_await_sysfs_charging();
        } else if phase == Phase::Charging && !charging {
            // A BLE glitch can leave the relay off while the phase
            // still says CHARGING; restore through the full sequence.
            info!("Phase is CHARGING but the relay is off, restoring power");
            self.power_on().await?;
            self.set_phase(Phase::NegotiatingCharge);
            self.spawn_await_sysfs_charging();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reconnection
    // ------------------------------------------------------------------

    fn start_reconnect(&self) {
        let Some(engine) = self.weak.upgrade() else {
            return;
        };
        let mut state = self.state.lock();
        if state.reconnect_task.is_some() {
            return;
        }
        state.reconnect_attempt = 0;
        state.reconnect_delay = 0;
        state.reconnect_task = Some(tokio::spawn(async move { engine.reconnect_loop().await }));
    }

    fn stop_reconnect_locked(state: &mut EngineState) {
        if let Some(task) = state.reconnect_task.take() {
            task.abort();
        }
        state.reconnect_attempt = 0;
        state.reconnect_delay = 0;
    }

    async fn reconnect_loop(self: Arc<Self>) {
        info!("Auto-reconnect started");
        loop {
            let (attempt, delay) = {
                let mut state = self.state.lock();
                let index = (state.reconnect_attempt as usize).min(RECONNECT_DELAYS.len() - 1);
                let delay = RECONNECT_DELAYS[index];
                state.reconnect_attempt += 1;
                state.reconnect_delay = delay;
                (state.reconnect_attempt, delay)
            };
            self.notify();
            info!("Reconnect attempt {attempt} in {delay}s");

            tokio::time::sleep(Duration::from_secs(delay)).await;

            if self.try_reconnect().await {
                let mut state = self.state.lock();
                info!(
                    "Reconnected successfully on attempt {}",
                    state.reconnect_attempt
                );
                state.reconnect_task = None;
                state.reconnect_attempt = 0;
                state.reconnect_delay = 0;
                return;
            }
        }
    }

    /// One reconnect attempt: the full scan → connect → verify →
    /// PD-on lifecycle. Any failure leaves the loop to try again.
    async fn try_reconnect(&self) -> bool {
        let _guard = self.op_lock.lock().await;

        let found = match self.transport.scan(SCAN_TIMEOUT).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Reconnect scan failed: {e}");
                return false;
            }
        };
        if found.is_none() {
            return false;
        }

        match self.transport.connect().await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                warn!("Reconnect failed: {e}");
                return false;
            }
        }

        if !self.verify_device().await {
            let _ = self.transport.disconnect().await;
            return false;
        }

        self.query_device_info().await;

        if let Err(e) = self.power_on().await {
            warn!("PD negotiation failed on reconnect: {e}");
            self.state.lock().charging = false;
            let _ = self.transport.disconnect().await;
            return false;
        }

        self.set_phase(Phase::NegotiatingCharge);
        self.start_polling();
        self.spawn_await_sysfs_charging();
        true
    }

    // ------------------------------------------------------------------
    // State management
    // ------------------------------------------------------------------

    fn set_phase(&self, new_phase: Phase) {
        let changed = {
            let mut state = self.state.lock();
            let old = state.phase;
            state.phase = new_phase;
            if old != new_phase {
                info!("Engine phase: {:?} -> {:?}", old, new_phase);
                if old.is_active() && new_phase.is_active() {
                    self.transition.notify_waiters();
                }
                true
            } else {
                false
            }
        };
        if changed {
            self.notify();
        }
    }

    /// Any non-stopped disconnect drops the device-derived state
    /// (charging flag, override, telemetry, device info); it dies with
    /// the link whether or not we reconnect. Only a link lost while a
    /// session existed hands over to the reconnect machinery; the
    /// start sequence handles its own failures.
    fn handle_ble_disconnect(&self) {
        let auto_reconnect = {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            Self::stop_polling_locked(&mut state);
            state.charging = false;
            state.override_mode = None;
            state.telemetry = None;
            state.device_info = None;
            if !state.phase.is_active() {
                return;
            }
            state.config.auto_reconnect
        };
        self.set_phase(Phase::Disconnected);
        if auto_reconnect {
            self.set_phase(Phase::Reconnecting);
            self.start_reconnect();
        }
    }

    /// Record a chart point (edge-triggered) and broadcast a fresh
    /// snapshot. The chart append happens before the send, so every
    /// observer sees a snapshot consistent with the latest point.
    fn notify(&self) {
        let percent = self.battery.read_percent();
        let snapshot = {
            let mut state = self.state.lock();
            if let Some(percent) = percent {
                Self::record_chart_point_locked(&mut state, percent);
            }
            self.status_locked(&state, percent)
        };
        let _ = self.update_tx.send(snapshot);
    }

    fn record_chart_point_locked(state: &mut EngineState, percent: u8) {
        if state.chart_last_percent == Some(percent) {
            return;
        }
        state.chart_last_percent = Some(percent);
        if state.chart.len() >= CHART_CAPACITY {
            state.chart.pop_front();
        }
        state.chart.push_back(ChartPoint {
            timestamp: unix_now(),
            percent,
            charging: state.charging,
            charge_max: state.config.charge_max,
            charge_min: state.config.charge_min,
        });
    }

    fn status_locked(&self, state: &EngineState, percent: Option<u8>) -> EngineStatus {
        let telemetry = state.telemetry.map(|t| TelemetrySnapshot {
            volts: t.volts,
            amps: t.amps,
            watts: t.watts(),
        });
        let device = state.device_info.as_ref().map(|d| DeviceSnapshot {
            name: self.transport.device_name(),
            firmware: d.firmware.clone(),
            hardware: d.hardware.clone(),
            capabilities: CapabilitiesSnapshot {
                pd: d.capabilities.pd,
                fet2: d.capabilities.fet2,
                auto: d.capabilities.auto,
            },
        });
        let (reconnect_attempt, reconnect_delay) = if state.phase == Phase::Reconnecting {
            (Some(state.reconnect_attempt), Some(state.reconnect_delay))
        } else {
            (None, None)
        };

        EngineStatus {
            phase: state.phase,
            battery_percent: percent,
            is_charging: state.charging,
            override_mode: state.override_mode,
            charge_max: state.config.charge_max,
            charge_min: state.config.charge_min,
            pd_mode: state.config.pd_mode.as_int(),
            telemetry_interval: state.config.telemetry_interval,
            telemetry,
            device,
            reconnect_attempt,
            reconnect_delay,
        }
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
