//! Shared test fixtures: a scripted BLE transport and a synthetic
//! battery sysfs tree.
#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use chargie_transport::protocol::{
    CMD_CAPA, CMD_FWVR, CMD_HWVR, CMD_ISPD, CMD_PD_MODE_1, CMD_PD_MODE_2, CMD_POWER_OFF,
    CMD_POWER_ON, CMD_STAT,
};
use chargie_transport::{ConnectionState, FoundDevice, Transport, TransportError};
use chargied::battery::BatteryReader;
use chargied::config::ChargeConfig;
use chargied::engine::ChargeEngine;

/// In-memory transport with per-command scripted responses.
/// A command with no scripted response times out.
pub struct MockTransport {
    sent: Mutex<Vec<String>>,
    responses: Mutex<HashMap<&'static str, String>>,
    scan_available: Mutex<bool>,
    connected: Mutex<bool>,
    disconnect_count: Mutex<usize>,
    state_tx: broadcast::Sender<ConnectionState>,
    unsolicited_tx: broadcast::Sender<String>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let mut responses = HashMap::new();
        responses.insert(CMD_POWER_OFF, "OK+PIO2:0".to_string());
        responses.insert(CMD_POWER_ON, "OK+PIO2:1".to_string());
        responses.insert(CMD_PD_MODE_1, "OK+PDMO:1".to_string());
        responses.insert(CMD_PD_MODE_2, "OK+PDMO:2".to_string());
        responses.insert(CMD_ISPD, "OK+ISPD:1".to_string());
        responses.insert(CMD_STAT, "OK+STAT:3.00/15.00".to_string());
        responses.insert(CMD_CAPA, "OK+CAPA:7".to_string());
        responses.insert(CMD_FWVR, "OK+FWVR:1.2.3".to_string());
        responses.insert(CMD_HWVR, "OK+HWVR:rev B".to_string());

        let (state_tx, _) = broadcast::channel(32);
        let (unsolicited_tx, _) = broadcast::channel(32);
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            responses: Mutex::new(responses),
            scan_available: Mutex::new(true),
            connected: Mutex::new(false),
            disconnect_count: Mutex::new(0),
            state_tx,
            unsolicited_tx,
        })
    }

    pub fn set_response(&self, command: &'static str, response: &str) {
        self.responses.lock().insert(command, response.to_string());
    }

    pub fn set_scan_available(&self, available: bool) {
        *self.scan_available.lock() = available;
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn sent_since(&self, marker: usize) -> Vec<String> {
        self.sent.lock()[marker..].to_vec()
    }

    pub fn disconnect_count(&self) -> usize {
        *self.disconnect_count.lock()
    }

    /// Simulate a spontaneous link loss.
    pub fn emit_disconnect(&self) {
        *self.connected.lock() = false;
        let _ = self.state_tx.send(ConnectionState::Disconnected);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn scan(&self, _timeout: Duration) -> Result<Option<FoundDevice>, TransportError> {
        if *self.scan_available.lock() {
            Ok(Some(FoundDevice {
                name: Some("Chargie".to_string()),
                address: "AA:BB:CC:DD:EE:FF".to_string(),
            }))
        } else {
            Ok(None)
        }
    }

    async fn connect(&self) -> Result<bool, TransportError> {
        *self.connected.lock() = true;
        let _ = self.state_tx.send(ConnectionState::Connected);
        Ok(true)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        *self.connected.lock() = false;
        *self.disconnect_count.lock() += 1;
        let _ = self.state_tx.send(ConnectionState::Disconnected);
        Ok(())
    }

    async fn send_command(
        &self,
        command: &str,
        _timeout: Duration,
    ) -> Result<String, TransportError> {
        if !*self.connected.lock() {
            return Err(TransportError::NotConnected);
        }
        self.sent.lock().push(command.to_string());
        match self.responses.lock().get(command) {
            Some(response) => Ok(response.clone()),
            None => Err(TransportError::Timeout {
                command: command.to_string(),
            }),
        }
    }

    fn state(&self) -> ConnectionState {
        if *self.connected.lock() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn device_name(&self) -> Option<String> {
        Some("Chargie".to_string())
    }

    fn device_address(&self) -> Option<String> {
        Some("AA:BB:CC:DD:EE:FF".to_string())
    }

    fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn subscribe_unsolicited(&self) -> broadcast::Receiver<String> {
        self.unsolicited_tx.subscribe()
    }
}

/// An engine wired to a mock transport and a tempdir battery tree.
pub struct Harness {
    pub engine: Arc<ChargeEngine>,
    pub transport: Arc<MockTransport>,
    battery_dir: tempfile::TempDir,
}

impl Harness {
    pub fn set_percent(&self, percent: u8) {
        write_file(
            &self.battery_dir.path().join("BAT0/capacity"),
            &format!("{percent}\n"),
        );
    }

    pub fn set_battery_status(&self, status: &str) {
        write_file(
            &self.battery_dir.path().join("BAT0/status"),
            &format!("{status}\n"),
        );
    }
}

fn write_file(path: &Path, contents: &str) {
    fs::write(path, contents).unwrap();
}

pub fn harness(config: ChargeConfig, percent: u8, status: &str) -> Harness {
    let battery_dir = tempfile::tempdir().unwrap();
    let bat = battery_dir.path().join("BAT0");
    fs::create_dir_all(&bat).unwrap();
    write_file(&bat.join("type"), "Battery\n");
    write_file(&bat.join("capacity"), &format!("{percent}\n"));
    write_file(&bat.join("status"), &format!("{status}\n"));

    let battery = Arc::new(BatteryReader::new(battery_dir.path()));
    let transport = MockTransport::new();
    let engine = ChargeEngine::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        battery,
        config,
    );

    Harness {
        engine,
        transport,
        battery_dir,
    }
}
