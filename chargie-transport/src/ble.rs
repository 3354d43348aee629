//! btleplug-backed transport for Chargie devices.
//!
//! Owns a single connection and serializes command/response exchanges
//! over the shared write/notify characteristic. Only one request is
//! ever in flight; the send lock plus the inter-command spacing are
//! what keep the device's firmware from corrupting exchanges.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::TransportError;
use crate::protocol::{self, CHAR_UUID, SCAN_SERVICE_UUIDS};

/// Quiescent period between command-response exchanges. Empirical
/// device requirement; removing it corrupts subsequent exchanges.
pub const COMMAND_SPACING: Duration = Duration::from_millis(100);
/// Default GATT connection timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Default per-command response timeout.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default scan timeout.
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(20);

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Transport connection states. `Disconnected` is the terminal failure
/// state from any intermediate; callers re-initiate with a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting,
    Connected,
}

/// Identity of a device located by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundDevice {
    pub name: Option<String>,
    pub address: String,
}

/// Serialized request/response channel to one Chargie device.
///
/// Implemented by [`BleTransport`] for real hardware; test code
/// substitutes its own implementation.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Scan for a device advertising one of the Chargie service UUIDs.
    /// The first match is remembered for a subsequent [`connect`].
    ///
    /// [`connect`]: Transport::connect
    async fn scan(&self, timeout: Duration) -> Result<Option<FoundDevice>, TransportError>;

    /// Connect to the last scanned device and locate the write/notify
    /// characteristic pair. `false` means the connection was torn down
    /// (characteristics missing, timeout, link error). Calling this
    /// without a prior successful scan is
    /// [`TransportError::NoDevice`].
    async fn connect(&self) -> Result<bool, TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Write a command and wait for its matching `OK+` response.
    /// Non-matching frames are fanned out to unsolicited subscribers.
    async fn send_command(&self, command: &str, timeout: Duration)
        -> Result<String, TransportError>;

    fn state(&self) -> ConnectionState;

    fn device_name(&self) -> Option<String>;

    fn device_address(&self) -> Option<String>;

    /// Connection-state changes, including spontaneous disconnects.
    fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState>;

    /// Frames that arrived without matching an in-flight command.
    fn subscribe_unsolicited(&self) -> broadcast::Receiver<String>;
}

struct Session {
    peripheral: Peripheral,
    write_char: Characteristic,
    name: Option<String>,
    address: String,
}

struct Shared {
    state: parking_lot::Mutex<ConnectionState>,
    candidate: parking_lot::Mutex<Option<Peripheral>>,
    session: parking_lot::Mutex<Option<Session>>,
    /// Receiver half of the per-connection response queue. Replaced on
    /// every connect, which drops any stale frames from the previous
    /// session.
    responses: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    /// Serializes exchanges so only one request is in flight.
    send_lock: tokio::sync::Mutex<()>,
    state_tx: broadcast::Sender<ConnectionState>,
    unsolicited_tx: broadcast::Sender<String>,
}

impl Shared {
    fn set_state(&self, new_state: ConnectionState) {
        let mut state = self.state.lock();
        let old = *state;
        *state = new_state;
        drop(state);
        if old != new_state {
            info!("BLE state: {:?} -> {:?}", old, new_state);
            let _ = self.state_tx.send(new_state);
        }
    }
}

/// BLE transport over the system Bluetooth adapter.
pub struct BleTransport {
    adapter: Adapter,
    shared: Arc<Shared>,
}

impl BleTransport {
    /// Open the first available Bluetooth adapter and start watching
    /// for link-loss events.
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;

        let (state_tx, _) = broadcast::channel(16);
        let (unsolicited_tx, _) = broadcast::channel(16);
        let shared = Arc::new(Shared {
            state: parking_lot::Mutex::new(ConnectionState::Disconnected),
            candidate: parking_lot::Mutex::new(None),
            session: parking_lot::Mutex::new(None),
            responses: tokio::sync::Mutex::new(None),
            send_lock: tokio::sync::Mutex::new(()),
            state_tx,
            unsolicited_tx,
        });

        let events = adapter.events().await?;
        tokio::spawn(watch_disconnects(events, Arc::clone(&shared)));

        Ok(Self { adapter, shared })
    }

    async fn find_advertising_peripheral(
        &self,
        deadline: Instant,
    ) -> Result<Option<Peripheral>, TransportError> {
        while Instant::now() < deadline {
            for peripheral in self.adapter.peripherals().await? {
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };
                if props
                    .services
                    .iter()
                    .any(|uuid| SCAN_SERVICE_UUIDS.contains(uuid))
                {
                    return Ok(Some(peripheral));
                }
            }
            tokio::time::sleep(SCAN_POLL_INTERVAL).await;
        }
        Ok(None)
    }

    async fn teardown(&self, peripheral: &Peripheral) {
        let _ = peripheral.disconnect().await;
        self.shared.session.lock().take();
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Locate the write and notify halves of the command
    /// characteristic. Both share one UUID and differ only in their
    /// property flags.
    fn find_char_pair(
        chars: &BTreeSet<Characteristic>,
    ) -> Result<(Characteristic, Characteristic), TransportError> {
        let write_char = chars
            .iter()
            .find(|c| c.uuid == CHAR_UUID && c.properties.contains(CharPropFlags::WRITE));
        let notify_char = chars
            .iter()
            .find(|c| c.uuid == CHAR_UUID && c.properties.contains(CharPropFlags::NOTIFY));
        match (write_char, notify_char) {
            (Some(write), Some(notify)) => Ok((write.clone(), notify.clone())),
            _ => Err(TransportError::CharacteristicNotFound(CHAR_UUID)),
        }
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn scan(&self, timeout: Duration) -> Result<Option<FoundDevice>, TransportError> {
        self.shared.set_state(ConnectionState::Scanning);
        info!("Scanning for Chargie devices (timeout {:?})", timeout);

        self.adapter
            .start_scan(ScanFilter {
                services: SCAN_SERVICE_UUIDS.to_vec(),
            })
            .await?;

        let deadline = Instant::now() + timeout;
        let found = self.find_advertising_peripheral(deadline).await;
        let _ = self.adapter.stop_scan().await;

        let Some(peripheral) = found? else {
            warn!("No Chargie device found");
            self.shared.set_state(ConnectionState::Disconnected);
            return Ok(None);
        };

        let props = peripheral.properties().await.ok().flatten();
        let device = FoundDevice {
            name: props.and_then(|p| p.local_name),
            address: peripheral.address().to_string(),
        };
        info!("Found: {:?} ({})", device.name, device.address);
        *self.shared.candidate.lock() = Some(peripheral);
        Ok(Some(device))
    }

    async fn connect(&self) -> Result<bool, TransportError> {
        let Some(peripheral) = self.shared.candidate.lock().clone() else {
            return Err(TransportError::NoDevice);
        };

        self.shared.set_state(ConnectionState::Connecting);
        info!("Connecting to {}...", peripheral.address());

        match tokio::time::timeout(CONNECT_TIMEOUT, peripheral.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Connection failed: {e}");
                self.teardown(&peripheral).await;
                return Ok(false);
            }
            Err(_) => {
                error!("Connection timed out after {:?}", CONNECT_TIMEOUT);
                self.teardown(&peripheral).await;
                return Ok(false);
            }
        }

        if let Err(e) = peripheral.discover_services().await {
            error!("Service discovery failed: {e}");
            self.teardown(&peripheral).await;
            return Ok(false);
        }

        let (write_char, notify_char) = match Self::find_char_pair(&peripheral.characteristics())
        {
            Ok(pair) => pair,
            Err(e) => {
                error!("{e}, disconnecting");
                self.teardown(&peripheral).await;
                return Ok(false);
            }
        };

        // Fresh queue per connection; stale frames from a previous
        // session must not satisfy new commands.
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        *self.shared.responses.lock().await = Some(frame_rx);

        if let Err(e) = peripheral.subscribe(&notify_char).await {
            error!("Failed to enable notifications: {e}");
            self.teardown(&peripheral).await;
            return Ok(false);
        }

        let notifications = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to open notification stream: {e}");
                self.teardown(&peripheral).await;
                return Ok(false);
            }
        };
        tokio::spawn(read_notifications(notifications, frame_tx));

        let props = peripheral.properties().await.ok().flatten();
        *self.shared.session.lock() = Some(Session {
            address: peripheral.address().to_string(),
            name: props.and_then(|p| p.local_name),
            write_char,
            peripheral,
        });

        self.shared.set_state(ConnectionState::Connected);
        info!("Connected and notifications started");
        Ok(true)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let session = self.shared.session.lock().take();
        if let Some(session) = session {
            let _ = session.peripheral.disconnect().await;
        }
        self.shared.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    async fn send_command(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<String, TransportError> {
        let (peripheral, write_char) = {
            let session = self.shared.session.lock();
            let session = session.as_ref().ok_or(TransportError::NotConnected)?;
            (session.peripheral.clone(), session.write_char.clone())
        };

        let expected = protocol::expected_response_key(command);
        let _guard = self.shared.send_lock.lock().await;

        debug!("BLE TX: {command}");
        peripheral
            .write(&write_char, command.as_bytes(), WriteType::WithResponse)
            .await?;

        let deadline = Instant::now() + timeout;
        let mut responses = self.shared.responses.lock().await;
        let queue = responses.as_mut().ok_or(TransportError::NotConnected)?;

        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                warn!("Timeout waiting for response to {command}");
                return Err(TransportError::Timeout {
                    command: command.to_string(),
                });
            };

            let frame = match tokio::time::timeout(remaining, queue.recv()).await {
                Ok(Some(frame)) => frame,
                // Queue closed: the reader task ended with the link.
                Ok(None) => return Err(TransportError::NotConnected),
                Err(_) => {
                    warn!("Timeout waiting for response to {command}");
                    return Err(TransportError::Timeout {
                        command: command.to_string(),
                    });
                }
            };

            if frame.starts_with("OK+") && protocol::response_key(&frame) == expected {
                debug!("BLE response: {command} -> {frame}");
                tokio::time::sleep(COMMAND_SPACING).await;
                return Ok(frame);
            }

            debug!("BLE unsolicited: {frame} (waiting for {expected})");
            let _ = self.shared.unsolicited_tx.send(frame);
        }
    }

    fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    fn device_name(&self) -> Option<String> {
        self.shared.session.lock().as_ref().and_then(|s| s.name.clone())
    }

    fn device_address(&self) -> Option<String> {
        self.shared.session.lock().as_ref().map(|s| s.address.clone())
    }

    fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    fn subscribe_unsolicited(&self) -> broadcast::Receiver<String> {
        self.shared.unsolicited_tx.subscribe()
    }
}

/// Decode incoming frames and queue them for the in-flight command.
/// Frames are UTF-8 with permissive decoding, one frame per
/// notification, surrounding whitespace stripped.
async fn read_notifications(
    mut notifications: std::pin::Pin<
        Box<dyn futures::Stream<Item = btleplug::api::ValueNotification> + Send>,
    >,
    frame_tx: mpsc::UnboundedSender<String>,
) {
    while let Some(notification) = notifications.next().await {
        if notification.uuid != CHAR_UUID {
            continue;
        }
        let text = String::from_utf8_lossy(&notification.value).trim().to_string();
        debug!("BLE RX: {text}");
        if frame_tx.send(text).is_err() {
            break;
        }
    }
    debug!("Notification stream closed");
}

/// Publish spontaneous link loss for the current session.
async fn watch_disconnects(
    mut events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    shared: Arc<Shared>,
) {
    while let Some(event) = events.next().await {
        let CentralEvent::DeviceDisconnected(id) = event else {
            continue;
        };
        let is_current = shared
            .session
            .lock()
            .as_ref()
            .map(|s| s.peripheral.id() == id)
            .unwrap_or(false);
        if is_current {
            warn!("BLE disconnected");
            shared.session.lock().take();
            shared.set_state(ConnectionState::Disconnected);
        }
    }
}
