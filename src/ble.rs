//! BLE session management for the LED peripheral.
//!
//! `BleSessionManager` is the single owner of the write characteristic.
//! Everything the host BLE stack does (device chooser, GATT connect,
//! characteristic lookup, write-without-response) sits behind the
//! `GattTransport` trait so the same manager drives a real adapter, the
//! serial bridge, or the in-process simulator.

use crate::codec::{self, ColorSource};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;

/// Service advertised by the LED peripheral.
pub const LED_SERVICE_UUID: Uuid = Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);
/// The single writable characteristic (frames and commands).
pub const LED_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a8);

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BleError {
    #[error("device chooser cancelled")]
    ChooserCancelled,
    #[error("no device advertising the LED service")]
    DeviceNotFound,
    #[error("GATT connect failed: {0}")]
    GattConnect(String),
    #[error("service {0} not found")]
    ServiceNotFound(Uuid),
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    #[error("write failed: {0}")]
    Write(String),
    #[error("not connected")]
    NotConnected,
    #[error("a connection attempt is already running")]
    ConnectInProgress,
    #[error("connection attempt cancelled")]
    ConnectAborted,
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Stack-specific opaque identifier
    pub id: String,
    pub name: String,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.id)
    }
}

/// Attribute handle returned by characteristic discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Why a session ended without the host asking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    PeripheralClosed,
    LinkLost(String),
}

/// Host BLE stack as seen by the session manager.
pub trait GattTransport: Send {
    /// Let the user (or policy) pick a device advertising `service`.
    fn request_device(
        &mut self,
        service: Uuid,
        name_prefix: Option<&str>,
    ) -> Result<DeviceInfo, BleError>;

    /// Open a GATT session. Peripheral-initiated disconnects for this
    /// session are delivered on the returned channel.
    fn connect_gatt(&mut self, device: &DeviceInfo) -> Result<Receiver<DisconnectReason>, BleError>;

    fn characteristic(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<CharacteristicHandle, BleError>;

    /// Fire-and-forget write.
    fn write_without_response(
        &mut self,
        handle: CharacteristicHandle,
        data: &[u8],
    ) -> Result<(), BleError>;

    /// Tear down the GATT session. Must be safe to call when not connected.
    fn disconnect(&mut self);
}

/// Counters for the current manager lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub commands_sent: u64,
    pub write_errors: u64,
    /// Sends skipped because no session was open
    pub skipped: u64,
}

struct Session {
    device: DeviceInfo,
    characteristic: CharacteristicHandle,
    disconnects: Receiver<DisconnectReason>,
}

struct Inner<T> {
    /// `None` while a handshake runs with the lock released.
    transport: Option<T>,
    state: ConnectionState,
    session: Option<Session>,
    /// `disconnect()` arrived during a handshake.
    abort_connect: bool,
    watchers: Vec<Sender<ConnectionState>>,
    frame_buf: Vec<u8>,
    stats: SessionStats,
}

impl<T> Inner<T> {
    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        self.state = state;
        self.watchers.retain(|w| w.send(state).is_ok());
    }

    /// Apply any pending peripheral-initiated disconnect.
    fn poll_disconnect(&mut self) {
        let reason = match &self.session {
            Some(s) => match s.disconnects.try_recv() {
                Ok(reason) => reason,
                Err(crossbeam_channel::TryRecvError::Empty) => return,
                Err(crossbeam_channel::TryRecvError::Disconnected) => {
                    DisconnectReason::LinkLost("transport dropped event channel".to_string())
                }
            },
            None => return,
        };
        if let Some(s) = self.session.take() {
            info!("BLE: {} disconnected ({:?})", s.device, reason);
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

/// One logical owner of device I/O, shareable behind an `Arc`.
///
/// All sends are no-ops while disconnected and never return errors to the
/// caller: LED state is refreshed every frame, so a lost write heals on the
/// next tick. Only a peripheral disconnect event (or `disconnect()`) ends a
/// session; a failed write does not.
pub struct BleSessionManager<T: GattTransport> {
    inner: Mutex<Inner<T>>,
}

impl<T: GattTransport> BleSessionManager<T> {
    pub fn new(transport: T) -> Self {
        Self {
            inner: Mutex::new(Inner {
                transport: Some(transport),
                state: ConnectionState::Disconnected,
                session: None,
                abort_connect: false,
                watchers: Vec::new(),
                frame_buf: Vec::new(),
                stats: SessionStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        // A panic while holding the lock leaves plain data behind; keep going.
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.poll_disconnect();
        inner
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn device(&self) -> Option<DeviceInfo> {
        self.lock().session.as_ref().map(|s| s.device.clone())
    }

    pub fn stats(&self) -> SessionStats {
        self.lock().stats
    }

    /// Receive every state transition from now on.
    pub fn watch(&self) -> Receiver<ConnectionState> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.lock().watchers.push(tx);
        rx
    }

    /// Connect to the first device advertising `LED_SERVICE_UUID`.
    ///
    /// Already connected: returns the current device. The handshake runs
    /// without holding the session lock, so sends from the stream thread are
    /// skipped (not blocked) while it is in flight. On any failure the state
    /// ends at `Disconnected` and the error goes back to the caller that
    /// asked for the connection.
    pub fn connect(&self, name_prefix: Option<&str>) -> Result<DeviceInfo, BleError> {
        let mut transport = {
            let mut inner = self.lock();
            if let Some(s) = &inner.session {
                return Ok(s.device.clone());
            }
            let Some(transport) = inner.transport.take() else {
                return Err(BleError::ConnectInProgress);
            };
            inner.abort_connect = false;
            inner.set_state(ConnectionState::Connecting);
            transport
        };
        info!("BLE: requesting device (service {})", LED_SERVICE_UUID);

        let result = Self::open_session(&mut transport, name_prefix);

        let mut inner = self.lock();
        let aborted = std::mem::take(&mut inner.abort_connect);
        let result = match result {
            Ok(_) if aborted => {
                transport.disconnect();
                Err(BleError::ConnectAborted)
            }
            other => other,
        };
        inner.transport = Some(transport);
        match result {
            Ok(session) => {
                let device = session.device.clone();
                info!(
                    "BLE: connected to {} (characteristic 0x{:04X})",
                    device, session.characteristic.0
                );
                inner.session = Some(session);
                inner.set_state(ConnectionState::Connected);
                Ok(device)
            }
            Err(e) => {
                error!("BLE: connect failed: {}", e);
                inner.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    fn open_session(transport: &mut T, name_prefix: Option<&str>) -> Result<Session, BleError> {
        let device = transport.request_device(LED_SERVICE_UUID, name_prefix)?;
        debug!("BLE: chooser returned {}", device);
        let disconnects = transport.connect_gatt(&device)?;
        match transport.characteristic(LED_SERVICE_UUID, LED_CHARACTERISTIC_UUID) {
            Ok(characteristic) => Ok(Session {
                device,
                characteristic,
                disconnects,
            }),
            Err(e) => {
                transport.disconnect();
                Err(e)
            }
        }
    }

    /// Explicit teardown. Idempotent.
    pub fn disconnect(&self) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        match (inner.session.take(), inner.transport.as_mut()) {
            (Some(s), Some(transport)) => {
                transport.disconnect();
                info!("BLE: disconnected from {}", s.device);
            }
            // Handshake in flight: it tears itself down when it returns
            (_, None) => inner.abort_connect = true,
            (None, Some(_)) => {}
        }
        inner.set_state(ConnectionState::Disconnected);
    }

    /// Encode and write one frame. Returns true when the write went out.
    pub fn send_frame<C: ColorSource + ?Sized>(&self, colors: &C) -> bool {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let (Some(handle), Some(transport)) = (
            inner.session.as_ref().map(|s| s.characteristic),
            inner.transport.as_mut(),
        ) else {
            inner.stats.skipped += 1;
            return false;
        };
        codec::encode_frame_into(colors, &mut inner.frame_buf);
        match transport.write_without_response(handle, &inner.frame_buf) {
            Ok(()) => {
                inner.stats.frames_sent += 1;
                true
            }
            Err(e) => {
                inner.stats.write_errors += 1;
                warn!("BLE: frame write dropped: {}", e);
                false
            }
        }
    }

    /// Set device blink frequency. 0 = solid on.
    pub fn send_strobe(&self, hz: f32) -> bool {
        let cmd = codec::encode_strobe(hz);
        debug!("BLE: strobe {:.1} Hz", hz);
        self.send_command(&cmd, "strobe")
    }

    /// Device-side brightness calibration (0–255).
    pub fn send_brightness(&self, value: u8) -> bool {
        let cmd = codec::encode_brightness(value);
        self.send_command(&cmd, "brightness")
    }

    fn send_command(&self, cmd: &[u8], what: &str) -> bool {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let (Some(handle), Some(transport)) = (
            inner.session.as_ref().map(|s| s.characteristic),
            inner.transport.as_mut(),
        ) else {
            inner.stats.skipped += 1;
            return false;
        };
        match transport.write_without_response(handle, cmd) {
            Ok(()) => {
                inner.stats.commands_sent += 1;
                true
            }
            Err(e) => {
                inner.stats.write_errors += 1;
                warn!("BLE: {} command dropped: {}", what, e);
                false
            }
        }
    }
}

impl<T: GattTransport> Drop for BleSessionManager<T> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
        if let (Some(_), Some(transport)) = (inner.session.take(), inner.transport.as_mut()) {
            transport.disconnect();
        }
    }
}
