use crate::ble::{
    BleError, CharacteristicHandle, DeviceInfo, DisconnectReason, GattTransport,
    LED_CHARACTERISTIC_UUID, LED_SERVICE_UUID,
};
use crate::codec::{self, BRIGHTNESS_COMMAND_LEN, CMD_BRIGHTNESS, STROBE_COMMAND_LEN};
use crate::player::{copy_window, AudioTap, PlayHead, Player};
use crate::types::Rgb;
use crossbeam_channel::Sender;
use log::{debug, info};
use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use uuid::Uuid;

/// Writes retained for inspection; older ones are discarded.
const WRITE_LOG_CAP: usize = 4096;

const SIM_HANDLE: CharacteristicHandle = CharacteristicHandle(0x002A);

/// A write as the peripheral interprets it.
#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralWrite {
    /// Decoded RGB565 colors, physical order
    Frame(Vec<Rgb>),
    Strobe(f32),
    Brightness(u8),
    Unknown(Vec<u8>),
}

impl PeripheralWrite {
    /// Classify a raw characteristic write the way the firmware does:
    /// commands by length and opcode, everything else is a frame.
    pub fn parse(data: &[u8]) -> Self {
        match data.len() {
            BRIGHTNESS_COMMAND_LEN if data[0] == CMD_BRIGHTNESS => {
                PeripheralWrite::Brightness(data[1])
            }
            STROBE_COMMAND_LEN => match codec::decode_strobe(data) {
                Ok(hz) => PeripheralWrite::Strobe(hz),
                Err(_) => PeripheralWrite::Unknown(data.to_vec()),
            },
            n if n >= 4 && n % 2 == 0 => match codec::decode_frame(data) {
                Ok(colors) => PeripheralWrite::Frame(colors),
                Err(_) => PeripheralWrite::Unknown(data.to_vec()),
            },
            _ => PeripheralWrite::Unknown(data.to_vec()),
        }
    }
}

struct SimState {
    name: String,
    id: String,
    powered: bool,
    cancel_chooser: bool,
    expose_characteristic: bool,
    gatt_open: bool,
    events: Option<Sender<DisconnectReason>>,
    connect_count: u32,
    /// Chooser latency, like a user picking from the system dialog
    chooser_delay: Duration,
    fail_writes: u32,
    writes: VecDeque<PeripheralWrite>,
    last_frame: Option<Vec<Rgb>>,
    strobe_hz: f32,
    brightness: u8,
}

/// In-process stand-in for the LED peripheral and the host BLE stack.
///
/// Decodes every write the way the firmware would, so tests (and the
/// `--simulate` CLI mode) can observe exactly what would reach the LEDs.
/// Use `probe()` to keep a handle for inspection and fault injection after
/// the peripheral has been moved into a `BleSessionManager`.
pub struct SimulatedPeripheral {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedPeripheral {
    pub fn new(name: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                name: name.to_string(),
                id: format!("sim:{}", Uuid::new_v4().simple()),
                powered: true,
                cancel_chooser: false,
                expose_characteristic: true,
                gatt_open: false,
                events: None,
                connect_count: 0,
                chooser_delay: Duration::ZERO,
                fail_writes: 0,
                writes: VecDeque::new(),
                last_frame: None,
                strobe_hz: 0.0,
                brightness: 255,
            })),
        }
    }

    pub fn probe(&self) -> PeripheralProbe {
        PeripheralProbe {
            state: Arc::clone(&self.state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl GattTransport for SimulatedPeripheral {
    fn request_device(
        &mut self,
        service: Uuid,
        name_prefix: Option<&str>,
    ) -> Result<DeviceInfo, BleError> {
        let delay = self.lock().chooser_delay;
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let s = self.lock();
        if s.cancel_chooser {
            return Err(BleError::ChooserCancelled);
        }
        let name_ok = name_prefix.map_or(true, |p| s.name.starts_with(p));
        if !s.powered || service != LED_SERVICE_UUID || !name_ok {
            return Err(BleError::DeviceNotFound);
        }
        Ok(DeviceInfo {
            id: s.id.clone(),
            name: s.name.clone(),
        })
    }

    fn connect_gatt(
        &mut self,
        device: &DeviceInfo,
    ) -> Result<crossbeam_channel::Receiver<DisconnectReason>, BleError> {
        let mut s = self.lock();
        if !s.powered || device.id != s.id {
            return Err(BleError::GattConnect(format!("{} unreachable", device)));
        }
        let (tx, rx) = crossbeam_channel::bounded(1);
        s.events = Some(tx);
        s.gatt_open = true;
        s.connect_count += 1;
        debug!("sim: GATT open ({})", s.name);
        Ok(rx)
    }

    fn characteristic(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<CharacteristicHandle, BleError> {
        let s = self.lock();
        if service != LED_SERVICE_UUID {
            return Err(BleError::ServiceNotFound(service));
        }
        if !s.expose_characteristic || characteristic != LED_CHARACTERISTIC_UUID {
            return Err(BleError::CharacteristicNotFound(characteristic));
        }
        Ok(SIM_HANDLE)
    }

    fn write_without_response(
        &mut self,
        handle: CharacteristicHandle,
        data: &[u8],
    ) -> Result<(), BleError> {
        let mut s = self.lock();
        if !s.gatt_open || handle != SIM_HANDLE {
            return Err(BleError::NotConnected);
        }
        if s.fail_writes > 0 {
            s.fail_writes -= 1;
            return Err(BleError::Write("simulated GATT busy".to_string()));
        }
        let write = PeripheralWrite::parse(data);
        match &write {
            PeripheralWrite::Frame(colors) => s.last_frame = Some(colors.clone()),
            PeripheralWrite::Strobe(hz) => s.strobe_hz = *hz,
            PeripheralWrite::Brightness(v) => s.brightness = *v,
            PeripheralWrite::Unknown(_) => {}
        }
        if s.writes.len() == WRITE_LOG_CAP {
            s.writes.pop_front();
        }
        s.writes.push_back(write);
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut s = self.lock();
        s.gatt_open = false;
        s.events = None;
    }
}

/// Inspection and fault-injection handle for a `SimulatedPeripheral`.
#[derive(Clone)]
pub struct PeripheralProbe {
    state: Arc<Mutex<SimState>>,
}

impl PeripheralProbe {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn writes(&self) -> Vec<PeripheralWrite> {
        self.lock().writes.iter().cloned().collect()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    pub fn frames(&self) -> Vec<Vec<Rgb>> {
        self.lock()
            .writes
            .iter()
            .filter_map(|w| match w {
                PeripheralWrite::Frame(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn strobe_commands(&self) -> Vec<f32> {
        self.lock()
            .writes
            .iter()
            .filter_map(|w| match w {
                PeripheralWrite::Strobe(hz) => Some(*hz),
                _ => None,
            })
            .collect()
    }

    pub fn last_frame(&self) -> Option<Vec<Rgb>> {
        self.lock().last_frame.clone()
    }

    pub fn strobe_hz(&self) -> f32 {
        self.lock().strobe_hz
    }

    pub fn brightness(&self) -> u8 {
        self.lock().brightness
    }

    pub fn connect_count(&self) -> u32 {
        self.lock().connect_count
    }

    pub fn gatt_open(&self) -> bool {
        self.lock().gatt_open
    }

    pub fn set_cancel_chooser(&self, cancel: bool) {
        self.lock().cancel_chooser = cancel;
    }

    pub fn set_expose_characteristic(&self, expose: bool) {
        self.lock().expose_characteristic = expose;
    }

    /// Make `request_device` block for `delay` before answering.
    pub fn set_chooser_delay(&self, delay: Duration) {
        self.lock().chooser_delay = delay;
    }

    /// Reject the next `n` writes with a transient error.
    pub fn fail_next_writes(&self, n: u32) {
        self.lock().fail_writes = n;
    }

    /// Peripheral goes away: open sessions get a disconnect event.
    pub fn power_off(&self) {
        let mut s = self.lock();
        s.powered = false;
        s.gatt_open = false;
        if let Some(tx) = s.events.take() {
            let _ = tx.try_send(DisconnectReason::PeripheralClosed);
        }
        info!("sim: {} powered off", s.name);
    }

    pub fn power_on(&self) {
        let mut s = self.lock();
        s.powered = true;
        info!("sim: {} powered on", s.name);
    }
}

/// Beat-bearing test audio: a decaying kick on every beat, a sustained mid
/// chord, and a short treble tick on the off-beat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyntheticSong {
    pub bpm: f32,
    pub sample_rate: u32,
    pub duration: f64,
    /// Kick level 0.0–1.0
    pub kick: f32,
    pub pad: f32,
    pub hat: f32,
}

impl Default for SyntheticSong {
    fn default() -> Self {
        Self {
            bpm: 120.0,
            sample_rate: 22050,
            duration: 30.0,
            kick: 0.9,
            pad: 0.15,
            hat: 0.1,
        }
    }
}

impl SyntheticSong {
    /// Sample value at `t` seconds. Pure in `t`.
    pub fn sample_at(&self, t: f64) -> f32 {
        if t < 0.0 || t >= self.duration {
            return 0.0;
        }
        let beat = 60.0 / self.bpm.max(1.0) as f64;
        let since_beat = (t % beat) as f32;
        let since_off = ((t + beat / 2.0) % beat) as f32;
        let t32 = t as f32;

        let kick_env = (-since_beat * 18.0).exp();
        let kick_freq = 50.0 + 60.0 * (-since_beat * 30.0).exp();
        let kick = self.kick * kick_env * (2.0 * PI * kick_freq * since_beat).sin();

        let pad = self.pad
            * ((2.0 * PI * 220.0 * t32).sin() + (2.0 * PI * 277.2 * t32).sin()) * 0.5;

        let hat_env = (-since_off * 60.0).exp();
        let hat = self.hat * hat_env * (2.0 * PI * 7040.0 * t32).sin();

        (kick + pad + hat).clamp(-1.0, 1.0)
    }

    pub fn render(&self) -> Vec<f32> {
        let n = (self.duration * self.sample_rate as f64) as usize;
        (0..n)
            .map(|i| self.sample_at(i as f64 / self.sample_rate as f64))
            .collect()
    }
}

/// `SyntheticSong` behind the `Player`/`AudioTap` interfaces, for running the
/// stream without an audio file.
pub struct SyntheticTrack {
    song: SyntheticSong,
    samples: Vec<f32>,
    head: PlayHead,
}

impl SyntheticTrack {
    pub fn new(song: SyntheticSong) -> Self {
        info!(
            "Synthetic track: {:.0} BPM, {:.1}s @ {} Hz",
            song.bpm, song.duration, song.sample_rate
        );
        Self {
            samples: song.render(),
            head: PlayHead::new(song.duration),
            song,
        }
    }

    pub fn song(&self) -> &SyntheticSong {
        &self.song
    }
}

impl Player for SyntheticTrack {
    fn play(&mut self) {
        self.head.start();
    }

    fn pause(&mut self) {
        self.head.stop();
    }

    fn seek(&mut self, secs: f64) {
        self.head.seek(secs);
    }

    fn duration(&self) -> f64 {
        self.head.duration()
    }

    fn current_time(&self) -> f64 {
        self.head.position()
    }

    fn ready(&self) -> bool {
        true
    }
}

impl AudioTap for SyntheticTrack {
    fn sample_rate(&self) -> u32 {
        self.song.sample_rate
    }

    fn read_window(&self, out: &mut [f32]) {
        let end = (self.head.position() * self.song.sample_rate as f64) as usize;
        copy_window(&self.samples, end, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::compute_rms;

    #[test]
    fn test_parse_writes() {
        assert_eq!(
            PeripheralWrite::parse(&codec::encode_strobe(4.5)),
            PeripheralWrite::Strobe(4.5)
        );
        assert_eq!(
            PeripheralWrite::parse(&codec::encode_brightness(9)),
            PeripheralWrite::Brightness(9)
        );
        assert_eq!(
            PeripheralWrite::parse(&[0xF8, 0x00, 0x00, 0x1F]),
            PeripheralWrite::Frame(vec![[248, 0, 0], [0, 0, 248]])
        );
        assert_eq!(
            PeripheralWrite::parse(&[1, 2, 3, 4, 5]),
            PeripheralWrite::Unknown(vec![1, 2, 3, 4, 5])
        );
    }

    #[test]
    fn test_write_requires_open_gatt() {
        let mut sim = SimulatedPeripheral::new("x");
        assert_eq!(
            sim.write_without_response(SIM_HANDLE, &[0, 0, 0, 0]),
            Err(BleError::NotConnected)
        );
    }

    #[test]
    fn test_power_off_emits_event() {
        let mut sim = SimulatedPeripheral::new("ChromaMind");
        let probe = sim.probe();
        let dev = sim.request_device(LED_SERVICE_UUID, None).unwrap();
        let rx = sim.connect_gatt(&dev).unwrap();
        probe.power_off();
        assert_eq!(rx.try_recv(), Ok(DisconnectReason::PeripheralClosed));
        assert!(sim.request_device(LED_SERVICE_UUID, None).is_err());
    }

    #[test]
    fn test_state_tracks_last_values() {
        let mut sim = SimulatedPeripheral::new("ChromaMind");
        let probe = sim.probe();
        let dev = sim.request_device(LED_SERVICE_UUID, None).unwrap();
        let _rx = sim.connect_gatt(&dev).unwrap();
        let h = sim
            .characteristic(LED_SERVICE_UUID, LED_CHARACTERISTIC_UUID)
            .unwrap();
        sim.write_without_response(h, &codec::encode_strobe(20.0)).unwrap();
        sim.write_without_response(h, &codec::encode_brightness(100)).unwrap();
        assert_eq!(probe.strobe_hz(), 20.0);
        assert_eq!(probe.brightness(), 100);
        assert_eq!(probe.strobe_commands(), vec![20.0]);
    }

    #[test]
    fn test_song_kick_louder_on_beat() {
        let song = SyntheticSong::default();
        let sr = song.sample_rate as f64;
        let window = |t0: f64| -> Vec<f32> {
            (0..512).map(|i| song.sample_at(t0 + i as f64 / sr)).collect()
        };
        // Beat at 1.0s, quiet stretch just before the next one
        let on = compute_rms(&window(1.0));
        let off = compute_rms(&window(1.4));
        assert!(on > off * 2.0, "on={} off={}", on, off);
        assert_eq!(song.sample_at(-1.0), 0.0);
        assert_eq!(song.sample_at(song.duration + 1.0), 0.0);
    }

    #[test]
    fn test_track_window_follows_seek() {
        let song = SyntheticSong {
            duration: 2.0,
            ..SyntheticSong::default()
        };
        let mut track = SyntheticTrack::new(song);
        assert_eq!(track.duration(), 2.0);
        let mut buf = vec![1.0f32; 64];
        track.read_window(&mut buf);
        assert!(buf.iter().all(|&s| s == 0.0));
        track.seek(1.0);
        track.read_window(&mut buf);
        let end = song.sample_rate as usize;
        assert_eq!(buf[63], track.samples[end - 1]);
    }
}
