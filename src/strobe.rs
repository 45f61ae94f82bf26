use crate::types::{StrobeMode, MAX_STROBE_HZ};
use log::trace;

/// Auto-mode step size in Hz.
pub const AUTO_QUANTUM_HZ: f32 = 0.5;
/// Minimum spacing of auto-mode strobe commands, seconds.
pub const AUTO_MIN_INTERVAL: f64 = 0.1;

/// Auto mode: energy 0–255 → 0–100 Hz, rounded to the nearest 0.5 Hz.
pub fn auto_hz(energy: f32) -> f32 {
    let energy = if energy.is_finite() { energy.clamp(0.0, 255.0) } else { 0.0 };
    let hz = energy / 255.0 * MAX_STROBE_HZ;
    (hz / AUTO_QUANTUM_HZ).round() * AUTO_QUANTUM_HZ
}

/// Decides when the device strobe frequency needs a new command.
///
/// A command goes out only when the desired value differs from the last
/// one the device actually received. Auto mode is additionally held to one
/// command per `AUTO_MIN_INTERVAL`. Call `confirm` after a successful send;
/// a dropped write leaves the old value in place so the next tick retries.
#[derive(Debug, Clone)]
pub struct StrobeController {
    mode: StrobeMode,
    manual_hz: f32,
    last_sent: Option<f32>,
    last_auto_send: f64,
}

impl StrobeController {
    pub fn new(mode: StrobeMode, manual_hz: f32) -> Self {
        let mut s = Self {
            mode,
            manual_hz: 0.0,
            last_sent: None,
            last_auto_send: f64::NEG_INFINITY,
        };
        s.set_manual_hz(manual_hz);
        s
    }

    pub fn mode(&self) -> StrobeMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: StrobeMode) {
        self.mode = mode;
    }

    pub fn manual_hz(&self) -> f32 {
        self.manual_hz
    }

    pub fn set_manual_hz(&mut self, hz: f32) {
        self.manual_hz = if hz.is_finite() {
            hz.clamp(0.0, MAX_STROBE_HZ)
        } else {
            0.0
        };
    }

    pub fn last_sent(&self) -> Option<f32> {
        self.last_sent
    }

    /// Desired frequency for the current mode.
    pub fn desired_hz(&self, energy: f32) -> f32 {
        match self.mode {
            StrobeMode::Off => 0.0,
            StrobeMode::Manual => self.manual_hz,
            StrobeMode::Auto => auto_hz(energy),
        }
    }

    /// Frequency to transmit this tick, if any.
    pub fn pending(&self, energy: f32, now: f64) -> Option<f32> {
        let hz = self.desired_hz(energy);
        if self.last_sent == Some(hz) {
            return None;
        }
        if self.mode == StrobeMode::Auto && now - self.last_auto_send < AUTO_MIN_INTERVAL {
            trace!("strobe: {:.1} Hz held by rate limit", hz);
            return None;
        }
        Some(hz)
    }

    /// Record that `hz` reached the device at `now`.
    pub fn confirm(&mut self, hz: f32, now: f64) {
        self.last_sent = Some(hz);
        if self.mode == StrobeMode::Auto {
            self.last_auto_send = now;
        }
    }

    /// Device state unknown (new connection): resend on the next tick.
    pub fn invalidate(&mut self) {
        self.last_sent = None;
    }
}

impl Default for StrobeController {
    fn default() -> Self {
        Self::new(StrobeMode::Off, 0.0)
    }
}
