use crate::pattern::PatternId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

// ─── Colors ─────────────────────────────────────────────────────────────────

/// One LED color, 8 bits per channel.
pub type Rgb = [u8; 3];

pub const BLACK: Rgb = [0, 0, 0];
pub const WHITE: Rgb = [255, 255, 255];

// ─── Audio features ─────────────────────────────────────────────────────────

/// Scalar reductions of one frequency snapshot. Each value is in 0.0–255.0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioFeatures {
    pub bass: f32,
    pub mid: f32,
    pub treble: f32,
    pub energy: f32,
}

impl AudioFeatures {
    pub fn silent() -> Self {
        Self::default()
    }
}

impl fmt::Display for AudioFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "B={:>5.1} M={:>5.1} T={:>5.1} E={:>5.1}",
            self.bass, self.mid, self.treble, self.energy
        )
    }
}

// ─── Modes ──────────────────────────────────────────────────────────────────

/// How the loop picks the pattern for each frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "mode", content = "pattern")]
pub enum PatternMode {
    /// Beat detector drives pattern changes.
    #[default]
    Auto,
    /// A user-selected pattern, never changed by the loop.
    Fixed(PatternId),
}

/// Strobe frequency source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrobeMode {
    /// Always 0 Hz (solid on).
    #[default]
    Off,
    /// Derived from energy.
    Auto,
    /// User-set frequency.
    Manual,
}

impl std::str::FromStr for StrobeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(StrobeMode::Off),
            "auto" => Ok(StrobeMode::Auto),
            "manual" => Ok(StrobeMode::Manual),
            other => Err(format!("unknown strobe mode '{}' (off, auto, manual)", other)),
        }
    }
}

// ─── Inter-thread messages ──────────────────────────────────────────────────

/// Commands from the owning UI/CLI to a running stream loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    Play,
    Pause,
    /// Stop playback and terminate the loop.
    Stop,
    Seek(f64),
    SetPatternMode(PatternMode),
    /// Device brightness factor, clamped to 0.0–1.0.
    SetBrightness(f32),
    SetStrobeMode(StrobeMode),
    SetManualStrobeHz(f32),
}

/// Parses one line of the interactive console: `play`, `pause`, `stop`,
/// `seek <secs>`, `pattern auto|<name>`, `brightness <0..1>`,
/// `strobe off|auto|manual`, `hz <freq>`.
impl std::str::FromStr for ControlEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let cmd = words.next().unwrap_or("").to_ascii_lowercase();
        let arg = words.next();
        let need = |what: &str| arg.ok_or_else(|| format!("'{}' needs {}", cmd, what));
        let number = |what: &str| -> Result<f64, String> {
            let a = need(what)?;
            a.parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| format!("bad number '{}'", a))
        };
        match cmd.as_str() {
            "play" => Ok(ControlEvent::Play),
            "pause" => Ok(ControlEvent::Pause),
            "stop" | "quit" | "q" => Ok(ControlEvent::Stop),
            "seek" => Ok(ControlEvent::Seek(number("seconds")?)),
            "pattern" => match need("a pattern name or 'auto'")? {
                a if a.eq_ignore_ascii_case("auto") => {
                    Ok(ControlEvent::SetPatternMode(PatternMode::Auto))
                }
                a => Ok(ControlEvent::SetPatternMode(PatternMode::Fixed(a.parse()?))),
            },
            "brightness" => Ok(ControlEvent::SetBrightness(number("a factor")? as f32)),
            "strobe" => Ok(ControlEvent::SetStrobeMode(need("a mode")?.parse()?)),
            "hz" => Ok(ControlEvent::SetManualStrobeHz(number("a frequency")? as f32)),
            "" => Err("empty command".to_string()),
            other => Err(format!("unknown command '{}'", other)),
        }
    }
}

/// One console line: a loop event, or a device link command handled by
/// whoever owns the `BleSessionManager`.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Control(ControlEvent),
    /// (Re)connect to the LED peripheral.
    Connect,
    Disconnect,
}

impl std::str::FromStr for ConsoleCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let first = s.split_whitespace().next().unwrap_or("");
        if first.eq_ignore_ascii_case("connect") || first.eq_ignore_ascii_case("reconnect") {
            Ok(ConsoleCommand::Connect)
        } else if first.eq_ignore_ascii_case("disconnect") {
            Ok(ConsoleCommand::Disconnect)
        } else {
            s.parse().map(ConsoleCommand::Control)
        }
    }
}

// ─── Session clock ──────────────────────────────────────────────────────────

/// Monotonic wall clock for one streaming session.
#[derive(Clone)]
pub struct SessionClock {
    start: Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    /// Seconds since session start.
    pub fn now_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Constants ──────────────────────────────────────────────────────────────

/// Minimum spacing between device frames (30 fps).
pub const DEFAULT_TARGET_FPS: u32 = 30;

/// Host refresh cadence the threaded loop is woken at.
pub const DISPLAY_REFRESH_HZ: u32 = 60;

/// Ceiling for strobe commands accepted by the peripheral.
pub const MAX_STROBE_HZ: f32 = 100.0;
