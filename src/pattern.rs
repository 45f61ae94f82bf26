//! Deterministic LED pattern renderers.
//!
//! A renderer is a pure function of `PatternContext`: same id + same
//! context always produces the same bytes. The live stream loop and the
//! offline pattern-file generator both call into this module, so a frame
//! previewed on screen can be regenerated bit-for-bit later.

use crate::frame::{LedFrame, MatrixGeometry};
use crate::types::{AudioFeatures, Rgb, BLACK, WHITE};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of one palette step, in seconds.
pub const COLOR_CYCLE_SECS: f64 = 2.0;

/// Saturated colors stepped through by time, wrapping.
pub const PALETTE: [Rgb; 6] = [
    [255, 0, 0],
    [0, 255, 0],
    [0, 0, 255],
    [255, 255, 0],
    [255, 0, 255],
    [0, 255, 255],
];

/// How long one auto-selection slot lasts before round-robin moves on.
pub const SELECT_SLOT_SECS: f64 = 2.0;

/// Immutable input to a renderer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatternContext {
    pub geometry: MatrixGeometry,
    /// Seconds since playback start
    pub t: f64,
    pub features: AudioFeatures,
}

impl PatternContext {
    pub fn new(geometry: MatrixGeometry, t: f64, features: AudioFeatures) -> Self {
        Self {
            geometry,
            t,
            features,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatternId {
    /// Left half of every row lit with the palette color ("left eye").
    LeftHalf,
    /// Right half of every row lit with the palette color ("right eye").
    RightHalf,
    /// Whole matrix in the palette color.
    Fill,
    /// Whole matrix static white.
    FullWhite,
    /// One column sweeping left→right once per color cycle.
    Sweep,
    /// Palette color with brightness following energy.
    Pulse,
}

impl PatternId {
    /// Every renderer, in round-robin order.
    pub const ALL: [PatternId; 6] = [
        PatternId::LeftHalf,
        PatternId::RightHalf,
        PatternId::Fill,
        PatternId::FullWhite,
        PatternId::Sweep,
        PatternId::Pulse,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PatternId::LeftHalf => "left-half",
            PatternId::RightHalf => "right-half",
            PatternId::Fill => "fill",
            PatternId::FullWhite => "full-white",
            PatternId::Sweep => "sweep",
            PatternId::Pulse => "pulse",
        }
    }

    pub fn index(self) -> usize {
        match self {
            PatternId::LeftHalf => 0,
            PatternId::RightHalf => 1,
            PatternId::Fill => 2,
            PatternId::FullWhite => 3,
            PatternId::Sweep => 4,
            PatternId::Pulse => 5,
        }
    }

    /// Next pattern in round-robin order, wrapping.
    pub fn next(self) -> PatternId {
        Self::ALL[(self.index() + 1) % Self::ALL.len()]
    }
}

impl fmt::Display for PatternId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

impl FromStr for PatternId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "left-half" | "left-eye" => Ok(PatternId::LeftHalf),
            "right-half" | "right-eye" => Ok(PatternId::RightHalf),
            "fill" => Ok(PatternId::Fill),
            "full-white" | "white" => Ok(PatternId::FullWhite),
            "sweep" => Ok(PatternId::Sweep),
            "pulse" => Ok(PatternId::Pulse),
            other => {
                let names: Vec<&str> = PatternId::ALL.iter().map(|p| p.name()).collect();
                Err(format!("unknown pattern '{}' ({})", other, names.join(", ")))
            }
        }
    }
}

/// Palette color for elapsed time `t`.
pub fn palette_color(t: f64) -> Rgb {
    let step = (t.max(0.0) / COLOR_CYCLE_SECS).floor() as usize;
    PALETTE[step % PALETTE.len()]
}

/// Render into a new frame.
pub fn render(id: PatternId, ctx: &PatternContext) -> LedFrame {
    let mut frame = LedFrame::new(ctx.geometry);
    render_into(id, ctx, &mut frame);
    frame
}

/// Render into an existing frame of the same geometry. Every LED is written.
pub fn render_into(id: PatternId, ctx: &PatternContext, frame: &mut LedFrame) {
    assert_eq!(
        frame.geometry(),
        ctx.geometry,
        "render target geometry differs from context"
    );
    match id {
        PatternId::LeftHalf => half(ctx, frame, true),
        PatternId::RightHalf => half(ctx, frame, false),
        PatternId::Fill => frame.fill(palette_color(ctx.t)),
        PatternId::FullWhite => frame.fill(WHITE),
        PatternId::Sweep => sweep(ctx, frame),
        PatternId::Pulse => pulse(ctx, frame),
    }
}

fn half(ctx: &PatternContext, frame: &mut LedFrame, left: bool) {
    let color = palette_color(ctx.t);
    let g = ctx.geometry;
    let split = g.cols / 2;
    for y in 0..g.rows {
        for x in 0..g.cols {
            let lit = if left { x < split } else { x >= g.cols - split };
            frame.set(x, y, if lit { color } else { BLACK });
        }
    }
}

fn sweep(ctx: &PatternContext, frame: &mut LedFrame) {
    let color = palette_color(ctx.t);
    let g = ctx.geometry;
    let phase = (ctx.t.max(0.0) % COLOR_CYCLE_SECS) / COLOR_CYCLE_SECS;
    let lit_col = ((phase * g.cols as f64).floor() as usize).min(g.cols - 1);
    for y in 0..g.rows {
        for x in 0..g.cols {
            frame.set(x, y, if x == lit_col { color } else { BLACK });
        }
    }
}

fn pulse(ctx: &PatternContext, frame: &mut LedFrame) {
    let [r, g, b] = palette_color(ctx.t);
    let level = (ctx.features.energy.clamp(0.0, 255.0) / 255.0) as f32;
    let scale = |c: u8| (c as f32 * level).round() as u8;
    frame.fill([scale(r), scale(g), scale(b)]);
}

/// Pick a pattern from the current features and time.
///
/// Time is split into `SELECT_SLOT_SECS` slots that step round-robin through
/// `PatternId::ALL`; loud or bass-heavy material shifts the slot so the same
/// moment picks a different pattern when the music intensifies. Always
/// returns a valid id, for any input including NaN.
pub fn choose_pattern_id_auto(bass: f32, energy: f32, t: f64) -> PatternId {
    let n = PatternId::ALL.len();
    // Reduce in f64: the slot count itself can exceed usize for large t
    let slot = if t.is_finite() && t > 0.0 {
        ((t / SELECT_SLOT_SECS).floor() % n as f64) as usize
    } else {
        0
    };
    let tier = if energy > 170.0 {
        2
    } else if bass > 140.0 {
        1
    } else {
        0
    };
    PatternId::ALL[(slot + tier) % n]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(rows: usize, cols: usize, t: f64) -> PatternContext {
        PatternContext::new(
            MatrixGeometry::new(rows, cols).unwrap(),
            t,
            AudioFeatures {
                bass: 120.0,
                mid: 60.0,
                treble: 30.0,
                energy: 90.0,
            },
        )
    }

    #[test]
    fn test_palette_steps_and_wraps() {
        assert_eq!(palette_color(0.0), [255, 0, 0]);
        assert_eq!(palette_color(1.99), [255, 0, 0]);
        assert_eq!(palette_color(2.0), [0, 255, 0]);
        assert_eq!(palette_color(4.5), [0, 0, 255]);
        assert_eq!(palette_color(12.0), [255, 0, 0]);
        assert_eq!(palette_color(-5.0), [255, 0, 0]);
    }

    #[test]
    fn test_full_white() {
        let f = render(PatternId::FullWhite, &ctx(2, 8, 0.0));
        assert_eq!(f.as_bytes().len(), 48);
        assert!(f.as_bytes().iter().all(|&b| b == 255));
    }

    #[test]
    fn test_left_half_serpentine() {
        let f = render(PatternId::LeftHalf, &ctx(2, 8, 0.0));
        let bytes = f.as_bytes();
        // Row 0: physical 0..4 lit, 4..8 dark
        for i in 0..4 {
            assert_eq!(f.pixel(i), [255, 0, 0], "row0 led {}", i);
        }
        for i in 4..8 {
            assert_eq!(f.pixel(i), [0, 0, 0], "row0 led {}", i);
        }
        // Row 1 is reversed: physical 8..12 are logical x=7..4 (dark),
        // physical 12..16 are logical x=3..0 (lit)
        for i in 8..12 {
            assert_eq!(f.pixel(i), [0, 0, 0], "row1 led {}", i);
        }
        for i in 12..16 {
            assert_eq!(f.pixel(i), [255, 0, 0], "row1 led {}", i);
        }
        assert_eq!(&bytes[36..39], &[255, 0, 0]);
    }

    #[test]
    fn test_right_half_mirrors_left() {
        let c = ctx(3, 8, 2.5);
        let l = render(PatternId::LeftHalf, &c);
        let r = render(PatternId::RightHalf, &c);
        for y in 0..3 {
            for x in 0..8 {
                assert_eq!(l.get(x, y), r.get(7 - x, y));
            }
        }
        assert_eq!(r.get(7, 0), [0, 255, 0]);
    }

    #[test]
    fn test_fill_uses_palette() {
        let f = render(PatternId::Fill, &ctx(4, 4, 6.1));
        assert!(f.to_triplets().iter().all(|&c| c == [255, 255, 0]));
    }

    #[test]
    fn test_sweep_single_column() {
        let c = ctx(2, 4, 1.0); // halfway through the cycle → column 2
        let f = render(PatternId::Sweep, &c);
        for y in 0..2 {
            for x in 0..4 {
                let expect = if x == 2 { [255, 0, 0] } else { [0, 0, 0] };
                assert_eq!(f.get(x, y), expect);
            }
        }
    }

    #[test]
    fn test_pulse_follows_energy() {
        let mut c = ctx(1, 2, 0.0);
        c.features.energy = 0.0;
        assert!(render(PatternId::Pulse, &c).is_dark());
        c.features.energy = 255.0;
        assert_eq!(render(PatternId::Pulse, &c).pixel(0), [255, 0, 0]);
    }

    #[test]
    fn test_render_deterministic() {
        for &id in PatternId::ALL.iter() {
            for t in [0.0, 0.7, 3.3, 19.99] {
                let c = ctx(5, 7, t);
                assert_eq!(render(id, &c), render(id, &c), "{} at t={}", id, t);
            }
        }
    }

    #[test]
    fn test_render_into_overwrites_previous() {
        let c = ctx(2, 4, 0.0);
        let mut f = LedFrame::new(c.geometry);
        render_into(PatternId::FullWhite, &c, &mut f);
        render_into(PatternId::LeftHalf, &c, &mut f);
        assert_eq!(f, render(PatternId::LeftHalf, &c));
    }

    #[test]
    fn test_choose_auto_round_robin() {
        assert_eq!(choose_pattern_id_auto(0.0, 0.0, 0.0), PatternId::ALL[0]);
        assert_eq!(choose_pattern_id_auto(0.0, 0.0, 2.0), PatternId::ALL[1]);
        assert_eq!(choose_pattern_id_auto(0.0, 0.0, 13.0), PatternId::ALL[0]);
        // Bass shifts by one slot, energy by two
        assert_eq!(choose_pattern_id_auto(200.0, 0.0, 0.0), PatternId::ALL[1]);
        assert_eq!(choose_pattern_id_auto(200.0, 200.0, 0.0), PatternId::ALL[2]);
    }

    #[test]
    fn test_choose_auto_total() {
        for t in [f64::NAN, f64::INFINITY, -1.0, 1e12, 1e20, f64::MAX] {
            for (bass, energy) in [(f32::NAN, f32::INFINITY), (200.0, 200.0), (0.0, 0.0)] {
                let id = choose_pattern_id_auto(bass, energy, t);
                assert!(PatternId::ALL.contains(&id));
            }
        }
    }

    #[test]
    fn test_choose_auto_round_robin_past_usize() {
        // Slot index 2^64 + k still steps through the patterns
        let n = PatternId::ALL.len() as f64;
        let base = 2f64.powi(64) * SELECT_SLOT_SECS;
        let start = (2f64.powi(64) % n) as usize;
        assert_eq!(
            choose_pattern_id_auto(0.0, 0.0, base),
            PatternId::ALL[start]
        );
        assert_eq!(
            choose_pattern_id_auto(200.0, 0.0, base),
            PatternId::ALL[(start + 1) % PatternId::ALL.len()]
        );
    }

    #[test]
    fn test_pattern_names_roundtrip() {
        for &id in PatternId::ALL.iter() {
            assert_eq!(id.name().parse::<PatternId>().unwrap(), id);
        }
        assert_eq!("left-eye".parse::<PatternId>().unwrap(), PatternId::LeftHalf);
        assert!("plasma".parse::<PatternId>().is_err());
    }

    #[test]
    fn test_next_wraps() {
        assert_eq!(PatternId::Pulse.next(), PatternId::LeftHalf);
        assert_eq!(PatternId::LeftHalf.next(), PatternId::RightHalf);
    }
}
