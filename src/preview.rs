//! On-screen preview of the LED matrix.
//!
//! The preview always shows the full-brightness frame. Displays cannot
//! visibly strobe at device rates, so blinking is simulated with a sine
//! gate and the low phase dims to `DIM_FLOOR` instead of going black.
//!
//! The gate is applied by each sink at the rate it actually redraws: a
//! blink needs at least `SAMPLES_PER_BLINK` redraws per cycle to be seen,
//! so the shown rate is capped at `redraw_hz / SAMPLES_PER_BLINK` (and never
//! above `MAX_PREVIEW_HZ`).

use crate::frame::LedFrame;
use crate::pattern::PatternId;
use crate::types::{AudioFeatures, Rgb};
use serde::{Deserialize, Serialize};

/// Highest blink rate shown on screen.
pub const MAX_PREVIEW_HZ: f32 = 15.0;
/// Brightness multiplier while the gate is low.
pub const DIM_FLOOR: f32 = 0.35;
/// Redraws needed per blink cycle for the blink to read as one.
pub const SAMPLES_PER_BLINK: f32 = 4.0;

/// Blink rate shown by a sink redrawing at `redraw_hz`.
pub fn shown_blink_hz(hz: f32, redraw_hz: f32) -> f32 {
    if hz.is_nan() || hz <= 0.0 || redraw_hz.is_nan() || redraw_hz <= 0.0 {
        return 0.0;
    }
    hz.min(MAX_PREVIEW_HZ).min(redraw_hz / SAMPLES_PER_BLINK)
}

/// Brightness multiplier at time `t` for a strobe of `hz`, as seen by a
/// sink redrawing at `redraw_hz`: 1.0 or `DIM_FLOOR`.
pub fn strobe_gate(t: f64, hz: f32, redraw_hz: f32) -> f32 {
    let hz = shown_blink_hz(hz, redraw_hz);
    if hz <= 0.0 || !t.is_finite() {
        return 1.0;
    }
    let hz = hz as f64;
    if (2.0 * std::f64::consts::PI * hz * t).sin() >= 0.0 {
        1.0
    } else {
        DIM_FLOOR
    }
}

fn dim(c: Rgb, gate: f32) -> Rgb {
    if gate >= 1.0 {
        return c;
    }
    let s = |v: u8| (v as f32 * gate).round() as u8;
    [s(c[0]), s(c[1]), s(c[2])]
}

/// One preview update: the raw frame in logical row-major order. Sinks
/// apply the strobe gate for their own redraw rate via `gate`/`shown_pixel`.
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewFrame {
    pub t: f64,
    pub pattern: PatternId,
    pub strobe_hz: f32,
    pub rows: usize,
    pub cols: usize,
    /// `pixels[y * cols + x]`
    pub pixels: Vec<Rgb>,
    pub features: AudioFeatures,
    pub connected: bool,
}

impl PreviewFrame {
    /// Build from the unscaled frame. Device brightness never applies here.
    pub fn render(
        raw: &LedFrame,
        t: f64,
        pattern: PatternId,
        strobe_hz: f32,
        features: AudioFeatures,
        connected: bool,
    ) -> Self {
        let g = raw.geometry();
        let mut pixels = Vec::with_capacity(g.led_count());
        for y in 0..g.rows {
            for x in 0..g.cols {
                pixels.push(raw.get(x, y));
            }
        }
        Self {
            t,
            pattern,
            strobe_hz,
            rows: g.rows,
            cols: g.cols,
            pixels,
            features,
            connected,
        }
    }

    pub fn pixel(&self, x: usize, y: usize) -> Rgb {
        self.pixels[y * self.cols + x]
    }

    /// Strobe gate for a sink that redraws at `redraw_hz`.
    pub fn gate(&self, redraw_hz: f32) -> f32 {
        strobe_gate(self.t, self.strobe_hz, redraw_hz)
    }

    /// Pixel with `gate` applied.
    pub fn shown_pixel(&self, x: usize, y: usize, gate: f32) -> Rgb {
        dim(self.pixel(x, y), gate)
    }
}

/// Short-key JSON form for the browser page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactPreview {
    pub t: f64,
    pub p: PatternId,
    pub hz: f32,
    pub g: f32,
    pub r: usize,
    pub c: usize,
    /// Flat RGB, logical row-major
    pub px: Vec<u8>,
    /// bass, mid, treble, energy
    pub f: [f32; 4],
    pub ble: bool,
}

impl CompactPreview {
    /// Gated for a client updated at `redraw_hz`.
    pub fn new(f: &PreviewFrame, redraw_hz: f32) -> Self {
        let gate = f.gate(redraw_hz);
        Self {
            t: f.t,
            p: f.pattern,
            hz: f.strobe_hz,
            g: gate,
            r: f.rows,
            c: f.cols,
            px: f.pixels.iter().flat_map(|&c| dim(c, gate)).collect(),
            f: [
                f.features.bass,
                f.features.mid,
                f.features.treble,
                f.features.energy,
            ],
            ble: f.connected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MatrixGeometry;
    use crate::pattern::{render, PatternContext};

    #[test]
    fn test_gate_off_is_full() {
        assert_eq!(strobe_gate(0.3, 0.0, 30.0), 1.0);
        assert_eq!(strobe_gate(0.3, -4.0, 30.0), 1.0);
        assert_eq!(strobe_gate(0.3, f32::NAN, 30.0), 1.0);
        // No redraws, nothing to blink
        assert_eq!(strobe_gate(0.75, 1.0, 0.0), 1.0);
    }

    #[test]
    fn test_gate_halves() {
        // 1 Hz: high for the first half second, dim for the second
        assert_eq!(strobe_gate(0.25, 1.0, 30.0), 1.0);
        assert_eq!(strobe_gate(0.75, 1.0, 30.0), DIM_FLOOR);
    }

    #[test]
    fn test_gate_clamped_rate() {
        // A fast sink still tops out at MAX_PREVIEW_HZ
        assert_eq!(shown_blink_hz(100.0, 240.0), MAX_PREVIEW_HZ);
        for i in 0..200 {
            let t = i as f64 * 0.0037;
            assert_eq!(strobe_gate(t, 100.0, 240.0), strobe_gate(t, MAX_PREVIEW_HZ, 240.0));
        }
        // Slower sinks get a quarter of their redraw rate
        assert_eq!(shown_blink_hz(60.0, 30.0), 7.5);
        assert_eq!(shown_blink_hz(60.0, 15.0), 3.75);
        assert_eq!(shown_blink_hz(2.0, 30.0), 2.0);
    }

    #[test]
    fn test_fast_strobe_blinks_at_sink_rate() {
        // 60 Hz strobe sampled by a 30 fps sink: a steady on/on/dim/dim cycle
        let gates: Vec<f32> = (0..12)
            .map(|k| strobe_gate(k as f64 / 30.0 + 0.001, 60.0, 30.0))
            .collect();
        for cycle in gates.chunks(4) {
            assert_eq!(cycle, &[1.0, 1.0, DIM_FLOOR, DIM_FLOOR]);
        }
        // 15 fps console: same shape at half the rate
        let gates: Vec<f32> = (0..8)
            .map(|k| strobe_gate(k as f64 / 15.0 + 0.001, 60.0, 15.0))
            .collect();
        assert_eq!(gates.iter().filter(|&&g| g == DIM_FLOOR).count(), 4);
        assert_eq!(&gates[..4], &[1.0, 1.0, DIM_FLOOR, DIM_FLOOR]);
    }

    #[test]
    fn test_gate_never_black() {
        for i in 0..1000 {
            let g = strobe_gate(i as f64 * 0.001, 40.0, 1000.0);
            assert!(g == 1.0 || g == DIM_FLOOR);
        }
    }

    #[test]
    fn test_preview_logical_order() {
        let g = MatrixGeometry::new(2, 8).unwrap();
        let ctx = PatternContext::new(g, 0.0, AudioFeatures::silent());
        let raw = render(PatternId::LeftHalf, &ctx);
        let p = PreviewFrame::render(&raw, 0.0, PatternId::LeftHalf, 0.0, ctx.features, false);
        // Logical order: both rows lit on the left, unlike the physical buffer
        for y in 0..2 {
            for x in 0..8 {
                let expect = if x < 4 { [255, 0, 0] } else { [0, 0, 0] };
                assert_eq!(p.pixel(x, y), expect);
            }
        }
    }

    #[test]
    fn test_preview_dims_on_low_gate() {
        let g = MatrixGeometry::new(1, 2).unwrap();
        let ctx = PatternContext::new(g, 0.0, AudioFeatures::silent());
        let raw = render(PatternId::FullWhite, &ctx);
        let p = PreviewFrame::render(&raw, 0.75, PatternId::FullWhite, 1.0, ctx.features, true);
        // Frame itself stays unscaled; the sink dims it
        assert_eq!(p.pixels, vec![[255, 255, 255]; 2]);
        assert_eq!(p.gate(30.0), DIM_FLOOR);
        // 255 * 0.35 = 89.25 → 89
        assert_eq!(p.shown_pixel(1, 0, DIM_FLOOR), [89, 89, 89]);
        let compact = CompactPreview::new(&p, 30.0);
        assert_eq!(compact.g, DIM_FLOOR);
        assert_eq!(compact.px, vec![89; 6]);
        let json = serde_json::to_string(&compact).unwrap();
        assert!(json.contains("\"p\":\"full-white\""));
    }
}
