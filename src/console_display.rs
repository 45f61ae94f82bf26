use crate::preview::PreviewFrame;
use crossbeam_channel::Receiver;
use std::fmt::Write as _;
use std::io::{self, Write};

/// Live terminal view of the preview stream: the matrix in 24-bit color
/// plus feature bars.
pub struct ConsoleDisplay {
    rx: Receiver<PreviewFrame>,
    update_hz: u32,
    /// Rate previews arrive at (the loop's device fps)
    source_fps: u32,
}

/// Previews arrive once per device frame; redraw every `skip`th one.
/// An `update_hz` of 0 means half the source rate.
fn redraw_skip(source_fps: u32, update_hz: u32) -> u64 {
    if update_hz == 0 {
        2
    } else {
        (source_fps / update_hz).max(1) as u64
    }
}

impl ConsoleDisplay {
    pub fn new(rx: Receiver<PreviewFrame>, update_hz: u32, source_fps: u32) -> Self {
        Self {
            rx,
            update_hz,
            source_fps: source_fps.max(1),
        }
    }

    /// Effective redraw rate in Hz.
    pub fn redraw_hz(&self) -> f32 {
        self.source_fps as f32 / redraw_skip(self.source_fps, self.update_hz) as f32
    }

    /// Blocks until the preview channel closes.
    pub fn run(&self) {
        let skip = redraw_skip(self.source_fps, self.update_hz);
        let redraw_hz = self.redraw_hz();
        let mut count: u64 = 0;
        let mut stdout = io::stdout();

        for frame in self.rx.iter() {
            count += 1;
            if count % skip != 0 {
                continue;
            }
            // Clear screen and move cursor home
            let _ = write!(stdout, "\x1b[2J\x1b[H{}", render_text(&frame, redraw_hz));
            let _ = stdout.flush();
        }
    }
}

/// One full dashboard redraw, without the clear-screen prefix, for a
/// terminal refreshed at `redraw_hz`.
pub fn render_text(frame: &PreviewFrame, redraw_hz: f32) -> String {
    let gate = frame.gate(redraw_hz);
    let mut out = String::new();
    let width = frame.cols * 2 + 2;
    let _ = writeln!(out, "╔{}╗", "═".repeat(width));
    for y in 0..frame.rows {
        out.push_str("║ ");
        for x in 0..frame.cols {
            let [r, g, b] = frame.shown_pixel(x, y, gate);
            let _ = write!(out, "\x1b[38;2;{};{};{}m██", r, g, b);
        }
        out.push_str("\x1b[0m ║\n");
    }
    let _ = writeln!(out, "╚{}╝", "═".repeat(width));

    let ble = if frame.connected { "connected" } else { "offline" };
    let _ = writeln!(out, "  t {:>7.2}s  {:<10}  BLE {}", frame.t, frame.pattern, ble);
    if frame.strobe_hz > 0.0 {
        let _ = writeln!(out, "  strobe {:>5.1} Hz", frame.strobe_hz);
    } else {
        out.push_str("  strobe off\n");
    }
    let f = &frame.features;
    for (name, v) in [
        ("bass", f.bass),
        ("mid", f.mid),
        ("treble", f.treble),
        ("energy", f.energy),
    ] {
        let _ = writeln!(out, "  {:>6} {} {:>3.0}", name, make_bar(v / 255.0, 24), v);
    }
    out
}

fn make_bar(val: f32, width: usize) -> String {
    let val = if val.is_finite() { val.clamp(0.0, 1.0) } else { 0.0 };
    let filled = (val * width as f32).round() as usize;
    let empty = width.saturating_sub(filled);
    format!("[{}{}]", "█".repeat(filled), "░".repeat(empty))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MatrixGeometry;
    use crate::pattern::{render, PatternContext, PatternId};
    use crate::types::AudioFeatures;

    #[test]
    fn test_make_bar() {
        assert_eq!(make_bar(0.5, 4), "[██░░]");
        assert_eq!(make_bar(2.0, 2), "[██]");
        assert_eq!(make_bar(f32::NAN, 2), "[░░]");
    }

    #[test]
    fn test_render_text_colors() {
        let g = MatrixGeometry::new(2, 2).unwrap();
        let features = AudioFeatures {
            bass: 255.0,
            mid: 0.0,
            treble: 0.0,
            energy: 85.0,
        };
        let ctx = PatternContext::new(g, 0.0, features);
        let raw = render(PatternId::LeftHalf, &ctx);
        let p = PreviewFrame::render(&raw, 0.0, PatternId::LeftHalf, 0.0, features, true);
        let text = render_text(&p, 15.0);
        // Two red cells (one per row) and two dark ones
        assert_eq!(text.matches("\x1b[38;2;255;0;0m").count(), 2);
        assert_eq!(text.matches("\x1b[38;2;0;0;0m").count(), 2);
        assert!(text.contains("BLE connected"));
        assert!(text.contains("strobe off"));
        assert!(text.contains("left-half"));
    }

    #[test]
    fn test_redraw_skip_follows_source_rate() {
        assert_eq!(redraw_skip(30, 15), 2);
        assert_eq!(redraw_skip(20, 15), 1);
        assert_eq!(redraw_skip(60, 15), 4);
        assert_eq!(redraw_skip(30, 0), 2);
        assert_eq!(redraw_skip(10, 30), 1);

        let (_tx, rx) = crossbeam_channel::bounded(1);
        assert_eq!(ConsoleDisplay::new(rx.clone(), 15, 60).redraw_hz(), 15.0);
        assert_eq!(ConsoleDisplay::new(rx.clone(), 15, 20).redraw_hz(), 20.0);
        assert_eq!(ConsoleDisplay::new(rx, 0, 30).redraw_hz(), 15.0);
    }

    #[test]
    fn test_render_text_dims_low_gate() {
        let g = MatrixGeometry::new(1, 2).unwrap();
        let ctx = PatternContext::new(g, 0.0, AudioFeatures::silent());
        let raw = render(PatternId::FullWhite, &ctx);
        // 1 Hz strobe, second half of the cycle
        let p = PreviewFrame::render(&raw, 0.75, PatternId::FullWhite, 1.0, ctx.features, false);
        let text = render_text(&p, 15.0);
        assert_eq!(text.matches("\x1b[38;2;89;89;89m").count(), 2);
        assert!(text.contains("strobe   1.0 Hz"));
    }
}
