use crate::analyser::FrequencyAnalyser;
use crate::beat::BeatDetector;
use crate::ble::{BleSessionManager, GattTransport};
use crate::config::StreamConfig;
use crate::dsp::features_from_bins;
use crate::frame::{scale_brightness, LedFrame, MatrixGeometry};
use crate::pattern::{render_into, PatternContext, PatternId};
use crate::player::{AudioTap, Player};
use crate::preview::PreviewFrame;
use crate::strobe::StrobeController;
use crate::types::{
    AudioFeatures, ControlEvent, PatternMode, SessionClock, StrobeMode, DISPLAY_REFRESH_HZ,
};
use crossbeam_channel::{select, Receiver, Sender};
use log::{debug, info, trace, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Slack allowed when comparing tick spacing against the frame interval,
/// so a 60 Hz wake-up lands on every second tick for a 30 fps device.
const THROTTLE_SLACK_SECS: f64 = 0.002;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Stopped,
    Playing,
    Paused,
    Ended,
}

/// What one call to `StreamLoop::tick` did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Not playing; nothing to do.
    Idle,
    /// Too soon after the last device frame.
    Throttled,
    /// A frame was rendered (and sent if connected).
    Rendered(TickReport),
    /// Track reached its end this tick; the device was blanked.
    Ended,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    /// Track position used for rendering
    pub t: f64,
    pub pattern: PatternId,
    pub features: AudioFeatures,
    pub frame_sent: bool,
    /// Strobe command transmitted this tick, if any
    pub strobe_sent: Option<f32>,
}

/// Per-tick audio → pattern → device pipeline.
///
/// # Tick order
///
///   1. Skip unless `1 / target_fps` has passed since the last device frame
///      (the host may wake us at display rate).
///   2. Read the current sample window and analyse it into frequency bins.
///   3. Reduce to bass/mid/treble/energy; in auto mode feed the beat
///      detector, otherwise use the fixed pattern.
///   4. Render into the raw (full-brightness) frame, which feeds the preview.
///   5. Scale into the separate device frame by the brightness factor.
///   6. Work out the strobe command (de-duplicated, auto rate-limited).
///   7. Send the device frame. Failures are absorbed by the session manager.
///
/// Pause, stop, and end of track blank the device (black frame + 0 Hz
/// strobe) immediately. Brightness and modes survive pause/resume.
///
/// All scratch buffers are owned here and reused every tick; the preview
/// receives an owned copy in logical order.
pub struct StreamLoop<T: GattTransport> {
    ble: Arc<BleSessionManager<T>>,
    geometry: MatrixGeometry,
    min_interval: f64,
    last_step: f64,
    state: PlayState,
    brightness: f32,
    pattern_mode: PatternMode,
    current_pattern: PatternId,
    detector: BeatDetector,
    strobe: StrobeController,
    analyser: FrequencyAnalyser,
    samples: Vec<f32>,
    bins: Vec<u8>,
    raw: LedFrame,
    scaled: LedFrame,
    preview_tx: Option<Sender<PreviewFrame>>,
    was_connected: bool,
    frame_count: u64,
}

impl<T: GattTransport> StreamLoop<T> {
    pub fn new(config: &StreamConfig, ble: Arc<BleSessionManager<T>>) -> Result<Self, String> {
        let geometry = config.geometry()?;
        let analyser = FrequencyAnalyser::new(config.fft_size)?;
        let fps = config.target_fps.max(1);
        let initial = match config.pattern {
            PatternMode::Fixed(id) => id,
            PatternMode::Auto => PatternId::ALL[0],
        };
        Ok(Self {
            ble,
            geometry,
            min_interval: 1.0 / fps as f64,
            last_step: f64::NEG_INFINITY,
            state: PlayState::Stopped,
            brightness: clamp_unit(config.brightness),
            pattern_mode: config.pattern,
            current_pattern: initial,
            detector: BeatDetector::new(initial),
            strobe: StrobeController::new(config.strobe_mode, config.manual_strobe_hz),
            samples: vec![0.0; analyser.fft_size()],
            bins: vec![0; analyser.frequency_bin_count()],
            analyser,
            raw: LedFrame::new(geometry),
            scaled: LedFrame::new(geometry),
            preview_tx: None,
            was_connected: false,
            frame_count: 0,
        })
    }

    /// Also publish a `PreviewFrame` for every rendered frame.
    pub fn with_preview(mut self, tx: Sender<PreviewFrame>) -> Self {
        self.preview_tx = Some(tx);
        self
    }

    pub fn state(&self) -> PlayState {
        self.state
    }

    pub fn brightness(&self) -> f32 {
        self.brightness
    }

    pub fn pattern_mode(&self) -> PatternMode {
        self.pattern_mode
    }

    pub fn current_pattern(&self) -> PatternId {
        self.current_pattern
    }

    pub fn strobe_mode(&self) -> StrobeMode {
        self.strobe.mode()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Full-brightness frame from the last rendered tick.
    pub fn raw_frame(&self) -> &LedFrame {
        &self.raw
    }

    /// Brightness-scaled frame from the last rendered tick.
    pub fn device_frame(&self) -> &LedFrame {
        &self.scaled
    }

    /// Apply a control event. Returns false when the loop should terminate.
    pub fn handle<P: Player + ?Sized>(&mut self, event: ControlEvent, player: &mut P) -> bool {
        match event {
            ControlEvent::Play => {
                if !player.ready() {
                    warn!("Play requested before audio is ready");
                    return true;
                }
                if self.state == PlayState::Ended {
                    player.seek(0.0);
                }
                if self.state != PlayState::Playing {
                    self.detector.reset(player.current_time());
                    // Resume renders on the very next tick
                    self.last_step = f64::NEG_INFINITY;
                }
                player.play();
                self.state = PlayState::Playing;
                info!("Playback: play at {:.2}s", player.current_time());
            }
            ControlEvent::Pause => {
                player.pause();
                if self.state == PlayState::Playing {
                    self.state = PlayState::Paused;
                    info!("Playback: pause at {:.2}s", player.current_time());
                    self.blackout();
                }
            }
            ControlEvent::Stop => {
                player.pause();
                player.seek(0.0);
                self.state = PlayState::Stopped;
                info!("Playback: stop");
                self.blackout();
                return false;
            }
            ControlEvent::Seek(secs) => {
                player.seek(secs);
                self.detector.reset(player.current_time());
                debug!("Playback: seek to {:.2}s", player.current_time());
            }
            ControlEvent::SetPatternMode(mode) => {
                self.pattern_mode = mode;
                if let PatternMode::Fixed(id) = mode {
                    self.current_pattern = id;
                }
                info!("Pattern mode: {:?}", mode);
            }
            ControlEvent::SetBrightness(b) => {
                self.brightness = clamp_unit(b);
                info!("Brightness: {:.2}", self.brightness);
            }
            ControlEvent::SetStrobeMode(mode) => {
                self.strobe.set_mode(mode);
                info!("Strobe mode: {:?}", mode);
            }
            ControlEvent::SetManualStrobeHz(hz) => {
                self.strobe.set_manual_hz(hz);
                info!("Manual strobe: {:.1} Hz", self.strobe.manual_hz());
            }
        }
        true
    }

    /// Run one scheduling step at host time `now` (seconds, monotonic).
    pub fn tick<P: Player + AudioTap + ?Sized>(&mut self, now: f64, player: &mut P) -> TickOutcome {
        let connected = self.ble.is_connected();
        if connected && !self.was_connected {
            // Fresh session: device strobe state is unknown
            self.strobe.invalidate();
        }
        self.was_connected = connected;

        if self.state != PlayState::Playing {
            return TickOutcome::Idle;
        }

        let duration = player.duration();
        if duration > 0.0 && player.current_time() >= duration {
            player.pause();
            self.state = PlayState::Ended;
            info!("Playback: end of track after {} frames", self.frame_count);
            self.blackout();
            return TickOutcome::Ended;
        }

        if now - self.last_step + THROTTLE_SLACK_SECS < self.min_interval {
            return TickOutcome::Throttled;
        }
        self.last_step = now;

        // Audio → features
        player.read_window(&mut self.samples);
        self.analyser
            .byte_frequency_data(&self.samples, &mut self.bins);
        let features = features_from_bins(&self.bins);
        let t = player.current_time();

        // Pattern
        let pattern = match self.pattern_mode {
            PatternMode::Fixed(id) => id,
            PatternMode::Auto => {
                self.detector.evaluate(&features, t);
                self.detector.current()
            }
        };
        self.current_pattern = pattern;
        let ctx = PatternContext::new(self.geometry, t, features);
        render_into(pattern, &ctx, &mut self.raw);

        // Device path
        scale_brightness(&self.raw, self.brightness, &mut self.scaled);

        let mut strobe_sent = None;
        if let Some(hz) = self.strobe.pending(features.energy, now) {
            if self.ble.send_strobe(hz) {
                self.strobe.confirm(hz, now);
                strobe_sent = Some(hz);
            }
        }
        let frame_sent = self.ble.send_frame(&self.scaled);

        // Preview path
        if let Some(tx) = &self.preview_tx {
            let preview = PreviewFrame::render(
                &self.raw,
                t,
                pattern,
                self.strobe.desired_hz(features.energy),
                features,
                connected,
            );
            // A slow display just misses frames
            let _ = tx.try_send(preview);
        }

        self.frame_count += 1;
        if self.frame_count % 300 == 0 {
            debug!(
                "Stream: {} frames, t={:.1}s, pattern {}, {}",
                self.frame_count, t, pattern, features
            );
        }
        trace!("tick t={:.3} {} {}", t, pattern, features);

        TickOutcome::Rendered(TickReport {
            t,
            pattern,
            features,
            frame_sent,
            strobe_sent,
        })
    }

    /// Black frame and 0 Hz strobe, so the device does not hold a stale frame.
    fn blackout(&mut self) {
        if !self.ble.is_connected() {
            return;
        }
        self.scaled.clear();
        self.ble.send_frame(&self.scaled);
        if self.ble.send_strobe(0.0) {
            self.strobe.confirm(0.0, f64::NEG_INFINITY);
        }
        debug!("Device blanked");
    }
}

fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// Owner of a running stream thread.
///
/// Dropping the handle (or calling `stop`) sends `ControlEvent::Stop` and
/// joins the thread, so the loop cannot outlive whoever started it.
pub struct LoopHandle {
    control: Sender<ControlEvent>,
    join: Option<JoinHandle<()>>,
}

impl LoopHandle {
    /// Forward a control event. False once the loop has exited.
    pub fn send(&self, event: ControlEvent) -> bool {
        self.control.send(event).is_ok()
    }

    /// A sender other threads can use to drive the loop.
    pub fn controller(&self) -> Sender<ControlEvent> {
        self.control.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |j| j.is_finished())
    }

    /// Block until the loop exits on its own (end of track or Stop).
    pub fn wait(mut self) {
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(j) = self.join.take() {
            let _ = self.control.send(ControlEvent::Stop);
            if j.join().is_err() {
                warn!("Stream thread panicked");
            }
        }
    }
}

impl Drop for LoopHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run `stream` on its own thread, woken at display refresh rate.
///
/// With `autoplay` the track starts immediately. The thread exits on
/// `ControlEvent::Stop`, when every `LoopHandle` sender is gone, or when
/// the track ends.
pub fn spawn<T, P>(
    mut stream: StreamLoop<T>,
    mut player: P,
    autoplay: bool,
) -> std::io::Result<LoopHandle>
where
    T: GattTransport + 'static,
    P: Player + AudioTap + Send + 'static,
{
    let (control_tx, control_rx) = crossbeam_channel::unbounded::<ControlEvent>();
    let join = thread::Builder::new()
        .name("stream-loop".into())
        .spawn(move || {
            if autoplay {
                stream.handle(ControlEvent::Play, &mut player);
            }
            run_loop(&mut stream, &mut player, &control_rx);
        })?;
    Ok(LoopHandle {
        control: control_tx,
        join: Some(join),
    })
}

fn run_loop<T, P>(stream: &mut StreamLoop<T>, player: &mut P, control_rx: &Receiver<ControlEvent>)
where
    T: GattTransport,
    P: Player + AudioTap,
{
    let clock = SessionClock::new();
    let ticker = crossbeam_channel::tick(Duration::from_micros(
        1_000_000 / DISPLAY_REFRESH_HZ as u64,
    ));
    info!(
        "Stream loop running ({} Hz wake-up, {:.0} fps device)",
        DISPLAY_REFRESH_HZ,
        1.0 / stream.min_interval
    );

    loop {
        select! {
            recv(control_rx) -> msg => match msg {
                Ok(event) => {
                    if !stream.handle(event, player) {
                        break;
                    }
                }
                Err(_) => {
                    stream.handle(ControlEvent::Stop, player);
                    break;
                }
            },
            recv(ticker) -> _ => {
                if stream.tick(clock.now_secs(), player) == TickOutcome::Ended {
                    break;
                }
            }
        }
    }
    info!("Stream loop stopped after {} frames", stream.frame_count);
}
