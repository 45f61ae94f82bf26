use hound::{SampleFormat, WavReader};
use log::{debug, info};
use std::path::Path;
use std::time::Instant;

/// Transport controls of an audio source.
pub trait Player {
    fn play(&mut self);
    fn pause(&mut self);
    /// Jump to `secs`, clamped to `0..=duration`.
    fn seek(&mut self, secs: f64);
    /// Track length in seconds.
    fn duration(&self) -> f64;
    /// Playback position in seconds.
    fn current_time(&self) -> f64;
    /// True once audio is decoded and the analyser can produce data.
    fn ready(&self) -> bool;
}

/// Read access to the audio the player is currently emitting.
pub trait AudioTap {
    fn sample_rate(&self) -> u32;
    /// Fill `out` with the samples ending at the current position
    /// (zeros before the start of the track).
    fn read_window(&self, out: &mut [f32]);
}

/// Wall-clock playback position.
#[derive(Debug, Clone)]
pub struct PlayHead {
    offset: f64,
    started: Option<Instant>,
    duration: f64,
}

impl PlayHead {
    pub fn new(duration: f64) -> Self {
        Self {
            offset: 0.0,
            started: None,
            duration: duration.max(0.0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    pub fn start(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    pub fn stop(&mut self) {
        self.offset = self.position();
        self.started = None;
    }

    pub fn seek(&mut self, secs: f64) {
        let secs = if secs.is_finite() { secs } else { 0.0 };
        self.offset = secs.clamp(0.0, self.duration);
        if self.started.is_some() {
            self.started = Some(Instant::now());
        }
    }

    pub fn position(&self) -> f64 {
        let running = self
            .started
            .map(|s| s.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        (self.offset + running).min(self.duration)
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }
}

/// Copy the `out.len()` samples of `mono` ending at sample `end`.
pub fn copy_window(mono: &[f32], end: usize, out: &mut [f32]) {
    let end = end.min(mono.len());
    let start = end.saturating_sub(out.len());
    let avail = &mono[start..end];
    let pad = out.len() - avail.len();
    out[..pad].fill(0.0);
    out[pad..].copy_from_slice(avail);
}

/// A decoded WAV file played against the wall clock.
///
/// The whole file is decoded into mono `f32` up front; the analyser reads
/// windows out of that buffer at the current play position.
pub struct WavTrack {
    mono: Vec<f32>,
    sample_rate: u32,
    head: PlayHead,
}

impl WavTrack {
    pub fn open(path: &Path) -> Result<Self, hound::Error> {
        let reader = WavReader::open(path)?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        info!(
            "WAV: {:?}  {} Hz  {} ch  {:?}  {} bit",
            path.file_name().unwrap_or_default(),
            spec.sample_rate,
            channels,
            spec.sample_format,
            spec.bits_per_sample,
        );

        let samples: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<Result<_, _>>()?,
            SampleFormat::Int => {
                let max = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / max))
                    .collect::<Result<_, _>>()?
            }
        };

        Ok(Self::from_samples(mix_to_mono(samples, channels), spec.sample_rate))
    }

    pub fn from_samples(mono: Vec<f32>, sample_rate: u32) -> Self {
        let sample_rate = sample_rate.max(1);
        let duration = mono.len() as f64 / sample_rate as f64;
        debug!("WAV: {:.2}s, {} samples", duration, mono.len());
        Self {
            mono,
            sample_rate,
            head: PlayHead::new(duration),
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.mono
    }

    /// Fill `out` with the window ending at `t` seconds.
    pub fn window_at(&self, t: f64, out: &mut [f32]) {
        let end = (t.max(0.0) * self.sample_rate as f64) as usize;
        copy_window(&self.mono, end, out);
    }
}

fn mix_to_mono(interleaved: Vec<f32>, channels: usize) -> Vec<f32> {
    if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    }
}

impl Player for WavTrack {
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
        !self.mono.is_empty()
    }
}

impl AudioTap for WavTrack {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_window(&self, out: &mut [f32]) {
        self.window_at(self.head.position(), out);
    }
}
