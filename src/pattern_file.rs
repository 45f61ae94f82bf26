//! Offline pattern files: a whole track rendered ahead of time.
//!
//! Uses the same renderers and auto-selector as the live stream, so a file
//! generated here matches what the live path shows for the same features.
//!
//! ```text
//! {
//!   "version": 1, "rows": 8, "cols": 8, "fps": 30, "duration": 12.5,
//!   "frames": [ { "t": 0.0, "pattern": "left-half", "rgb": [255, 0, 0, ...] }, ... ]
//! }
//! ```
//!
//! `rgb` is the full-brightness frame, flat, in serpentine physical order.

use crate::analyser::FrequencyAnalyser;
use crate::dsp::features_from_bins;
use crate::frame::{LedFrame, MatrixGeometry};
use crate::pattern::{choose_pattern_id_auto, render_into, PatternContext, PatternId};
use crate::player::{AudioTap, WavTrack};
use crate::types::AudioFeatures;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::Path;

pub const FORMAT_VERSION: u32 = 1;
/// Longest timeline a file may cover.
pub const MAX_DURATION_SECS: f64 = 3600.0;
/// Upper bound on frames per file (one hour at 120 fps).
pub const MAX_FRAMES: usize = 432_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternFrame {
    pub t: f64,
    pub pattern: PatternId,
    pub rgb: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternFile {
    pub version: u32,
    pub rows: usize,
    pub cols: usize,
    pub fps: u32,
    pub duration: f64,
    pub frames: Vec<PatternFrame>,
}

/// Generation parameters.
#[derive(Debug, Clone, Copy)]
pub struct GenerateOptions {
    pub geometry: MatrixGeometry,
    pub fps: u32,
    /// Used when no audio is given; otherwise the track length wins.
    pub duration: f64,
    pub fft_size: usize,
}

/// Render a pattern file, with features from `audio` when supplied.
///
/// Without audio every frame sees silent features and the selector reduces
/// to a time-based round-robin.
pub fn generate(opts: &GenerateOptions, audio: Option<&WavTrack>) -> Result<PatternFile, String> {
    if opts.fps == 0 {
        return Err("fps must be positive".to_string());
    }
    let duration = match audio {
        Some(track) => track.samples().len() as f64 / track.sample_rate() as f64,
        None => opts.duration,
    };
    if !(duration.is_finite() && duration >= 0.0) {
        return Err(format!("invalid duration {}", duration));
    }
    if duration > MAX_DURATION_SECS {
        return Err(format!(
            "duration {:.1}s exceeds {:.0}s",
            duration, MAX_DURATION_SECS
        ));
    }
    let count = (duration * opts.fps as f64).ceil();
    if count > MAX_FRAMES as f64 {
        return Err(format!(
            "{:.0} frames ({:.1}s @ {} fps) exceeds {}",
            count, duration, opts.fps, MAX_FRAMES
        ));
    }
    let count = count as usize;

    let mut analyser = FrequencyAnalyser::new(opts.fft_size)?;
    let mut samples = vec![0.0f32; analyser.fft_size()];
    let mut bins = vec![0u8; analyser.frequency_bin_count()];
    let mut frame = LedFrame::new(opts.geometry);

    let mut frames = Vec::with_capacity(count);
    for i in 0..count {
        let t = i as f64 / opts.fps as f64;
        let features = match audio {
            Some(track) => {
                track.window_at(t, &mut samples);
                analyser.byte_frequency_data(&samples, &mut bins);
                features_from_bins(&bins)
            }
            None => AudioFeatures::silent(),
        };
        let pattern = choose_pattern_id_auto(features.bass, features.energy, t);
        render_into(pattern, &PatternContext::new(opts.geometry, t, features), &mut frame);
        frames.push(PatternFrame {
            t,
            pattern,
            rgb: frame.as_bytes().to_vec(),
        });
    }

    info!(
        "Generated {} frames ({:.1}s @ {} fps, {}x{})",
        frames.len(),
        duration,
        opts.fps,
        opts.geometry.rows,
        opts.geometry.cols
    );
    Ok(PatternFile {
        version: FORMAT_VERSION,
        rows: opts.geometry.rows,
        cols: opts.geometry.cols,
        fps: opts.fps,
        duration,
        frames,
    })
}

impl PatternFile {
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, self).map_err(io::Error::other)?;
        info!("Pattern file written to {:?}", path);
        Ok(())
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let file: PatternFile = serde_json::from_reader(reader).map_err(io::Error::other)?;
        if file.version != FORMAT_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported pattern file version {}", file.version),
            ));
        }
        let expected = file.rows * file.cols * 3;
        if let Some(bad) = file.frames.iter().find(|f| f.rgb.len() != expected) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame at t={} has {} bytes, expected {}", bad.t, bad.rgb.len(), expected),
            ));
        }
        Ok(file)
    }

    /// Frame shown at `t` (the last one starting at or before `t`).
    pub fn frame_at(&self, t: f64) -> Option<&PatternFrame> {
        if self.frames.is_empty() || !(t >= 0.0) {
            return None;
        }
        let i = ((t * self.fps as f64).floor() as usize).min(self.frames.len() - 1);
        self.frames.get(i)
    }
}
