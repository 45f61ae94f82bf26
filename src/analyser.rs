//! Byte frequency analyser with the same transfer function as a browser
//! `AnalyserNode::getByteFrequencyData`.
//!
//! Blackman window → FFT → |X[k]| / N → exponential smoothing over time →
//! dB → linear map of [min_db, max_db] onto 0–255.
//! The smoothing state lives in the analyser, so one instance is built per
//! audio source and reused across pattern/strobe changes.

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

pub const DEFAULT_FFT_SIZE: usize = 128;
pub const DEFAULT_SMOOTHING: f32 = 0.8;
pub const DEFAULT_MIN_DB: f32 = -100.0;
pub const DEFAULT_MAX_DB: f32 = -30.0;

const MIN_FFT_SIZE: usize = 32;
const MAX_FFT_SIZE: usize = 2048;

pub struct FrequencyAnalyser {
    fft_size: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    smoothed: Vec<f32>,
    smoothing: f32,
    min_db: f32,
    max_db: f32,
}

impl FrequencyAnalyser {
    /// `fft_size` must be a power of two in 32..=2048.
    pub fn new(fft_size: usize) -> Result<Self, String> {
        if !fft_size.is_power_of_two() || !(MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&fft_size) {
            return Err(format!(
                "fft size {} must be a power of two in {}..={}",
                fft_size, MIN_FFT_SIZE, MAX_FFT_SIZE
            ));
        }
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);
        let scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];
        Ok(Self {
            fft_size,
            fft,
            window: blackman_window(fft_size),
            buffer: vec![Complex::new(0.0, 0.0); fft_size],
            scratch,
            smoothed: vec![0.0; fft_size / 2],
            smoothing: DEFAULT_SMOOTHING,
            min_db: DEFAULT_MIN_DB,
            max_db: DEFAULT_MAX_DB,
        })
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Smoothing time constant, clamped to 0.0–1.0.
    pub fn set_smoothing(&mut self, smoothing: f32) {
        self.smoothing = smoothing.clamp(0.0, 1.0);
    }

    pub fn set_decibel_range(&mut self, min_db: f32, max_db: f32) -> Result<(), String> {
        if min_db >= max_db {
            return Err(format!("min_db {} must be below max_db {}", min_db, max_db));
        }
        self.min_db = min_db;
        self.max_db = max_db;
        Ok(())
    }

    /// Forget smoothing history (new audio source).
    pub fn reset(&mut self) {
        self.smoothed.fill(0.0);
    }

    /// Analyse the most recent `fft_size` samples of `samples` into `out`.
    ///
    /// Shorter input is zero-padded at the front. `out` is filled up to
    /// `min(out.len(), frequency_bin_count())` bins.
    pub fn byte_frequency_data(&mut self, samples: &[f32], out: &mut [u8]) {
        let n = self.fft_size;
        let start = samples.len().saturating_sub(n);
        let recent = &samples[start..];
        let pad = n - recent.len();

        for (i, slot) in self.buffer.iter_mut().enumerate() {
            let s = if i < pad { 0.0 } else { recent[i - pad] };
            let s = if s.is_finite() { s } else { 0.0 };
            *slot = Complex::new(s * self.window[i], 0.0);
        }
        self.fft
            .process_with_scratch(&mut self.buffer, &mut self.scratch);

        let scale = 1.0 / n as f32;
        let range = self.max_db - self.min_db;
        let tau = self.smoothing;
        for (k, smoothed) in self.smoothed.iter_mut().enumerate() {
            let mag = self.buffer[k].norm() * scale;
            *smoothed = tau * *smoothed + (1.0 - tau) * mag;
            if k < out.len() {
                out[k] = to_byte(*smoothed, self.min_db, range);
            }
        }
    }
}

fn to_byte(magnitude: f32, min_db: f32, range: f32) -> u8 {
    if magnitude <= 0.0 {
        return 0;
    }
    let db = 20.0 * magnitude.log10();
    let scaled = 255.0 * (db - min_db) / range;
    scaled.clamp(0.0, 255.0) as u8
}

fn blackman_window(n: usize) -> Vec<f32> {
    const A0: f32 = 0.42;
    const A1: f32 = 0.5;
    const A2: f32 = 0.08;
    (0..n)
        .map(|i| {
            let x = i as f32 / n as f32;
            A0 - A1 * (2.0 * PI * x).cos() + A2 * (4.0 * PI * x).cos()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::test_helpers::sine_wave;

    #[test]
    fn test_rejects_bad_sizes() {
        assert!(FrequencyAnalyser::new(100).is_err());
        assert!(FrequencyAnalyser::new(16).is_err());
        assert!(FrequencyAnalyser::new(4096).is_err());
        let a = FrequencyAnalyser::new(256).unwrap();
        assert_eq!(a.frequency_bin_count(), 128);
    }

    #[test]
    fn test_silence_is_zero() {
        let mut a = FrequencyAnalyser::new(128).unwrap();
        let mut bins = vec![7u8; 64];
        a.byte_frequency_data(&vec![0.0; 128], &mut bins);
        assert!(bins.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_tone_lands_in_expected_bin() {
        let mut a = FrequencyAnalyser::new(128).unwrap();
        a.set_smoothing(0.0);
        // 44100 / 128 ≈ 344.5 Hz per bin; bin 4 ≈ 1378 Hz
        let samples = sine_wave(1378.125, 0.8, 44100, 10);
        let mut bins = vec![0u8; 64];
        a.byte_frequency_data(&samples, &mut bins);
        let max = *bins.iter().max().unwrap();
        assert_eq!(bins[4], max);
        assert!(bins[4] > 200, "peak bin only {}", bins[4]);
        assert!(bins[30] < bins[4] / 2);
    }

    #[test]
    fn test_smoothing_carries_over() {
        let mut a = FrequencyAnalyser::new(64).unwrap();
        let loud = sine_wave(2000.0, 0.9, 44100, 5);
        let mut first = vec![0u8; 32];
        a.byte_frequency_data(&loud, &mut first);
        let mut second = vec![0u8; 32];
        a.byte_frequency_data(&loud, &mut second);
        // Smoothed magnitude climbs toward the steady value
        let total = |v: &[u8]| v.iter().map(|&b| b as u32).sum::<u32>();
        assert!(total(&second) > total(&first));

        a.reset();
        let mut after_reset = vec![0u8; 32];
        a.byte_frequency_data(&loud, &mut after_reset);
        assert_eq!(after_reset, first);
    }

    #[test]
    fn test_short_input_padded() {
        let mut a = FrequencyAnalyser::new(128).unwrap();
        let mut bins = vec![0u8; 64];
        a.byte_frequency_data(&[0.5; 10], &mut bins);
        // Output shorter than the bin count is filled as far as it goes
        let mut short_out = vec![9u8; 8];
        a.byte_frequency_data(&[], &mut short_out);
        assert_eq!(short_out.len(), 8);
    }

    #[test]
    fn test_decibel_range_validation() {
        let mut a = FrequencyAnalyser::new(32).unwrap();
        assert!(a.set_decibel_range(-30.0, -100.0).is_err());
        assert!(a.set_decibel_range(-90.0, -10.0).is_ok());
    }
}
