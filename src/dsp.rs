//! Band reduction of byte frequency bins, RMS, and test signal generators.

use crate::types::AudioFeatures;

/// Fraction of bins (from DC up) counted as bass.
pub const BASS_FRACTION: f32 = 0.15;
/// Upper edge of the mid band as a fraction of all bins.
pub const MID_FRACTION: f32 = 0.47;

/// Bin ranges `(bass_end, mid_end)` for `n` bins.
///
/// bass = `0..bass_end`, mid = `bass_end..mid_end`, treble = `mid_end..n`.
/// Each band keeps at least one bin when `n >= 3`.
pub fn band_edges(n: usize) -> (usize, usize) {
    if n == 0 {
        return (0, 0);
    }
    let bass_end = ((n as f32 * BASS_FRACTION).ceil() as usize).clamp(1, n);
    let mid_end = ((n as f32 * MID_FRACTION).ceil() as usize).clamp(bass_end, n);
    if n >= 3 {
        let mid_end = mid_end.max(bass_end + 1).min(n - 1);
        (bass_end.min(mid_end - 1), mid_end)
    } else {
        (bass_end, mid_end)
    }
}

fn mean(bins: &[u8]) -> f32 {
    if bins.is_empty() {
        return 0.0;
    }
    bins.iter().map(|&b| b as u32).sum::<u32>() as f32 / bins.len() as f32
}

/// Reduce one frequency snapshot to bass/mid/treble/energy (each the mean
/// of its bins, 0.0–255.0).
pub fn features_from_bins(bins: &[u8]) -> AudioFeatures {
    let (bass_end, mid_end) = band_edges(bins.len());
    AudioFeatures {
        bass: mean(&bins[..bass_end]),
        mid: mean(&bins[bass_end..mid_end]),
        treble: mean(&bins[mid_end..]),
        energy: mean(bins),
    }
}

/// Root mean square of an audio buffer.
pub fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}
