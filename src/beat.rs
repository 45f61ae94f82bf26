use crate::pattern::{choose_pattern_id_auto, PatternId};
use crate::types::AudioFeatures;
use log::debug;
use std::collections::VecDeque;

/// Samples kept for the rolling bass/energy averages.
pub const HISTORY_LEN: usize = 4;

/// Short rolling history of bass and energy, overwritten continuously.
#[derive(Debug, Clone)]
pub struct FeatureHistory {
    bass: VecDeque<f32>,
    energy: VecDeque<f32>,
    capacity: usize,
}

impl FeatureHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            bass: VecDeque::with_capacity(capacity),
            energy: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, features: &AudioFeatures) {
        if self.bass.len() == self.capacity {
            self.bass.pop_front();
            self.energy.pop_front();
        }
        self.bass.push_back(features.bass);
        self.energy.push_back(features.energy);
    }

    pub fn len(&self) -> usize {
        self.bass.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bass.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.bass.len() == self.capacity
    }

    pub fn clear(&mut self) {
        self.bass.clear();
        self.energy.clear();
    }

    pub fn bass_average(&self) -> f32 {
        average(&self.bass)
    }

    pub fn energy_average(&self) -> f32 {
        average(&self.energy)
    }
}

impl Default for FeatureHistory {
    fn default() -> Self {
        Self::new(HISTORY_LEN)
    }
}

fn average(values: &VecDeque<f32>) -> f32 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f32>() / values.len() as f32
    }
}

/// Thresholds for the four detection rules. Times in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorConfig {
    pub bass_ratio: f32,
    pub bass_floor: f32,
    pub bass_debounce: f64,
    pub energy_ratio: f32,
    pub energy_floor: f32,
    pub energy_debounce: f64,
    pub drop_ratio: f32,
    /// Rolling energy average must exceed this before a drop counts
    pub drop_average_floor: f32,
    pub drop_debounce: f64,
    /// Fraction of `min_hold` a drop has to wait
    pub drop_hold_factor: f64,
    /// Minimum time between pattern changes for transient rules
    pub min_hold: f64,
    /// Forced change when nothing fired for this long
    pub max_idle: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            bass_ratio: 1.4,
            bass_floor: 80.0,
            bass_debounce: 0.3,
            energy_ratio: 1.6,
            energy_floor: 100.0,
            energy_debounce: 0.4,
            drop_ratio: 0.5,
            drop_average_floor: 80.0,
            drop_debounce: 0.8,
            drop_hold_factor: 0.7,
            min_hold: 0.8,
            max_idle: 6.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeatKind {
    BassKick,
    EnergySpike,
    Drop,
    /// No transient for `max_idle`; not counted as a beat.
    Forced,
}

/// One rule firing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorEvent {
    pub kind: BeatKind,
    pub t: f64,
    /// Active auto pattern after the event
    pub pattern: PatternId,
    /// False when the selector returned the already-active pattern
    pub changed: bool,
}

/// Transient detector driving automatic pattern changes.
///
/// # Rules
///
/// Evaluated once per tick against the rolling averages of the samples
/// *before* the current one, first match wins:
///
///   1. **Bass kick**: bass above `bass_ratio` × average and above
///      `bass_floor`, gated by `min_hold` since the last change and
///      `bass_debounce` since the last beat.
///   2. **Energy spike**: same shape on energy (`energy_ratio`,
///      `energy_floor`, `energy_debounce`).
///   3. **Drop**: energy below `drop_ratio` × average while the average is
///      above `drop_average_floor`, with a relaxed hold
///      (`drop_hold_factor` × `min_hold`) and `drop_debounce`.
///   4. **Forced**: nothing fired and the pattern is older than `max_idle`.
///
/// Transient rules need a full history so the first ticks of a track
/// cannot fire against an empty average. A firing rule asks
/// `choose_pattern_id_auto` for a candidate and commits it only when it
/// differs from the active pattern; a forced change that gets the active
/// pattern back advances to `PatternId::next` instead.
pub struct BeatDetector {
    pub config: DetectorConfig,
    history: FeatureHistory,
    last_beat: f64,
    last_change: f64,
    current: PatternId,
    beats: u64,
}

impl BeatDetector {
    pub fn new(initial: PatternId) -> Self {
        Self::with_config(initial, DetectorConfig::default())
    }

    pub fn with_config(initial: PatternId, config: DetectorConfig) -> Self {
        Self {
            config,
            history: FeatureHistory::default(),
            last_beat: f64::NEG_INFINITY,
            last_change: 0.0,
            current: initial,
            beats: 0,
        }
    }

    /// Active auto pattern.
    pub fn current(&self) -> PatternId {
        self.current
    }

    /// Beats registered since construction or the last reset.
    pub fn beat_count(&self) -> u64 {
        self.beats
    }

    pub fn history(&self) -> &FeatureHistory {
        &self.history
    }

    /// Start a new session with time origin `t0`.
    pub fn reset(&mut self, t0: f64) {
        self.history.clear();
        self.last_beat = f64::NEG_INFINITY;
        self.last_change = t0;
        self.beats = 0;
    }

    pub fn evaluate(&mut self, features: &AudioFeatures, t: f64) -> Option<DetectorEvent> {
        let kind = self.classify(features, t);
        self.history.push(features);
        let kind = kind?;

        let candidate = choose_pattern_id_auto(features.bass, features.energy, t);
        let next = match kind {
            BeatKind::Forced if candidate == self.current => self.current.next(),
            _ => candidate,
        };
        if kind != BeatKind::Forced {
            self.last_beat = t;
            self.beats += 1;
        }
        let changed = next != self.current;
        if changed {
            debug!(
                "Pattern {} -> {} ({:?} at {:.2}s, {})",
                self.current, next, kind, t, features
            );
            self.current = next;
            self.last_change = t;
        }
        Some(DetectorEvent {
            kind,
            t,
            pattern: self.current,
            changed,
        })
    }

    fn classify(&self, f: &AudioFeatures, t: f64) -> Option<BeatKind> {
        let c = &self.config;
        let since_change = t - self.last_change;
        let since_beat = t - self.last_beat;

        if self.history.is_full() {
            let bass_avg = self.history.bass_average();
            let energy_avg = self.history.energy_average();

            if f.bass > c.bass_ratio * bass_avg
                && f.bass > c.bass_floor
                && since_change > c.min_hold
                && since_beat > c.bass_debounce
            {
                return Some(BeatKind::BassKick);
            }
            if f.energy > c.energy_ratio * energy_avg
                && f.energy > c.energy_floor
                && since_change > c.min_hold
                && since_beat > c.energy_debounce
            {
                return Some(BeatKind::EnergySpike);
            }
            if f.energy < c.drop_ratio * energy_avg
                && energy_avg > c.drop_average_floor
                && since_change > c.min_hold * c.drop_hold_factor
                && since_beat > c.drop_debounce
            {
                return Some(BeatKind::Drop);
            }
        }

        if since_change > c.max_idle {
            return Some(BeatKind::Forced);
        }
        None
    }
}
