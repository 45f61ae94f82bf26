//! Stream configuration: matrix geometry, device rate and initial modes.
//!
//! Loaded from an optional JSON file; CLI flags override individual fields.
//! Missing fields take their defaults, so a file may list only what it changes.

use crate::analyser::DEFAULT_FFT_SIZE;
use crate::frame::MatrixGeometry;
use crate::types::{PatternMode, StrobeMode, DEFAULT_TARGET_FPS};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub rows: usize,
    pub cols: usize,
    /// Device frames per second
    pub target_fps: u32,
    /// Device brightness factor 0.0–1.0
    pub brightness: f32,
    pub pattern: PatternMode,
    pub strobe_mode: StrobeMode,
    pub manual_strobe_hz: f32,
    pub fft_size: usize,
    /// Only connect to devices whose name starts with this
    pub device_name_prefix: Option<String>,
    /// Calibration value sent to the device after connecting
    pub device_brightness: Option<u8>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            rows: 8,
            cols: 8,
            target_fps: DEFAULT_TARGET_FPS,
            brightness: 1.0,
            pattern: PatternMode::Auto,
            strobe_mode: StrobeMode::Off,
            manual_strobe_hz: 0.0,
            fft_size: DEFAULT_FFT_SIZE,
            device_name_prefix: None,
            device_brightness: None,
        }
    }
}

impl StreamConfig {
    /// Load from a JSON file. Returns None if file is absent or malformed.
    pub fn load(path: &Path) -> Option<Self> {
        let data = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&data) {
            Ok(c) => {
                info!("Loaded stream config from {:?}", path);
                Some(c)
            }
            Err(e) => {
                warn!("Failed to parse config file {:?}: {}", path, e);
                None
            }
        }
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        std::fs::write(path, json)?;
        info!("Stream config saved to {:?}", path);
        Ok(())
    }

    pub fn geometry(&self) -> Result<MatrixGeometry, String> {
        MatrixGeometry::new(self.rows, self.cols)
    }
}
