//! LED matrix geometry, the serpentine physical wiring map, and frame buffers.
//!
//! Physical strips are wired back and forth: even rows run left→right,
//! odd rows right→left. Every buffer in this crate is stored in physical
//! order so it can be shipped to the peripheral without reordering.

use crate::types::Rgb;
use serde::{Deserialize, Serialize};

/// Rows × columns of the physical LED matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixGeometry {
    pub rows: usize,
    pub cols: usize,
}

impl MatrixGeometry {
    /// A matrix needs at least two LEDs so a frame payload can never be
    /// confused with a control command on the shared characteristic.
    pub fn new(rows: usize, cols: usize) -> Result<Self, String> {
        if rows == 0 || cols == 0 {
            return Err(format!("matrix {}x{} has no LEDs", rows, cols));
        }
        if rows * cols < 2 {
            return Err("matrix must contain at least 2 LEDs".to_string());
        }
        Ok(Self { rows, cols })
    }

    pub fn led_count(&self) -> usize {
        self.rows * self.cols
    }

    /// Byte length of an RGB frame for this matrix.
    pub fn frame_len(&self) -> usize {
        self.led_count() * 3
    }

    /// Logical (x, y) → physical LED index.
    pub fn serpentine_index(&self, x: usize, y: usize) -> usize {
        debug_assert!(x < self.cols && y < self.rows);
        if y % 2 == 0 {
            y * self.cols + x
        } else {
            y * self.cols + (self.cols - 1 - x)
        }
    }

    /// Physical LED index → logical (x, y). Inverse of `serpentine_index`.
    pub fn logical_coords(&self, index: usize) -> (usize, usize) {
        let y = index / self.cols;
        let col = index % self.cols;
        let x = if y % 2 == 0 { col } else { self.cols - 1 - col };
        (x, y)
    }
}

impl Default for MatrixGeometry {
    fn default() -> Self {
        Self { rows: 8, cols: 8 }
    }
}

/// RGB bytes for every LED in physical order. Length is always
/// `rows * cols * 3`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedFrame {
    geometry: MatrixGeometry,
    data: Vec<u8>,
}

impl LedFrame {
    /// All-black frame.
    pub fn new(geometry: MatrixGeometry) -> Self {
        Self {
            geometry,
            data: vec![0; geometry.frame_len()],
        }
    }

    /// Wrap an existing flat buffer. Panics when the length does not match
    /// the geometry; a mis-sized frame is a logic bug, not input to recover from.
    pub fn from_bytes(geometry: MatrixGeometry, data: Vec<u8>) -> Self {
        assert_eq!(
            data.len(),
            geometry.frame_len(),
            "frame length {} does not match {}x{} matrix",
            data.len(),
            geometry.rows,
            geometry.cols
        );
        Self { geometry, data }
    }

    pub fn geometry(&self) -> MatrixGeometry {
        self.geometry
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn led_count(&self) -> usize {
        self.geometry.led_count()
    }

    /// Color at a physical index.
    pub fn pixel(&self, index: usize) -> Rgb {
        let i = index * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    /// Color at a logical coordinate.
    pub fn get(&self, x: usize, y: usize) -> Rgb {
        self.pixel(self.geometry.serpentine_index(x, y))
    }

    /// Write a color at a logical coordinate (mapped to its physical slot).
    pub fn set(&mut self, x: usize, y: usize, color: Rgb) {
        let i = self.geometry.serpentine_index(x, y) * 3;
        self.data[i..i + 3].copy_from_slice(&color);
    }

    pub fn fill(&mut self, color: Rgb) {
        for px in self.data.chunks_exact_mut(3) {
            px.copy_from_slice(&color);
        }
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    pub fn is_dark(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }

    /// Nested `[R, G, B]` form, physical order.
    pub fn to_triplets(&self) -> Vec<Rgb> {
        self.data
            .chunks_exact(3)
            .map(|c| [c[0], c[1], c[2]])
            .collect()
    }
}

/// Write `src` scaled by `factor` (clamped to 0.0–1.0) into `dst`.
///
/// 0 short-circuits to black, 1 to a straight copy; anything between is
/// multiplied per channel and rounded half away from zero. `src` is never
/// modified, so the preview keeps the full-brightness frame.
pub fn scale_brightness(src: &LedFrame, factor: f32, dst: &mut LedFrame) {
    assert_eq!(
        src.geometry, dst.geometry,
        "brightness scaling between different geometries"
    );
    let factor = if factor.is_nan() { 0.0 } else { factor.clamp(0.0, 1.0) };
    if factor == 0.0 {
        dst.data.fill(0);
    } else if factor == 1.0 {
        dst.data.copy_from_slice(&src.data);
    } else {
        for (d, &s) in dst.data.iter_mut().zip(src.data.iter()) {
            *d = (s as f32 * factor).round() as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_rejects_empty() {
        assert!(MatrixGeometry::new(0, 8).is_err());
        assert!(MatrixGeometry::new(8, 0).is_err());
        assert!(MatrixGeometry::new(1, 1).is_err());
        assert!(MatrixGeometry::new(1, 2).is_ok());
    }

    #[test]
    fn test_serpentine_rows() {
        let g = MatrixGeometry::new(2, 8).unwrap();
        // Row 0 left→right
        assert_eq!(g.serpentine_index(0, 0), 0);
        assert_eq!(g.serpentine_index(7, 0), 7);
        // Row 1 right→left
        assert_eq!(g.serpentine_index(0, 1), 15);
        assert_eq!(g.serpentine_index(7, 1), 8);
    }

    #[test]
    fn test_serpentine_bijective() {
        for rows in 1..=9 {
            for cols in 1..=9 {
                let Ok(g) = MatrixGeometry::new(rows, cols) else {
                    continue;
                };
                let mut seen = vec![false; g.led_count()];
                for y in 0..rows {
                    for x in 0..cols {
                        let i = g.serpentine_index(x, y);
                        assert!(i < g.led_count(), "{}x{}: index {} out of range", rows, cols, i);
                        assert!(!seen[i], "{}x{}: index {} hit twice", rows, cols, i);
                        seen[i] = true;
                        assert_eq!(g.logical_coords(i), (x, y));
                    }
                }
                assert!(seen.iter().all(|&s| s));
            }
        }
    }

    #[test]
    fn test_physical_neighbours_adjacent() {
        // End of row 0 and start of row 1 sit in the same column.
        let g = MatrixGeometry::new(4, 5).unwrap();
        let (x0, y0) = g.logical_coords(4);
        let (x1, y1) = g.logical_coords(5);
        assert_eq!(x0, x1);
        assert_eq!(y1, y0 + 1);
    }

    #[test]
    fn test_set_get() {
        let g = MatrixGeometry::new(2, 4).unwrap();
        let mut f = LedFrame::new(g);
        f.set(0, 1, [1, 2, 3]);
        assert_eq!(f.get(0, 1), [1, 2, 3]);
        // (0, 1) lives at physical index 7 (last LED of the reversed row)
        assert_eq!(f.pixel(7), [1, 2, 3]);
        assert_eq!(f.as_bytes().len(), 24);
    }

    #[test]
    #[should_panic(expected = "does not match")]
    fn test_from_bytes_wrong_len_panics() {
        let g = MatrixGeometry::new(2, 2).unwrap();
        let _ = LedFrame::from_bytes(g, vec![0; 11]);
    }

    #[test]
    fn test_scale_zero_is_black() {
        let g = MatrixGeometry::new(2, 2).unwrap();
        let mut src = LedFrame::new(g);
        src.fill([200, 100, 50]);
        let mut dst = LedFrame::new(g);
        dst.fill([9, 9, 9]);
        scale_brightness(&src, 0.0, &mut dst);
        assert!(dst.is_dark());
    }

    #[test]
    fn test_scale_one_is_copy() {
        let g = MatrixGeometry::new(2, 2).unwrap();
        let mut src = LedFrame::new(g);
        src.fill([200, 101, 7]);
        let mut dst = LedFrame::new(g);
        scale_brightness(&src, 1.0, &mut dst);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_scale_half_rounds() {
        let g = MatrixGeometry::new(1, 2).unwrap();
        let src = LedFrame::from_bytes(g, vec![255, 101, 7, 1, 0, 254]);
        let mut dst = LedFrame::new(g);
        scale_brightness(&src, 0.5, &mut dst);
        assert_eq!(dst.as_bytes(), &[128, 51, 4, 1, 0, 127]);
        // Source untouched
        assert_eq!(src.as_bytes(), &[255, 101, 7, 1, 0, 254]);
    }

    #[test]
    fn test_scale_clamps_factor() {
        let g = MatrixGeometry::new(1, 2).unwrap();
        let mut src = LedFrame::new(g);
        src.fill([100, 100, 100]);
        let mut dst = LedFrame::new(g);
        scale_brightness(&src, 3.0, &mut dst);
        assert_eq!(dst, src);
        scale_brightness(&src, -1.0, &mut dst);
        assert!(dst.is_dark());
    }
}
