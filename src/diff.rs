// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Snapshot differencing.
//!
//! Divides the screen into `block_size` x `block_size` tiles and
//! compares each tile byte-for-byte against the previous snapshot.
//! Only tiles that differ are reported, which keeps updates small when
//! the screen is mostly static. The union of the reported rectangles
//! always covers every changed pixel; a single full-screen rectangle is
//! the degenerate cover produced on the first frame and after a
//! resolution change.

use crate::framebuffer::DirtyRegion;

/// Stateful detector that remembers the previous snapshot and emits
/// per-block change rectangles.
pub struct DirtyDetector {
    previous: Option<Vec<u8>>,
    prev_dims: (u16, u16),
    block_size: usize,
    bytes_per_pixel: usize,
}

impl DirtyDetector {
    /// Creates a detector. A block size of 64 amortises the per-block
    /// overhead while still skipping unchanged regions on a typical
    /// desktop.
    pub fn new(block_size: usize, bytes_per_pixel: usize) -> Self {
        assert!(block_size > 0, "block_size must be > 0");
        Self {
            previous: None,
            prev_dims: (0, 0),
            block_size,
            bytes_per_pixel,
        }
    }

    /// Forgets the previous snapshot, forcing the next comparison to
    /// report the full screen.
    pub fn reset(&mut self) {
        self.previous = None;
    }

    /// Compares `current` against the stored snapshot and returns the
    /// changed rectangles. Stores `current` for the next call.
    ///
    /// The first call, or a call after a dimension change, reports one
    /// full-screen rectangle.
    pub fn detect(&mut self, current: &[u8], width: u16, height: u16) -> Vec<DirtyRegion> {
        let regions = match &self.previous {
            Some(prev) if self.prev_dims == (width, height) && prev.len() == current.len() => {
                self.changed_blocks(current, prev, width, height)
            }
            _ => vec![DirtyRegion::full(width, height)],
        };
        self.previous = Some(current.to_vec());
        self.prev_dims = (width, height);
        regions
    }

    fn changed_blocks(
        &self,
        current: &[u8],
        previous: &[u8],
        width: u16,
        height: u16,
    ) -> Vec<DirtyRegion> {
        let w = usize::from(width);
        let h = usize::from(height);
        let bs = self.block_size;
        let bpp = self.bytes_per_pixel;
        let row_len = w * bpp;

        let mut changed = Vec::new();
        let mut by = 0;
        while by < h {
            let block_h = bs.min(h - by);
            let mut bx = 0;
            while bx < w {
                let block_w = bs.min(w - bx);
                if Self::block_differs(
                    current, previous, row_len, bpp, bx, by, block_w, block_h,
                ) {
                    changed.push(DirtyRegion::new(
                        bx as u16,
                        by as u16,
                        block_w as u16,
                        block_h as u16,
                    ));
                }
                bx += block_w;
            }
            by += block_h;
        }
        changed
    }

    /// Row-by-row byte comparison of one tile.
    #[allow(clippy::too_many_arguments)]
    fn block_differs(
        current: &[u8],
        previous: &[u8],
        row_len: usize,
        bpp: usize,
        x: usize,
        y: usize,
        w: usize,
        h: usize,
    ) -> bool {
        for row in y..y + h {
            let left = row * row_len + x * bpp;
            let right = left + w * bpp;
            if current[left..right] != previous[left..right] {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(w: u16, h: u16, fill: u8) -> Vec<u8> {
        vec![fill; usize::from(w) * usize::from(h) * 4]
    }

    #[test]
    fn first_frame_covers_everything() {
        let mut det = DirtyDetector::new(64, 4);
        let regions = det.detect(&frame(128, 128, 0), 128, 128);
        assert_eq!(regions, vec![DirtyRegion::full(128, 128)]);
    }

    #[test]
    fn identical_frames_report_nothing() {
        let mut det = DirtyDetector::new(64, 4);
        let f = frame(128, 128, 0xaa);
        det.detect(&f, 128, 128);
        assert!(det.detect(&f, 128, 128).is_empty());
    }

    #[test]
    fn single_pixel_change_reports_its_block() {
        let mut det = DirtyDetector::new(64, 4);
        let f1 = frame(128, 128, 0);
        det.detect(&f1, 128, 128);

        let mut f2 = f1.clone();
        // Top-left pixel of block (1, 0).
        let offset = 64 * 4;
        f2[offset] = 0xff;
        let regions = det.detect(&f2, 128, 128);
        assert_eq!(regions, vec![DirtyRegion::new(64, 0, 64, 64)]);
    }

    #[test]
    fn cover_invariant_holds_for_scattered_changes() {
        let mut det = DirtyDetector::new(16, 4);
        let f1 = frame(48, 48, 0);
        det.detect(&f1, 48, 48);

        let mut f2 = f1.clone();
        let changed_pixels = [(0usize, 0usize), (20, 5), (47, 47)];
        for &(x, y) in &changed_pixels {
            f2[(y * 48 + x) * 4 + 1] = 0x55;
        }
        let regions = det.detect(&f2, 48, 48);
        for &(x, y) in &changed_pixels {
            assert!(
                regions.iter().any(|r| {
                    x >= usize::from(r.x)
                        && x < usize::from(r.x) + usize::from(r.width)
                        && y >= usize::from(r.y)
                        && y < usize::from(r.y) + usize::from(r.height)
                }),
                "pixel ({x},{y}) not covered"
            );
        }
    }

    #[test]
    fn resolution_change_forces_full_frame() {
        let mut det = DirtyDetector::new(64, 4);
        det.detect(&frame(64, 64, 0), 64, 64);
        let regions = det.detect(&frame(128, 64, 0), 128, 64);
        assert_eq!(regions, vec![DirtyRegion::full(128, 64)]);
    }

    #[test]
    fn ragged_edge_blocks_are_clamped() {
        let mut det = DirtyDetector::new(64, 4);
        let f1 = frame(100, 70, 0);
        det.detect(&f1, 100, 70);

        let mut f2 = f1.clone();
        // Bottom-right corner pixel, inside the 36x6 edge block.
        f2[(69 * 100 + 99) * 4] = 1;
        let regions = det.detect(&f2, 100, 70);
        assert_eq!(regions, vec![DirtyRegion::new(64, 64, 36, 6)]);
    }

    #[test]
    fn reset_forces_full_frame() {
        let mut det = DirtyDetector::new(64, 4);
        let f = frame(64, 64, 0);
        det.detect(&f, 64, 64);
        det.reset();
        assert_eq!(det.detect(&f, 64, 64), vec![DirtyRegion::full(64, 64)]);
    }
}
