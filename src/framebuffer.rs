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

//! Framebuffer storage and dirty region tracking.
//!
//! The [`Framebuffer`] is a contiguous row-major pixel store with a
//! top-left origin, shared between tasks through a cheap clonable
//! handle. The server owns one as the capture target; the viewer owns
//! one as the decode target. Pixel bytes are copied out under a short
//! lock and never written while a lock is held across I/O.
//!
//! A [`DirtyRegion`] is a rectangle of pixels that changed since the
//! last update delivered to a given client. Each client keeps its own
//! ordered set because each client acknowledges independently.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::SessionError;

/// A rectangle of changed pixels, in framebuffer coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyRegion {
    /// Left edge in pixels.
    pub x: u16,
    /// Top edge in pixels.
    pub y: u16,
    /// Width in pixels.
    pub width: u16,
    /// Height in pixels.
    pub height: u16,
}

impl DirtyRegion {
    /// Creates a region from its corner and dimensions.
    pub fn new(x: u16, y: u16, width: u16, height: u16) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// A region covering an entire `width` x `height` framebuffer.
    pub fn full(width: u16, height: u16) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Whether the region covers zero pixels.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Intersection with another region, or `None` when they are
    /// disjoint or either is empty.
    pub fn intersect(&self, other: &DirtyRegion) -> Option<DirtyRegion> {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);
        if x1 < x2 && y1 < y2 {
            Some(DirtyRegion::new(x1, y1, x2 - x1, y2 - y1))
        } else {
            None
        }
    }

    /// Clamps the region to the framebuffer bounds, dropping any part
    /// that falls outside.
    pub fn clamp(&self, fb_width: u16, fb_height: u16) -> Option<DirtyRegion> {
        self.intersect(&DirtyRegion::full(fb_width, fb_height))
    }

    /// Removes `other` from this region, returning the up to four
    /// rectangles that remain. Used to drain sent rectangles from a
    /// dirty set.
    pub fn subtract(&self, other: &DirtyRegion) -> Vec<DirtyRegion> {
        let Some(cut) = self.intersect(other) else {
            return vec![*self];
        };
        let mut pieces = Vec::new();
        // Band above and below the cut, full width of self.
        if cut.y > self.y {
            pieces.push(DirtyRegion::new(self.x, self.y, self.width, cut.y - self.y));
        }
        let self_bottom = self.y + self.height;
        let cut_bottom = cut.y + cut.height;
        if cut_bottom < self_bottom {
            pieces.push(DirtyRegion::new(
                self.x,
                cut_bottom,
                self.width,
                self_bottom - cut_bottom,
            ));
        }
        // Left and right of the cut, within the cut's vertical band.
        if cut.x > self.x {
            pieces.push(DirtyRegion::new(self.x, cut.y, cut.x - self.x, cut.height));
        }
        let self_right = self.x + self.width;
        let cut_right = cut.x + cut.width;
        if cut_right < self_right {
            pieces.push(DirtyRegion::new(
                cut_right,
                cut.y,
                self_right - cut_right,
                cut.height,
            ));
        }
        pieces
    }
}

struct Inner {
    width: u16,
    height: u16,
    bytes_per_pixel: usize,
    data: Vec<u8>,
}

impl Inner {
    fn row_len(&self) -> usize {
        usize::from(self.width) * self.bytes_per_pixel
    }

    fn check_rect(&self, x: u16, y: u16, w: u16, h: u16) -> Result<(), SessionError> {
        if u32::from(x) + u32::from(w) > u32::from(self.width)
            || u32::from(y) + u32::from(h) > u32::from(self.height)
        {
            return Err(SessionError::Decode(format!(
                "rectangle ({x},{y} {w}x{h}) outside {}x{} framebuffer",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

/// Shared, clonable pixel store.
///
/// Cloning the handle shares the same underlying buffer; the lock is
/// internal and every operation copies the bytes it needs.
#[derive(Clone)]
pub struct Framebuffer {
    inner: Arc<RwLock<Inner>>,
}

impl Framebuffer {
    /// Allocates a zeroed `width` x `height` framebuffer with the given
    /// pixel width in bytes.
    pub fn new(width: u16, height: u16, bytes_per_pixel: usize) -> Self {
        let data = vec![0u8; usize::from(width) * usize::from(height) * bytes_per_pixel];
        Self::from_pixels(width, height, bytes_per_pixel, data)
    }

    /// Wraps an existing full frame, so the store holds real content
    /// from the first moment.
    ///
    /// `data` length must be `width * height * bytes_per_pixel`; a
    /// mismatched buffer is truncated or zero-extended.
    pub fn from_pixels(width: u16, height: u16, bytes_per_pixel: usize, mut data: Vec<u8>) -> Self {
        data.resize(
            usize::from(width) * usize::from(height) * bytes_per_pixel,
            0,
        );
        Self {
            inner: Arc::new(RwLock::new(Inner {
                width,
                height,
                bytes_per_pixel,
                data,
            })),
        }
    }

    /// Current width in pixels.
    pub async fn width(&self) -> u16 {
        self.inner.read().await.width
    }

    /// Current height in pixels.
    pub async fn height(&self) -> u16 {
        self.inner.read().await.height
    }

    /// Current dimensions as a pair.
    pub async fn dimensions(&self) -> (u16, u16) {
        let inner = self.inner.read().await;
        (inner.width, inner.height)
    }

    /// Bytes per pixel of the stored data.
    pub async fn bytes_per_pixel(&self) -> usize {
        self.inner.read().await.bytes_per_pixel
    }

    /// Replaces the entire contents from a full-frame slice.
    ///
    /// `data` must be exactly `width * height * bytes_per_pixel` bytes.
    pub async fn update_from_slice(&self, data: &[u8]) -> Result<(), SessionError> {
        let mut inner = self.inner.write().await;
        if data.len() != inner.data.len() {
            return Err(SessionError::Decode(format!(
                "full-frame update of {} bytes does not match buffer of {}",
                data.len(),
                inner.data.len()
            )));
        }
        inner.data.copy_from_slice(data);
        Ok(())
    }

    /// Reallocates to new dimensions, zero-filling the contents.
    pub async fn resize(&self, width: u16, height: u16) {
        let mut inner = self.inner.write().await;
        inner.width = width;
        inner.height = height;
        let len = usize::from(width) * usize::from(height) * inner.bytes_per_pixel;
        inner.data.clear();
        inner.data.resize(len, 0);
    }

    /// Copies out the pixels of a rectangle, row major.
    pub async fn get_rect(
        &self,
        x: u16,
        y: u16,
        w: u16,
        h: u16,
    ) -> Result<Vec<u8>, SessionError> {
        let inner = self.inner.read().await;
        inner.check_rect(x, y, w, h)?;
        let bpp = inner.bytes_per_pixel;
        let row_len = inner.row_len();
        let mut out = Vec::with_capacity(usize::from(w) * usize::from(h) * bpp);
        for row in 0..usize::from(h) {
            let start = (usize::from(y) + row) * row_len + usize::from(x) * bpp;
            out.extend_from_slice(&inner.data[start..start + usize::from(w) * bpp]);
        }
        Ok(out)
    }

    /// Writes a row-major pixel block into a rectangle.
    pub async fn put_rect(
        &self,
        x: u16,
        y: u16,
        w: u16,
        h: u16,
        pixels: &[u8],
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.write().await;
        inner.check_rect(x, y, w, h)?;
        let bpp = inner.bytes_per_pixel;
        let expected = usize::from(w) * usize::from(h) * bpp;
        if pixels.len() != expected {
            return Err(SessionError::Decode(format!(
                "rectangle payload of {} bytes, expected {expected}",
                pixels.len()
            )));
        }
        let row_len = inner.row_len();
        for row in 0..usize::from(h) {
            let start = (usize::from(y) + row) * row_len + usize::from(x) * bpp;
            let src = &pixels[row * usize::from(w) * bpp..(row + 1) * usize::from(w) * bpp];
            inner.data[start..start + src.len()].copy_from_slice(src);
        }
        Ok(())
    }

    /// Copies a rectangle within the framebuffer.
    ///
    /// Semantically read-then-write: the source is captured into a
    /// temporary first, so overlapping source and destination behave as
    /// if the copy were instantaneous.
    pub async fn copy_rect(
        &self,
        src_x: u16,
        src_y: u16,
        dst_x: u16,
        dst_y: u16,
        w: u16,
        h: u16,
    ) -> Result<(), SessionError> {
        let temp = self.get_rect(src_x, src_y, w, h).await?;
        self.put_rect(dst_x, dst_y, w, h, &temp).await
    }

    /// Copies out the whole frame.
    pub async fn snapshot(&self) -> Vec<u8> {
        self.inner.read().await.data.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rect_round_trip() {
        let fb = Framebuffer::new(8, 8, 4);
        let pixels: Vec<u8> = (0..2 * 2 * 4).map(|i| i as u8).collect();
        fb.put_rect(2, 3, 2, 2, &pixels).await.unwrap();
        assert_eq!(fb.get_rect(2, 3, 2, 2).await.unwrap(), pixels);
        // Neighbouring pixels stay zero.
        assert_eq!(fb.get_rect(0, 0, 1, 1).await.unwrap(), vec![0u8; 4]);
    }

    #[tokio::test]
    async fn out_of_bounds_rect_is_rejected() {
        let fb = Framebuffer::new(4, 4, 4);
        assert!(fb.get_rect(3, 3, 2, 2).await.is_err());
        assert!(fb.put_rect(0, 0, 5, 1, &[0u8; 20]).await.is_err());
    }

    #[tokio::test]
    async fn overlapping_copy_reads_before_writing() {
        let fb = Framebuffer::new(4, 1, 1);
        fb.update_from_slice(&[1, 2, 3, 4]).await.unwrap();
        // Shift right by one with overlap; a naive forward copy would
        // smear the first byte.
        fb.copy_rect(0, 0, 1, 0, 3, 1).await.unwrap();
        assert_eq!(fb.snapshot().await, vec![1, 1, 2, 3]);
    }

    #[tokio::test]
    async fn resize_zeroes_contents() {
        let fb = Framebuffer::new(2, 2, 4);
        fb.update_from_slice(&[0xff; 16]).await.unwrap();
        fb.resize(3, 3).await;
        assert_eq!(fb.dimensions().await, (3, 3));
        assert_eq!(fb.snapshot().await, vec![0u8; 36]);
    }

    #[test]
    fn subtract_splits_into_covering_pieces() {
        let region = DirtyRegion::new(0, 0, 10, 10);
        let hole = DirtyRegion::new(2, 3, 4, 5);
        let pieces = region.subtract(&hole);
        // The pieces plus the hole tile the region exactly.
        let area: u32 = pieces
            .iter()
            .map(|p| u32::from(p.width) * u32::from(p.height))
            .sum();
        assert_eq!(area + 4 * 5, 100);
        for piece in &pieces {
            assert!(piece.intersect(&hole).is_none());
            assert!(piece.intersect(&region).is_some());
        }

        // Disjoint subtraction is a no-op.
        assert_eq!(
            region.subtract(&DirtyRegion::new(50, 50, 1, 1)),
            vec![region]
        );
        // Full subtraction leaves nothing.
        assert!(region.subtract(&region).is_empty());
    }

    #[test]
    fn intersect_and_clamp() {
        let a = DirtyRegion::new(0, 0, 10, 10);
        let b = DirtyRegion::new(5, 5, 10, 10);
        assert_eq!(a.intersect(&b), Some(DirtyRegion::new(5, 5, 5, 5)));
        assert_eq!(a.intersect(&DirtyRegion::new(10, 0, 4, 4)), None);
        assert_eq!(
            DirtyRegion::new(8, 8, 16, 16).clamp(12, 12),
            Some(DirtyRegion::new(8, 8, 4, 4))
        );
        assert!(DirtyRegion::new(0, 0, 0, 5).is_empty());
    }
}
