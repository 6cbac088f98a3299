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

//! Pixel format model.
//!
//! A [`PixelFormat`] is the 16-byte packed record exchanged during the
//! RFB handshake and in `SetPixelFormat`. It describes how a pixel's
//! bytes encode colour channels: bits per pixel, depth, endianness, and
//! per-channel max and shift. The helpers here pack and unpack 24-bit
//! RGB triples for the current format and translate whole pixel buffers
//! between two formats, which is what the server does before encoding a
//! rectangle for a client whose format differs from the native one.

use bytes::{BufMut, BytesMut};

use crate::wire::{WireError, WireReader, WireResult};

/// Pixel layout negotiated between the two peers.
///
/// Invariants (checked by [`PixelFormat::is_valid`]):
/// - `bits_per_pixel` is 8, 16 or 32 and `depth <= bits_per_pixel`;
/// - each channel max fits in `bits_per_pixel` bits;
/// - each shift is below `bits_per_pixel` and the shifted channel mask
///   stays within the pixel;
/// - channel bit ranges do not overlap where max > 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFormat {
    /// Bits per pixel on the wire: 8, 16 or 32.
    pub bits_per_pixel: u8,
    /// Colour depth in bits, at most `bits_per_pixel`.
    pub depth: u8,
    /// Non-zero when multi-byte pixels are big-endian on the wire.
    pub big_endian_flag: u8,
    /// Non-zero for true colour; zero means indexed colour maps.
    pub true_colour_flag: u8,
    /// Maximum red value (2^n - 1 for an n-bit channel).
    pub red_max: u16,
    /// Maximum green value.
    pub green_max: u16,
    /// Maximum blue value.
    pub blue_max: u16,
    /// Right shift to reach the red channel.
    pub red_shift: u8,
    /// Right shift to reach the green channel.
    pub green_shift: u8,
    /// Right shift to reach the blue channel.
    pub blue_shift: u8,
}

impl Default for PixelFormat {
    fn default() -> Self {
        Self::rgb32()
    }
}

impl PixelFormat {
    /// The server's native format: 32 bpp, depth 24, true colour,
    /// little-endian, R/G/B in bits 16/8/0.
    pub fn rgb32() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
        }
    }

    /// Bytes each pixel occupies on the wire.
    pub fn bytes_per_pixel(&self) -> usize {
        usize::from(self.bits_per_pixel) / 8
    }

    /// Validates the record against the invariants listed on the type.
    pub fn is_valid(&self) -> bool {
        if !matches!(self.bits_per_pixel, 8 | 16 | 32) || self.depth > self.bits_per_pixel {
            return false;
        }
        if self.true_colour_flag == 0 {
            // Indexed colour carries no channel layout to validate.
            return true;
        }
        let bpp = u32::from(self.bits_per_pixel);
        let channels = [
            (self.red_max, self.red_shift),
            (self.green_max, self.green_shift),
            (self.blue_max, self.blue_shift),
        ];
        let mut seen: u64 = 0;
        for (max, shift) in channels {
            if u32::from(shift) >= bpp {
                return false;
            }
            let mask = u64::from(max) << shift;
            if bpp < 64 && mask >> bpp != 0 {
                return false;
            }
            if max > 0 && seen & mask != 0 {
                return false;
            }
            seen |= mask;
        }
        true
    }

    /// Parses the 16-byte packed record.
    pub fn read_from(reader: &mut WireReader<'_>) -> WireResult<Self> {
        let format = Self {
            bits_per_pixel: reader.read_u8()?,
            depth: reader.read_u8()?,
            big_endian_flag: reader.read_u8()?,
            true_colour_flag: reader.read_u8()?,
            red_max: reader.read_u16()?,
            green_max: reader.read_u16()?,
            blue_max: reader.read_u16()?,
            red_shift: reader.read_u8()?,
            green_shift: reader.read_u8()?,
            blue_shift: reader.read_u8()?,
        };
        reader.skip(3)?; // padding
        Ok(format)
    }

    /// Parses from an exactly 16-byte slice.
    pub fn from_bytes(bytes: &[u8]) -> WireResult<Self> {
        if bytes.len() < 16 {
            return Err(WireError::NeedMore);
        }
        Self::read_from(&mut WireReader::new(&bytes[..16]))
    }

    /// Serializes the 16-byte packed record.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.bits_per_pixel);
        buf.put_u8(self.depth);
        buf.put_u8(self.big_endian_flag);
        buf.put_u8(self.true_colour_flag);
        buf.put_u16(self.red_max);
        buf.put_u16(self.green_max);
        buf.put_u16(self.blue_max);
        buf.put_u8(self.red_shift);
        buf.put_u8(self.green_shift);
        buf.put_u8(self.blue_shift);
        buf.put_bytes(0, 3); // padding
    }

    /// Packs an 8-bit-per-channel RGB triple into a pixel value for this
    /// format, scaling each channel down to its max.
    pub fn pack_rgb(&self, r: u8, g: u8, b: u8) -> u32 {
        let scale = |v: u8, max: u16| -> u32 {
            if max == 0 {
                0
            } else {
                u32::from(v) * u32::from(max) / 255
            }
        };
        (scale(r, self.red_max) << self.red_shift)
            | (scale(g, self.green_max) << self.green_shift)
            | (scale(b, self.blue_max) << self.blue_shift)
    }

    /// Unpacks a pixel value into an 8-bit-per-channel RGB triple,
    /// scaling each channel up from its max.
    pub fn unpack_rgb(&self, pixel: u32) -> (u8, u8, u8) {
        let extract = |shift: u8, max: u16| -> u8 {
            if max == 0 {
                return 0;
            }
            let v = (pixel >> shift) & u32::from(max);
            (v * 255 / u32::from(max)) as u8
        };
        (
            extract(self.red_shift, self.red_max),
            extract(self.green_shift, self.green_max),
            extract(self.blue_shift, self.blue_max),
        )
    }

    /// Reads one pixel from `bytes` honouring width and endianness.
    ///
    /// `bytes` must hold at least `bytes_per_pixel` bytes.
    pub fn read_pixel(&self, bytes: &[u8]) -> u32 {
        match self.bytes_per_pixel() {
            1 => u32::from(bytes[0]),
            2 => {
                if self.big_endian_flag != 0 {
                    u32::from(u16::from_be_bytes([bytes[0], bytes[1]]))
                } else {
                    u32::from(u16::from_le_bytes([bytes[0], bytes[1]]))
                }
            }
            _ => {
                if self.big_endian_flag != 0 {
                    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
                } else {
                    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
                }
            }
        }
    }

    /// Appends one pixel to `buf` honouring width and endianness.
    pub fn write_pixel(&self, buf: &mut BytesMut, pixel: u32) {
        match self.bytes_per_pixel() {
            1 => buf.put_u8(pixel as u8),
            2 => {
                if self.big_endian_flag != 0 {
                    buf.put_u16(pixel as u16);
                } else {
                    buf.put_u16_le(pixel as u16);
                }
            }
            _ => {
                if self.big_endian_flag != 0 {
                    buf.put_u32(pixel);
                } else {
                    buf.put_u32_le(pixel);
                }
            }
        }
    }
}

/// Translates a pixel buffer from one format to another.
///
/// `src` is row-major with no padding between rows. When the two formats
/// are identical the buffer is copied through untouched.
pub fn translate_pixels(src: &[u8], from: &PixelFormat, to: &PixelFormat) -> BytesMut {
    if from == to {
        return BytesMut::from(src);
    }
    let src_bpp = from.bytes_per_pixel();
    let count = src.len() / src_bpp;
    let mut out = BytesMut::with_capacity(count * to.bytes_per_pixel());
    for chunk in src.chunks_exact(src_bpp) {
        let (r, g, b) = from.unpack_rgb(from.read_pixel(chunk));
        to.write_pixel(&mut out, to.pack_rgb(r, g, b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb565() -> PixelFormat {
        PixelFormat {
            bits_per_pixel: 16,
            depth: 16,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max: 31,
            green_max: 63,
            blue_max: 31,
            red_shift: 11,
            green_shift: 5,
            blue_shift: 0,
        }
    }

    #[test]
    fn native_format_is_valid() {
        assert!(PixelFormat::rgb32().is_valid());
        assert!(rgb565().is_valid());
    }

    #[test]
    fn rejects_bad_bpp_and_depth() {
        let mut pf = PixelFormat::rgb32();
        pf.bits_per_pixel = 24;
        assert!(!pf.is_valid());

        let mut pf = PixelFormat::rgb32();
        pf.depth = 33;
        assert!(!pf.is_valid());
    }

    #[test]
    fn rejects_overlapping_channels() {
        let mut pf = PixelFormat::rgb32();
        pf.green_shift = 16; // collides with red
        assert!(!pf.is_valid());
    }

    #[test]
    fn rejects_shift_out_of_range() {
        let mut pf = rgb565();
        pf.red_shift = 16;
        assert!(!pf.is_valid());
    }

    #[test]
    fn packed_record_round_trips() {
        let pf = rgb565();
        let mut buf = BytesMut::new();
        pf.write_to(&mut buf);
        assert_eq!(buf.len(), 16);
        let parsed = PixelFormat::from_bytes(&buf).unwrap();
        assert_eq!(parsed, pf);
    }

    #[test]
    fn pack_unpack_are_inverses_at_full_depth() {
        let pf = PixelFormat::rgb32();
        for &(r, g, b) in &[(0, 0, 0), (255, 0, 0), (0, 255, 0), (0, 0, 255), (255, 255, 255), (17, 93, 201)] {
            let pixel = pf.pack_rgb(r, g, b);
            assert_eq!(pf.unpack_rgb(pixel), (r, g, b));
        }
    }

    #[test]
    fn rgb565_saturates_white() {
        let pf = rgb565();
        let pixel = pf.pack_rgb(255, 255, 255);
        assert_eq!(pixel, 0xffff);
        assert_eq!(pf.unpack_rgb(pixel), (255, 255, 255));
    }

    #[test]
    fn translate_32_to_565_and_back_preserves_primaries() {
        let from = PixelFormat::rgb32();
        let to = rgb565();
        let mut src = BytesMut::new();
        for &(r, g, b) in &[(255u8, 0u8, 0u8), (0, 255, 0), (0, 0, 255)] {
            from.write_pixel(&mut src, from.pack_rgb(r, g, b));
        }
        let narrow = translate_pixels(&src, &from, &to);
        assert_eq!(narrow.len(), 6);
        let wide = translate_pixels(&narrow, &to, &from);
        assert_eq!(&wide[..], &src[..]);
    }

    #[test]
    fn big_endian_pixels_swap_bytes() {
        let mut pf = PixelFormat::rgb32();
        pf.big_endian_flag = 1;
        let mut buf = BytesMut::new();
        pf.write_pixel(&mut buf, 0x00aa_bb_cc);
        assert_eq!(&buf[..], &[0x00, 0xaa, 0xbb, 0xcc]);
        assert_eq!(pf.read_pixel(&buf), 0x00aa_bbcc);
    }
}
