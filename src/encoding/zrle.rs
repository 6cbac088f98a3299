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

//! ZRLE encoding (16).
//!
//! The payload is a 4-byte length followed by that many bytes of
//! zlib-compressed data. A single zlib stream spans the entire
//! connection, so both the compressor and the decompressor are
//! per-session state that must never be reset until the session ends.
//!
//! Once inflated, the rectangle is tiled in 64x64 tiles of CPIXELs.
//! Each tile starts with a subencoding byte: 0 raw, 1 solid, 2 to 16 a
//! packed palette of that size, 128 plain RLE, 130 to 255 palette RLE.
//! A CPIXEL is the pixel narrowed to 3 bytes when a 32-bpp true-colour
//! format keeps all channel bits in three consecutive bytes.

use bytes::{BufMut, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::SessionError;
use crate::pixel::PixelFormat;
use crate::wire::{WireError, WireReader};

const TILE: usize = 64;

const SUBENC_RAW: u8 = 0;
const SUBENC_SOLID: u8 = 1;
const SUBENC_PLAIN_RLE: u8 = 128;

/// Width in bytes of a compressed pixel for this format.
pub fn cpixel_len(format: &PixelFormat) -> usize {
    if format.bits_per_pixel == 32 && format.depth <= 24 && format.true_colour_flag != 0 {
        let mask = (u32::from(format.red_max) << format.red_shift)
            | (u32::from(format.green_max) << format.green_shift)
            | (u32::from(format.blue_max) << format.blue_shift);
        if mask & 0xff00_0000 == 0 || mask & 0x0000_00ff == 0 {
            return 3;
        }
    }
    format.bytes_per_pixel()
}

fn write_cpixel(out: &mut Vec<u8>, format: &PixelFormat, pixel: u32) {
    let mut full = BytesMut::with_capacity(4);
    format.write_pixel(&mut full, pixel);
    if cpixel_len(format) == full.len() {
        out.extend_from_slice(&full);
        return;
    }
    // Narrow to the 3 bytes that hold the channel bits. Whether those
    // are the most or least significant bytes of the value depends on
    // the format, and their position in the serialization depends on
    // the endianness.
    let mask = (u32::from(format.red_max) << format.red_shift)
        | (u32::from(format.green_max) << format.green_shift)
        | (u32::from(format.blue_max) << format.blue_shift);
    let fits_low = mask & 0xff00_0000 == 0;
    let big_endian = format.big_endian_flag != 0;
    let range = match (fits_low, big_endian) {
        (true, false) => 0..3,
        (true, true) => 1..4,
        (false, false) => 1..4,
        (false, true) => 0..3,
    };
    out.extend_from_slice(&full[range]);
}

fn read_cpixel(bytes: &[u8], format: &PixelFormat) -> u32 {
    if cpixel_len(format) == format.bytes_per_pixel() {
        return format.read_pixel(bytes);
    }
    let mask = (u32::from(format.red_max) << format.red_shift)
        | (u32::from(format.green_max) << format.green_shift)
        | (u32::from(format.blue_max) << format.blue_shift);
    let fits_low = mask & 0xff00_0000 == 0;
    let big_endian = format.big_endian_flag != 0;
    let mut full = [0u8; 4];
    match (fits_low, big_endian) {
        (true, false) | (false, true) => full[..3].copy_from_slice(bytes),
        (true, true) | (false, false) => full[1..].copy_from_slice(bytes),
    }
    format.read_pixel(&full)
}

fn bits_per_index(palette_len: usize) -> usize {
    match palette_len {
        0..=2 => 1,
        3..=4 => 2,
        _ => 4,
    }
}

/// Iterator over the 64x64 tile grid: (x, y, w, h) in rectangle-local
/// pixels.
fn tiles(width: u16, height: u16) -> impl Iterator<Item = (usize, usize, usize, usize)> {
    let w = usize::from(width);
    let h = usize::from(height);
    (0..h).step_by(TILE).flat_map(move |ty| {
        let th = TILE.min(h - ty);
        (0..w)
            .step_by(TILE)
            .map(move |tx| (tx, ty, TILE.min(w - tx), th))
    })
}

/// Server-side ZRLE encoder with its connection-lifetime zlib stream.
pub struct ZrleEncoder {
    compress: Compress,
}

impl Default for ZrleEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ZrleEncoder {
    /// Creates the encoder. The zlib stream lives until the session
    /// ends; recreating it mid-session corrupts the client's inflater.
    pub fn new() -> Self {
        Self {
            compress: Compress::new(Compression::new(6), true),
        }
    }

    /// Encodes a rectangle already translated to the client's pixel
    /// format. The output carries the 4-byte length prefix.
    pub fn encode(
        &mut self,
        pixels: &[u8],
        width: u16,
        height: u16,
        format: &PixelFormat,
    ) -> Result<BytesMut, SessionError> {
        let tile_stream = build_tile_stream(pixels, width, height, format);

        let mut compressed = Vec::with_capacity(tile_stream.len() / 2 + 64);
        let mut input: &[u8] = &tile_stream;
        loop {
            compressed.reserve(4096);
            let before_in = self.compress.total_in();
            let status = self
                .compress
                .compress_vec(input, &mut compressed, FlushCompress::Sync)
                .map_err(|e| SessionError::Decode(format!("zlib compression failed: {e}")))?;
            let consumed = (self.compress.total_in() - before_in) as usize;
            input = &input[consumed..];
            // The sync flush is complete once all input is consumed and
            // deflate stopped short of the output capacity.
            if input.is_empty()
                && compressed.len() < compressed.capacity()
                && !matches!(status, Status::StreamEnd)
            {
                break;
            }
        }

        let mut out = BytesMut::with_capacity(4 + compressed.len());
        out.put_u32(compressed.len() as u32);
        out.put_slice(&compressed);
        Ok(out)
    }
}

/// Builds the uncompressed tile stream for a rectangle.
fn build_tile_stream(pixels: &[u8], width: u16, height: u16, format: &PixelFormat) -> Vec<u8> {
    let bpp = format.bytes_per_pixel();
    let w = usize::from(width);
    let mut out = Vec::new();

    for (tx, ty, tw, th) in tiles(width, height) {
        // Gather the tile's pixel values.
        let mut values = Vec::with_capacity(tw * th);
        for row in 0..th {
            for col in 0..tw {
                let idx = ((ty + row) * w + tx + col) * bpp;
                values.push(format.read_pixel(&pixels[idx..idx + bpp]));
            }
        }

        // Palette of distinct values in order of first appearance.
        let mut palette: Vec<u32> = Vec::new();
        for &v in &values {
            if !palette.contains(&v) {
                palette.push(v);
            }
            if palette.len() > 16 {
                break;
            }
        }

        if palette.len() == 1 {
            out.push(SUBENC_SOLID);
            write_cpixel(&mut out, format, palette[0]);
        } else if palette.len() <= 16 {
            out.push(palette.len() as u8);
            for &entry in &palette {
                write_cpixel(&mut out, format, entry);
            }
            let bits = bits_per_index(palette.len());
            for row in 0..th {
                let mut byte = 0u8;
                let mut filled = 0;
                for col in 0..tw {
                    let index = palette
                        .iter()
                        .position(|&p| p == values[row * tw + col])
                        .unwrap_or(0) as u8;
                    byte = (byte << bits) | index;
                    filled += bits;
                    if filled == 8 {
                        out.push(byte);
                        byte = 0;
                        filled = 0;
                    }
                }
                // Rows are padded to a byte boundary.
                if filled > 0 {
                    out.push(byte << (8 - filled));
                }
            }
        } else {
            out.push(SUBENC_RAW);
            for &v in &values {
                write_cpixel(&mut out, format, v);
            }
        }
    }
    out
}

/// Client-side ZRLE decoder with its connection-lifetime inflater.
pub struct ZrleDecoder {
    decompress: Decompress,
}

impl Default for ZrleDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ZrleDecoder {
    /// Creates the decoder. The inflation context persists across
    /// updates for the whole session.
    pub fn new() -> Self {
        Self {
            decompress: Decompress::new(true),
        }
    }

    /// Decodes a full ZRLE payload (length prefix included) into a
    /// row-major pixel block.
    pub fn decode(
        &mut self,
        payload: &[u8],
        width: u16,
        height: u16,
        format: &PixelFormat,
    ) -> Result<Vec<u8>, SessionError> {
        if payload.len() < 4 {
            return Err(SessionError::Decode("truncated ZRLE payload".into()));
        }
        let declared = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
        let compressed = &payload[4..];
        if compressed.len() != declared {
            return Err(SessionError::Decode(format!(
                "ZRLE payload of {} bytes, declared {declared}",
                compressed.len()
            )));
        }

        let mut stream = Vec::new();
        let mut input = compressed;
        while !input.is_empty() {
            stream.reserve(16 * 1024);
            let before_in = self.decompress.total_in();
            let status = self
                .decompress
                .decompress_vec(input, &mut stream, FlushDecompress::Sync)
                .map_err(|e| SessionError::Decode(format!("zlib inflation failed: {e}")))?;
            let consumed = (self.decompress.total_in() - before_in) as usize;
            input = &input[consumed..];
            if consumed == 0 && matches!(status, Status::BufError) && stream.len() == stream.capacity()
            {
                continue; // output buffer was full, grow and retry
            }
            if consumed == 0 && !input.is_empty() {
                return Err(SessionError::Decode("zlib stream stalled".into()));
            }
        }
        // Drain anything the inflater buffered past the last input byte.
        loop {
            stream.reserve(1024);
            let before_out = self.decompress.total_out();
            self.decompress
                .decompress_vec(&[], &mut stream, FlushDecompress::Sync)
                .map_err(|e| SessionError::Decode(format!("zlib inflation failed: {e}")))?;
            if self.decompress.total_out() == before_out {
                break;
            }
        }

        parse_tile_stream(&stream, width, height, format)
    }
}

/// Parses an inflated tile stream into a row-major pixel block.
fn parse_tile_stream(
    stream: &[u8],
    width: u16,
    height: u16,
    format: &PixelFormat,
) -> Result<Vec<u8>, SessionError> {
    let bpp = format.bytes_per_pixel();
    let cpx = cpixel_len(format);
    let w = usize::from(width);
    let h = usize::from(height);
    let mut out = vec![0u8; w * h * bpp];
    let mut reader = WireReader::new(stream);

    for (tx, ty, tw, th) in tiles(width, height) {
        let subenc = reader.read_u8().map_err(truncated)?;
        let mut tile = vec![0u32; tw * th];

        match subenc {
            SUBENC_RAW => {
                for value in tile.iter_mut() {
                    *value = read_cpixel(reader.take(cpx).map_err(truncated)?, format);
                }
            }
            SUBENC_SOLID => {
                let value = read_cpixel(reader.take(cpx).map_err(truncated)?, format);
                tile.fill(value);
            }
            2..=16 => {
                let palette = read_palette(&mut reader, usize::from(subenc), cpx, format)?;
                let bits = bits_per_index(palette.len());
                for row in 0..th {
                    let row_bytes = (tw * bits).div_ceil(8);
                    let packed = reader.take(row_bytes).map_err(truncated)?;
                    for col in 0..tw {
                        let bit_offset = col * bits;
                        let byte = packed[bit_offset / 8];
                        let shift = 8 - bits - (bit_offset % 8);
                        let index = usize::from((byte >> shift) & ((1 << bits) - 1) as u8);
                        tile[row * tw + col] = *palette.get(index).ok_or_else(|| {
                            SessionError::Decode(format!("ZRLE palette index {index} out of range"))
                        })?;
                    }
                }
            }
            SUBENC_PLAIN_RLE => {
                let mut filled = 0usize;
                while filled < tw * th {
                    let value = read_cpixel(reader.take(cpx).map_err(truncated)?, format);
                    let run = read_run_length(&mut reader)?;
                    if filled + run > tw * th {
                        return Err(SessionError::Decode("ZRLE run overflows tile".into()));
                    }
                    tile[filled..filled + run].fill(value);
                    filled += run;
                }
            }
            130..=255 => {
                let palette = read_palette(&mut reader, usize::from(subenc - 128), cpx, format)?;
                let mut filled = 0usize;
                while filled < tw * th {
                    let control = reader.read_u8().map_err(truncated)?;
                    let index = usize::from(control & 0x7f);
                    let value = *palette.get(index).ok_or_else(|| {
                        SessionError::Decode(format!("ZRLE palette index {index} out of range"))
                    })?;
                    let run = if control & 0x80 != 0 {
                        read_run_length(&mut reader)?
                    } else {
                        1
                    };
                    if filled + run > tw * th {
                        return Err(SessionError::Decode("ZRLE run overflows tile".into()));
                    }
                    tile[filled..filled + run].fill(value);
                    filled += run;
                }
            }
            other => {
                return Err(SessionError::Decode(format!(
                    "ZRLE subencoding {other} is not defined"
                )));
            }
        }

        // Blit the tile into the rectangle.
        let mut scratch = BytesMut::with_capacity(bpp);
        for row in 0..th {
            for col in 0..tw {
                scratch.clear();
                format.write_pixel(&mut scratch, tile[row * tw + col]);
                let dst = ((ty + row) * w + tx + col) * bpp;
                out[dst..dst + bpp].copy_from_slice(&scratch);
            }
        }
    }

    if reader.remaining() != 0 {
        return Err(SessionError::Decode(format!(
            "{} trailing bytes after ZRLE tile stream",
            reader.remaining()
        )));
    }
    Ok(out)
}

fn truncated(_: WireError) -> SessionError {
    SessionError::Decode("truncated ZRLE tile stream".into())
}

fn read_palette(
    reader: &mut WireReader<'_>,
    len: usize,
    cpx: usize,
    format: &PixelFormat,
) -> Result<Vec<u32>, SessionError> {
    let mut palette = Vec::with_capacity(len);
    for _ in 0..len {
        palette.push(read_cpixel(reader.take(cpx).map_err(truncated)?, format));
    }
    Ok(palette)
}

/// Reads a run length: one plus the sum of bytes, where every 255 byte
/// continues the sum.
fn read_run_length(reader: &mut WireReader<'_>) -> Result<usize, SessionError> {
    let mut run = 1usize;
    loop {
        let byte = reader.read_u8().map_err(truncated)?;
        run += usize::from(byte);
        if byte != 255 {
            return Ok(run);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pf() -> PixelFormat {
        PixelFormat::rgb32()
    }

    #[test]
    fn rgb32_narrows_to_three_byte_cpixels() {
        assert_eq!(cpixel_len(&pf()), 3);
        let mut pf16 = pf();
        pf16.bits_per_pixel = 16;
        pf16.depth = 16;
        pf16.red_max = 31;
        pf16.green_max = 63;
        pf16.blue_max = 31;
        pf16.red_shift = 11;
        pf16.green_shift = 5;
        pf16.blue_shift = 0;
        assert_eq!(cpixel_len(&pf16), 2);
    }

    #[test]
    fn cpixel_round_trip() {
        let format = pf();
        for pixel in [0u32, 0x00ff_0000, 0x0000_ff00, 0x0000_00ff, 0x0012_3456] {
            let mut buf = Vec::new();
            write_cpixel(&mut buf, &format, pixel);
            assert_eq!(buf.len(), 3);
            assert_eq!(read_cpixel(&buf, &format), pixel);
        }
    }

    #[test]
    fn solid_rect_round_trips() {
        let format = pf();
        let pixels: Vec<u8> = [40u8, 30, 20, 0].iter().copied().cycle().take(8 * 8 * 4).collect();
        let mut enc = ZrleEncoder::new();
        let mut dec = ZrleDecoder::new();
        let payload = enc.encode(&pixels, 8, 8, &format).unwrap();
        assert_eq!(dec.decode(&payload, 8, 8, &format).unwrap(), pixels);
    }

    #[test]
    fn stream_state_survives_across_updates() {
        // Encoding and decoding must share one zlib stream across many
        // rectangles; a decoder reset between updates would fail here.
        let format = pf();
        let mut enc = ZrleEncoder::new();
        let mut dec = ZrleDecoder::new();
        for round in 0u8..5 {
            // Keep the padding byte zero; CPIXELs only carry the three
            // colour bytes.
            let pixels: Vec<u8> = (0..70 * 70 * 4)
                .map(|i| {
                    if i % 4 == 3 {
                        0
                    } else {
                        (i as u8).wrapping_mul(round.wrapping_add(3))
                    }
                })
                .collect();
            let payload = enc.encode(&pixels, 70, 70, &format).unwrap();
            assert_eq!(dec.decode(&payload, 70, 70, &format).unwrap(), pixels);
        }
    }

    #[test]
    fn fresh_decoder_cannot_join_mid_stream() {
        let format = pf();
        let mut enc = ZrleEncoder::new();
        let mut dec = ZrleDecoder::new();
        let pixels = vec![0u8; 8 * 8 * 4];
        let first = enc.encode(&pixels, 8, 8, &format).unwrap();
        dec.decode(&first, 8, 8, &format).unwrap();
        let second = enc.encode(&pixels, 8, 8, &format).unwrap();
        // A brand-new decoder has no dictionary or stream header state.
        let mut stale = ZrleDecoder::new();
        assert!(stale.decode(&second, 8, 8, &format).is_err());
    }

    #[test]
    fn palette_tile_round_trips() {
        let format = pf();
        // Three colours in a 65x3 rect so the second tile column is
        // exercised too.
        let mut pixels = Vec::new();
        for i in 0..65 * 3 {
            let colour: [u8; 4] = match i % 3 {
                0 => [255, 0, 0, 0],
                1 => [0, 255, 0, 0],
                _ => [0, 0, 255, 0],
            };
            pixels.extend_from_slice(&colour);
        }
        let mut enc = ZrleEncoder::new();
        let mut dec = ZrleDecoder::new();
        let payload = enc.encode(&pixels, 65, 3, &format).unwrap();
        assert_eq!(dec.decode(&payload, 65, 3, &format).unwrap(), pixels);
    }

    #[test]
    fn noisy_rect_round_trips_through_raw_tiles() {
        let format = pf();
        let pixels: Vec<u8> = (0..32 * 32 * 4)
            .map(|i| if i % 4 == 3 { 0 } else { (i * 31 % 253) as u8 })
            .collect();
        let mut enc = ZrleEncoder::new();
        let mut dec = ZrleDecoder::new();
        let payload = enc.encode(&pixels, 32, 32, &format).unwrap();
        assert_eq!(dec.decode(&payload, 32, 32, &format).unwrap(), pixels);
    }

    #[test]
    fn plain_and_palette_rle_decode() {
        // Hand-built tile streams compressed with a fresh deflater.
        let format = pf();
        let mut stream = Vec::new();
        // Plain RLE: 4x1 tile, one run of 4 of colour 0x123456.
        stream.push(SUBENC_PLAIN_RLE);
        write_cpixel(&mut stream, &format, 0x0012_3456);
        stream.push(3); // run = 1 + 3
        let payload = deflate_once(&stream);
        let mut dec = ZrleDecoder::new();
        let out = dec.decode(&payload, 4, 1, &format).unwrap();
        assert_eq!(out.len(), 16);
        assert_eq!(&out[..4], &[0x56, 0x34, 0x12, 0x00]);

        // Palette RLE: palette of 2, run of 3 of entry 1 then a single
        // pixel of entry 0.
        let mut stream = Vec::new();
        stream.push(130);
        write_cpixel(&mut stream, &format, 0x0000_00aa);
        write_cpixel(&mut stream, &format, 0x0000_bb00);
        stream.push(0x80 | 1);
        stream.push(2); // run = 1 + 2
        stream.push(0); // single pixel, entry 0
        let payload = deflate_once(&stream);
        let mut dec = ZrleDecoder::new();
        let out = dec.decode(&payload, 4, 1, &format).unwrap();
        assert_eq!(&out[0..4], &[0x00, 0xbb, 0x00, 0x00]);
        assert_eq!(&out[8..12], &[0x00, 0xbb, 0x00, 0x00]);
        assert_eq!(&out[12..16], &[0xaa, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn declared_length_must_match() {
        let format = pf();
        let mut dec = ZrleDecoder::new();
        assert!(dec.decode(&[0, 0, 0, 9, 1, 2], 4, 4, &format).is_err());
    }

    /// Compresses a tile stream with a fresh stream, the way a server
    /// would for the first update of a connection.
    fn deflate_once(stream: &[u8]) -> BytesMut {
        let mut comp = Compress::new(Compression::new(6), true);
        let mut compressed = Vec::with_capacity(stream.len() + 64);
        let mut input = stream;
        loop {
            compressed.reserve(4096);
            let before = comp.total_in();
            let status = comp
                .compress_vec(input, &mut compressed, FlushCompress::Sync)
                .unwrap();
            input = &input[(comp.total_in() - before) as usize..];
            if input.is_empty()
                && compressed.len() < compressed.capacity()
                && !matches!(status, Status::StreamEnd)
            {
                break;
            }
        }
        let mut out = BytesMut::new();
        out.put_u32(compressed.len() as u32);
        out.put_slice(&compressed);
        out
    }
}
