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

//! RRE encoding (2).
//!
//! Rise-and-run-length encoding per RFC 6143 section 7.7.3: a 4-byte
//! subrectangle count, one background pixel, then for each subrectangle
//! a pixel followed by x, y, w, h as 16-bit values. The decoder paints
//! the background first and overlays the subrectangles in order.

use bytes::{BufMut, BytesMut};
use std::collections::HashMap;

use crate::error::SessionError;
use crate::pixel::PixelFormat;
use crate::protocol::ENCODING_RRE;
use crate::wire::WireReader;

use super::RectEncoder;

/// Encoder producing a background fill plus horizontal runs.
///
/// The background is the most frequent pixel value; every maximal
/// horizontal run of any other value becomes one subrectangle. Not the
/// tightest possible RRE, but exact and cheap.
pub struct RreEncoder;

impl RectEncoder for RreEncoder {
    fn encoding(&self) -> i32 {
        ENCODING_RRE
    }

    fn encode(&self, pixels: &[u8], width: u16, height: u16, format: &PixelFormat) -> BytesMut {
        let bpp = format.bytes_per_pixel();
        let w = usize::from(width);

        let background = most_frequent_pixel(pixels, bpp);

        // Collect (x, y, run, pixel) for every non-background run.
        let mut subrects = Vec::new();
        for y in 0..usize::from(height) {
            let mut x = 0;
            while x < w {
                let at = |col: usize| &pixels[(y * w + col) * bpp..(y * w + col + 1) * bpp];
                if at(x) == background {
                    x += 1;
                    continue;
                }
                let run_pixel = at(x);
                let mut run = 1;
                while x + run < w && at(x + run) == run_pixel {
                    run += 1;
                }
                subrects.push((x as u16, y as u16, run as u16, run_pixel));
                x += run;
            }
        }

        let mut out = BytesMut::with_capacity(4 + bpp + subrects.len() * (bpp + 8));
        out.put_u32(subrects.len() as u32);
        out.put_slice(background);
        for (x, y, run, pixel) in subrects {
            out.put_slice(pixel);
            out.put_u16(x);
            out.put_u16(y);
            out.put_u16(run);
            out.put_u16(1);
        }
        out
    }
}

fn most_frequent_pixel(pixels: &[u8], bpp: usize) -> &[u8] {
    let mut counts: HashMap<&[u8], usize> = HashMap::new();
    for chunk in pixels.chunks_exact(bpp) {
        *counts.entry(chunk).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by_key(|&(_, n)| n)
        .map(|(p, _)| p)
        .unwrap_or(&pixels[..bpp])
}

/// Payload length from the bytes received so far, or `None` when the
/// 4-byte count has not arrived yet.
pub fn scan_payload(buf: &[u8], bpp: usize) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    let count = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    Some(4 + bpp + count * (bpp + 8))
}

/// Decodes the payload into a row-major pixel block.
pub fn decode(
    payload: &[u8],
    width: u16,
    height: u16,
    format: &PixelFormat,
) -> Result<Vec<u8>, SessionError> {
    let bpp = format.bytes_per_pixel();
    let w = usize::from(width);
    let h = usize::from(height);

    let mut reader = WireReader::new(payload);
    let count = reader.read_u32().map_err(SessionError::from)? as usize;
    let background = reader.take(bpp).map_err(SessionError::from)?;

    let mut out = vec![0u8; w * h * bpp];
    for chunk in out.chunks_exact_mut(bpp) {
        chunk.copy_from_slice(background);
    }

    for _ in 0..count {
        let pixel = reader.take(bpp).map_err(SessionError::from)?.to_vec();
        let sx = usize::from(reader.read_u16().map_err(SessionError::from)?);
        let sy = usize::from(reader.read_u16().map_err(SessionError::from)?);
        let sw = usize::from(reader.read_u16().map_err(SessionError::from)?);
        let sh = usize::from(reader.read_u16().map_err(SessionError::from)?);
        if sx + sw > w || sy + sh > h {
            return Err(SessionError::Decode(format!(
                "RRE subrectangle ({sx},{sy} {sw}x{sh}) outside {w}x{h} rectangle"
            )));
        }
        for row in sy..sy + sh {
            for col in sx..sx + sw {
                out[(row * w + col) * bpp..(row * w + col + 1) * bpp].copy_from_slice(&pixel);
            }
        }
    }

    if reader.remaining() != 0 {
        return Err(SessionError::Decode(format!(
            "{} trailing bytes after RRE payload",
            reader.remaining()
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pf() -> PixelFormat {
        PixelFormat::rgb32()
    }

    fn solid(pixel: [u8; 4], count: usize) -> Vec<u8> {
        pixel.iter().copied().cycle().take(count * 4).collect()
    }

    #[test]
    fn uniform_rect_has_no_subrects() {
        let pixels = solid([9, 9, 9, 0], 16);
        let encoded = RreEncoder.encode(&pixels, 4, 4, &pf());
        assert_eq!(&encoded[..4], &[0, 0, 0, 0]);
        assert_eq!(encoded.len(), 8);
        assert_eq!(decode(&encoded, 4, 4, &pf()).unwrap(), pixels);
    }

    #[test]
    fn encode_decode_round_trip() {
        // A background with a contrasting 2x1 run and a lone pixel.
        let mut pixels = solid([1, 1, 1, 0], 16);
        pixels[4 * 5..4 * 7].copy_from_slice(&[2, 2, 2, 0, 2, 2, 2, 0]);
        pixels[4 * 12..4 * 13].copy_from_slice(&[3, 3, 3, 0]);
        let encoded = RreEncoder.encode(&pixels, 4, 4, &pf());
        assert_eq!(decode(&encoded, 4, 4, &pf()).unwrap(), pixels);
    }

    #[test]
    fn subrects_paint_over_background_in_order() {
        // Hand-built payload: bg black, then two overlapping subrects;
        // the later one must win on the overlap.
        let mut payload = BytesMut::new();
        payload.put_u32(2);
        payload.put_slice(&[0, 0, 0, 0]); // background
        payload.put_slice(&[10, 0, 0, 0]); // subrect 1 pixel
        payload.put_u16(0);
        payload.put_u16(0);
        payload.put_u16(2);
        payload.put_u16(1);
        payload.put_slice(&[20, 0, 0, 0]); // subrect 2 pixel
        payload.put_u16(1);
        payload.put_u16(0);
        payload.put_u16(1);
        payload.put_u16(1);

        let out = decode(&payload, 2, 1, &pf()).unwrap();
        assert_eq!(&out[..4], &[10, 0, 0, 0]);
        assert_eq!(&out[4..], &[20, 0, 0, 0]);
    }

    #[test]
    fn out_of_bounds_subrect_is_rejected() {
        let mut payload = BytesMut::new();
        payload.put_u32(1);
        payload.put_slice(&[0, 0, 0, 0]);
        payload.put_slice(&[1, 1, 1, 0]);
        payload.put_u16(3);
        payload.put_u16(0);
        payload.put_u16(2); // 3 + 2 > 4
        payload.put_u16(1);
        assert!(decode(&payload, 4, 1, &pf()).is_err());
    }

    #[test]
    fn scan_needs_the_count_first() {
        assert_eq!(scan_payload(&[0, 0], 4), None);
        // count 2: 4 + 4 + 2 * 12 bytes
        assert_eq!(scan_payload(&[0, 0, 0, 2], 4), Some(32));
    }
}
