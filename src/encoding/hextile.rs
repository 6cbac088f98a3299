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

//! Hextile encoding (5).
//!
//! The rectangle is tiled in 16x16 tiles, left to right, top to bottom,
//! with the last column and row possibly smaller. Each tile starts with
//! a subencoding mask byte; background and foreground pixels are
//! inherited from the previous tile unless respecified, and a raw tile
//! invalidates both. Subrectangle geometry is nibble-packed: x in the
//! high nibble and y in the low nibble of the first byte, width minus
//! one and height minus one likewise in the second.

use bytes::{BufMut, BytesMut};

use crate::error::SessionError;
use crate::pixel::PixelFormat;
use crate::protocol::ENCODING_HEXTILE;
use crate::wire::{WireError, WireReader};

use super::RectEncoder;

/// Subencoding bit: tile is raw pixels; all other bits are ignored.
pub const HEXTILE_RAW: u8 = 1;
/// Subencoding bit: a background pixel follows.
pub const HEXTILE_BACKGROUND_SPECIFIED: u8 = 2;
/// Subencoding bit: a foreground pixel follows.
pub const HEXTILE_FOREGROUND_SPECIFIED: u8 = 4;
/// Subencoding bit: a subrectangle count and subrectangles follow.
pub const HEXTILE_ANY_SUBRECTS: u8 = 8;
/// Subencoding bit: each subrectangle carries its own colour.
pub const HEXTILE_SUBRECTS_COLOURED: u8 = 16;

const TILE: usize = 16;

/// Iterator over the tile grid of a rectangle: (x, y, w, h) in
/// rectangle-local pixels.
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

/// Encoder choosing per tile between a solid background, a two-colour
/// tile with foreground runs, and a raw tile.
pub struct HextileEncoder;

impl RectEncoder for HextileEncoder {
    fn encoding(&self) -> i32 {
        ENCODING_HEXTILE
    }

    fn encode(&self, pixels: &[u8], width: u16, height: u16, format: &PixelFormat) -> BytesMut {
        let bpp = format.bytes_per_pixel();
        let w = usize::from(width);
        let mut out = BytesMut::new();

        for (tx, ty, tw, th) in tiles(width, height) {
            let pixel_at =
                |col: usize, row: usize| -> &[u8] {
                    let idx = ((ty + row) * w + tx + col) * bpp;
                    &pixels[idx..idx + bpp]
                };

            // Classify the tile by its first two distinct colours.
            let mut first: &[u8] = pixel_at(0, 0);
            let mut second: Option<&[u8]> = None;
            let mut first_count = 0usize;
            let mut more_than_two = false;
            'scan: for row in 0..th {
                for col in 0..tw {
                    let p = pixel_at(col, row);
                    if p == first {
                        first_count += 1;
                    } else if second.is_none() {
                        second = Some(p);
                    } else if Some(p) != second {
                        more_than_two = true;
                        break 'scan;
                    }
                }
            }

            if more_than_two {
                out.put_u8(HEXTILE_RAW);
                for row in 0..th {
                    let start = ((ty + row) * w + tx) * bpp;
                    out.put_slice(&pixels[start..start + tw * bpp]);
                }
                continue;
            }

            let Some(second) = second else {
                // Solid tile.
                out.put_u8(HEXTILE_BACKGROUND_SPECIFIED);
                out.put_slice(first);
                continue;
            };

            // Two colours: the more frequent one is the background.
            let (bg, fg) = if first_count * 2 >= tw * th {
                (first, second)
            } else {
                (second, first)
            };

            out.put_u8(
                HEXTILE_BACKGROUND_SPECIFIED | HEXTILE_FOREGROUND_SPECIFIED | HEXTILE_ANY_SUBRECTS,
            );
            out.put_slice(bg);
            out.put_slice(fg);

            // Horizontal runs of the foreground colour.
            let mut subrects = Vec::new();
            for row in 0..th {
                let mut col = 0;
                while col < tw {
                    if pixel_at(col, row) != fg {
                        col += 1;
                        continue;
                    }
                    let mut run = 1;
                    while col + run < tw && pixel_at(col + run, row) == fg {
                        run += 1;
                    }
                    subrects.push((col, row, run));
                    col += run;
                }
            }
            out.put_u8(subrects.len() as u8);
            for (x, y, run) in subrects {
                out.put_u8(((x as u8) << 4) | y as u8);
                out.put_u8((((run - 1) as u8) << 4) /* height - 1 == 0 */);
            }
        }
        out
    }
}

/// Payload length from the bytes received so far, or `None` while the
/// buffer is still short. Walks the tile stream without copying.
pub fn scan_payload(buf: &[u8], width: u16, height: u16, bpp: usize) -> Option<usize> {
    let mut pos = 0usize;
    for (_, _, tw, th) in tiles(width, height) {
        let subenc = *buf.get(pos)?;
        pos += 1;
        if subenc & HEXTILE_RAW != 0 {
            pos += tw * th * bpp;
        } else {
            if subenc & HEXTILE_BACKGROUND_SPECIFIED != 0 {
                pos += bpp;
            }
            if subenc & HEXTILE_FOREGROUND_SPECIFIED != 0 {
                pos += bpp;
            }
            if subenc & HEXTILE_ANY_SUBRECTS != 0 {
                let count = usize::from(*buf.get(pos)?);
                pos += 1;
                let per = if subenc & HEXTILE_SUBRECTS_COLOURED != 0 {
                    bpp + 2
                } else {
                    2
                };
                pos += count * per;
            }
        }
        if pos > buf.len() {
            return None;
        }
    }
    Some(pos)
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
    let mut out = vec![0u8; w * h * bpp];

    let mut reader = WireReader::new(payload);
    let mut background: Option<Vec<u8>> = None;
    let mut foreground: Option<Vec<u8>> = None;
    let truncated =
        |_: WireError| SessionError::Decode("truncated hextile payload".into());

    for (tx, ty, tw, th) in tiles(width, height) {
        let subenc = reader.read_u8().map_err(truncated)?;

        if subenc & HEXTILE_RAW != 0 {
            let raw = reader.take(tw * th * bpp).map_err(truncated)?;
            for row in 0..th {
                let dst = ((ty + row) * w + tx) * bpp;
                out[dst..dst + tw * bpp].copy_from_slice(&raw[row * tw * bpp..(row + 1) * tw * bpp]);
            }
            // A raw tile invalidates the carried colours.
            background = None;
            foreground = None;
            continue;
        }

        if subenc & HEXTILE_BACKGROUND_SPECIFIED != 0 {
            background = Some(reader.take(bpp).map_err(truncated)?.to_vec());
        }
        let bg = background
            .clone()
            .ok_or_else(|| SessionError::Decode("hextile tile with no background".into()))?;
        for row in 0..th {
            let dst = ((ty + row) * w + tx) * bpp;
            for col in 0..tw {
                out[dst + col * bpp..dst + (col + 1) * bpp].copy_from_slice(&bg);
            }
        }

        if subenc & HEXTILE_FOREGROUND_SPECIFIED != 0 {
            foreground = Some(reader.take(bpp).map_err(truncated)?.to_vec());
        }

        if subenc & HEXTILE_ANY_SUBRECTS != 0 {
            let count = usize::from(reader.read_u8().map_err(truncated)?);
            for _ in 0..count {
                let colour = if subenc & HEXTILE_SUBRECTS_COLOURED != 0 {
                    reader.take(bpp).map_err(truncated)?.to_vec()
                } else {
                    foreground.clone().ok_or_else(|| {
                        SessionError::Decode("hextile subrect with no foreground".into())
                    })?
                };
                let xy = reader.read_u8().map_err(truncated)?;
                let wh = reader.read_u8().map_err(truncated)?;
                let sx = usize::from(xy >> 4);
                let sy = usize::from(xy & 0x0f);
                let sw = usize::from(wh >> 4) + 1;
                let sh = usize::from(wh & 0x0f) + 1;
                if sx + sw > tw || sy + sh > th {
                    return Err(SessionError::Decode(format!(
                        "hextile subrect ({sx},{sy} {sw}x{sh}) outside {tw}x{th} tile"
                    )));
                }
                for row in sy..sy + sh {
                    let dst = ((ty + row) * w + tx) * bpp;
                    for col in sx..sx + sw {
                        out[dst + col * bpp..dst + (col + 1) * bpp].copy_from_slice(&colour);
                    }
                }
            }
        }
    }

    if reader.remaining() != 0 {
        return Err(SessionError::Decode(format!(
            "{} trailing bytes after hextile payload",
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
    fn solid_rect_encodes_one_byte_plus_pixel_per_tile() {
        // 20x20 has four tiles: 16x16, 4x16, 16x4, 4x4.
        let pixels = solid([5, 6, 7, 0], 400);
        let encoded = HextileEncoder.encode(&pixels, 20, 20, &pf());
        assert_eq!(encoded.len(), 4 * (1 + 4));
        assert_eq!(decode(&encoded, 20, 20, &pf()).unwrap(), pixels);
    }

    #[test]
    fn two_colour_round_trip() {
        let mut pixels = solid([0, 0, 0, 0], 18 * 18);
        // An L of white pixels crossing the tile boundary.
        for i in 0..18 {
            pixels[(i * 18 + 17) * 4..(i * 18 + 17) * 4 + 4].copy_from_slice(&[255, 255, 255, 0]);
            pixels[(17 * 18 + i) * 4..(17 * 18 + i) * 4 + 4].copy_from_slice(&[255, 255, 255, 0]);
        }
        let encoded = HextileEncoder.encode(&pixels, 18, 18, &pf());
        assert_eq!(decode(&encoded, 18, 18, &pf()).unwrap(), pixels);
    }

    #[test]
    fn noisy_rect_round_trips_through_raw_tiles() {
        let pixels: Vec<u8> = (0..17 * 5 * 4).map(|i| (i * 7 % 251) as u8).collect();
        let encoded = HextileEncoder.encode(&pixels, 17, 5, &pf());
        assert_eq!(decode(&encoded, 17, 5, &pf()).unwrap(), pixels);
    }

    #[test]
    fn background_is_inherited_across_tiles() {
        // Two 16x16 tiles side by side; the second specifies nothing
        // and must inherit the first tile's background.
        let mut payload = BytesMut::new();
        payload.put_u8(HEXTILE_BACKGROUND_SPECIFIED);
        payload.put_slice(&[42, 0, 0, 0]);
        payload.put_u8(0);
        let out = decode(&payload, 32, 16, &pf()).unwrap();
        assert_eq!(&out[32 * 16 * 4 - 4..], &[42, 0, 0, 0]);
    }

    #[test]
    fn coloured_subrects_paint_their_own_colour() {
        let mut payload = BytesMut::new();
        payload.put_u8(
            HEXTILE_BACKGROUND_SPECIFIED | HEXTILE_ANY_SUBRECTS | HEXTILE_SUBRECTS_COLOURED,
        );
        payload.put_slice(&[1, 1, 1, 0]);
        payload.put_u8(1);
        payload.put_slice(&[9, 9, 9, 0]);
        // 2x3 subrect at (4, 2): xy = 0x42, wh = 0x12.
        payload.put_u8(0x42);
        payload.put_u8(0x12);
        let out = decode(&payload, 8, 8, &pf()).unwrap();
        let px = |x: usize, y: usize| &out[(y * 8 + x) * 4..(y * 8 + x) * 4 + 4];
        assert_eq!(px(4, 2), &[9, 9, 9, 0]);
        assert_eq!(px(5, 4), &[9, 9, 9, 0]);
        assert_eq!(px(3, 2), &[1, 1, 1, 0]);
        assert_eq!(px(6, 2), &[1, 1, 1, 0]);
    }

    #[test]
    fn missing_background_is_a_decode_error() {
        let payload = [HEXTILE_ANY_SUBRECTS, 0];
        assert!(decode(&payload, 8, 8, &pf()).is_err());
    }

    #[test]
    fn raw_tile_invalidates_carried_colours() {
        // First tile raw, second tile tries to inherit a background.
        let mut payload = BytesMut::new();
        payload.put_u8(HEXTILE_RAW);
        payload.put_slice(&vec![7u8; 16 * 16 * 4]);
        payload.put_u8(0);
        assert!(decode(&payload, 32, 16, &pf()).is_err());
    }

    #[test]
    fn scan_agrees_with_encoder_output() {
        let mut pixels = solid([0, 0, 0, 0], 20 * 20);
        pixels[0..4].copy_from_slice(&[255, 0, 0, 0]);
        let encoded = HextileEncoder.encode(&pixels, 20, 20, &pf());
        assert_eq!(scan_payload(&encoded, 20, 20, 4), Some(encoded.len()));
        assert_eq!(scan_payload(&encoded[..encoded.len() - 1], 20, 20, 4), None);
        assert_eq!(scan_payload(&[], 20, 20, 4), None);
    }
}
