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

//! Rectangle encodings.
//!
//! Each encoding serializes the pixels of one update rectangle. The
//! stateless encodings (Raw, RRE, Hextile) are exposed through the
//! [`get_encoder`] registry; ZRLE is stateful because one zlib stream
//! spans the whole connection, so it lives in its own
//! [`zrle::ZrleEncoder`] / [`zrle::ZrleDecoder`] pair that the session
//! owns. CopyRect and the pseudo-encodings carry no pixel data and are
//! framed here directly.
//!
//! Every encoding also has a payload *scanner* used by the client-role
//! engine: given the rectangle header and the bytes received so far, it
//! reports how long the payload is, or that more bytes are needed.
//! Scanning keeps parsing non-destructive so a partially received
//! update never corrupts framing.

pub mod hextile;
pub mod raw;
pub mod rre;
pub mod zrle;

use bytes::BytesMut;

use crate::error::SessionError;
use crate::pixel::PixelFormat;
use crate::protocol::{
    ENCODING_COPYRECT, ENCODING_CURSOR, ENCODING_DESKTOP_SIZE, ENCODING_HEXTILE, ENCODING_RAW,
    ENCODING_RRE, ENCODING_ZRLE,
};

/// A stateless rectangle encoder.
pub trait RectEncoder: Send + Sync {
    /// The RFB encoding number this encoder produces.
    fn encoding(&self) -> i32;

    /// Encodes a row-major pixel block already translated to the
    /// client's pixel format.
    fn encode(&self, pixels: &[u8], width: u16, height: u16, format: &PixelFormat) -> BytesMut;
}

/// Looks up the stateless encoder for an encoding number.
///
/// ZRLE is deliberately absent: its zlib stream is per-connection state
/// and must be owned by the session, not shared from a registry.
pub fn get_encoder(encoding: i32) -> Option<&'static dyn RectEncoder> {
    match encoding {
        ENCODING_RAW => Some(&raw::RawEncoder),
        ENCODING_RRE => Some(&rre::RreEncoder),
        ENCODING_HEXTILE => Some(&hextile::HextileEncoder),
        _ => None,
    }
}

/// Whether this implementation can serve or consume the encoding.
pub fn is_supported(encoding: i32) -> bool {
    matches!(
        encoding,
        ENCODING_RAW
            | ENCODING_COPYRECT
            | ENCODING_RRE
            | ENCODING_HEXTILE
            | ENCODING_ZRLE
            | ENCODING_CURSOR
            | ENCODING_DESKTOP_SIZE
    )
}

/// Payload length of a Cursor pseudo-rectangle: the cursor pixels
/// followed by a one-bit-per-pixel mask with byte-aligned rows.
pub fn cursor_payload_len(width: u16, height: u16, format: &PixelFormat) -> usize {
    let w = usize::from(width);
    let h = usize::from(height);
    w * h * format.bytes_per_pixel() + w.div_ceil(8) * h
}

/// Determines the payload length of a rectangle, given the bytes
/// received so far.
///
/// Returns `Ok(None)` when the buffer does not yet hold enough bytes to
/// know the length. Unknown encodings are a decode error here: without
/// knowing the payload length the stream cannot be re-framed.
pub fn payload_length(
    encoding: i32,
    width: u16,
    height: u16,
    format: &PixelFormat,
    buf: &[u8],
) -> Result<Option<usize>, SessionError> {
    let bpp = format.bytes_per_pixel();
    match encoding {
        ENCODING_RAW => Ok(Some(usize::from(width) * usize::from(height) * bpp)),
        ENCODING_COPYRECT => Ok(Some(4)),
        ENCODING_RRE => Ok(rre::scan_payload(buf, bpp)),
        ENCODING_HEXTILE => Ok(hextile::scan_payload(buf, width, height, bpp)),
        ENCODING_ZRLE => {
            if buf.len() < 4 {
                return Ok(None);
            }
            let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            Ok(Some(4 + len))
        }
        ENCODING_CURSOR => Ok(Some(cursor_payload_len(width, height, format))),
        ENCODING_DESKTOP_SIZE => Ok(Some(0)),
        other => Err(SessionError::Decode(format!(
            "cannot frame rectangle with unknown encoding {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_covers_the_stateless_encodings() {
        assert_eq!(get_encoder(ENCODING_RAW).unwrap().encoding(), ENCODING_RAW);
        assert_eq!(get_encoder(ENCODING_RRE).unwrap().encoding(), ENCODING_RRE);
        assert_eq!(
            get_encoder(ENCODING_HEXTILE).unwrap().encoding(),
            ENCODING_HEXTILE
        );
        assert!(get_encoder(ENCODING_ZRLE).is_none());
        assert!(get_encoder(999).is_none());
    }

    #[test]
    fn supported_set_matches_the_implementation() {
        for enc in [0, 1, 2, 5, 16, -239, -223] {
            assert!(is_supported(enc), "encoding {enc}");
        }
        assert!(!is_supported(7));
        assert!(!is_supported(999));
    }

    #[test]
    fn fixed_length_payloads() {
        let pf = PixelFormat::rgb32();
        assert_eq!(
            payload_length(ENCODING_RAW, 2, 2, &pf, &[]).unwrap(),
            Some(16)
        );
        assert_eq!(
            payload_length(ENCODING_COPYRECT, 100, 100, &pf, &[]).unwrap(),
            Some(4)
        );
        assert_eq!(
            payload_length(ENCODING_DESKTOP_SIZE, 800, 600, &pf, &[]).unwrap(),
            Some(0)
        );
        // 10x3 cursor: 120 pixel bytes + 2 mask bytes per row.
        assert_eq!(
            payload_length(ENCODING_CURSOR, 10, 3, &pf, &[]).unwrap(),
            Some(126)
        );
    }

    #[test]
    fn zrle_length_is_prefixed() {
        let pf = PixelFormat::rgb32();
        assert_eq!(payload_length(ENCODING_ZRLE, 8, 8, &pf, &[0, 0]).unwrap(), None);
        assert_eq!(
            payload_length(ENCODING_ZRLE, 8, 8, &pf, &[0, 0, 0, 9]).unwrap(),
            Some(13)
        );
    }

    #[test]
    fn unknown_encoding_cannot_be_framed() {
        let pf = PixelFormat::rgb32();
        assert!(payload_length(999, 8, 8, &pf, &[]).is_err());
    }
}
