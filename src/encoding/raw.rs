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

//! Raw encoding (0).
//!
//! The payload is simply width x height x bytes-per-pixel, row major.
//! It is the minimum viable encoding and the universal fallback: every
//! peer must handle it.

use bytes::BytesMut;

use crate::error::SessionError;
use crate::pixel::PixelFormat;
use crate::protocol::ENCODING_RAW;

use super::RectEncoder;

/// The identity encoder.
pub struct RawEncoder;

impl RectEncoder for RawEncoder {
    fn encoding(&self) -> i32 {
        ENCODING_RAW
    }

    fn encode(&self, pixels: &[u8], _width: u16, _height: u16, _format: &PixelFormat) -> BytesMut {
        BytesMut::from(pixels)
    }
}

/// Validates and returns the rectangle's pixels.
pub fn decode(
    payload: &[u8],
    width: u16,
    height: u16,
    format: &PixelFormat,
) -> Result<Vec<u8>, SessionError> {
    let expected = usize::from(width) * usize::from(height) * format.bytes_per_pixel();
    if payload.len() != expected {
        return Err(SessionError::Decode(format!(
            "raw payload of {} bytes, expected {expected}",
            payload.len()
        )));
    }
    Ok(payload.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_is_identity() {
        let pf = PixelFormat::rgb32();
        let pixels: Vec<u8> = (0..2 * 2 * 4).map(|i| i as u8).collect();
        let encoded = RawEncoder.encode(&pixels, 2, 2, &pf);
        assert_eq!(&encoded[..], &pixels[..]);
        assert_eq!(decode(&encoded, 2, 2, &pf).unwrap(), pixels);
    }

    #[test]
    fn wrong_length_is_a_decode_error() {
        let pf = PixelFormat::rgb32();
        assert!(decode(&[0u8; 15], 2, 2, &pf).is_err());
    }
}
