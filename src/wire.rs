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

//! Wire codec primitives.
//!
//! All RFB multi-byte integers are network byte order. Parsing is
//! non-destructive: a [`WireReader`] walks a borrowed buffer without
//! consuming it, and the caller commits the consumed length only once a
//! complete message has decoded. A short buffer surfaces as
//! [`WireError::NeedMore`], which is a signal to wait for more bytes,
//! never a protocol failure.

use crate::error::SessionError;

/// Result of a wire-level read.
pub type WireResult<T> = Result<T, WireError>;

/// Failure modes of the wire codec.
#[derive(Debug, PartialEq, Eq)]
pub enum WireError {
    /// The buffer does not yet hold a complete value. Retry after the
    /// transport delivers more bytes.
    NeedMore,
    /// The bytes are structurally or semantically invalid. Fatal.
    Invalid(String),
}

impl From<WireError> for SessionError {
    fn from(err: WireError) -> Self {
        match err {
            // NeedMore must be handled before conversion; reaching here
            // means a framing bug upstream.
            WireError::NeedMore => SessionError::Decode("truncated message".into()),
            WireError::Invalid(msg) => SessionError::Decode(msg),
        }
    }
}

/// Non-destructive big-endian reader over a borrowed byte slice.
///
/// The reader tracks its own position; [`WireReader::consumed`] reports
/// how many bytes a successful parse used so the caller can advance the
/// underlying buffer in one step.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Creates a reader positioned at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed by reads so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    /// Bytes remaining in the buffer.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Reads exactly `n` bytes, or signals `NeedMore`.
    pub fn take(&mut self, n: usize) -> WireResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(WireError::NeedMore);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Skips `n` bytes of padding.
    pub fn skip(&mut self, n: usize) -> WireResult<()> {
        self.take(n).map(|_| ())
    }

    pub fn read_u8(&mut self) -> WireResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> WireResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> WireResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> WireResult<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a 32-bit length-prefixed UTF-8 string (no terminator).
    ///
    /// `max` bounds the declared length so a hostile peer cannot force an
    /// arbitrarily large allocation before the bytes even arrive.
    pub fn read_string(&mut self, max: usize) -> WireResult<String> {
        let len = self.read_u32()? as usize;
        if len > max {
            return Err(WireError::Invalid(format!(
                "string length {len} exceeds limit {max}"
            )));
        }
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| WireError::Invalid("string is not valid UTF-8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_are_big_endian() {
        let buf = [0x12, 0x34, 0x56, 0x78, 0xff, 0xff, 0xff, 0xff];
        let mut r = WireReader::new(&buf);
        assert_eq!(r.read_u16().unwrap(), 0x1234);
        assert_eq!(r.read_u16().unwrap(), 0x5678);
        assert_eq!(r.read_i32().unwrap(), -1);
        assert_eq!(r.consumed(), 8);
    }

    #[test]
    fn short_buffer_signals_need_more() {
        let buf = [0x00, 0x01];
        let mut r = WireReader::new(&buf);
        assert_eq!(r.read_u32().unwrap_err(), WireError::NeedMore);
        // A failed read must not advance the position.
        assert_eq!(r.consumed(), 0);
        assert_eq!(r.read_u16().unwrap(), 1);
    }

    #[test]
    fn length_prefixed_string_round_trip() {
        let mut buf = vec![0, 0, 0, 4];
        buf.extend_from_slice(b"Test");
        let mut r = WireReader::new(&buf);
        assert_eq!(r.read_string(1024).unwrap(), "Test");
        assert_eq!(r.consumed(), 8);
    }

    #[test]
    fn string_waits_for_payload() {
        let buf = [0, 0, 0, 10, b'p'];
        let mut r = WireReader::new(&buf);
        assert_eq!(r.read_string(1024).unwrap_err(), WireError::NeedMore);
    }

    #[test]
    fn oversized_string_is_invalid() {
        let buf = [0xff, 0xff, 0xff, 0xff];
        let mut r = WireReader::new(&buf);
        assert!(matches!(
            r.read_string(1 << 20).unwrap_err(),
            WireError::Invalid(_)
        ));
    }
}
