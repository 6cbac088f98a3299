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

//! RFB protocol constants and fixed-layout records.
//!
//! This module provides the building blocks shared by both engine roles:
//! protocol version literal, message-type bytes, security types,
//! encoding numbers, and the packed records that frame every message.
//! It implements the RFB protocol as specified in RFC 6143.
//!
//! # Protocol Overview
//!
//! An RFB session passes through four phases:
//! 1. **Protocol Version** - both peers agree on version 3.8
//! 2. **Security Handshake** - authentication selection and execution
//! 3. **Initialization** - ClientInit / ServerInit exchange
//! 4. **Steady State** - input events and framebuffer updates

use bytes::{BufMut, BytesMut};

use crate::pixel::PixelFormat;
use crate::wire::{WireReader, WireResult};

/// The RFB protocol version string spoken by both roles.
///
/// Exactly 12 bytes including the trailing newline, as RFC 6143
/// requires. Peers announcing a higher 3.x minor are downgraded to 3.8;
/// anything older is rejected.
pub const PROTOCOL_VERSION: &[u8; 12] = b"RFB 003.008\n";

/// Default TCP port for RFB.
pub const DEFAULT_PORT: u16 = 5900;

// Client-to-Server Message Types

/// Client requests a new pixel format for subsequent updates.
pub const CLIENT_MSG_SET_PIXEL_FORMAT: u8 = 0;

/// Client announces the encodings it accepts, most preferred first.
pub const CLIENT_MSG_SET_ENCODINGS: u8 = 2;

/// Client requests a framebuffer update for a region, incrementally or
/// in full.
pub const CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;

/// Client reports a key press or release.
pub const CLIENT_MSG_KEY_EVENT: u8 = 4;

/// Client reports pointer position and button state.
pub const CLIENT_MSG_POINTER_EVENT: u8 = 5;

/// Client transfers clipboard text to the server.
pub const CLIENT_MSG_CLIENT_CUT_TEXT: u8 = 6;

// Server-to-Client Message Types

/// Server delivers one or more rectangles of pixel data.
pub const SERVER_MSG_FRAMEBUFFER_UPDATE: u8 = 0;

/// Server defines colour map entries (indexed-colour formats only).
pub const SERVER_MSG_SET_COLOUR_MAP_ENTRIES: u8 = 1;

/// Server rings the bell.
pub const SERVER_MSG_BELL: u8 = 2;

/// Server transfers clipboard text to the client.
pub const SERVER_MSG_SERVER_CUT_TEXT: u8 = 3;

// Encoding Types

/// Raw encoding: width x height x bytes-per-pixel, row major. Every
/// peer must handle it; it is the universal fallback.
pub const ENCODING_RAW: i32 = 0;

/// CopyRect encoding: a 4-byte source position; the client copies the
/// region from its own framebuffer.
pub const ENCODING_COPYRECT: i32 = 1;

/// Rise-and-Run-length Encoding: background pixel plus coloured
/// subrectangles.
pub const ENCODING_RRE: i32 = 2;

/// Hextile encoding: 16x16 tiles with per-tile subencoding masks.
pub const ENCODING_HEXTILE: i32 = 5;

/// ZRLE encoding: zlib-compressed 64x64 tiles. One zlib stream spans
/// the whole connection.
pub const ENCODING_ZRLE: i32 = 16;

/// Cursor pseudo-encoding: carries cursor shape and hotspot.
pub const ENCODING_CURSOR: i32 = -239;

/// DesktopSize pseudo-encoding: announces new framebuffer dimensions.
pub const ENCODING_DESKTOP_SIZE: i32 = -223;

// Security Types

/// No authentication; the session proceeds straight to initialization.
pub const SECURITY_TYPE_NONE: u8 = 1;

/// VNC authentication: DES-encrypted challenge/response.
pub const SECURITY_TYPE_VNC_AUTH: u8 = 2;

// Security Results

/// Authentication (if any) succeeded.
pub const SECURITY_RESULT_OK: u32 = 0;

/// Authentication failed; RFB 3.8 follows this with a reason string.
pub const SECURITY_RESULT_FAILED: u32 = 1;

/// Upper bound accepted for clipboard transfers in either direction.
/// Prevents a hostile peer from forcing a huge allocation.
pub const MAX_CUT_TEXT: usize = 10 * 1024 * 1024;

/// Upper bound accepted for the ServerInit desktop name.
pub const MAX_DESKTOP_NAME: usize = 4096;

/// The `ServerInit` message sent when the handshake completes.
///
/// Gives the client the framebuffer dimensions, the server's native
/// pixel format, and the desktop name.
#[derive(Debug, Clone)]
pub struct ServerInit {
    /// Framebuffer width in pixels.
    pub framebuffer_width: u16,
    /// Framebuffer height in pixels.
    pub framebuffer_height: u16,
    /// The server's native pixel format.
    pub pixel_format: PixelFormat,
    /// Desktop name shown by viewers.
    pub name: String,
}

impl ServerInit {
    /// Serializes the message: width, height, 16-byte pixel format,
    /// 4-byte name length, then the name bytes.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.framebuffer_width);
        buf.put_u16(self.framebuffer_height);
        self.pixel_format.write_to(buf);

        let name_bytes = self.name.as_bytes();
        buf.put_u32(name_bytes.len() as u32);
        buf.put_slice(name_bytes);
    }

    /// Parses the message, signalling `NeedMore` until the name has
    /// fully arrived.
    pub fn read_from(reader: &mut WireReader<'_>) -> WireResult<Self> {
        let framebuffer_width = reader.read_u16()?;
        let framebuffer_height = reader.read_u16()?;
        let pixel_format = PixelFormat::read_from(reader)?;
        let name = reader.read_string(MAX_DESKTOP_NAME)?;
        Ok(Self {
            framebuffer_width,
            framebuffer_height,
            pixel_format,
            name,
        })
    }
}

/// A rectangle header inside a framebuffer update.
///
/// Each update carries one or more rectangles, each with its own
/// encoding. The 12-byte header is followed by an encoding-specific
/// payload whose length depends on the dimensions and the pixel format
/// in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rectangle {
    /// X coordinate of the top-left corner.
    pub x: u16,
    /// Y coordinate of the top-left corner.
    pub y: u16,
    /// Width in pixels.
    pub width: u16,
    /// Height in pixels.
    pub height: u16,
    /// Encoding of the payload that follows.
    pub encoding: i32,
}

impl Rectangle {
    /// Writes the 12-byte header in network byte order.
    pub fn write_header(&self, buf: &mut BytesMut) {
        buf.put_u16(self.x);
        buf.put_u16(self.y);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_i32(self.encoding);
    }

    /// Parses the 12-byte header.
    pub fn read_header(reader: &mut WireReader<'_>) -> WireResult<Self> {
        Ok(Self {
            x: reader.read_u16()?,
            y: reader.read_u16()?,
            width: reader.read_u16()?,
            height: reader.read_u16()?,
            encoding: reader.read_i32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_literal_is_twelve_bytes() {
        assert_eq!(PROTOCOL_VERSION.len(), 12);
        assert_eq!(&PROTOCOL_VERSION[..4], b"RFB ");
        assert_eq!(PROTOCOL_VERSION[11], b'\n');
    }

    #[test]
    fn rectangle_header_round_trips() {
        let rect = Rectangle {
            x: 10,
            y: 20,
            width: 300,
            height: 400,
            encoding: ENCODING_CURSOR,
        };
        let mut buf = BytesMut::new();
        rect.write_header(&mut buf);
        assert_eq!(buf.len(), 12);
        let parsed = Rectangle::read_header(&mut WireReader::new(&buf)).unwrap();
        assert_eq!(parsed, rect);
    }

    #[test]
    fn server_init_layout_matches_rfc() {
        let init = ServerInit {
            framebuffer_width: 0x0010,
            framebuffer_height: 0x0010,
            pixel_format: PixelFormat::rgb32(),
            name: "Test".to_string(),
        };
        let mut buf = BytesMut::new();
        init.write_to(&mut buf);
        // 2 + 2 + 16 + 4 + 4 bytes
        assert_eq!(buf.len(), 28);
        assert_eq!(&buf[..4], &[0x00, 0x10, 0x00, 0x10]);
        assert_eq!(&buf[20..24], &[0x00, 0x00, 0x00, 0x04]);
        assert_eq!(&buf[24..], b"Test");

        let parsed = ServerInit::read_from(&mut WireReader::new(&buf)).unwrap();
        assert_eq!(parsed.name, "Test");
        assert_eq!(parsed.framebuffer_width, 16);
        assert_eq!(parsed.pixel_format, PixelFormat::rgb32());
    }
}
