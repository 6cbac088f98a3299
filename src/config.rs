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

//! Session configuration.

use std::time::Duration;

use crate::pixel::PixelFormat;
use crate::protocol::{
    DEFAULT_PORT, ENCODING_CURSOR, ENCODING_DESKTOP_SIZE, ENCODING_HEXTILE, ENCODING_RAW,
    ENCODING_RRE, ENCODING_ZRLE,
};

/// Server-side configuration. All fields are public and overridable;
/// `Default` carries the standard values.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port the server listens on.
    pub listen_port: u16,
    /// When set, VNCAuth is offered and required; otherwise None is
    /// offered.
    pub password: Option<String>,
    /// Desktop name sent in ServerInit.
    pub desktop_name: String,
    /// Framebuffer width in pixels.
    pub screen_width: u16,
    /// Framebuffer height in pixels.
    pub screen_height: u16,
    /// The server's native pixel format.
    pub pixel_format: PixelFormat,
    /// Bound on the whole handshake.
    pub handshake_timeout: Duration,
    /// Bound on steady-state inactivity.
    pub idle_timeout: Duration,
    /// Interval between screen captures.
    pub capture_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_PORT,
            password: None,
            desktop_name: "rfbcore".to_string(),
            screen_width: 1024,
            screen_height: 768,
            pixel_format: PixelFormat::rgb32(),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            capture_interval: Duration::from_millis(33),
        }
    }
}

/// Viewer-side configuration.
#[derive(Debug, Clone)]
pub struct ViewerConfig {
    /// Server host name or address.
    pub host: String,
    /// Server TCP port.
    pub port: u16,
    /// Password for VNCAuth, when the server requires it.
    pub password: Option<String>,
    /// ClientInit shared flag; false requests exclusive access.
    pub shared: bool,
    /// Encoding preference list, most preferred first.
    pub preferred_encodings: Vec<i32>,
    /// Bound on the whole handshake.
    pub handshake_timeout: Duration,
    /// Bound on steady-state inactivity.
    pub idle_timeout: Duration,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            password: None,
            shared: true,
            preferred_encodings: vec![
                ENCODING_ZRLE,
                ENCODING_HEXTILE,
                ENCODING_RRE,
                ENCODING_RAW,
                ENCODING_CURSOR,
                ENCODING_DESKTOP_SIZE,
            ],
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_table() {
        let server = ServerConfig::default();
        assert_eq!(server.listen_port, 5900);
        assert_eq!((server.screen_width, server.screen_height), (1024, 768));
        assert_eq!(server.pixel_format.bits_per_pixel, 32);
        assert_eq!(server.capture_interval, Duration::from_millis(33));

        let viewer = ViewerConfig::default();
        assert_eq!(viewer.preferred_encodings[0], ENCODING_ZRLE);
        assert_eq!(viewer.handshake_timeout, Duration::from_secs(10));
        assert_eq!(viewer.idle_timeout, Duration::from_secs(30));
        assert!(viewer.shared);
    }
}
