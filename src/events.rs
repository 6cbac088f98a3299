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

//! Events surfaced to embedders by the session controllers.

use crate::framebuffer::DirtyRegion;

/// Events emitted by the server controller.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A client completed the handshake.
    ClientConnected {
        /// Unique client identifier.
        id: usize,
        /// Client's remote address, as "host:port".
        address: String,
    },

    /// A client session ended.
    ClientDisconnected {
        /// Unique client identifier.
        id: usize,
        /// Why the session ended.
        reason: String,
    },

    /// Key press or release from a client. The event has already been
    /// forwarded to the input sink.
    KeyEvent {
        /// Client identifier.
        client_id: usize,
        /// X keysym value.
        keysym: u32,
        /// True if pressed, false if released.
        down: bool,
    },

    /// Pointer event from a client. Already forwarded to the input
    /// sink.
    PointerEvent {
        /// Client identifier.
        client_id: usize,
        /// X coordinate.
        x: u16,
        /// Y coordinate.
        y: u16,
        /// Button mask (bit 0 = left, bit 1 = middle, bit 2 = right).
        buttons: u8,
    },

    /// Clipboard text received from a client.
    CutText {
        /// Client identifier.
        client_id: usize,
        /// Clipboard contents.
        text: String,
    },
}

/// Events emitted by the viewer controller.
#[derive(Debug, Clone)]
pub enum ViewerEvent {
    /// Handshake finished; the local framebuffer has been allocated.
    Connected {
        /// Remote framebuffer width.
        width: u16,
        /// Remote framebuffer height.
        height: u16,
        /// Desktop name from ServerInit.
        name: String,
    },

    /// A rectangle of the local framebuffer changed.
    RectUpdated {
        /// The changed region.
        region: DirtyRegion,
    },

    /// All rectangles of the current update have been applied.
    UpdateComplete,

    /// The remote framebuffer changed size; the local one follows.
    Resized {
        /// New width.
        width: u16,
        /// New height.
        height: u16,
    },

    /// The remote cursor shape changed; query it from the viewer.
    CursorUpdated,

    /// The server rang the bell.
    Bell,

    /// Clipboard text from the server.
    Clipboard(String),

    /// The session ended.
    Disconnected {
        /// Why the session ended.
        reason: String,
    },
}
