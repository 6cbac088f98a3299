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

//! Collaborator interfaces.
//!
//! Platform screen grabbers and input synthesizers live outside this
//! crate; the server controller talks to them through these traits.
//! Concrete implementations are selected at construction time, never
//! downcast at runtime.

use crate::error::SessionError;

/// A full-screen snapshot delivered by a [`ScreenSource`].
///
/// Pixels are RGBA8888, top-down, row major: width * height * 4 bytes.
pub struct CapturedFrame {
    /// RGBA pixel bytes.
    pub pixels: Vec<u8>,
    /// Width in pixels.
    pub width: u16,
    /// Height in pixels.
    pub height: u16,
}

/// Produces framebuffer snapshots for the capture loop.
///
/// Called from a single task; implementations do not need interior
/// synchronization.
pub trait ScreenSource: Send + 'static {
    /// Prepares the source. Called once before the first capture.
    fn init(&mut self) -> Result<(), SessionError>;

    /// Grabs the current screen contents.
    fn capture(&mut self) -> Result<CapturedFrame, SessionError>;

    /// Releases platform resources. Called once on shutdown.
    fn shutdown(&mut self);
}

/// Applies remote input events to the local machine.
///
/// Platform injection APIs are not re-entrant, so the controller
/// serializes all calls behind one mutex.
pub trait InputSink: Send + 'static {
    /// Prepares the sink. Called once before the first event.
    fn init(&mut self) -> Result<(), SessionError>;

    /// Presses or releases a key. `keysym` is an X keysym value, as
    /// RFB carries them verbatim.
    fn key(&mut self, keysym: u32, down: bool);

    /// Moves the pointer.
    fn pointer_move(&mut self, x: u16, y: u16);

    /// Applies a button mask change at a position. Bit 0 is left,
    /// 1 middle, 2 right, 3 wheel up, 4 wheel down.
    fn pointer_buttons(&mut self, x: u16, y: u16, mask: u8);

    /// Releases platform resources. Called once on shutdown.
    fn shutdown(&mut self);
}
