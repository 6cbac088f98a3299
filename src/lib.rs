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

//! Bidirectional RFB 3.8 (VNC) core.
//!
//! This crate implements both endpoints of a Remote Framebuffer
//! session: a transport-agnostic protocol engine, a server controller
//! that serves a captured screen to many clients, and a viewer
//! controller that decodes updates into a local pixel buffer.
//!
//! # Architecture
//!
//! - **`protocol`**: RFB constants, message types, packed records
//! - **`wire`**: network-byte-order codec with partial-input signalling
//! - **`pixel`**: pixel format model and buffer translation
//! - **`engine`**: the RFB state machine for either role
//! - **`encoding`**: Raw, CopyRect, RRE, Hextile and ZRLE codecs
//! - **`auth`**: VNC authentication (DES challenge/response)
//! - **`framebuffer`**: shared pixel store and dirty region tracking
//! - **`diff`**: snapshot differencing for the capture loop
//! - **`server`** / **`client`**: server controller and per-client sessions
//! - **`viewer`**: client-side session controller
//! - **`traits`**: `ScreenSource` and `InputSink` collaborator interfaces
//!
//! # Example Flow
//!
//! ```ignore
//! // Serve a screen source on the default port.
//! let (server, mut events) = VncServer::new(
//!     ServerConfig::default(),
//!     Box::new(my_screen_source),
//!     Box::new(my_input_sink),
//! )?;
//! tokio::spawn(async move { server.listen().await });
//!
//! // And watch it from the other end.
//! let (viewer, mut viewer_events) = VncViewer::connect(ViewerConfig::default()).await?;
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod diff;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod events;
pub mod framebuffer;
pub mod pixel;
pub mod protocol;
pub mod server;
pub mod traits;
pub mod viewer;
pub mod wire;

pub use client::{ClientHandle, ClientInfo};
pub use config::{ServerConfig, ViewerConfig};
pub use engine::{EncodedRect, EngineEvent, PeerState, ProtocolEngine, Role};
pub use error::SessionError;
pub use events::{ServerEvent, ViewerEvent};
pub use framebuffer::{DirtyRegion, Framebuffer};
pub use pixel::PixelFormat;
pub use server::VncServer;
pub use traits::{CapturedFrame, InputSink, ScreenSource};
pub use viewer::{CursorShape, VncViewer};
