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

//! The RFB protocol engine.
//!
//! One [`ProtocolEngine`] drives one peer of a session, in either role.
//! It is transport-agnostic: the caller feeds it arbitrary byte slices
//! from the stream, drains the bytes it produces, and polls the events
//! it parsed. The engine buffers partial input and consumes bytes only
//! once a complete message has decoded, so feeding it one byte at a
//! time is as correct as feeding it whole messages.
//!
//! # State machine
//!
//! ```text
//! AwaitVersion -> security -> auth -> init -> Steady
//!                                              |
//!                           any failure -> Failed (terminal)
//! ```
//!
//! The server role emits its version string at construction; only the
//! handshake direction differs between roles. After [`PeerState::Failed`]
//! the engine refuses further input and produces no further output.
//!
//! The engine is not re-entrant: callers must serialize access, which
//! the session controllers get for free by owning their engine from a
//! single task.

use std::collections::VecDeque;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::auth::{self, VncAuth};
use crate::encoding;
use crate::error::SessionError;
use crate::framebuffer::DirtyRegion;
use crate::pixel::PixelFormat;
use crate::protocol::{
    Rectangle, ServerInit, CLIENT_MSG_CLIENT_CUT_TEXT, CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST,
    CLIENT_MSG_KEY_EVENT, CLIENT_MSG_POINTER_EVENT, CLIENT_MSG_SET_ENCODINGS,
    CLIENT_MSG_SET_PIXEL_FORMAT, ENCODING_CURSOR, ENCODING_DESKTOP_SIZE,
    ENCODING_HEXTILE, ENCODING_RAW, ENCODING_RRE, ENCODING_ZRLE, MAX_CUT_TEXT, PROTOCOL_VERSION,
    SECURITY_RESULT_FAILED, SECURITY_RESULT_OK, SECURITY_TYPE_NONE, SECURITY_TYPE_VNC_AUTH,
    SERVER_MSG_BELL, SERVER_MSG_FRAMEBUFFER_UPDATE, SERVER_MSG_SERVER_CUT_TEXT,
    SERVER_MSG_SET_COLOUR_MAP_ENTRIES,
};
use crate::wire::{WireError, WireReader};

/// Which endpoint of the session this engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The viewer endpoint.
    Client,
    /// The server endpoint.
    Server,
}

/// Protocol phase of the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Waiting for the 12-byte version string.
    AwaitVersion,
    /// Client: waiting for the server's security type list.
    AwaitSecurityTypes,
    /// Server: waiting for the client's security type choice.
    AwaitSecurityChoice,
    /// Client: waiting for the 16-byte VNCAuth challenge.
    AwaitAuthChallenge,
    /// Server: waiting for the 16-byte VNCAuth response.
    AwaitAuthResponse,
    /// Client: waiting for the 4-byte security result.
    AwaitAuthResult,
    /// Server: waiting for the 1-byte ClientInit.
    AwaitClientInit,
    /// Client: waiting for the ServerInit message.
    AwaitServerInit,
    /// Handshake done; demultiplexing by message type.
    Steady,
    /// Terminal. The session is over.
    Failed,
}

/// A rectangle already encoded for the wire, ready to be framed into a
/// FramebufferUpdate.
#[derive(Debug, Clone)]
pub struct EncodedRect {
    /// X coordinate of the destination.
    pub x: u16,
    /// Y coordinate of the destination.
    pub y: u16,
    /// Width in pixels.
    pub width: u16,
    /// Height in pixels.
    pub height: u16,
    /// Encoding of `payload`.
    pub encoding: i32,
    /// Encoding-specific payload bytes.
    pub payload: Bytes,
}

/// Parsed events surfaced by the engine.
///
/// Events arrive in wire order; the controller must apply them in that
/// order, which matters for `DesktopResized` followed by rectangles
/// that assume the new geometry.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The handshake finished and the engine entered steady state.
    HandshakeComplete,
    /// Server role: the client sent its ClientInit shared flag.
    ClientInit {
        /// False requests exclusive access; policy is the controller's.
        shared: bool,
    },
    /// Server role: the client changed its pixel format.
    SetPixelFormat(PixelFormat),
    /// Server role: the client announced its encodings. Unsupported
    /// entries have already been dropped.
    SetEncodings(Vec<i32>),
    /// Server role: the client asked for a framebuffer update.
    UpdateRequest {
        /// Requested region.
        region: DirtyRegion,
        /// True to send only changes since the last update.
        incremental: bool,
    },
    /// A key press or release.
    KeyEvent {
        /// X keysym value.
        keysym: u32,
        /// True if pressed.
        down: bool,
    },
    /// Pointer position and button state.
    PointerEvent {
        /// X coordinate.
        x: u16,
        /// Y coordinate.
        y: u16,
        /// Button mask: bit 0 left, 1 middle, 2 right, 3 wheel up,
        /// 4 wheel down.
        buttons: u8,
    },
    /// Clipboard text from the peer.
    CutText(String),
    /// Client role: the ServerInit arrived.
    ServerInit {
        /// Framebuffer width.
        width: u16,
        /// Framebuffer height.
        height: u16,
        /// Desktop name.
        name: String,
        /// The server's native pixel format.
        format: PixelFormat,
    },
    /// Client role: a pixel rectangle of a framebuffer update, with
    /// its still-encoded payload.
    RectData {
        /// Destination rectangle and encoding.
        rect: Rectangle,
        /// Encoding-specific payload.
        payload: Bytes,
    },
    /// Client role: the framebuffer dimensions changed. Applies before
    /// any following rectangle.
    DesktopResized {
        /// New width.
        width: u16,
        /// New height.
        height: u16,
    },
    /// Client role: a new cursor shape.
    CursorShape {
        /// Hotspot x, carried in the rectangle header.
        hotspot_x: u16,
        /// Hotspot y.
        hotspot_y: u16,
        /// Cursor width.
        width: u16,
        /// Cursor height.
        height: u16,
        /// Cursor pixels followed by the 1-bit mask.
        payload: Bytes,
    },
    /// Client role: all rectangles of the current update have been
    /// delivered.
    UpdateComplete,
    /// Client role: the server rang the bell.
    Bell,
    /// Client role: colour map entries for indexed formats. Parsed for
    /// framing; the palette itself is not retained.
    ColourMap {
        /// Index of the first updated entry.
        first: u16,
        /// Number of entries.
        count: u16,
    },
}

/// The RFB 3.8 state machine for one peer.
pub struct ProtocolEngine {
    role: Role,
    state: PeerState,
    inbound: BytesMut,
    outbound: BytesMut,
    events: VecDeque<EngineEvent>,

    /// Pixel format in force for rectangle payloads.
    pixel_format: PixelFormat,
    fb_width: u16,
    fb_height: u16,
    desktop_name: String,
    password: Option<String>,
    auth: VncAuth,
    challenge: Option<[u8; 16]>,
    shared: bool,

    /// Server role: the agreed encoding list, supported entries only.
    encodings: Vec<i32>,

    /// Client role: rectangles left in the update being parsed.
    pending_rects: u16,
    /// Client role: header of the rectangle whose payload is awaited.
    current_rect: Option<Rectangle>,
}

impl ProtocolEngine {
    /// Creates a server-role engine and queues the version string.
    pub fn server(
        width: u16,
        height: u16,
        pixel_format: PixelFormat,
        desktop_name: String,
        password: Option<String>,
    ) -> Self {
        let mut engine = Self {
            role: Role::Server,
            state: PeerState::AwaitVersion,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            events: VecDeque::new(),
            pixel_format,
            fb_width: width,
            fb_height: height,
            desktop_name,
            auth: VncAuth::new(password.clone()),
            password,
            challenge: None,
            shared: true,
            encodings: vec![ENCODING_RAW],
            pending_rects: 0,
            current_rect: None,
        };
        engine.outbound.put_slice(PROTOCOL_VERSION);
        engine
    }

    /// Creates a client-role engine. `shared` is the ClientInit flag
    /// sent once authentication succeeds.
    pub fn client(password: Option<String>, shared: bool) -> Self {
        Self {
            role: Role::Client,
            state: PeerState::AwaitVersion,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            events: VecDeque::new(),
            pixel_format: PixelFormat::rgb32(),
            fb_width: 0,
            fb_height: 0,
            desktop_name: String::new(),
            auth: VncAuth::new(None),
            password,
            challenge: None,
            shared,
            encodings: vec![ENCODING_RAW],
            pending_rects: 0,
            current_rect: None,
        }
    }

    /// Current protocol phase.
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Whether the handshake has completed.
    pub fn is_steady(&self) -> bool {
        self.state == PeerState::Steady
    }

    /// Whether the session has failed terminally.
    pub fn is_failed(&self) -> bool {
        self.state == PeerState::Failed
    }

    /// The pixel format currently in force for rectangle payloads.
    pub fn pixel_format(&self) -> &PixelFormat {
        &self.pixel_format
    }

    /// Framebuffer dimensions as this engine knows them.
    pub fn dimensions(&self) -> (u16, u16) {
        (self.fb_width, self.fb_height)
    }

    /// Server role: the agreed encoding list.
    pub fn encodings(&self) -> &[i32] {
        &self.encodings
    }

    /// Server role: picks the encoding for the next update. The first
    /// entry of the client's preference list that carries pixel data
    /// and is implemented wins; Raw is the fallback.
    pub fn choose_encoding(&self) -> i32 {
        self.encodings
            .iter()
            .copied()
            .find(|&enc| matches!(enc, ENCODING_RAW | ENCODING_RRE | ENCODING_HEXTILE | ENCODING_ZRLE))
            .unwrap_or(ENCODING_RAW)
    }

    /// Server role: whether the client advertised a pseudo-encoding
    /// (or CopyRect) in SetEncodings.
    pub fn peer_accepts(&self, encoding: i32) -> bool {
        self.encodings.contains(&encoding)
    }

    /// Drains the bytes produced so far.
    pub fn take_outbound(&mut self) -> BytesMut {
        self.outbound.split()
    }

    /// Whether there are bytes waiting to be written.
    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Pops the next parsed event.
    pub fn poll_event(&mut self) -> Option<EngineEvent> {
        self.events.pop_front()
    }

    /// Feeds bytes from the transport and advances the state machine
    /// as far as the data allows.
    ///
    /// # Errors
    ///
    /// Any protocol failure drives the engine to [`PeerState::Failed`]
    /// and is returned. After that every call fails with a state
    /// violation and no further output is produced.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), SessionError> {
        if self.state == PeerState::Failed {
            return Err(SessionError::StateViolation(
                "session has already failed".into(),
            ));
        }
        self.inbound.extend_from_slice(data);
        loop {
            match self.process_one() {
                Ok(true) => continue,
                Ok(false) => return Ok(()),
                Err(err) => {
                    self.state = PeerState::Failed;
                    return Err(err);
                }
            }
        }
    }

    /// Processes at most one message. Returns `Ok(true)` on progress,
    /// `Ok(false)` when more bytes are needed.
    fn process_one(&mut self) -> Result<bool, SessionError> {
        match (self.state, self.role) {
            (PeerState::AwaitVersion, _) => self.process_version(),
            (PeerState::AwaitSecurityTypes, Role::Client) => self.process_security_types(),
            (PeerState::AwaitSecurityChoice, Role::Server) => self.process_security_choice(),
            (PeerState::AwaitAuthChallenge, Role::Client) => self.process_auth_challenge(),
            (PeerState::AwaitAuthResponse, Role::Server) => self.process_auth_response(),
            (PeerState::AwaitAuthResult, Role::Client) => self.process_auth_result(),
            (PeerState::AwaitClientInit, Role::Server) => self.process_client_init(),
            (PeerState::AwaitServerInit, Role::Client) => self.process_server_init(),
            (PeerState::Steady, Role::Server) => self.process_client_message(),
            (PeerState::Steady, Role::Client) => self.process_server_message(),
            (state, role) => Err(SessionError::StateViolation(format!(
                "{role:?} engine has no transitions from {state:?}"
            ))),
        }
    }

    // ── Handshake ────────────────────────────────────────────────

    fn process_version(&mut self) -> Result<bool, SessionError> {
        if self.inbound.len() < 12 {
            return Ok(false);
        }
        let mut version = [0u8; 12];
        version.copy_from_slice(&self.inbound[..12]);
        self.inbound.advance(12);
        let minor = parse_version(&version)?;
        if minor < 8 {
            return Err(SessionError::StateViolation(format!(
                "peer version 3.{minor} is older than 3.8"
            )));
        }
        // Any 3.x with minor >= 8 is downgraded to 3.8.
        match self.role {
            Role::Server => {
                self.send_security_types();
                self.state = PeerState::AwaitSecurityChoice;
            }
            Role::Client => {
                self.outbound.put_slice(PROTOCOL_VERSION);
                self.state = PeerState::AwaitSecurityTypes;
            }
        }
        Ok(true)
    }

    /// Server: offer VNCAuth when a password is configured, None
    /// otherwise. The password being set makes authentication
    /// mandatory, so None is not offered alongside it.
    fn send_security_types(&mut self) {
        if self.auth.enabled() {
            self.outbound.put_slice(&[1, SECURITY_TYPE_VNC_AUTH]);
        } else {
            self.outbound.put_slice(&[1, SECURITY_TYPE_NONE]);
        }
    }

    fn process_security_types(&mut self) -> Result<bool, SessionError> {
        let (consumed, outcome) = {
            let mut reader = WireReader::new(&self.inbound[..]);
            let count = match reader.read_u8() {
                Ok(n) => n,
                Err(WireError::NeedMore) => return Ok(false),
                Err(e) => return Err(e.into()),
            };
            if count == 0 {
                // A zero count is a fatal handshake failure with a
                // reason string.
                let reason = match reader.read_string(4096) {
                    Ok(r) => r,
                    Err(WireError::NeedMore) => return Ok(false),
                    Err(e) => return Err(e.into()),
                };
                return Err(SessionError::Auth(format!("server refused handshake: {reason}")));
            }
            let types = match reader.take(usize::from(count)) {
                Ok(t) => t.to_vec(),
                Err(WireError::NeedMore) => return Ok(false),
                Err(e) => return Err(e.into()),
            };
            (reader.consumed(), types)
        };
        self.inbound.advance(consumed);

        let offers_none = outcome.contains(&SECURITY_TYPE_NONE);
        let offers_vnc = outcome.contains(&SECURITY_TYPE_VNC_AUTH);
        let choice = if offers_none && self.password.is_none() {
            SECURITY_TYPE_NONE
        } else if offers_vnc && self.password.is_some() {
            SECURITY_TYPE_VNC_AUTH
        } else if offers_none {
            SECURITY_TYPE_NONE
        } else {
            return Err(SessionError::Auth(format!(
                "no mutually supported security type in {outcome:?}"
            )));
        };
        self.outbound.put_u8(choice);
        self.state = if choice == SECURITY_TYPE_VNC_AUTH {
            PeerState::AwaitAuthChallenge
        } else {
            PeerState::AwaitAuthResult
        };
        Ok(true)
    }

    fn process_security_choice(&mut self) -> Result<bool, SessionError> {
        if self.inbound.is_empty() {
            return Ok(false);
        }
        let choice = self.inbound[0];
        self.inbound.advance(1);
        match choice {
            SECURITY_TYPE_NONE if !self.auth.enabled() => {
                self.outbound.put_u32(SECURITY_RESULT_OK);
                self.state = PeerState::AwaitClientInit;
                Ok(true)
            }
            SECURITY_TYPE_VNC_AUTH if self.auth.enabled() => {
                let challenge = self.auth.generate_challenge();
                self.outbound.put_slice(&challenge);
                self.challenge = Some(challenge);
                self.state = PeerState::AwaitAuthResponse;
                Ok(true)
            }
            other => {
                self.send_security_failure("security type not offered");
                Err(SessionError::Auth(format!(
                    "client chose unoffered security type {other}"
                )))
            }
        }
    }

    fn process_auth_challenge(&mut self) -> Result<bool, SessionError> {
        if self.inbound.len() < 16 {
            return Ok(false);
        }
        let mut challenge = [0u8; 16];
        challenge.copy_from_slice(&self.inbound[..16]);
        self.inbound.advance(16);
        let Some(ref password) = self.password else {
            return Err(SessionError::Auth(
                "server requires a password but none is configured".into(),
            ));
        };
        let response = auth::encrypt_challenge(&challenge, password);
        self.outbound.put_slice(&response);
        self.state = PeerState::AwaitAuthResult;
        Ok(true)
    }

    fn process_auth_response(&mut self) -> Result<bool, SessionError> {
        if self.inbound.len() < 16 {
            return Ok(false);
        }
        let response = self.inbound[..16].to_vec();
        self.inbound.advance(16);
        let challenge = self.challenge.take().ok_or_else(|| {
            SessionError::StateViolation("auth response without a challenge".into())
        })?;
        if self.auth.verify_response(&response, &challenge) {
            self.outbound.put_u32(SECURITY_RESULT_OK);
            self.state = PeerState::AwaitClientInit;
            Ok(true)
        } else {
            self.send_security_failure("authentication failed");
            Err(SessionError::Auth("password mismatch".into()))
        }
    }

    /// Emits a failed SecurityResult with the RFB 3.8 reason string.
    fn send_security_failure(&mut self, reason: &str) {
        self.outbound.put_u32(SECURITY_RESULT_FAILED);
        self.outbound.put_u32(reason.len() as u32);
        self.outbound.put_slice(reason.as_bytes());
    }

    fn process_auth_result(&mut self) -> Result<bool, SessionError> {
        let (consumed, status, reason) = {
            let mut reader = WireReader::new(&self.inbound[..]);
            let status = match reader.read_u32() {
                Ok(s) => s,
                Err(WireError::NeedMore) => return Ok(false),
                Err(e) => return Err(e.into()),
            };
            if status == SECURITY_RESULT_OK {
                (reader.consumed(), status, String::new())
            } else {
                let reason = match reader.read_string(4096) {
                    Ok(r) => r,
                    Err(WireError::NeedMore) => return Ok(false),
                    Err(e) => return Err(e.into()),
                };
                (reader.consumed(), status, reason)
            }
        };
        self.inbound.advance(consumed);
        if status != SECURITY_RESULT_OK {
            return Err(SessionError::Auth(if reason.is_empty() {
                "authentication rejected".into()
            } else {
                reason
            }));
        }
        self.outbound.put_u8(u8::from(self.shared));
        self.state = PeerState::AwaitServerInit;
        Ok(true)
    }

    fn process_client_init(&mut self) -> Result<bool, SessionError> {
        if self.inbound.is_empty() {
            return Ok(false);
        }
        let shared = self.inbound[0] != 0;
        self.inbound.advance(1);
        self.events.push_back(EngineEvent::ClientInit { shared });

        let init = ServerInit {
            framebuffer_width: self.fb_width,
            framebuffer_height: self.fb_height,
            pixel_format: self.pixel_format.clone(),
            name: self.desktop_name.clone(),
        };
        init.write_to(&mut self.outbound);
        self.state = PeerState::Steady;
        self.events.push_back(EngineEvent::HandshakeComplete);
        Ok(true)
    }

    fn process_server_init(&mut self) -> Result<bool, SessionError> {
        let (consumed, init) = {
            let mut reader = WireReader::new(&self.inbound[..]);
            match ServerInit::read_from(&mut reader) {
                Ok(init) => (reader.consumed(), init),
                Err(WireError::NeedMore) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        };
        self.inbound.advance(consumed);
        if !init.pixel_format.is_valid() {
            return Err(SessionError::Decode(
                "ServerInit carries an invalid pixel format".into(),
            ));
        }
        self.fb_width = init.framebuffer_width;
        self.fb_height = init.framebuffer_height;
        self.pixel_format = init.pixel_format.clone();
        self.desktop_name = init.name.clone();
        self.events.push_back(EngineEvent::ServerInit {
            width: init.framebuffer_width,
            height: init.framebuffer_height,
            name: init.name,
            format: init.pixel_format,
        });
        self.state = PeerState::Steady;
        self.events.push_back(EngineEvent::HandshakeComplete);
        Ok(true)
    }

    // ── Steady state, server role ────────────────────────────────

    fn process_client_message(&mut self) -> Result<bool, SessionError> {
        let Some(&msg_type) = self.inbound.first() else {
            return Ok(false);
        };
        match msg_type {
            CLIENT_MSG_SET_PIXEL_FORMAT => {
                let (consumed, format) = {
                    let mut reader = WireReader::new(&self.inbound[1..]);
                    match reader
                        .skip(3)
                        .and_then(|()| PixelFormat::read_from(&mut reader))
                    {
                        Ok(f) => (1 + reader.consumed(), f),
                        Err(WireError::NeedMore) => return Ok(false),
                        Err(e) => return Err(e.into()),
                    }
                };
                self.inbound.advance(consumed);
                if !format.is_valid() {
                    return Err(SessionError::Decode(format!(
                        "client requested invalid pixel format ({}bpp depth {})",
                        format.bits_per_pixel, format.depth
                    )));
                }
                self.pixel_format = format.clone();
                self.events.push_back(EngineEvent::SetPixelFormat(format));
                Ok(true)
            }
            CLIENT_MSG_SET_ENCODINGS => {
                let (consumed, requested) = {
                    let mut reader = WireReader::new(&self.inbound[1..]);
                    let mut parse = || -> Result<Vec<i32>, WireError> {
                        reader.skip(1)?;
                        let count = reader.read_u16()?;
                        let mut list = Vec::with_capacity(usize::from(count));
                        for _ in 0..count {
                            list.push(reader.read_i32()?);
                        }
                        Ok(list)
                    };
                    match parse() {
                        Ok(list) => (1 + reader.consumed(), list),
                        Err(WireError::NeedMore) => return Ok(false),
                        Err(e) => return Err(e.into()),
                    }
                };
                self.inbound.advance(consumed);

                let mut agreed = Vec::with_capacity(requested.len());
                for enc in requested {
                    if encoding::is_supported(enc) {
                        agreed.push(enc);
                    } else {
                        // Silently dropped from the agreed list; worth a
                        // trace but not an error.
                        log::debug!("dropping unsupported encoding {enc} from client list");
                    }
                }
                // Raw stays as the implicit fallback even when the
                // client sends an empty or fully unsupported list.
                if !agreed.contains(&ENCODING_RAW) {
                    agreed.push(ENCODING_RAW);
                }
                self.encodings = agreed.clone();
                self.events.push_back(EngineEvent::SetEncodings(agreed));
                Ok(true)
            }
            CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST => {
                if self.inbound.len() < 10 {
                    return Ok(false);
                }
                let mut reader = WireReader::new(&self.inbound[1..10]);
                let incremental = reader.read_u8().map_err(SessionError::from)? != 0;
                let x = reader.read_u16().map_err(SessionError::from)?;
                let y = reader.read_u16().map_err(SessionError::from)?;
                let width = reader.read_u16().map_err(SessionError::from)?;
                let height = reader.read_u16().map_err(SessionError::from)?;
                self.inbound.advance(10);
                self.events.push_back(EngineEvent::UpdateRequest {
                    region: DirtyRegion::new(x, y, width, height),
                    incremental,
                });
                Ok(true)
            }
            CLIENT_MSG_KEY_EVENT => {
                if self.inbound.len() < 8 {
                    return Ok(false);
                }
                let down = self.inbound[1] != 0;
                let keysym = u32::from_be_bytes([
                    self.inbound[4],
                    self.inbound[5],
                    self.inbound[6],
                    self.inbound[7],
                ]);
                self.inbound.advance(8);
                self.events.push_back(EngineEvent::KeyEvent { keysym, down });
                Ok(true)
            }
            CLIENT_MSG_POINTER_EVENT => {
                if self.inbound.len() < 6 {
                    return Ok(false);
                }
                let buttons = self.inbound[1];
                let x = u16::from_be_bytes([self.inbound[2], self.inbound[3]]);
                let y = u16::from_be_bytes([self.inbound[4], self.inbound[5]]);
                self.inbound.advance(6);
                self.events
                    .push_back(EngineEvent::PointerEvent { x, y, buttons });
                Ok(true)
            }
            CLIENT_MSG_CLIENT_CUT_TEXT => {
                let (consumed, text) = {
                    let mut reader = WireReader::new(&self.inbound[1..]);
                    let mut parse = || -> Result<String, WireError> {
                        reader.skip(3)?;
                        let len = reader.read_u32()? as usize;
                        if len > MAX_CUT_TEXT {
                            return Err(WireError::Invalid(format!(
                                "cut text of {len} bytes exceeds limit"
                            )));
                        }
                        let bytes = reader.take(len)?;
                        // Cut text is Latin-1, not UTF-8.
                        Ok(bytes.iter().map(|&b| b as char).collect())
                    };
                    match parse() {
                        Ok(text) => (1 + reader.consumed(), text),
                        Err(WireError::NeedMore) => return Ok(false),
                        Err(e) => return Err(e.into()),
                    }
                };
                self.inbound.advance(consumed);
                self.events.push_back(EngineEvent::CutText(text));
                Ok(true)
            }
            other => Err(SessionError::Decode(format!(
                "unknown client message type {other}"
            ))),
        }
    }

    // ── Steady state, client role ────────────────────────────────

    fn process_server_message(&mut self) -> Result<bool, SessionError> {
        // Finish the update in progress before demultiplexing again.
        if self.pending_rects > 0 {
            return self.process_update_rect();
        }
        let Some(&msg_type) = self.inbound.first() else {
            return Ok(false);
        };
        match msg_type {
            SERVER_MSG_FRAMEBUFFER_UPDATE => {
                if self.inbound.len() < 4 {
                    return Ok(false);
                }
                let count = u16::from_be_bytes([self.inbound[2], self.inbound[3]]);
                self.inbound.advance(4);
                self.pending_rects = count;
                if count == 0 {
                    self.events.push_back(EngineEvent::UpdateComplete);
                }
                Ok(true)
            }
            SERVER_MSG_SET_COLOUR_MAP_ENTRIES => {
                if self.inbound.len() < 6 {
                    return Ok(false);
                }
                let first = u16::from_be_bytes([self.inbound[2], self.inbound[3]]);
                let count = u16::from_be_bytes([self.inbound[4], self.inbound[5]]);
                let total = 6 + usize::from(count) * 6;
                if self.inbound.len() < total {
                    return Ok(false);
                }
                self.inbound.advance(total);
                self.events.push_back(EngineEvent::ColourMap { first, count });
                Ok(true)
            }
            SERVER_MSG_BELL => {
                self.inbound.advance(1);
                self.events.push_back(EngineEvent::Bell);
                Ok(true)
            }
            SERVER_MSG_SERVER_CUT_TEXT => {
                let (consumed, text) = {
                    let mut reader = WireReader::new(&self.inbound[1..]);
                    let mut parse = || -> Result<String, WireError> {
                        reader.skip(3)?;
                        let len = reader.read_u32()? as usize;
                        if len > MAX_CUT_TEXT {
                            return Err(WireError::Invalid(format!(
                                "cut text of {len} bytes exceeds limit"
                            )));
                        }
                        let bytes = reader.take(len)?;
                        Ok(bytes.iter().map(|&b| b as char).collect())
                    };
                    match parse() {
                        Ok(text) => (1 + reader.consumed(), text),
                        Err(WireError::NeedMore) => return Ok(false),
                        Err(e) => return Err(e.into()),
                    }
                };
                self.inbound.advance(consumed);
                self.events.push_back(EngineEvent::CutText(text));
                Ok(true)
            }
            other => Err(SessionError::Decode(format!(
                "unknown server message type {other}, framing lost"
            ))),
        }
    }

    fn process_update_rect(&mut self) -> Result<bool, SessionError> {
        // Parse the 12-byte header first if it is still outstanding.
        let rect = match self.current_rect {
            Some(rect) => rect,
            None => {
                let (consumed, rect) = {
                    let mut reader = WireReader::new(&self.inbound[..]);
                    match Rectangle::read_header(&mut reader) {
                        Ok(rect) => (reader.consumed(), rect),
                        Err(WireError::NeedMore) => return Ok(false),
                        Err(e) => return Err(e.into()),
                    }
                };
                self.inbound.advance(consumed);
                self.current_rect = Some(rect);
                rect
            }
        };

        let payload_len = match encoding::payload_length(
            rect.encoding,
            rect.width,
            rect.height,
            &self.pixel_format,
            &self.inbound[..],
        )? {
            Some(len) => len,
            None => return Ok(false),
        };
        if self.inbound.len() < payload_len {
            return Ok(false);
        }
        let payload = self.inbound.split_to(payload_len).freeze();
        self.current_rect = None;
        self.pending_rects -= 1;

        match rect.encoding {
            ENCODING_DESKTOP_SIZE => {
                if rect.width == 0 && rect.height == 0 {
                    return Err(SessionError::Decode(
                        "DesktopSize rectangle with zero dimensions".into(),
                    ));
                }
                self.fb_width = rect.width;
                self.fb_height = rect.height;
                self.events.push_back(EngineEvent::DesktopResized {
                    width: rect.width,
                    height: rect.height,
                });
            }
            ENCODING_CURSOR => {
                self.events.push_back(EngineEvent::CursorShape {
                    hotspot_x: rect.x,
                    hotspot_y: rect.y,
                    width: rect.width,
                    height: rect.height,
                    payload,
                });
            }
            _ => {
                self.events.push_back(EngineEvent::RectData { rect, payload });
            }
        }

        if self.pending_rects == 0 {
            self.events.push_back(EngineEvent::UpdateComplete);
        }
        Ok(true)
    }

    // ── Emitters, server role ────────────────────────────────────

    fn require_steady(&self, what: &str) -> Result<(), SessionError> {
        if self.state != PeerState::Steady {
            return Err(SessionError::StateViolation(format!(
                "{what} is only legal in steady state, not {:?}",
                self.state
            )));
        }
        Ok(())
    }

    /// Frames a FramebufferUpdate from already-encoded rectangles.
    pub fn send_framebuffer_update(&mut self, rects: &[EncodedRect]) -> Result<(), SessionError> {
        self.require_steady("FramebufferUpdate")?;
        self.outbound.put_u8(SERVER_MSG_FRAMEBUFFER_UPDATE);
        self.outbound.put_u8(0); // padding
        self.outbound.put_u16(rects.len() as u16);
        for rect in rects {
            Rectangle {
                x: rect.x,
                y: rect.y,
                width: rect.width,
                height: rect.height,
                encoding: rect.encoding,
            }
            .write_header(&mut self.outbound);
            self.outbound.put_slice(&rect.payload);
        }
        Ok(())
    }

    /// Rings the client's bell.
    pub fn send_bell(&mut self) -> Result<(), SessionError> {
        self.require_steady("Bell")?;
        self.outbound.put_u8(SERVER_MSG_BELL);
        Ok(())
    }

    /// Sends clipboard text to the client.
    pub fn send_server_cut_text(&mut self, text: &str) -> Result<(), SessionError> {
        self.require_steady("ServerCutText")?;
        self.outbound.put_u8(SERVER_MSG_SERVER_CUT_TEXT);
        self.outbound.put_bytes(0, 3);
        put_latin1(&mut self.outbound, text);
        Ok(())
    }

    // ── Emitters, client role ────────────────────────────────────

    /// Requests a new pixel format and adopts it for future payloads.
    pub fn send_set_pixel_format(&mut self, format: &PixelFormat) -> Result<(), SessionError> {
        self.require_steady("SetPixelFormat")?;
        self.outbound.put_u8(CLIENT_MSG_SET_PIXEL_FORMAT);
        self.outbound.put_bytes(0, 3);
        format.write_to(&mut self.outbound);
        self.pixel_format = format.clone();
        Ok(())
    }

    /// Announces the encodings this client accepts, most preferred
    /// first.
    pub fn send_set_encodings(&mut self, encodings: &[i32]) -> Result<(), SessionError> {
        self.require_steady("SetEncodings")?;
        self.outbound.put_u8(CLIENT_MSG_SET_ENCODINGS);
        self.outbound.put_u8(0); // padding
        self.outbound.put_u16(encodings.len() as u16);
        for &enc in encodings {
            self.outbound.put_i32(enc);
        }
        Ok(())
    }

    /// Requests a framebuffer update for a region.
    pub fn send_update_request(
        &mut self,
        region: DirtyRegion,
        incremental: bool,
    ) -> Result<(), SessionError> {
        self.require_steady("FramebufferUpdateRequest")?;
        self.outbound.put_u8(CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST);
        self.outbound.put_u8(u8::from(incremental));
        self.outbound.put_u16(region.x);
        self.outbound.put_u16(region.y);
        self.outbound.put_u16(region.width);
        self.outbound.put_u16(region.height);
        Ok(())
    }

    /// Sends a key press or release.
    pub fn send_key_event(&mut self, keysym: u32, down: bool) -> Result<(), SessionError> {
        self.require_steady("KeyEvent")?;
        self.outbound.put_u8(CLIENT_MSG_KEY_EVENT);
        self.outbound.put_u8(u8::from(down));
        self.outbound.put_bytes(0, 2);
        self.outbound.put_u32(keysym);
        Ok(())
    }

    /// Sends pointer position and button state.
    pub fn send_pointer_event(&mut self, x: u16, y: u16, buttons: u8) -> Result<(), SessionError> {
        self.require_steady("PointerEvent")?;
        self.outbound.put_u8(CLIENT_MSG_POINTER_EVENT);
        self.outbound.put_u8(buttons);
        self.outbound.put_u16(x);
        self.outbound.put_u16(y);
        Ok(())
    }

    /// Sends clipboard text to the server.
    pub fn send_client_cut_text(&mut self, text: &str) -> Result<(), SessionError> {
        self.require_steady("ClientCutText")?;
        self.outbound.put_u8(CLIENT_MSG_CLIENT_CUT_TEXT);
        self.outbound.put_bytes(0, 3);
        put_latin1(&mut self.outbound, text);
        Ok(())
    }
}

/// Writes a 32-bit length-prefixed Latin-1 string. Characters outside
/// Latin-1 degrade to '?'.
fn put_latin1(buf: &mut BytesMut, text: &str) {
    let bytes: Vec<u8> = text
        .chars()
        .map(|c| if (c as u32) < 256 { c as u8 } else { b'?' })
        .collect();
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(&bytes);
}

/// Parses "RFB 0MM.mmm\n" and returns the minor version.
fn parse_version(bytes: &[u8; 12]) -> Result<u32, SessionError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| SessionError::Decode("version string is not ASCII".into()))?;
    if !text.starts_with("RFB ") || !text.ends_with('\n') || text.as_bytes()[7] != b'.' {
        return Err(SessionError::Decode(format!(
            "malformed version string {text:?}"
        )));
    }
    let major: u32 = text[4..7]
        .parse()
        .map_err(|_| SessionError::Decode("malformed major version".into()))?;
    let minor: u32 = text[8..11]
        .parse()
        .map_err(|_| SessionError::Decode("malformed minor version".into()))?;
    if major != 3 {
        return Err(SessionError::StateViolation(format!(
            "unsupported major version {major}"
        )));
    }
    Ok(minor)
}
