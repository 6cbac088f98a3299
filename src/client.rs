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

//! Per-client server session.
//!
//! One handler task per connected client owns the stream and a
//! server-role [`ProtocolEngine`], pumps bytes in both directions, and
//! answers update requests from the shared framebuffer. The handler
//! holds handles to shared state (framebuffer, input sink, its own
//! dirty set) rather than a pointer back to the server aggregate; the
//! capture loop reaches the handler only through the dirty set and the
//! command channel.
//!
//! # Update dispatch
//!
//! A FramebufferUpdate is emitted only in answer to the client's
//! pending request. A non-incremental request is served in full from
//! the current snapshot; an incremental request waits until the dirty
//! set intersects the requested region. Sent rectangles are removed
//! from the dirty set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Instant, SystemTime};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::encoding::{self, zrle::ZrleEncoder};
use crate::engine::{EncodedRect, EngineEvent, ProtocolEngine};
use crate::error::SessionError;
use crate::events::ServerEvent;
use crate::framebuffer::{DirtyRegion, Framebuffer};
use crate::pixel::{self, PixelFormat};
use crate::protocol::{ENCODING_DESKTOP_SIZE, ENCODING_ZRLE};
use crate::traits::InputSink;

/// How often the handler checks for dispatchable updates and idle
/// timeouts.
const CHECK_INTERVAL_MS: u64 = 16;

/// Snapshot of one client's connection state, for status queries.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Unique client identifier.
    pub id: usize,
    /// Remote address as "host:port".
    pub address: String,
    /// When the connection was accepted.
    pub connected_at: SystemTime,
    /// Whether the handshake (including authentication) completed.
    pub authenticated: bool,
}

/// Commands the controller sends into a client handler.
pub(crate) enum ClientCommand {
    /// Send clipboard text to this client.
    CutText(String),
    /// Ring this client's bell.
    Bell,
    /// Announce new framebuffer dimensions with the next update.
    Resize {
        width: u16,
        height: u16,
    },
    /// Close the session.
    Disconnect,
}

/// Shared per-client state registered with the controller.
///
/// The capture loop pushes dirty regions in; the handler drains them
/// when it dispatches an update. The controller uses the command
/// channel for clipboard, bell, resize and disconnect.
pub struct ClientHandle {
    /// Unique client identifier.
    pub id: usize,
    /// Remote address as "host:port".
    pub address: String,
    connected_at: SystemTime,
    authenticated: AtomicBool,
    dirty: StdMutex<Vec<DirtyRegion>>,
    commands: mpsc::UnboundedSender<ClientCommand>,
}

impl ClientHandle {
    pub(crate) fn new(
        id: usize,
        address: String,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ClientCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(Self {
            id,
            address,
            connected_at: SystemTime::now(),
            authenticated: AtomicBool::new(false),
            dirty: StdMutex::new(Vec::new()),
            commands: tx,
        });
        (handle, rx)
    }

    /// Current state snapshot.
    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            id: self.id,
            address: self.address.clone(),
            connected_at: self.connected_at,
            authenticated: self.authenticated.load(Ordering::Relaxed),
        }
    }

    /// Unions new dirty regions into this client's set. Called by the
    /// capture loop after every snapshot diff.
    pub(crate) fn push_dirty(&self, regions: &[DirtyRegion]) {
        if regions.is_empty() {
            return;
        }
        let mut dirty = self.dirty.lock().expect("dirty set lock poisoned");
        dirty.extend_from_slice(regions);
    }

    pub(crate) fn send_command(&self, command: ClientCommand) {
        let _ = self.commands.send(command);
    }
}

/// Everything a handler needs from the controller, passed by handle
/// rather than back-pointer.
pub(crate) struct SessionContext {
    pub framebuffer: Framebuffer,
    pub config: ServerConfig,
    pub input: Arc<StdMutex<Box<dyn InputSink>>>,
    pub events: mpsc::UnboundedSender<ServerEvent>,
}

/// The client's most recent FramebufferUpdateRequest. At most one is
/// outstanding; a new request replaces an unsatisfied one.
struct PendingRequest {
    region: DirtyRegion,
    incremental: bool,
}

/// Runs one client session to completion. Returns when the client
/// closes the connection or the controller asks for a disconnect, and
/// returns an error for every fatal protocol condition.
pub(crate) async fn run_client_session<S>(
    stream: S,
    handle: Arc<ClientHandle>,
    mut commands: mpsc::UnboundedReceiver<ClientCommand>,
    ctx: SessionContext,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let engine = ProtocolEngine::server(
        ctx.config.screen_width,
        ctx.config.screen_height,
        ctx.config.pixel_format.clone(),
        ctx.config.desktop_name.clone(),
        ctx.config.password.clone(),
    );
    let (reader, writer) = tokio::io::split(stream);
    let mut session = ClientSession {
        engine,
        reader,
        writer,
        handle,
        ctx,
        zrle: ZrleEncoder::new(),
        pending: None,
        resize_pending: None,
        last_buttons: 0,
        read_buf: BytesMut::with_capacity(4096),
    };

    session.handshake().await?;
    session.steady_loop(&mut commands).await
}

struct ClientSession<S> {
    engine: ProtocolEngine,
    reader: tokio::io::ReadHalf<S>,
    writer: tokio::io::WriteHalf<S>,
    handle: Arc<ClientHandle>,
    ctx: SessionContext,
    zrle: ZrleEncoder,
    pending: Option<PendingRequest>,
    resize_pending: Option<(u16, u16)>,
    last_buttons: u8,
    read_buf: BytesMut,
}

impl<S> ClientSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Writes everything the engine has produced. Never called while a
    /// lock is held.
    async fn flush(&mut self) -> Result<(), SessionError> {
        if self.engine.has_outbound() {
            let bytes = self.engine.take_outbound();
            self.writer.write_all(&bytes).await?;
        }
        Ok(())
    }

    /// Reads at least one byte into the buffer, treating EOF as a
    /// transport error during handshake.
    async fn read_some(&mut self) -> Result<usize, SessionError> {
        let n = self.reader.read_buf(&mut self.read_buf).await?;
        Ok(n)
    }

    /// Feeds buffered bytes to the engine. On failure the engine's
    /// final output (an auth failure reason, for instance) is flushed
    /// before the error propagates; nothing is written afterwards.
    async fn feed_buffered(&mut self) -> Result<(), SessionError> {
        let data = self.read_buf.split();
        match self.engine.feed(&data) {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = self.flush().await;
                Err(err)
            }
        }
    }

    async fn handshake(&mut self) -> Result<(), SessionError> {
        let timeout = self.ctx.config.handshake_timeout;
        let phase = async {
            self.flush().await?; // version greeting
            while !self.engine.is_steady() {
                if self.read_some().await? == 0 {
                    return Err(SessionError::Transport(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "peer closed during handshake",
                    )));
                }
                self.feed_buffered().await?;
                self.pump_events();
                self.flush().await?;
            }
            Ok(())
        };
        tokio::time::timeout(timeout, phase)
            .await
            .map_err(|_| SessionError::Timeout(timeout))?
    }

    async fn steady_loop(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<ClientCommand>,
    ) -> Result<(), SessionError> {
        let mut check = tokio::time::interval(std::time::Duration::from_millis(CHECK_INTERVAL_MS));
        let mut last_activity = Instant::now();

        loop {
            tokio::select! {
                result = self.reader.read_buf(&mut self.read_buf) => {
                    if result? == 0 {
                        // Clean close from the client.
                        return Ok(());
                    }
                    last_activity = Instant::now();
                    self.feed_buffered().await?;
                    self.pump_events();
                    self.maybe_dispatch().await?;
                    self.flush().await?;
                }
                _ = check.tick() => {
                    if last_activity.elapsed() > self.ctx.config.idle_timeout {
                        return Err(SessionError::Timeout(self.ctx.config.idle_timeout));
                    }
                    self.maybe_dispatch().await?;
                    self.flush().await?;
                }
                command = commands.recv() => {
                    match command {
                        None | Some(ClientCommand::Disconnect) => return Ok(()),
                        Some(ClientCommand::CutText(text)) => {
                            self.engine.send_server_cut_text(&text)?;
                            self.flush().await?;
                        }
                        Some(ClientCommand::Bell) => {
                            self.engine.send_bell()?;
                            self.flush().await?;
                        }
                        Some(ClientCommand::Resize { width, height }) => {
                            self.resize_pending = Some((width, height));
                        }
                    }
                }
            }
        }
    }

    /// Drains engine events: input forwarding, request bookkeeping,
    /// embedder notifications.
    fn pump_events(&mut self) {
        while let Some(event) = self.engine.poll_event() {
            match event {
                EngineEvent::HandshakeComplete => {
                    self.handle.authenticated.store(true, Ordering::Relaxed);
                    log::info!(
                        "client {} ({}) completed handshake",
                        self.handle.id,
                        self.handle.address
                    );
                    let _ = self.ctx.events.send(ServerEvent::ClientConnected {
                        id: self.handle.id,
                        address: self.handle.address.clone(),
                    });
                }
                EngineEvent::ClientInit { shared } => {
                    // Exclusive-access policy is not enforced; all
                    // sessions are shared.
                    log::debug!("client {} requested shared={shared}", self.handle.id);
                }
                EngineEvent::SetPixelFormat(format) => {
                    log::debug!(
                        "client {} set pixel format to {}bpp",
                        self.handle.id,
                        format.bits_per_pixel
                    );
                }
                EngineEvent::SetEncodings(list) => {
                    log::debug!("client {} agreed encodings {list:?}", self.handle.id);
                }
                EngineEvent::UpdateRequest { region, incremental } => {
                    // A new request supersedes an unsatisfied one.
                    self.pending = Some(PendingRequest { region, incremental });
                }
                EngineEvent::KeyEvent { keysym, down } => {
                    {
                        let mut sink = self.ctx.input.lock().expect("input sink lock poisoned");
                        sink.key(keysym, down);
                    }
                    let _ = self.ctx.events.send(ServerEvent::KeyEvent {
                        client_id: self.handle.id,
                        keysym,
                        down,
                    });
                }
                EngineEvent::PointerEvent { x, y, buttons } => {
                    {
                        let mut sink = self.ctx.input.lock().expect("input sink lock poisoned");
                        sink.pointer_move(x, y);
                        // Mask transitions imply press and release.
                        if buttons != self.last_buttons {
                            sink.pointer_buttons(x, y, buttons);
                        }
                    }
                    self.last_buttons = buttons;
                    let _ = self.ctx.events.send(ServerEvent::PointerEvent {
                        client_id: self.handle.id,
                        x,
                        y,
                        buttons,
                    });
                }
                EngineEvent::CutText(text) => {
                    let _ = self.ctx.events.send(ServerEvent::CutText {
                        client_id: self.handle.id,
                        text,
                    });
                }
                other => {
                    log::debug!(
                        "client {} produced unexpected engine event {other:?}",
                        self.handle.id
                    );
                }
            }
        }
    }

    /// Sends a FramebufferUpdate when the pending request can be
    /// satisfied.
    async fn maybe_dispatch(&mut self) -> Result<(), SessionError> {
        if !self.engine.is_steady() {
            return Ok(());
        }
        let Some(request) = self.pending.as_ref() else {
            return Ok(());
        };

        let (fb_width, fb_height) = self.ctx.framebuffer.dimensions().await;
        let Some(bounded) = request.region.clamp(fb_width, fb_height) else {
            // A zero-area or out-of-bounds request is a no-op, not an
            // error.
            self.pending = None;
            return Ok(());
        };
        let incremental = request.incremental;

        // Collect the regions this update will carry and drain them
        // from the dirty set.
        let regions: Vec<DirtyRegion> = {
            let mut dirty = self
                .handle
                .dirty
                .lock()
                .expect("dirty set lock poisoned");
            if incremental {
                let hits: Vec<DirtyRegion> = dirty
                    .iter()
                    .filter_map(|d| d.intersect(&bounded))
                    .collect();
                if hits.is_empty() && self.resize_pending.is_none() {
                    // Defer until something inside the region changes.
                    return Ok(());
                }
                *dirty = dirty
                    .iter()
                    .flat_map(|d| d.subtract(&bounded))
                    .collect();
                hits
            } else {
                // Full refresh of the requested region from the
                // current snapshot, regardless of the dirty set.
                *dirty = dirty
                    .iter()
                    .flat_map(|d| d.subtract(&bounded))
                    .collect();
                vec![bounded]
            }
        };

        let mut rects = Vec::with_capacity(regions.len() + 1);

        // A pending resize is announced before any pixel rectangle.
        if let Some((width, height)) = self.resize_pending.take() {
            if self.engine.peer_accepts(ENCODING_DESKTOP_SIZE) {
                rects.push(EncodedRect {
                    x: 0,
                    y: 0,
                    width,
                    height,
                    encoding: ENCODING_DESKTOP_SIZE,
                    payload: bytes::Bytes::new(),
                });
            }
        }

        let client_format = self.engine.pixel_format().clone();
        let encoding = self.engine.choose_encoding();
        for region in regions {
            rects.push(
                self.encode_region(region, encoding, &client_format)
                    .await?,
            );
        }

        if rects.is_empty() {
            // Nothing to say after all (a resize the client cannot
            // understand); keep the request pending for future dirt.
            return Ok(());
        }
        self.engine.send_framebuffer_update(&rects)?;
        self.pending = None;
        Ok(())
    }

    /// Reads a region from the shared framebuffer, translates it to
    /// the client's pixel format, and encodes it. The framebuffer lock
    /// is released before any byte is written.
    async fn encode_region(
        &mut self,
        region: DirtyRegion,
        encoding: i32,
        client_format: &PixelFormat,
    ) -> Result<EncodedRect, SessionError> {
        let native = self
            .ctx
            .framebuffer
            .get_rect(region.x, region.y, region.width, region.height)
            .await?;
        let translated =
            pixel::translate_pixels(&native, &self.ctx.config.pixel_format, client_format);

        let payload = if encoding == ENCODING_ZRLE {
            self.zrle
                .encode(&translated, region.width, region.height, client_format)?
                .freeze()
        } else {
            match encoding::get_encoder(encoding) {
                Some(encoder) => encoder
                    .encode(&translated, region.width, region.height, client_format)
                    .freeze(),
                None => {
                    // The agreed list only contains implemented
                    // encodings, so this is a bookkeeping bug; fall
                    // back to Raw rather than kill the session.
                    log::error!("no encoder for agreed encoding {encoding}, sending raw");
                    translated.freeze()
                }
            }
        };
        let actual_encoding = if encoding == ENCODING_ZRLE || encoding::get_encoder(encoding).is_some()
        {
            encoding
        } else {
            crate::protocol::ENCODING_RAW
        };

        Ok(EncodedRect {
            x: region.x,
            y: region.y,
            width: region.width,
            height: region.height,
            encoding: actual_encoding,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_reports_connection_state() {
        let (handle, _rx) = ClientHandle::new(7, "10.0.0.2:41234".to_string());
        let info = handle.info();
        assert_eq!(info.id, 7);
        assert_eq!(info.address, "10.0.0.2:41234");
        assert!(!info.authenticated);

        handle.authenticated.store(true, Ordering::Relaxed);
        assert!(handle.info().authenticated);
    }

    #[test]
    fn push_dirty_accumulates() {
        let (handle, _rx) = ClientHandle::new(1, "a".to_string());
        handle.push_dirty(&[DirtyRegion::new(0, 0, 4, 4)]);
        handle.push_dirty(&[DirtyRegion::new(4, 0, 4, 4)]);
        assert_eq!(handle.dirty.lock().unwrap().len(), 2);
        handle.push_dirty(&[]);
        assert_eq!(handle.dirty.lock().unwrap().len(), 2);
    }
}
