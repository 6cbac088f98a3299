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

//! Viewer session controller.
//!
//! A [`VncViewer`] drives the client end of one RFB session: it
//! connects, completes the handshake, decodes framebuffer updates into
//! a local pixel buffer, and forwards input events upstream. Embedders
//! watch the [`ViewerEvent`] channel and read pixels from the shared
//! framebuffer handle; nothing here renders anything.
//!
//! The session keeps one persistent ZRLE inflater for its whole
//! lifetime, as the protocol requires, and tracks the remote cursor
//! shape delivered through the Cursor pseudo-encoding.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::config::ViewerConfig;
use crate::encoding::{hextile, raw, rre, zrle::ZrleDecoder};
use crate::engine::{EngineEvent, ProtocolEngine};
use crate::error::SessionError;
use crate::events::ViewerEvent;
use crate::framebuffer::{DirtyRegion, Framebuffer};
use crate::pixel::PixelFormat;
use crate::protocol::{
    Rectangle, ENCODING_COPYRECT, ENCODING_HEXTILE, ENCODING_RAW, ENCODING_RRE, ENCODING_ZRLE,
};

/// The remote cursor shape, as delivered by the Cursor
/// pseudo-encoding.
#[derive(Debug, Clone)]
pub struct CursorShape {
    /// Hotspot x within the cursor image.
    pub hotspot_x: u16,
    /// Hotspot y within the cursor image.
    pub hotspot_y: u16,
    /// Cursor width in pixels.
    pub width: u16,
    /// Cursor height in pixels.
    pub height: u16,
    /// Cursor pixels in the session pixel format.
    pub pixels: Vec<u8>,
    /// One-bit transparency mask, rows padded to whole bytes.
    pub mask: Vec<u8>,
}

enum ViewerCommand {
    Key { keysym: u32, down: bool },
    Pointer { x: u16, y: u16, buttons: u8 },
    Clipboard(String),
    Disconnect,
}

/// Handle to a running viewer session.
pub struct VncViewer {
    framebuffer: Framebuffer,
    cursor: Arc<StdMutex<Option<CursorShape>>>,
    commands: mpsc::UnboundedSender<ViewerCommand>,
}

impl VncViewer {
    /// Connects to the configured host, completes the handshake, and
    /// starts the session task.
    ///
    /// Returns once the session reached steady state; the returned
    /// receiver starts with the `Connected` event.
    ///
    /// # Errors
    ///
    /// Connection, handshake and authentication failures surface here;
    /// later failures arrive as `Disconnected` events.
    pub async fn connect(
        config: ViewerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ViewerEvent>), SessionError> {
        let stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
        stream.set_nodelay(true)?;
        Self::from_stream(stream, config).await
    }

    /// Runs a viewer session over any bidirectional stream, for custom
    /// transports and tests.
    pub async fn from_stream<S>(
        stream: S,
        config: ViewerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ViewerEvent>), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut engine = ProtocolEngine::client(config.password.clone(), config.shared);
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut read_buf = BytesMut::with_capacity(4096);

        // Drive the handshake to steady state under its own tighter
        // timeout.
        let handshake = async {
            while !engine.is_steady() {
                let n = reader.read_buf(&mut read_buf).await?;
                if n == 0 {
                    return Err(SessionError::Transport(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "server closed during handshake",
                    )));
                }
                let data = read_buf.split();
                engine.feed(&data)?;
                if engine.has_outbound() {
                    writer.write_all(&engine.take_outbound()).await?;
                }
            }
            Ok(())
        };
        tokio::time::timeout(config.handshake_timeout, handshake)
            .await
            .map_err(|_| SessionError::Timeout(config.handshake_timeout))??;

        // The handshake queued ServerInit and HandshakeComplete.
        let mut init = None;
        while let Some(event) = engine.poll_event() {
            if let EngineEvent::ServerInit {
                width,
                height,
                name,
                format,
            } = event
            {
                init = Some((width, height, name, format));
            }
        }
        let (width, height, name, server_format) = init.ok_or_else(|| {
            SessionError::StateViolation("handshake finished without ServerInit".into())
        })?;
        log::info!("connected to \"{name}\" ({width}x{height}, {}bpp native)", server_format.bits_per_pixel);

        // Normalize the session to the local working format, announce
        // our encodings, and ask for the first full frame.
        let format = PixelFormat::rgb32();
        engine.send_set_pixel_format(&format)?;
        engine.send_set_encodings(&config.preferred_encodings)?;
        engine.send_update_request(DirtyRegion::full(width, height), false)?;
        writer.write_all(&engine.take_outbound()).await?;

        let framebuffer = Framebuffer::new(width, height, format.bytes_per_pixel());
        let cursor = Arc::new(StdMutex::new(None));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let _ = event_tx.send(ViewerEvent::Connected {
            width,
            height,
            name,
        });

        let session = ViewerSession {
            engine,
            reader,
            writer,
            framebuffer: framebuffer.clone(),
            cursor: cursor.clone(),
            zrle: ZrleDecoder::new(),
            format,
            event_tx,
            idle_timeout: config.idle_timeout,
            read_buf,
        };
        tokio::spawn(session.run(command_rx));

        Ok((
            Self {
                framebuffer,
                cursor,
                commands: command_tx,
            },
            event_rx,
        ))
    }

    /// The local framebuffer the session decodes into.
    pub fn framebuffer(&self) -> Framebuffer {
        self.framebuffer.clone()
    }

    /// The current remote cursor shape, when one has been received.
    pub fn cursor(&self) -> Option<CursorShape> {
        self.cursor.lock().expect("cursor lock poisoned").clone()
    }

    /// Queues a key press or release. Silently dropped after
    /// disconnect.
    pub fn send_key(&self, keysym: u32, down: bool) {
        let _ = self.commands.send(ViewerCommand::Key { keysym, down });
    }

    /// Queues a pointer event.
    pub fn send_pointer(&self, x: u16, y: u16, buttons: u8) {
        let _ = self.commands.send(ViewerCommand::Pointer { x, y, buttons });
    }

    /// Queues clipboard text for the server.
    pub fn send_clipboard(&self, text: String) {
        let _ = self.commands.send(ViewerCommand::Clipboard(text));
    }

    /// Ends the session.
    pub fn disconnect(&self) {
        let _ = self.commands.send(ViewerCommand::Disconnect);
    }
}

struct ViewerSession<S> {
    engine: ProtocolEngine,
    reader: tokio::io::ReadHalf<S>,
    writer: tokio::io::WriteHalf<S>,
    framebuffer: Framebuffer,
    cursor: Arc<StdMutex<Option<CursorShape>>>,
    zrle: ZrleDecoder,
    format: PixelFormat,
    event_tx: mpsc::UnboundedSender<ViewerEvent>,
    idle_timeout: std::time::Duration,
    read_buf: BytesMut,
}

impl<S> ViewerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ViewerCommand>) {
        let reason = match self.pump(&mut commands).await {
            Ok(reason) => reason,
            Err(err) => err.to_string(),
        };
        log::info!("viewer session ended: {reason}");
        let _ = self.event_tx.send(ViewerEvent::Disconnected { reason });
    }

    async fn pump(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<ViewerCommand>,
    ) -> Result<String, SessionError> {
        let mut check = tokio::time::interval(std::time::Duration::from_secs(1));
        let mut last_activity = Instant::now();

        loop {
            tokio::select! {
                result = self.reader.read_buf(&mut self.read_buf) => {
                    if result? == 0 {
                        return Ok("server closed the connection".to_string());
                    }
                    last_activity = Instant::now();
                    let data = self.read_buf.split();
                    self.engine.feed(&data)?;
                    self.apply_events().await?;
                    self.flush().await?;
                }
                _ = check.tick() => {
                    if last_activity.elapsed() > self.idle_timeout {
                        return Err(SessionError::Timeout(self.idle_timeout));
                    }
                }
                command = commands.recv() => {
                    match command {
                        None | Some(ViewerCommand::Disconnect) => {
                            return Ok("disconnected by embedder".to_string());
                        }
                        Some(ViewerCommand::Key { keysym, down }) => {
                            self.engine.send_key_event(keysym, down)?;
                        }
                        Some(ViewerCommand::Pointer { x, y, buttons }) => {
                            self.engine.send_pointer_event(x, y, buttons)?;
                        }
                        Some(ViewerCommand::Clipboard(text)) => {
                            self.engine.send_client_cut_text(&text)?;
                        }
                    }
                    self.flush().await?;
                }
            }
        }
    }

    async fn flush(&mut self) -> Result<(), SessionError> {
        if self.engine.has_outbound() {
            let bytes = self.engine.take_outbound();
            self.writer.write_all(&bytes).await?;
        }
        Ok(())
    }

    async fn apply_events(&mut self) -> Result<(), SessionError> {
        while let Some(event) = self.engine.poll_event() {
            match event {
                EngineEvent::RectData { rect, payload } => {
                    self.apply_rect(rect, &payload).await?;
                }
                EngineEvent::DesktopResized { width, height } => {
                    self.framebuffer.resize(width, height).await;
                    let _ = self.event_tx.send(ViewerEvent::Resized { width, height });
                }
                EngineEvent::CursorShape {
                    hotspot_x,
                    hotspot_y,
                    width,
                    height,
                    payload,
                } => {
                    let pixel_bytes =
                        usize::from(width) * usize::from(height) * self.format.bytes_per_pixel();
                    let shape = CursorShape {
                        hotspot_x,
                        hotspot_y,
                        width,
                        height,
                        pixels: payload[..pixel_bytes].to_vec(),
                        mask: payload[pixel_bytes..].to_vec(),
                    };
                    *self.cursor.lock().expect("cursor lock poisoned") = Some(shape);
                    let _ = self.event_tx.send(ViewerEvent::CursorUpdated);
                }
                EngineEvent::UpdateComplete => {
                    let _ = self.event_tx.send(ViewerEvent::UpdateComplete);
                    // Keep the update pipeline primed with the next
                    // incremental full-screen request.
                    let (width, height) = self.engine.dimensions();
                    self.engine
                        .send_update_request(DirtyRegion::full(width, height), true)?;
                }
                EngineEvent::Bell => {
                    let _ = self.event_tx.send(ViewerEvent::Bell);
                }
                EngineEvent::CutText(text) => {
                    let _ = self.event_tx.send(ViewerEvent::Clipboard(text));
                }
                EngineEvent::ColourMap { first, count } => {
                    log::debug!("ignoring colour map update ({count} entries from {first})");
                }
                other => {
                    log::debug!("unexpected engine event in steady state: {other:?}");
                }
            }
        }
        Ok(())
    }

    /// Decodes one pixel rectangle into the local framebuffer.
    async fn apply_rect(&mut self, rect: Rectangle, payload: &[u8]) -> Result<(), SessionError> {
        let region = DirtyRegion::new(rect.x, rect.y, rect.width, rect.height);
        match rect.encoding {
            ENCODING_RAW => {
                let pixels = raw::decode(payload, rect.width, rect.height, &self.format)?;
                self.framebuffer
                    .put_rect(rect.x, rect.y, rect.width, rect.height, &pixels)
                    .await?;
            }
            ENCODING_COPYRECT => {
                let src_x = u16::from_be_bytes([payload[0], payload[1]]);
                let src_y = u16::from_be_bytes([payload[2], payload[3]]);
                self.framebuffer
                    .copy_rect(src_x, src_y, rect.x, rect.y, rect.width, rect.height)
                    .await?;
            }
            ENCODING_RRE => {
                let pixels = rre::decode(payload, rect.width, rect.height, &self.format)?;
                self.framebuffer
                    .put_rect(rect.x, rect.y, rect.width, rect.height, &pixels)
                    .await?;
            }
            ENCODING_HEXTILE => {
                let pixels = hextile::decode(payload, rect.width, rect.height, &self.format)?;
                self.framebuffer
                    .put_rect(rect.x, rect.y, rect.width, rect.height, &pixels)
                    .await?;
            }
            ENCODING_ZRLE => {
                let pixels = self
                    .zrle
                    .decode(payload, rect.width, rect.height, &self.format)?;
                self.framebuffer
                    .put_rect(rect.x, rect.y, rect.width, rect.height, &pixels)
                    .await?;
            }
            other => {
                // The engine only frames encodings it knows, so this
                // is unreachable in practice; skipping is safe because
                // the payload was already consumed.
                log::warn!("skipping rectangle with unsupported encoding {other}");
            }
        }
        let _ = self.event_tx.send(ViewerEvent::RectUpdated { region });
        Ok(())
    }
}
