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

//! Server session controller.
//!
//! The [`VncServer`] owns the listening endpoint, the capture loop, the
//! input sink and the set of connected clients. Each accepted
//! connection runs in its own task (see the `client` module); the
//! capture loop periodically snapshots the [`ScreenSource`], diffs
//! against the previous snapshot, and unions the resulting dirty
//! rectangles into every client's set. Per-session errors close that
//! session only; the listener and the capture loop keep running.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex, RwLock};

use crate::client::{
    run_client_session, ClientCommand, ClientHandle, ClientInfo, SessionContext,
};
use crate::config::ServerConfig;
use crate::diff::DirtyDetector;
use crate::error::SessionError;
use crate::events::ServerEvent;
use crate::framebuffer::Framebuffer;
use crate::pixel::PixelFormat;
use crate::traits::{InputSink, ScreenSource};

/// Global counter for unique client IDs across the server's lifetime.
static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Block size used by the snapshot differ.
const DIFF_BLOCK: usize = 64;

/// An RFB server serving one screen to many clients.
///
/// Cloning shares the same underlying state, so a clone can be moved
/// into the accept task while the original keeps answering status
/// queries.
#[derive(Clone)]
pub struct VncServer {
    config: ServerConfig,
    framebuffer: Framebuffer,
    clients: Arc<RwLock<Vec<Arc<ClientHandle>>>>,
    tasks: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
    input: Arc<StdMutex<Box<dyn InputSink>>>,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    shutdown: watch::Sender<bool>,
}

impl VncServer {
    /// Creates the server and starts its capture loop.
    ///
    /// Initializes both collaborators; the screen source is then owned
    /// by the capture task and the input sink is shared behind one
    /// mutex, since platform injection APIs are not re-entrant.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails when either collaborator fails to initialize.
    pub fn new(
        mut config: ServerConfig,
        mut screen: Box<dyn ScreenSource>,
        mut input: Box<dyn InputSink>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerEvent>), SessionError> {
        screen.init()?;
        input.init()?;

        // Take the first snapshot up front so the framebuffer never
        // serves uninitialized pixels, and so the advertised geometry
        // matches what the source actually delivers.
        let first = screen.capture()?;
        if (first.width, first.height) != (config.screen_width, config.screen_height) {
            log::warn!(
                "screen source is {}x{}, overriding configured {}x{}",
                first.width,
                first.height,
                config.screen_width,
                config.screen_height
            );
            config.screen_width = first.width;
            config.screen_height = first.height;
        }
        let framebuffer = Framebuffer::from_pixels(
            first.width,
            first.height,
            config.pixel_format.bytes_per_pixel(),
            rgba_to_native(&first.pixels, &config.pixel_format),
        );
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let server = Self {
            config,
            framebuffer,
            clients: Arc::new(RwLock::new(Vec::new())),
            tasks: Arc::new(Mutex::new(Vec::new())),
            input: Arc::new(StdMutex::new(input)),
            event_tx,
            shutdown,
        };
        server.spawn_capture_loop(screen);
        Ok((server, event_rx))
    }

    /// The shared framebuffer, also usable to paint synthetic content
    /// when no real screen source exists.
    pub fn framebuffer(&self) -> &Framebuffer {
        &self.framebuffer
    }

    /// Accepts connections on the configured port until shutdown.
    ///
    /// Accept errors are logged and do not stop the loop.
    pub async fn listen(&self) -> Result<(), SessionError> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.listen_port)).await?;
        log::info!("RFB server listening on port {}", self.config.listen_port);
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return Ok(()),
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                log::debug!("set_nodelay failed for {addr}: {e}");
                            }
                            self.from_socket(stream, addr.to_string()).await;
                        }
                        Err(e) => log::error!("error accepting connection: {e}"),
                    }
                }
            }
        }
    }

    /// Serves one RFB session over any bidirectional stream.
    ///
    /// This accepts TCP, in-memory duplex pipes, or any custom
    /// transport implementing the tokio stream traits.
    pub async fn from_socket<S>(&self, stream: S, address: String)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::SeqCst) as usize;
        let (handle, commands) = ClientHandle::new(id, address);
        // Seed the dirty set with the whole screen so even a client
        // that opens with an incremental request gets a first frame.
        let (width, height) = self.framebuffer.dimensions().await;
        handle.push_dirty(&[crate::framebuffer::DirtyRegion::full(width, height)]);
        self.clients.write().await.push(handle.clone());

        let ctx = SessionContext {
            framebuffer: self.framebuffer.clone(),
            config: self.config.clone(),
            input: self.input.clone(),
            events: self.event_tx.clone(),
        };
        let clients = self.clients.clone();
        let event_tx = self.event_tx.clone();

        let task = tokio::spawn(async move {
            let address = handle.address.clone();
            let result = run_client_session(stream, handle, commands, ctx).await;
            let reason = match &result {
                Ok(()) => "connection closed".to_string(),
                Err(err) => err.to_string(),
            };
            match &result {
                Ok(()) => log::info!("client {id} ({address}) disconnected"),
                Err(err) => log::warn!("client {id} ({address}) disconnected: {err}"),
            }
            clients.write().await.retain(|c| c.id != id);
            let _ = event_tx.send(ServerEvent::ClientDisconnected { id, reason });
        });

        // Sweep finished handlers while registering the new one.
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Snapshot of every connected client's state.
    pub async fn client_infos(&self) -> Vec<ClientInfo> {
        self.clients.read().await.iter().map(|c| c.info()).collect()
    }

    /// Number of connected clients.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Closes one client's session. Returns false when no such client
    /// is connected.
    pub async fn disconnect_client(&self, id: usize) -> bool {
        let clients = self.clients.read().await;
        match clients.iter().find(|c| c.id == id) {
            Some(client) => {
                client.send_command(ClientCommand::Disconnect);
                true
            }
            None => false,
        }
    }

    /// Sends clipboard text to every connected client.
    pub async fn send_cut_text_to_all(&self, text: String) {
        for client in self.clients.read().await.iter() {
            client.send_command(ClientCommand::CutText(text.clone()));
        }
    }

    /// Rings the bell on every connected client.
    pub async fn send_bell_to_all(&self) {
        for client in self.clients.read().await.iter() {
            client.send_command(ClientCommand::Bell);
        }
    }

    /// Resizes the served framebuffer and announces the new geometry
    /// to clients that understand DesktopSize.
    pub async fn resize_desktop(&self, width: u16, height: u16) {
        self.framebuffer.resize(width, height).await;
        for client in self.clients.read().await.iter() {
            client.send_command(ClientCommand::Resize { width, height });
        }
    }

    /// Stops the server: the listener exits, every client stream is
    /// closed, and all handler tasks are joined.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        for client in self.clients.read().await.iter() {
            client.send_command(ClientCommand::Disconnect);
        }
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }
        self.clients.write().await.clear();
        self.input
            .lock()
            .expect("input sink lock poisoned")
            .shutdown();
        log::info!("RFB server stopped");
    }

    /// Spawns the capture loop: snapshot, diff, distribute dirty
    /// rectangles. Capture errors are logged and never stop the loop.
    fn spawn_capture_loop(&self, mut source: Box<dyn ScreenSource>) {
        let framebuffer = self.framebuffer.clone();
        let clients = self.clients.clone();
        let native_format = self.config.pixel_format.clone();
        let interval = self.config.capture_interval;
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut detector = DirtyDetector::new(DIFF_BLOCK, native_format.bytes_per_pixel());
            let mut tick = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tick.tick() => {}
                }

                let frame = match source.capture() {
                    Ok(frame) => frame,
                    Err(err) => {
                        log::error!("screen capture failed: {err}");
                        continue;
                    }
                };

                // Follow the source through resolution changes.
                let (fb_width, fb_height) = framebuffer.dimensions().await;
                if (frame.width, frame.height) != (fb_width, fb_height) {
                    log::info!(
                        "screen source resized to {}x{}",
                        frame.width,
                        frame.height
                    );
                    framebuffer.resize(frame.width, frame.height).await;
                    for client in clients.read().await.iter() {
                        client.send_command(ClientCommand::Resize {
                            width: frame.width,
                            height: frame.height,
                        });
                    }
                    detector.reset();
                }

                let native = rgba_to_native(&frame.pixels, &native_format);
                if let Err(err) = framebuffer.update_from_slice(&native).await {
                    log::error!("dropping malformed capture frame: {err}");
                    continue;
                }

                let dirty = detector.detect(&native, frame.width, frame.height);
                if !dirty.is_empty() {
                    for client in clients.read().await.iter() {
                        client.push_dirty(&dirty);
                    }
                }
            }
            source.shutdown();
        });
    }
}

/// Converts an RGBA8888 capture frame into the server's native pixel
/// format.
fn rgba_to_native(pixels: &[u8], format: &PixelFormat) -> Vec<u8> {
    let mut out = bytes::BytesMut::with_capacity(pixels.len() / 4 * format.bytes_per_pixel());
    for chunk in pixels.chunks_exact(4) {
        let value = format.pack_rgb(chunk[0], chunk[1], chunk[2]);
        format.write_pixel(&mut out, value);
    }
    out.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgba_conversion_places_channels_by_shift() {
        // Native rgb32 is little-endian with red at bit 16, so a pure
        // red RGBA pixel lands in byte 2.
        let native = rgba_to_native(&[255, 0, 0, 255], &PixelFormat::rgb32());
        assert_eq!(native, vec![0, 0, 255, 0]);
        let native = rgba_to_native(&[0, 255, 0, 255], &PixelFormat::rgb32());
        assert_eq!(native, vec![0, 255, 0, 0]);
        let native = rgba_to_native(&[0, 0, 255, 255], &PixelFormat::rgb32());
        assert_eq!(native, vec![255, 0, 0, 0]);
    }
}
