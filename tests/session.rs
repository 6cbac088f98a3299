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

//! Integration tests: full session lifecycle between the server
//! controller and the viewer controller over in-memory streams, plus
//! input and authentication round trips.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rfbcore::{
    CapturedFrame, InputSink, ScreenSource, ServerConfig, SessionError, ViewerConfig, ViewerEvent,
    VncServer, VncViewer,
};
use tokio::sync::mpsc;

// ── Helpers ──────────────────────────────────────────────────────

/// Screen source backed by a shared buffer the test can repaint.
#[derive(Clone)]
struct SharedSource {
    frame: Arc<Mutex<Vec<u8>>>,
    width: u16,
    height: u16,
}

impl SharedSource {
    fn new(width: u16, height: u16, fill: [u8; 4]) -> Self {
        let pixels = fill
            .iter()
            .copied()
            .cycle()
            .take(usize::from(width) * usize::from(height) * 4)
            .collect();
        Self {
            frame: Arc::new(Mutex::new(pixels)),
            width,
            height,
        }
    }

    /// Repaints one pixel (RGBA).
    fn paint(&self, x: usize, y: usize, rgba: [u8; 4]) {
        let mut frame = self.frame.lock().unwrap();
        let offset = (y * usize::from(self.width) + x) * 4;
        frame[offset..offset + 4].copy_from_slice(&rgba);
    }
}

impl ScreenSource for SharedSource {
    fn init(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    fn capture(&mut self) -> Result<CapturedFrame, SessionError> {
        Ok(CapturedFrame {
            pixels: self.frame.lock().unwrap().clone(),
            width: self.width,
            height: self.height,
        })
    }

    fn shutdown(&mut self) {}
}

/// Records every input call in order.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SinkCall {
    Key(u32, bool),
    Move(u16, u16),
    Buttons(u16, u16, u8),
}

#[derive(Clone)]
struct RecordingSink {
    calls: Arc<Mutex<Vec<SinkCall>>>,
}

impl RecordingSink {
    fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl InputSink for RecordingSink {
    fn init(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    fn key(&mut self, keysym: u32, down: bool) {
        self.calls.lock().unwrap().push(SinkCall::Key(keysym, down));
    }

    fn pointer_move(&mut self, x: u16, y: u16) {
        self.calls.lock().unwrap().push(SinkCall::Move(x, y));
    }

    fn pointer_buttons(&mut self, x: u16, y: u16, mask: u8) {
        self.calls.lock().unwrap().push(SinkCall::Buttons(x, y, mask));
    }

    fn shutdown(&mut self) {}
}

fn test_config(source: &SharedSource, password: Option<&str>) -> ServerConfig {
    ServerConfig {
        listen_port: 0,
        password: password.map(str::to_string),
        desktop_name: "Test".to_string(),
        screen_width: source.width,
        screen_height: source.height,
        capture_interval: Duration::from_millis(5),
        ..ServerConfig::default()
    }
}

/// Starts a server with the given collaborators and connects a viewer
/// to it over an in-memory duplex stream.
async fn connect_pair(
    source: SharedSource,
    sink: RecordingSink,
    server_password: Option<&str>,
    viewer_config: ViewerConfig,
) -> Result<
    (
        VncServer,
        VncViewer,
        mpsc::UnboundedReceiver<ViewerEvent>,
    ),
    SessionError,
> {
    let config = test_config(&source, server_password);
    let (server, _events) = VncServer::new(config, Box::new(source), Box::new(sink))?;
    let (server_end, viewer_end) = tokio::io::duplex(256 * 1024);
    server
        .from_socket(server_end, "mem:duplex".to_string())
        .await;
    let (viewer, events) = VncViewer::from_stream(viewer_end, viewer_config).await?;
    Ok((server, viewer, events))
}

/// Receives the next event or panics after five seconds.
async fn next_event(events: &mut mpsc::UnboundedReceiver<ViewerEvent>) -> ViewerEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for viewer event")
        .expect("event channel closed")
}

/// Drains events until the predicate matches or the timeout expires.
async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<ViewerEvent>,
    mut predicate: impl FnMut(&ViewerEvent) -> bool,
) -> ViewerEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for matching event")
}

// ── Session lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn framebuffer_syncs_end_to_end() {
    let source = SharedSource::new(32, 24, [0, 0, 255, 255]); // blue
    let (_server, viewer, mut events) = connect_pair(
        source.clone(),
        RecordingSink::new(),
        None,
        ViewerConfig::default(),
    )
    .await
    .unwrap();

    match next_event(&mut events).await {
        ViewerEvent::Connected { width, height, name } => {
            assert_eq!((width, height), (32, 24));
            assert_eq!(name, "Test");
        }
        other => panic!("expected Connected, got {other:?}"),
    }

    // Blue in RGBA is blue at shift 0 in the native format, so every
    // pixel decodes to [255, 0, 0, 0].
    let fb = viewer.framebuffer();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            wait_for(&mut events, |e| matches!(e, ViewerEvent::UpdateComplete)).await;
            let pixels = fb.get_rect(0, 0, 32, 24).await.unwrap();
            if pixels.chunks_exact(4).all(|p| p == [255, 0, 0, 0]) {
                break;
            }
        }
    })
    .await
    .expect("framebuffer never reached the source contents");
}

#[tokio::test]
async fn incremental_updates_wait_for_changes() {
    let source = SharedSource::new(16, 16, [0, 0, 0, 255]);
    let (_server, viewer, mut events) = connect_pair(
        source.clone(),
        RecordingSink::new(),
        None,
        ViewerConfig::default(),
    )
    .await
    .unwrap();

    // Let the initial full update and the first dirty pass settle:
    // wait until no further UpdateComplete arrives for a while.
    let mut quiet = false;
    for _ in 0..50 {
        match tokio::time::timeout(Duration::from_millis(300), events.recv()).await {
            Ok(Some(_)) => continue,
            Ok(None) => panic!("event channel closed"),
            Err(_) => {
                quiet = true;
                break;
            }
        }
    }
    assert!(quiet, "server kept sending updates with nothing dirty");

    // A single pixel change must produce an update covering it.
    source.paint(7, 3, [255, 255, 255, 255]);
    wait_for(&mut events, |e| matches!(e, ViewerEvent::UpdateComplete)).await;
    let pixel = viewer.framebuffer().get_rect(7, 3, 1, 1).await.unwrap();
    assert_eq!(pixel, vec![255, 255, 255, 0]);
}

#[tokio::test]
async fn fallback_to_raw_still_syncs() {
    // A viewer that only asks for an unsupported encoding gets Raw.
    let source = SharedSource::new(8, 8, [0, 255, 0, 255]); // green
    let viewer_config = ViewerConfig {
        preferred_encodings: vec![999],
        ..ViewerConfig::default()
    };
    let (_server, viewer, mut events) = connect_pair(
        source.clone(),
        RecordingSink::new(),
        None,
        viewer_config,
    )
    .await
    .unwrap();

    let fb = viewer.framebuffer();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            wait_for(&mut events, |e| matches!(e, ViewerEvent::UpdateComplete)).await;
            let pixels = fb.get_rect(0, 0, 8, 8).await.unwrap();
            if pixels.chunks_exact(4).all(|p| p == [0, 255, 0, 0]) {
                break;
            }
        }
    })
    .await
    .expect("raw fallback never delivered the frame");
}

// ── Input ────────────────────────────────────────────────────────

#[tokio::test]
async fn input_events_reach_the_sink_in_order() {
    let source = SharedSource::new(16, 16, [0, 0, 0, 255]);
    let sink = RecordingSink::new();
    let (_server, viewer, mut events) = connect_pair(
        source,
        sink.clone(),
        None,
        ViewerConfig::default(),
    )
    .await
    .unwrap();
    next_event(&mut events).await; // Connected

    viewer.send_key(0x0061, true);
    viewer.send_key(0x0061, false);
    viewer.send_pointer(100, 50, 0x01);

    // Input is applied by the server handler as it arrives.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if sink.calls.lock().unwrap().len() >= 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("input never reached the sink");

    let calls = sink.calls.lock().unwrap().clone();
    assert_eq!(
        calls,
        vec![
            SinkCall::Key(0x61, true),
            SinkCall::Key(0x61, false),
            SinkCall::Move(100, 50),
            SinkCall::Buttons(100, 50, 0x01),
        ]
    );
}

#[tokio::test]
async fn clipboard_flows_both_ways() {
    let source = SharedSource::new(8, 8, [0, 0, 0, 255]);
    let (server, viewer, mut events) = connect_pair(
        source,
        RecordingSink::new(),
        None,
        ViewerConfig::default(),
    )
    .await
    .unwrap();
    next_event(&mut events).await; // Connected

    viewer.send_clipboard("from viewer".to_string());
    server.send_cut_text_to_all("from server".to_string()).await;

    let event = wait_for(&mut events, |e| matches!(e, ViewerEvent::Clipboard(_))).await;
    match event {
        ViewerEvent::Clipboard(text) => assert_eq!(text, "from server"),
        _ => unreachable!(),
    }
}

// ── Authentication ───────────────────────────────────────────────

#[tokio::test]
async fn vncauth_accepts_the_right_password() {
    let source = SharedSource::new(8, 8, [0, 0, 0, 255]);
    let viewer_config = ViewerConfig {
        password: Some("s3cret".to_string()),
        ..ViewerConfig::default()
    };
    let (_server, _viewer, mut events) = connect_pair(
        source,
        RecordingSink::new(),
        Some("s3cret"),
        viewer_config,
    )
    .await
    .unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        ViewerEvent::Connected { .. }
    ));
}

#[tokio::test]
async fn vncauth_rejects_the_wrong_password() {
    let source = SharedSource::new(8, 8, [0, 0, 0, 255]);
    let viewer_config = ViewerConfig {
        password: Some("wrong".to_string()),
        ..ViewerConfig::default()
    };
    let result = connect_pair(
        source,
        RecordingSink::new(),
        Some("right"),
        viewer_config,
    )
    .await;
    assert!(matches!(result, Err(SessionError::Auth(_))));
}

// ── Controller surface ───────────────────────────────────────────

#[tokio::test]
async fn disconnect_client_removes_the_session() {
    let source = SharedSource::new(8, 8, [0, 0, 0, 255]);
    let (server, _viewer, mut events) = connect_pair(
        source,
        RecordingSink::new(),
        None,
        ViewerConfig::default(),
    )
    .await
    .unwrap();
    next_event(&mut events).await; // Connected

    let infos = server.client_infos().await;
    assert_eq!(infos.len(), 1);
    assert!(infos[0].authenticated);

    assert!(server.disconnect_client(infos[0].id).await);
    wait_for(&mut events, |e| matches!(e, ViewerEvent::Disconnected { .. })).await;

    // The handler reaps its record on exit.
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.client_count().await != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client record was never reaped");

    assert!(!server.disconnect_client(9999).await);
}

#[tokio::test]
async fn listener_serves_real_tcp() {
    // End to end over loopback TCP. The listener binds the configured
    // port, so pick one unlikely to collide.
    let source = SharedSource::new(8, 8, [255, 0, 0, 255]);
    let config = ServerConfig {
        listen_port: 15937,
        desktop_name: "tcp".to_string(),
        screen_width: 8,
        screen_height: 8,
        capture_interval: Duration::from_millis(5),
        ..ServerConfig::default()
    };
    let (server, _events) =
        VncServer::new(config, Box::new(source), Box::new(RecordingSink::new())).unwrap();
    let listen_server = server.clone();
    tokio::spawn(async move { listen_server.listen().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let viewer_config = ViewerConfig {
        host: "127.0.0.1".to_string(),
        port: 15937,
        ..ViewerConfig::default()
    };
    let (_viewer, mut events) = VncViewer::connect(viewer_config).await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        ViewerEvent::Connected { .. }
    ));

    server.shutdown().await;
    wait_for(&mut events, |e| matches!(e, ViewerEvent::Disconnected { .. })).await;
}
