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

//! RFB server entry point.
//!
//! Serves a moving test pattern, which makes it a self-contained way
//! to exercise any VNC viewer against this implementation. Real
//! deployments plug platform `ScreenSource` / `InputSink`
//! implementations into `VncServer` instead.

use clap::Parser;

use rfbcore::{
    CapturedFrame, InputSink, ScreenSource, ServerConfig, ServerEvent, SessionError, VncServer,
};

#[derive(Parser, Debug)]
#[command(name = "rfbcore-server", about = "RFB 3.8 server serving a test pattern")]
struct Cli {
    /// TCP port to listen on.
    #[arg(short, long, default_value_t = 5900)]
    port: u16,

    /// Require VNC authentication with this password.
    #[arg(long)]
    password: Option<String>,

    /// Desktop name announced to clients.
    #[arg(long, default_value = "rfbcore")]
    name: String,

    /// Framebuffer width.
    #[arg(long, default_value_t = 1024)]
    width: u16,

    /// Framebuffer height.
    #[arg(long, default_value_t = 768)]
    height: u16,
}

/// Gradient test pattern that scrolls a little every frame so clients
/// always have something to fetch.
struct TestPatternSource {
    width: u16,
    height: u16,
    phase: u8,
}

impl ScreenSource for TestPatternSource {
    fn init(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    fn capture(&mut self) -> Result<CapturedFrame, SessionError> {
        let w = usize::from(self.width);
        let h = usize::from(self.height);
        let mut pixels = vec![0u8; w * h * 4];
        for y in 0..h {
            for x in 0..w {
                let offset = (y * w + x) * 4;
                pixels[offset] = ((x * 255 / w) as u8).wrapping_add(self.phase);
                pixels[offset + 1] = (y * 255 / h) as u8;
                pixels[offset + 2] = 128;
                pixels[offset + 3] = 255;
            }
        }
        self.phase = self.phase.wrapping_add(1);
        Ok(CapturedFrame {
            pixels,
            width: self.width,
            height: self.height,
        })
    }

    fn shutdown(&mut self) {}
}

/// Input sink that only logs, since there is no desktop behind the
/// test pattern.
struct LoggingInputSink;

impl InputSink for LoggingInputSink {
    fn init(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    fn key(&mut self, keysym: u32, down: bool) {
        log::info!("key {keysym:#06x} {}", if down { "down" } else { "up" });
    }

    fn pointer_move(&mut self, x: u16, y: u16) {
        log::debug!("pointer at ({x}, {y})");
    }

    fn pointer_buttons(&mut self, x: u16, y: u16, mask: u8) {
        log::info!("buttons {mask:#04x} at ({x}, {y})");
    }

    fn shutdown(&mut self) {}
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let config = ServerConfig {
        listen_port: cli.port,
        password: cli.password,
        desktop_name: cli.name,
        screen_width: cli.width,
        screen_height: cli.height,
        ..ServerConfig::default()
    };
    let source = TestPatternSource {
        width: cli.width,
        height: cli.height,
        phase: 0,
    };

    let (server, mut events) = match VncServer::new(config, Box::new(source), Box::new(LoggingInputSink)) {
        Ok(pair) => pair,
        Err(err) => {
            eprintln!("failed to start server: {err}");
            std::process::exit(1);
        }
    };

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::ClientConnected { id, address } => {
                    println!("client {id} connected from {address}");
                }
                ServerEvent::ClientDisconnected { id, reason } => {
                    println!("client {id} disconnected: {reason}");
                }
                ServerEvent::CutText { client_id, text } => {
                    println!("client {client_id} clipboard: {text}");
                }
                _ => {}
            }
        }
    });

    if let Err(err) = server.listen().await {
        eprintln!("server error: {err}");
        std::process::exit(1);
    }
}
