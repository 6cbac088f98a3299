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

//! Headless RFB viewer entry point.
//!
//! Connects, keeps the local framebuffer in sync, and logs session
//! activity. Useful for probing a server without a GUI; embedders
//! wanting pixels on a screen use `VncViewer` directly.

use clap::Parser;

use rfbcore::{ViewerConfig, ViewerEvent, VncViewer};

#[derive(Parser, Debug)]
#[command(name = "rfbcore-viewer", about = "Headless RFB 3.8 viewer")]
struct Cli {
    /// Server host.
    #[arg(default_value = "127.0.0.1")]
    host: String,

    /// Server port.
    #[arg(short, long, default_value_t = 5900)]
    port: u16,

    /// Password for VNC authentication.
    #[arg(long)]
    password: Option<String>,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let config = ViewerConfig {
        host: cli.host,
        port: cli.port,
        password: cli.password,
        ..ViewerConfig::default()
    };

    let (viewer, mut events) = match VncViewer::connect(config).await {
        Ok(pair) => pair,
        Err(err) => {
            eprintln!("failed to connect: {err}");
            std::process::exit(1);
        }
    };

    let mut rects: u64 = 0;
    while let Some(event) = events.recv().await {
        match event {
            ViewerEvent::Connected { width, height, name } => {
                println!("connected to \"{name}\" ({width}x{height})");
            }
            ViewerEvent::RectUpdated { .. } => {
                rects += 1;
                if rects % 100 == 0 {
                    log::info!("{rects} rectangles applied");
                }
            }
            ViewerEvent::Resized { width, height } => {
                println!("desktop resized to {width}x{height}");
            }
            ViewerEvent::Bell => println!("bell"),
            ViewerEvent::Clipboard(text) => println!("server clipboard: {text}"),
            ViewerEvent::Disconnected { reason } => {
                println!("disconnected: {reason}");
                break;
            }
            _ => {}
        }
    }
    drop(viewer);
}
