//! demo - end-to-end synthetic run of a camera session
//!
//! Streams frames from a `stub://` source, records them, takes a screenshot
//! and prints the session status as JSON.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use camwatch::{
    CameraSession, CaptureSettings, DefaultOpener, ReconnectPolicy, SessionOptions,
    SourceDescriptor,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Number of frames to serve.
    #[arg(long, default_value_t = 50)]
    frames: u32,
    /// Frames per second for the synthetic source.
    #[arg(long, default_value_t = 25)]
    fps: u32,
    /// Fail every Nth synthetic read to exercise reconnection.
    #[arg(long)]
    drop_every: Option<u64>,
    /// Output directory for the recording and screenshot.
    #[arg(long, default_value = "demo_out")]
    out: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if args.fps == 0 {
        return Err(anyhow!("fps must be >= 1"));
    }

    let out_dir = PathBuf::from(&args.out);
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("create output directory {}", out_dir.display()))?;

    let mut descriptor = format!("stub://demo?fps={}", args.fps);
    if let Some(n) = args.drop_every {
        descriptor.push_str(&format!("&drop_every={}", n));
    }
    let options = SessionOptions {
        reconnect: ReconnectPolicy::fixed(Duration::from_millis(100)),
        recordings_dir: out_dir.join("recordings"),
        opener: std::sync::Arc::new(DefaultOpener::new(CaptureSettings {
            target_fps: args.fps,
            ..CaptureSettings::default()
        })),
        ..SessionOptions::default()
    };
    let session = CameraSession::open(SourceDescriptor::parse(&descriptor)?, options)?;

    session.start_recording()?;
    let mut placeholders = 0u32;
    for _ in 0..args.frames {
        if session.get_frame().is_placeholder() {
            placeholders += 1;
        }
    }
    let summary = session
        .stop_recording()?
        .ok_or_else(|| anyhow!("recording was not active"))?;

    let screenshot = session.screenshot(&out_dir.join("screenshot.jpg"))?;
    let status = session.status();
    session.shutdown();

    println!("recording: {}", summary.path.display());
    println!(
        "frames written={} dropped={} placeholders={}",
        summary.frames_written, summary.frames_dropped, placeholders
    );
    println!("screenshot: {}", screenshot.display());
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
