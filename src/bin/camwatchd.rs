//! camwatchd - camera session daemon
//!
//! This daemon:
//! 1. Loads configuration (JSON file + CAMWATCH_* environment)
//! 2. Opens one camera session for the configured source
//! 3. Serves live MJPEG, recording toggle and screenshots over HTTP
//! 4. On Ctrl-C stops the API and drains any active recording

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use camwatch::{
    api::{ApiConfig, ApiServer},
    CameraSession, CamwatchConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve one camera over HTTP with on-demand recording")]
struct Args {
    /// JSON config file.
    #[arg(long, env = "CAMWATCH_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,
    /// Source: device index, file path, rtsp/http URL or stub://name.
    #[arg(long)]
    source: Option<String>,
    /// Address for the HTTP API.
    #[arg(long)]
    addr: Option<String>,
    /// Directory for recordings.
    #[arg(long, value_name = "DIR")]
    recordings_dir: Option<PathBuf>,
    /// Fixed screenshot file.
    #[arg(long, value_name = "PATH")]
    screenshot_path: Option<PathBuf>,
    /// Start recording immediately.
    #[arg(long)]
    record: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = CamwatchConfig::load_from(args.config.as_deref())?;
    if let Some(source) = args.source {
        config.source = source;
    }
    if let Some(addr) = args.addr {
        config.api_addr = addr;
    }
    if let Some(dir) = args.recordings_dir {
        config.recordings_dir = dir;
    }
    if let Some(path) = args.screenshot_path {
        config.screenshot_path = path;
    }
    config.validate()?;

    let session = Arc::new(CameraSession::open(
        config.source_descriptor()?,
        config.session_options()?,
    )?);
    if args.record {
        if let Err(err) = session.start_recording() {
            log::warn!("recording not started: {:#}", err);
        }
    }

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
        screenshot_path: config.screenshot_path.clone(),
        ..ApiConfig::default()
    };
    let api_handle = ApiServer::new(api_config, session.clone()).spawn()?;
    log::info!(
        "camwatchd running. source={} recordings={} video feed at http://{}/video_feed",
        config.source,
        config.recordings_dir.display(),
        api_handle.addr
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    if let Err(err) = rx.recv() {
        log::debug!("shutdown channel closed: {}", err);
    }
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;
    session.shutdown();
    Ok(())
}
