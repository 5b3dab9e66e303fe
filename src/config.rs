use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::encode::{EncoderConfig, FrameEncoder};
use crate::ingest::{CaptureSettings, DefaultOpener, SourceDescriptor};
use crate::reconnect::ReconnectPolicy;
use crate::recording::{MjpegWriterFactory, RecorderConfig, WriterFactory, DEFAULT_QUEUE_CAPACITY};
use crate::session::{SessionOptions, DEFAULT_FPS_FALLBACK};

const DEFAULT_SOURCE: &str = "0";
const DEFAULT_API_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_RECORDINGS_DIR: &str = "recordings";
const DEFAULT_SCREENSHOT_PATH: &str = "screenshot.jpg";
const DEFAULT_CAPTURE_FPS: u32 = 25;
const DEFAULT_CAPTURE_WIDTH: u32 = 640;
const DEFAULT_CAPTURE_HEIGHT: u32 = 480;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CamwatchConfigFile {
    source: Option<String>,
    api: Option<ApiConfigFile>,
    capture: Option<CaptureConfigFile>,
    recording: Option<RecordingConfigFile>,
    reconnect: Option<ReconnectConfigFile>,
    screenshot_path: Option<PathBuf>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CaptureConfigFile {
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RecordingConfigFile {
    dir: Option<PathBuf>,
    fps_fallback: Option<f64>,
    queue_capacity: Option<usize>,
    format: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ReconnectConfigFile {
    backoff_ms: Option<u64>,
    multiplier: Option<f64>,
    max_backoff_ms: Option<u64>,
    max_attempts: Option<u32>,
}

/// Container written by the recording pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordingFormat {
    Mjpeg,
    /// H.264 in MP4; needs the `record-gstreamer` feature.
    Mp4,
}

impl FromStr for RecordingFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mjpeg" => Ok(Self::Mjpeg),
            "mp4" => Ok(Self::Mp4),
            other => Err(anyhow!("unknown recording format '{}'; expected mjpeg or mp4", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CamwatchConfig {
    pub source: String,
    pub api_addr: String,
    pub capture: CaptureSettings,
    pub recordings_dir: PathBuf,
    pub recording_format: RecordingFormat,
    pub fps_fallback: f64,
    pub queue_capacity: usize,
    pub screenshot_path: PathBuf,
    pub jpeg_quality: u8,
    pub reconnect: ReconnectPolicy,
}

impl CamwatchConfig {
    /// File named by `CAMWATCH_CONFIG` (if any), then env overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = env_non_empty("CAMWATCH_CONFIG").map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Like `load`, with an explicit config file instead of `CAMWATCH_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CamwatchConfigFile) -> Result<Self> {
        let source = file.source.unwrap_or_else(|| DEFAULT_SOURCE.to_string());
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let capture = file.capture.unwrap_or_default();
        let capture = CaptureSettings {
            target_fps: capture.target_fps.unwrap_or(DEFAULT_CAPTURE_FPS),
            width: capture.width.unwrap_or(DEFAULT_CAPTURE_WIDTH),
            height: capture.height.unwrap_or(DEFAULT_CAPTURE_HEIGHT),
        };
        let recording = file.recording.unwrap_or_default();
        let recording_format = match recording.format.as_deref() {
            Some(format) => format.parse()?,
            None => RecordingFormat::Mjpeg,
        };

        let reconnect = file.reconnect.unwrap_or_default();
        let initial = Duration::from_millis(reconnect.backoff_ms.unwrap_or(DEFAULT_RECONNECT_BACKOFF_MS));
        let multiplier = reconnect.multiplier.unwrap_or(1.0);
        let max_backoff = reconnect
            .max_backoff_ms
            .map(Duration::from_millis)
            .unwrap_or(initial);
        let mut policy = ReconnectPolicy::exponential(initial, multiplier, max_backoff);
        if let Some(max_attempts) = reconnect.max_attempts {
            policy = policy.with_max_attempts(max_attempts);
        }

        Ok(Self {
            source,
            api_addr,
            capture,
            recordings_dir: recording
                .dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RECORDINGS_DIR)),
            recording_format,
            fps_fallback: recording.fps_fallback.unwrap_or(DEFAULT_FPS_FALLBACK),
            queue_capacity: recording.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
            screenshot_path: file
                .screenshot_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SCREENSHOT_PATH)),
            jpeg_quality: file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            reconnect: policy,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(source) = env_non_empty("CAMWATCH_SOURCE") {
            self.source = source;
        }
        if let Some(addr) = env_non_empty("CAMWATCH_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(dir) = env_non_empty("CAMWATCH_RECORDINGS_DIR") {
            self.recordings_dir = PathBuf::from(dir);
        }
        if let Some(path) = env_non_empty("CAMWATCH_SCREENSHOT_PATH") {
            self.screenshot_path = PathBuf::from(path);
        }
        if let Some(format) = env_non_empty("CAMWATCH_RECORDING_FORMAT") {
            self.recording_format = format.parse()?;
        }
        if let Some(fps) = env_non_empty("CAMWATCH_FPS_FALLBACK") {
            self.fps_fallback = fps
                .parse()
                .map_err(|_| anyhow!("CAMWATCH_FPS_FALLBACK must be a number"))?;
        }
        if let Some(capacity) = env_non_empty("CAMWATCH_QUEUE_CAPACITY") {
            self.queue_capacity = capacity
                .parse()
                .map_err(|_| anyhow!("CAMWATCH_QUEUE_CAPACITY must be an integer"))?;
        }
        if let Some(backoff) = env_non_empty("CAMWATCH_RECONNECT_BACKOFF_MS") {
            let millis: u64 = backoff.parse().map_err(|_| {
                anyhow!("CAMWATCH_RECONNECT_BACKOFF_MS must be an integer number of milliseconds")
            })?;
            let backoff = Duration::from_millis(millis);
            self.reconnect.initial_backoff = backoff;
            if self.reconnect.max_backoff < backoff {
                self.reconnect.max_backoff = backoff;
            }
        }
        if let Some(attempts) = env_non_empty("CAMWATCH_RECONNECT_MAX_ATTEMPTS") {
            let attempts: u32 = attempts
                .parse()
                .map_err(|_| anyhow!("CAMWATCH_RECONNECT_MAX_ATTEMPTS must be an integer"))?;
            self.reconnect.max_attempts = Some(attempts);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        SourceDescriptor::parse(&self.source)?;
        if self.api_addr.trim().is_empty() {
            return Err(anyhow!("api addr must not be empty"));
        }
        if !(self.fps_fallback.is_finite() && self.fps_fallback > 0.0) {
            return Err(anyhow!("fps fallback must be greater than zero"));
        }
        if self.queue_capacity == 0 {
            return Err(anyhow!("recording queue capacity must be greater than zero"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(anyhow!("jpeg quality must be within 1..=100"));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("capture width and height must be greater than zero"));
        }
        if self.screenshot_path.as_os_str().is_empty() {
            return Err(anyhow!("screenshot path must not be empty"));
        }
        self.reconnect.validate()
    }

    pub fn source_descriptor(&self) -> Result<SourceDescriptor> {
        SourceDescriptor::parse(&self.source)
    }

    /// Session wiring for this configuration: built-in backends, the
    /// configured encoder and the writer for `recording_format`.
    pub fn session_options(&self) -> Result<SessionOptions> {
        let encoder = FrameEncoder::new(EncoderConfig {
            quality: self.jpeg_quality,
            placeholder_width: self.capture.width,
            placeholder_height: self.capture.height,
        })?;
        let writers: Arc<dyn WriterFactory> = match self.recording_format {
            RecordingFormat::Mjpeg => Arc::new(MjpegWriterFactory::new(encoder.clone())),
            RecordingFormat::Mp4 => mp4_writers()?,
        };
        Ok(SessionOptions {
            reconnect: self.reconnect.clone(),
            recorder: RecorderConfig {
                queue_capacity: self.queue_capacity,
                ..RecorderConfig::default()
            },
            recordings_dir: self.recordings_dir.clone(),
            fps_fallback: self.fps_fallback,
            encoder,
            opener: Arc::new(DefaultOpener::new(self.capture.clone())),
            writers,
        })
    }
}

#[cfg(feature = "record-gstreamer")]
fn mp4_writers() -> Result<Arc<dyn WriterFactory>> {
    Ok(Arc::new(crate::recording::Mp4WriterFactory))
}

#[cfg(not(feature = "record-gstreamer"))]
fn mp4_writers() -> Result<Arc<dyn WriterFactory>> {
    Err(anyhow!("mp4 recording requires the record-gstreamer feature"))
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<CamwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
