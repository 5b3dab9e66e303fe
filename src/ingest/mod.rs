//! Frame sources.
//!
//! This module provides the capture devices a camera session can own:
//! - Synthetic `stub://` sources (always available, used by tests and the demo)
//! - USB/V4L2 devices by index (feature: ingest-v4l2)
//! - RTSP streams (feature: rtsp-gstreamer)
//! - MJPEG/JPEG over HTTP (feature: ingest-http)
//! - Local video files (feature: ingest-file-ffmpeg)
//!
//! Every backend produces RGB24 `RawFrame`s through the `FrameSource` trait. A
//! source descriptor is parsed once at session construction and reopened
//! through a `SourceOpener` on every reconnect.

use anyhow::{anyhow, Result};
use std::fmt;
use std::path::PathBuf;

use crate::frame::{DeviceProperties, RawFrame};

#[cfg(feature = "ingest-file-ffmpeg")]
pub mod file;
#[cfg(feature = "ingest-http")]
pub mod http;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
#[cfg(feature = "rtsp-gstreamer")]
pub mod rtsp;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

pub use synthetic::{SyntheticConfig, SyntheticSource};

/// An open (or failed) capture device.
///
/// `read` never blocks indefinitely: backends bound every wait with a timeout
/// and report a stall as a read failure.
pub trait FrameSource: Send {
    /// Read one frame. Fails when the handle is not open or the device yields nothing.
    fn read(&mut self) -> Result<RawFrame>;

    /// Whether the handle is currently usable.
    fn is_ready(&self) -> bool;

    /// Release underlying resources. Safe to call more than once.
    fn close(&mut self);

    /// Best-effort width/height/fps.
    fn properties(&self) -> DeviceProperties;

    /// Human readable name for logs.
    fn describe(&self) -> String;
}

/// Where frames come from. Immutable for the lifetime of a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceDescriptor {
    /// Local capture device index (`/dev/video<N>` on Linux).
    Device(u32),
    /// Local video file.
    File(PathBuf),
    /// Network stream URL (`rtsp://`, `http://`, `https://`).
    Network(String),
    /// Synthetic test pattern (`stub://name[?options]`).
    Synthetic(String),
}

impl SourceDescriptor {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(anyhow!("camera source must not be empty"));
        }
        if raw.chars().all(|c| c.is_ascii_digit()) {
            let index: u32 = raw
                .parse()
                .map_err(|_| anyhow!("device index '{}' is out of range", raw))?;
            return Ok(Self::Device(index));
        }
        if raw.starts_with("stub://") {
            return Ok(Self::Synthetic(raw.to_string()));
        }
        if raw.contains("://") {
            return Ok(Self::Network(raw.to_string()));
        }
        Ok(Self::File(PathBuf::from(raw)))
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(index) => write!(f, "device:{}", index),
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Network(url) => write!(f, "{}", url),
            Self::Synthetic(name) => write!(f, "{}", name),
        }
    }
}

impl std::str::FromStr for SourceDescriptor {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Opens a descriptor into a live `FrameSource`.
///
/// The session calls this at construction and on every reconnect.
pub trait SourceOpener: Send + Sync {
    fn open(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn FrameSource>>;
}

/// Preferred capture parameters handed to the built-in backends.
#[derive(Clone, Debug)]
pub struct CaptureSettings {
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            target_fps: 25,
            width: 640,
            height: 480,
        }
    }
}

/// Dispatches descriptors to the backends compiled into this build.
#[derive(Clone, Debug, Default)]
pub struct DefaultOpener {
    settings: CaptureSettings,
}

impl DefaultOpener {
    pub fn new(settings: CaptureSettings) -> Self {
        Self { settings }
    }
}

impl SourceOpener for DefaultOpener {
    fn open(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn FrameSource>> {
        match descriptor {
            SourceDescriptor::Synthetic(raw) => {
                let config = SyntheticConfig::from_descriptor(raw, &self.settings)?;
                Ok(Box::new(SyntheticSource::new(config)))
            }
            SourceDescriptor::Device(index) => open_device(*index, &self.settings),
            SourceDescriptor::Network(url) => open_network(url, &self.settings),
            SourceDescriptor::File(path) => open_file(path, &self.settings),
        }
    }
}

#[cfg(feature = "ingest-v4l2")]
fn open_device(index: u32, settings: &CaptureSettings) -> Result<Box<dyn FrameSource>> {
    let config = v4l2::V4l2Config {
        device: format!("/dev/video{}", index),
        target_fps: settings.target_fps,
        width: settings.width,
        height: settings.height,
    };
    Ok(Box::new(v4l2::V4l2Source::open(config)?))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_device(index: u32, _settings: &CaptureSettings) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!(
        "capture device {} requires the ingest-v4l2 feature",
        index
    ))
}

fn open_network(url: &str, settings: &CaptureSettings) -> Result<Box<dyn FrameSource>> {
    let scheme = url.split("://").next().unwrap_or_default().to_lowercase();
    match scheme.as_str() {
        "rtsp" | "rtsps" => open_rtsp(url, settings),
        "http" | "https" => open_http(url, settings),
        other => Err(anyhow!(
            "unsupported stream scheme '{}'; expected rtsp or http(s)",
            other
        )),
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn open_rtsp(url: &str, settings: &CaptureSettings) -> Result<Box<dyn FrameSource>> {
    let config = rtsp::RtspConfig {
        url: url.to_string(),
        target_fps: settings.target_fps,
    };
    Ok(Box::new(rtsp::RtspSource::open(config)?))
}

#[cfg(not(feature = "rtsp-gstreamer"))]
fn open_rtsp(url: &str, _settings: &CaptureSettings) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!("RTSP source {} requires the rtsp-gstreamer feature", url))
}

#[cfg(feature = "ingest-http")]
fn open_http(url: &str, settings: &CaptureSettings) -> Result<Box<dyn FrameSource>> {
    let config = http::HttpConfig {
        url: url.to_string(),
        target_fps: settings.target_fps,
    };
    Ok(Box::new(http::HttpSource::open(config)?))
}

#[cfg(not(feature = "ingest-http"))]
fn open_http(url: &str, _settings: &CaptureSettings) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!("HTTP source {} requires the ingest-http feature", url))
}

#[cfg(feature = "ingest-file-ffmpeg")]
fn open_file(path: &std::path::Path, settings: &CaptureSettings) -> Result<Box<dyn FrameSource>> {
    let config = file::FileConfig {
        path: path.to_path_buf(),
        target_fps: settings.target_fps,
    };
    Ok(Box::new(file::FileSource::open(config)?))
}

#[cfg(not(feature = "ingest-file-ffmpeg"))]
fn open_file(path: &std::path::Path, _settings: &CaptureSettings) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!(
        "file source {} requires the ingest-file-ffmpeg feature",
        path.display()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_index() -> Result<()> {
        assert_eq!(SourceDescriptor::parse("0")?, SourceDescriptor::Device(0));
        assert_eq!(SourceDescriptor::parse(" 2 ")?, SourceDescriptor::Device(2));
        Ok(())
    }

    #[test]
    fn parses_network_and_stub_urls() -> Result<()> {
        assert_eq!(
            SourceDescriptor::parse("rtsp://10.0.0.211")?,
            SourceDescriptor::Network("rtsp://10.0.0.211".to_string())
        );
        assert_eq!(
            SourceDescriptor::parse("http://10.181.5.98/stream")?,
            SourceDescriptor::Network("http://10.181.5.98/stream".to_string())
        );
        assert_eq!(
            SourceDescriptor::parse("stub://front")?,
            SourceDescriptor::Synthetic("stub://front".to_string())
        );
        Ok(())
    }

    #[test]
    fn parses_file_paths() -> Result<()> {
        assert_eq!(
            SourceDescriptor::parse("video_path.mp4")?,
            SourceDescriptor::File(PathBuf::from("video_path.mp4"))
        );
        Ok(())
    }

    #[test]
    fn rejects_empty_source() {
        assert!(SourceDescriptor::parse("   ").is_err());
        assert!(SourceDescriptor::parse("99999999999999").is_err());
    }

    #[test]
    fn default_opener_opens_stub_sources() -> Result<()> {
        let opener = DefaultOpener::default();
        let mut source = opener.open(&SourceDescriptor::parse("stub://cam?width=32&height=24")?)?;
        assert!(source.is_ready());
        let frame = source.read()?;
        assert_eq!(frame.dimensions(), (32, 24));
        Ok(())
    }

    #[test]
    fn unknown_scheme_fails_to_open() {
        let opener = DefaultOpener::default();
        let result = opener.open(&SourceDescriptor::Network("ftp://camera".to_string()));
        assert!(result.is_err());
    }
}
