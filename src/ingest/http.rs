//! HTTP frame source.
//!
//! Pulls MJPEG (`multipart/x-mixed-replace`) or single-JPEG snapshots from IP
//! cameras such as ESP32-CAM boards, and decodes each JPEG to RGB in-memory.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::{Duration, Instant};

use image::GenericImageView;
use url::Url;

use super::FrameSource;
use crate::frame::{DeviceProperties, RawFrame};

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for an HTTP camera source.
#[derive(Clone, Debug)]
pub struct HttpConfig {
    /// Stream URL, `http://` or `https://`.
    pub url: String,
    /// Expected frame rate, used for the health grace window.
    pub target_fps: u32,
}

pub struct HttpSource {
    config: HttpConfig,
    stream: Option<HttpStream>,
    last_frame_at: Option<Instant>,
    connected_at: Instant,
    frame_count: u64,
    last_error: Option<String>,
    properties: DeviceProperties,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    SingleJpeg,
}

impl HttpSource {
    pub fn open(config: HttpConfig) -> Result<Self> {
        Url::parse(&config.url).context("parse http camera url")?;
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .build();
        let response = agent
            .get(&config.url)
            .call()
            .with_context(|| format!("connect to http camera {}", config.url))?;
        let content_type = response.header("Content-Type").unwrap_or("");
        let stream = if content_type.to_lowercase().contains("multipart") {
            HttpStream::Mjpeg(MjpegStream::new(response.into_reader()))
        } else {
            HttpStream::SingleJpeg
        };
        log::info!("HttpSource: connected to {}", config.url);
        Ok(Self {
            config,
            stream: Some(stream),
            last_frame_at: None,
            connected_at: Instant::now(),
            frame_count: 0,
            last_error: None,
            properties: DeviceProperties::default(),
        })
    }
}

impl FrameSource for HttpSource {
    fn read(&mut self) -> Result<RawFrame> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("http source {} is closed", self.config.url))?;
        let jpeg_bytes = match stream {
            HttpStream::Mjpeg(stream) => stream.read_next_jpeg(),
            HttpStream::SingleJpeg => fetch_single_jpeg(&self.config.url),
        };
        let jpeg_bytes = jpeg_bytes.inspect_err(|err| self.last_error = Some(err.to_string()))?;

        let (pixels, width, height) = decode_jpeg(&jpeg_bytes)?;
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        self.properties = DeviceProperties::new(width, height, None);
        RawFrame::new(pixels, width, height, self.frame_count)
    }

    fn is_ready(&self) -> bool {
        if self.stream.is_none() || self.last_error.is_some() {
            return false;
        }
        let Some(last_frame_at) = self.last_frame_at else {
            return self.connected_at.elapsed() <= Duration::from_secs(5);
        };
        last_frame_at.elapsed() <= health_grace(self.config.target_fps)
    }

    fn close(&mut self) {
        self.stream = None;
    }

    fn properties(&self) -> DeviceProperties {
        self.properties
    }

    fn describe(&self) -> String {
        self.config.url.clone()
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_single_jpeg(url: &str) -> Result<Vec<u8>> {
    let response = ureq::get(url)
        .timeout(READ_TIMEOUT)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

fn decode_jpeg(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    let (width, height) = image.dimensions();
    Ok((image.into_rgb8().into_raw(), width, height))
}

/// Locate the first complete SOI..EOI span in `buffer`.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

fn health_grace(target_fps: u32) -> Duration {
    let base_ms = if target_fps == 0 {
        2_000
    } else {
        (1000 / target_fps).saturating_mul(6)
    };
    Duration::from_millis(base_ms.max(2_000) as u64)
}
