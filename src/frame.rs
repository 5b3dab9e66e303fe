//! Frame types shared by the capture, encode and recording paths.
//!
//! - `RawFrame`: one decoded RGB24 image as read from a device. Pixel storage is
//!   reference counted so the live path and the recording queue can both hold it.
//! - `EncodedFrame`: the JPEG bytes handed to a viewer, tagged live or placeholder.
//! - `DeviceProperties`: best-effort device metadata used to size recordings.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Instant;

/// Bytes per RGB24 pixel.
pub const RGB_CHANNELS: usize = 3;

/// One raw RGB24 frame.
#[derive(Clone)]
pub struct RawFrame {
    data: Arc<[u8]>,

    pub width: u32,
    pub height: u32,

    /// Monotonic sequence assigned by the source that produced the frame.
    pub sequence: u64,

    capture_instant: Instant,
}

impl RawFrame {
    /// Build a frame, checking that `data` holds exactly `width * height` RGB pixels.
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let expected = expected_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data: data.into(),
            width,
            height,
            sequence,
            capture_instant: Instant::now(),
        })
    }

    /// Solid-colour frame. Used by synthetic sources and tests.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3], sequence: u64) -> Result<Self> {
        let len = expected_len(width, height)?;
        let mut data = Vec::with_capacity(len);
        for _ in 0..len / RGB_CHANNELS {
            data.extend_from_slice(&rgb);
        }
        Self::new(data, width, height, sequence)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl std::fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish()
    }
}

pub(crate) fn expected_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(RGB_CHANNELS))
        .ok_or_else(|| anyhow!("RGB frame dimensions overflow"))
}

/// Whether an encoded frame came from the device or was synthesized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Live,
    Placeholder,
}

/// Transport-ready JPEG bytes.
#[derive(Clone, Debug)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub kind: FrameKind,
}

impl EncodedFrame {
    pub fn live(data: Vec<u8>) -> Self {
        Self {
            data,
            kind: FrameKind::Live,
        }
    }

    pub fn placeholder(data: Vec<u8>) -> Self {
        Self {
            data,
            kind: FrameKind::Placeholder,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.kind == FrameKind::Placeholder
    }
}

/// Best-effort device metadata.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DeviceProperties {
    pub width: u32,
    pub height: u32,
    /// `None` when the device does not report a frame rate (or reports 0).
    pub fps: Option<f64>,
}

impl DeviceProperties {
    pub fn new(width: u32, height: u32, fps: Option<f64>) -> Self {
        Self {
            width,
            height,
            fps: fps.filter(|fps| fps.is_finite() && *fps > 0.0),
        }
    }

    /// Frame rate to record at, falling back when the device reports none.
    pub fn fps_or(&self, fallback: f64) -> f64 {
        self.fps.unwrap_or(fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_frame_rejects_wrong_length() {
        assert!(RawFrame::new(vec![0u8; 10], 2, 2, 0).is_err());
        assert!(RawFrame::new(vec![0u8; 12], 2, 2, 0).is_ok());
    }

    #[test]
    fn filled_frame_has_uniform_pixels() -> Result<()> {
        let frame = RawFrame::filled(4, 3, [10, 20, 30], 7)?;
        assert_eq!(frame.byte_len(), 36);
        assert_eq!(frame.sequence, 7);
        assert!(frame
            .pixels()
            .chunks(3)
            .all(|px| px == [10, 20, 30]));
        Ok(())
    }

    #[test]
    fn cloned_frames_share_pixels() -> Result<()> {
        let frame = RawFrame::filled(2, 2, [1, 2, 3], 0)?;
        let clone = frame.clone();
        assert_eq!(frame.pixels().as_ptr(), clone.pixels().as_ptr());
        Ok(())
    }

    #[test]
    fn zero_fps_is_treated_as_unknown() {
        let props = DeviceProperties::new(640, 480, Some(0.0));
        assert_eq!(props.fps, None);
        assert_eq!(props.fps_or(25.0), 25.0);

        let props = DeviceProperties::new(640, 480, Some(30.0));
        assert_eq!(props.fps_or(25.0), 30.0);
    }
}
