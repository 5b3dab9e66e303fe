//! Frame encoding for transport.
//!
//! `FrameEncoder` turns a `RawFrame` into JPEG bytes and synthesizes the
//! captioned placeholder frames viewers see while the device is down. Neither
//! operation keeps state between calls, so identical input always yields
//! identical bytes.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::frame::{RawFrame, RGB_CHANNELS};

mod font;

use font::{glyph, GLYPH_ADVANCE, GLYPH_HEIGHT, GLYPH_WIDTH};

/// Boundary token used by `/video_feed`.
pub const MULTIPART_BOUNDARY: &str = "frame";

/// Response content type matching `multipart_chunk`.
pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const DEFAULT_QUALITY: u8 = 80;
const PLACEHOLDER_BACKGROUND: [u8; 3] = [24, 24, 28];
const PLACEHOLDER_FOREGROUND: [u8; 3] = [220, 220, 220];
const PLACEHOLDER_MAX_SCALE: u32 = 6;

#[derive(Clone, Debug)]
pub struct EncoderConfig {
    /// JPEG quality, 1..=100.
    pub quality: u8,
    pub placeholder_width: u32,
    pub placeholder_height: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            quality: DEFAULT_QUALITY,
            placeholder_width: 640,
            placeholder_height: 480,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct FrameEncoder {
    config: EncoderConfig,
}

impl FrameEncoder {
    pub fn new(config: EncoderConfig) -> Result<Self> {
        if !(1..=100).contains(&config.quality) {
            return Err(anyhow!("jpeg quality must be within 1..=100"));
        }
        if config.placeholder_width == 0 || config.placeholder_height == 0 {
            return Err(anyhow!("placeholder size must be non-zero"));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Compress one frame to JPEG.
    pub fn encode(&self, frame: &RawFrame) -> Result<Vec<u8>> {
        self.encode_rgb(frame.pixels(), frame.width, frame.height)
    }

    fn encode_rgb(&self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
        let mut jpeg = Vec::with_capacity(pixels.len() / 8);
        JpegEncoder::new_with_quality(&mut jpeg, self.config.quality)
            .encode(pixels, width, height, ExtendedColorType::Rgb8)
            .with_context(|| format!("encode {}x{} frame as jpeg", width, height))?;
        Ok(jpeg)
    }

    /// Solid frame with `caption` centred, encoded as JPEG.
    pub fn placeholder(&self, caption: &str) -> Result<Vec<u8>> {
        let width = self.config.placeholder_width;
        let height = self.config.placeholder_height;
        let pixels = render_caption(width, height, caption);
        self.encode_rgb(&pixels, width, height)
    }
}

fn render_caption(width: u32, height: u32, caption: &str) -> Vec<u8> {
    let mut pixels = Vec::with_capacity((width * height) as usize * RGB_CHANNELS);
    for _ in 0..width * height {
        pixels.extend_from_slice(&PLACEHOLDER_BACKGROUND);
    }

    let chars: Vec<char> = caption.chars().collect();
    if chars.is_empty() {
        return pixels;
    }
    let text_columns = chars.len() as u32 * GLYPH_ADVANCE - 1;
    let scale = ((width * 3 / 4) / text_columns)
        .min((height / 4) / GLYPH_HEIGHT)
        .clamp(1, PLACEHOLDER_MAX_SCALE);
    let text_width = text_columns * scale;
    let text_height = GLYPH_HEIGHT * scale;
    let origin_x = width.saturating_sub(text_width) / 2;
    let origin_y = height.saturating_sub(text_height) / 2;

    for (index, c) in chars.iter().enumerate() {
        let rows = glyph(*c);
        let glyph_x = origin_x + index as u32 * GLYPH_ADVANCE * scale;
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if bits & (1 << (GLYPH_WIDTH - 1 - col)) == 0 {
                    continue;
                }
                let x0 = glyph_x + col * scale;
                let y0 = origin_y + row as u32 * scale;
                fill_block(&mut pixels, width, height, x0, y0, scale);
            }
        }
    }
    pixels
}

fn fill_block(pixels: &mut [u8], width: u32, height: u32, x0: u32, y0: u32, size: u32) {
    for y in y0..(y0 + size).min(height) {
        for x in x0..(x0 + size).min(width) {
            let offset = ((y * width + x) as usize) * RGB_CHANNELS;
            pixels[offset..offset + RGB_CHANNELS].copy_from_slice(&PLACEHOLDER_FOREGROUND);
        }
    }
}

/// One part of a `multipart/x-mixed-replace` stream carrying `jpeg`.
pub fn multipart_chunk(jpeg: &[u8]) -> Vec<u8> {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\n\r\n",
        MULTIPART_BOUNDARY
    );
    let mut chunk = Vec::with_capacity(header.len() + jpeg.len() + 2);
    chunk.extend_from_slice(header.as_bytes());
    chunk.extend_from_slice(jpeg);
    chunk.extend_from_slice(b"\r\n");
    chunk
}
