//! Local video file source using FFmpeg.
//!
//! Frames are decoded in-memory and scaled to RGB24. Reaching the end of the
//! file is reported as a read failure; the session's reconnect reopens the
//! file, so a file source loops.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use std::path::PathBuf;

use super::FrameSource;
use crate::frame::{DeviceProperties, RawFrame};

/// Configuration for a local file source.
#[derive(Clone, Debug)]
pub struct FileConfig {
    pub path: PathBuf,
    /// Fallback frame rate when the container carries none.
    pub target_fps: u32,
}

pub struct FileSource {
    config: FileConfig,
    decoder_state: Option<DecoderState>,
    frame_count: u64,
    last_error: Option<String>,
    properties: DeviceProperties,
}

struct DecoderState {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
}

impl FileSource {
    pub fn open(config: FileConfig) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&config.path).with_context(|| {
            format!(
                "failed to open file input '{}' with ffmpeg",
                config.path.display()
            )
        })?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("file has no video track"))?;
        let stream_index = input_stream.index();
        let rate = input_stream.avg_frame_rate();
        let fps = (rate.denominator() != 0)
            .then(|| rate.numerator() as f64 / rate.denominator() as f64)
            .or((config.target_fps > 0).then_some(config.target_fps as f64));
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        log::info!("FileSource: opened {} (ffmpeg)", config.path.display());
        Ok(Self {
            properties: DeviceProperties::new(decoder.width(), decoder.height(), fps),
            config,
            decoder_state: Some(DecoderState {
                input,
                stream_index,
                decoder,
                scaler,
            }),
            frame_count: 0,
            last_error: None,
        })
    }
}

impl FrameSource for FileSource {
    fn read(&mut self) -> Result<RawFrame> {
        let state = self
            .decoder_state
            .as_mut()
            .ok_or_else(|| anyhow!("file source {} is closed", self.config.path.display()))?;

        let mut decoded = ffmpeg::frame::Video::empty();
        let mut rgb_frame = ffmpeg::frame::Video::empty();

        // Drain frames the decoder already holds before feeding more packets.
        loop {
            if state.decoder.receive_frame(&mut decoded).is_ok() {
                state
                    .scaler
                    .run(&decoded, &mut rgb_frame)
                    .context("scale frame to RGB")?;
                let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
                self.frame_count += 1;
                return RawFrame::new(pixels, width, height, self.frame_count);
            }

            let Some((stream, packet)) = state.input.packets().next() else {
                self.last_error = Some("end of file".to_string());
                return Err(anyhow!("{} reached end of file", self.config.path.display()));
            };
            if stream.index() != state.stream_index {
                continue;
            }
            state
                .decoder
                .send_packet(&packet)
                .context("send packet to ffmpeg decoder")?;
        }
    }

    fn is_ready(&self) -> bool {
        self.decoder_state.is_some() && self.last_error.is_none()
    }

    fn close(&mut self) {
        self.decoder_state = None;
    }

    fn properties(&self) -> DeviceProperties {
        self.properties
    }

    fn describe(&self) -> String {
        self.config.path.display().to_string()
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
