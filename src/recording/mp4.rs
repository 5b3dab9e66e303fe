//! H.264/MP4 file writer built on a GStreamer pipeline:
//! `appsrc ! videoconvert ! x264enc ! h264parse ! mp4mux ! filesink`.
//!
//! Buffers are timestamped from the recording's frame rate rather than the
//! wall clock, so playback speed follows the device's reported rate.

use anyhow::{anyhow, Context, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use std::path::{Path, PathBuf};

use super::{RecordingSpec, VideoWriter, WriterFactory};
use crate::frame::RawFrame;

const EOS_TIMEOUT_SECS: u64 = 10;

pub struct Mp4FileWriter {
    path: PathBuf,
    width: u32,
    height: u32,
    frame_duration_ns: u64,
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    frames: u64,
    finished: bool,
}

impl Mp4FileWriter {
    pub fn create(spec: &RecordingSpec) -> Result<Self> {
        gst::init().context("initialize gstreamer")?;
        if spec.fps <= 0.0 || !spec.fps.is_finite() {
            return Err(anyhow!("recording fps must be positive, got {}", spec.fps));
        }

        // Millihertz keeps fractional rates such as 29.97 intact.
        let framerate = gst::Fraction::new((spec.fps * 1000.0).round() as i32, 1000);
        let caps = gst::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .field("width", spec.width as i32)
            .field("height", spec.height as i32)
            .field("framerate", framerate)
            .build();

        let appsrc = gst_app::AppSrc::builder()
            .name("src")
            .caps(&caps)
            .format(gst::Format::Time)
            .build();

        let videoconvert = make_element("videoconvert")?;
        let encoder = make_element("x264enc")?;
        encoder.set_property_from_str("tune", "zerolatency");
        encoder.set_property_from_str("speed-preset", "veryfast");
        let parser = make_element("h264parse")?;
        let muxer = make_element("mp4mux")?;
        let filesink = gst::ElementFactory::make("filesink")
            .property("location", spec.path.to_string_lossy().to_string())
            .build()
            .context("create filesink")?;

        let pipeline = gst::Pipeline::new();
        pipeline
            .add_many([
                appsrc.upcast_ref(),
                &videoconvert,
                &encoder,
                &parser,
                &muxer,
                &filesink,
            ])
            .context("add recording elements")?;
        gst::Element::link_many([
            appsrc.upcast_ref(),
            &videoconvert,
            &encoder,
            &parser,
            &muxer,
            &filesink,
        ])
        .context("link recording elements")?;

        pipeline
            .set_state(gst::State::Playing)
            .context("start recording pipeline")?;

        Ok(Self {
            path: spec.path.clone(),
            width: spec.width,
            height: spec.height,
            frame_duration_ns: (1_000_000_000.0 / spec.fps).round() as u64,
            pipeline,
            appsrc,
            frames: 0,
            finished: false,
        })
    }
}

fn make_element(name: &str) -> Result<gst::Element> {
    gst::ElementFactory::make(name)
        .build()
        .with_context(|| format!("create gstreamer element {}", name))
}

impl VideoWriter for Mp4FileWriter {
    fn write_frame(&mut self, frame: &RawFrame) -> Result<()> {
        if self.finished {
            return Err(anyhow!("recording {} already finished", self.path.display()));
        }
        if frame.dimensions() != (self.width, self.height) {
            return Err(anyhow!(
                "frame is {}x{}, recording is {}x{}",
                frame.width,
                frame.height,
                self.width,
                self.height
            ));
        }

        let mut buffer = gst::Buffer::from_slice(frame.pixels().to_vec());
        {
            let buffer = buffer
                .get_mut()
                .ok_or_else(|| anyhow!("recording buffer is shared"))?;
            buffer.set_pts(gst::ClockTime::from_nseconds(
                self.frames * self.frame_duration_ns,
            ));
            buffer.set_duration(gst::ClockTime::from_nseconds(self.frame_duration_ns));
        }
        self.appsrc
            .push_buffer(buffer)
            .map_err(|flow| anyhow!("push frame to recording pipeline: {:?}", flow))?;
        self.frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        self.appsrc
            .end_of_stream()
            .map_err(|flow| anyhow!("send end-of-stream: {:?}", flow))?;

        let mut result = Ok(());
        if let Some(bus) = self.pipeline.bus() {
            result = Err(anyhow!("timed out waiting for end-of-stream"));
            for message in bus.iter_timed(gst::ClockTime::from_seconds(EOS_TIMEOUT_SECS)) {
                match message.view() {
                    gst::MessageView::Eos(..) => {
                        result = Ok(());
                        break;
                    }
                    gst::MessageView::Error(err) => {
                        result = Err(anyhow!("recording pipeline error: {}", err.error()));
                        break;
                    }
                    _ => {}
                }
            }
        }

        self.pipeline
            .set_state(gst::State::Null)
            .context("stop recording pipeline")?;
        result
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Mp4FileWriter {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

#[derive(Clone, Debug, Default)]
pub struct Mp4WriterFactory;

impl WriterFactory for Mp4WriterFactory {
    fn extension(&self) -> &str {
        "mp4"
    }

    fn create(&self, spec: &RecordingSpec) -> Result<Box<dyn VideoWriter>> {
        Ok(Box::new(Mp4FileWriter::create(spec)?))
    }
}
