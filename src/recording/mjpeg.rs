//! Motion-JPEG file writer.
//!
//! Each frame is JPEG-compressed and appended to the file back to back, the
//! layout ffmpeg and VLC read as raw `mjpeg`. Frame rate is not stored in the
//! stream; players default to 25 fps unless told otherwise.

use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::{RecordingSpec, VideoWriter, WriterFactory};
use crate::encode::FrameEncoder;
use crate::frame::RawFrame;

pub struct MjpegFileWriter {
    path: PathBuf,
    width: u32,
    height: u32,
    encoder: FrameEncoder,
    out: Option<BufWriter<File>>,
}

impl MjpegFileWriter {
    pub fn create(spec: &RecordingSpec, encoder: FrameEncoder) -> Result<Self> {
        let file = File::create(&spec.path)
            .with_context(|| format!("create recording file {}", spec.path.display()))?;
        Ok(Self {
            path: spec.path.clone(),
            width: spec.width,
            height: spec.height,
            encoder,
            out: Some(BufWriter::new(file)),
        })
    }
}

impl VideoWriter for MjpegFileWriter {
    fn write_frame(&mut self, frame: &RawFrame) -> Result<()> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(anyhow!(
                "frame is {}x{}, recording is {}x{}",
                frame.width,
                frame.height,
                self.width,
                self.height
            ));
        }
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| anyhow!("recording {} already finished", self.path.display()))?;
        let jpeg = self.encoder.encode(frame)?;
        out.write_all(&jpeg)
            .with_context(|| format!("write frame to {}", self.path.display()))?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let Some(mut out) = self.out.take() else {
            return Ok(());
        };
        out.flush()
            .with_context(|| format!("flush {}", self.path.display()))?;
        out.get_ref()
            .sync_all()
            .with_context(|| format!("sync {}", self.path.display()))?;
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Clone, Debug, Default)]
pub struct MjpegWriterFactory {
    encoder: FrameEncoder,
}

impl MjpegWriterFactory {
    pub fn new(encoder: FrameEncoder) -> Self {
        Self { encoder }
    }
}

impl WriterFactory for MjpegWriterFactory {
    fn extension(&self) -> &str {
        "mjpeg"
    }

    fn create(&self, spec: &RecordingSpec) -> Result<Box<dyn VideoWriter>> {
        Ok(Box::new(MjpegFileWriter::create(spec, self.encoder.clone())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(dir: &Path) -> RecordingSpec {
        RecordingSpec {
            path: dir.join("clip.mjpeg"),
            width: 8,
            height: 8,
            fps: 25.0,
        }
    }

    fn count_jpeg_starts(bytes: &[u8]) -> usize {
        bytes.windows(3).filter(|w| *w == [0xFF, 0xD8, 0xFF]).count()
    }

    #[test]
    fn appends_one_jpeg_per_frame() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let spec = spec(dir.path());
        let mut writer = MjpegWriterFactory::default().create(&spec)?;
        for seq in 1..=3 {
            writer.write_frame(&RawFrame::filled(8, 8, [10, 20, 30], seq)?)?;
        }
        writer.finish()?;

        let bytes = std::fs::read(&spec.path)?;
        assert_eq!(count_jpeg_starts(&bytes), 3);
        assert!(bytes.ends_with(&[0xFF, 0xD9]));
        Ok(())
    }

    #[test]
    fn rejects_mismatched_dimensions() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut writer = MjpegFileWriter::create(&spec(dir.path()), FrameEncoder::default())?;
        let err = writer
            .write_frame(&RawFrame::filled(4, 4, [0, 0, 0], 1)?)
            .unwrap_err();
        assert!(err.to_string().contains("4x4"));
        writer.finish()?;
        assert!(std::fs::read(&spec(dir.path()).path)?.is_empty());
        Ok(())
    }

    #[test]
    fn writes_after_finish_fail() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut writer = MjpegFileWriter::create(&spec(dir.path()), FrameEncoder::default())?;
        writer.finish()?;
        writer.finish()?;
        assert!(writer
            .write_frame(&RawFrame::filled(8, 8, [0, 0, 0], 1)?)
            .is_err());
        Ok(())
    }
}
