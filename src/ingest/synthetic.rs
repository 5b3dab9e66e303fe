//! Synthetic `stub://` frame source.
//!
//! Generates a moving RGB test pattern at the target frame rate. Options are
//! passed as query parameters on the descriptor:
//!
//! - `width`, `height`: frame size (defaults from capture settings)
//! - `fps`: pacing rate; `0` disables pacing
//! - `drop_every`: every Nth read fails, simulating a flaky network camera
//!
//! Example: `stub://front?width=320&height=240&fps=15&drop_every=50`

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

use super::{CaptureSettings, FrameSource};
use crate::frame::{expected_len, DeviceProperties, RawFrame};

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    /// Fail every Nth read (`None` never fails).
    pub drop_every: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "stub://camera".to_string(),
            width: 640,
            height: 480,
            target_fps: 25,
            drop_every: None,
        }
    }
}

impl SyntheticConfig {
    pub fn from_descriptor(raw: &str, settings: &CaptureSettings) -> Result<Self> {
        let mut config = Self {
            name: raw.split('?').next().unwrap_or(raw).to_string(),
            width: settings.width,
            height: settings.height,
            target_fps: settings.target_fps,
            drop_every: None,
        };
        let Some(query) = raw.split_once('?').map(|(_, q)| q) else {
            return Ok(config);
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("stub option '{}' is missing a value", pair))?;
            let parsed: u64 = value
                .parse()
                .map_err(|_| anyhow!("stub option '{}' must be an integer", key))?;
            let narrow = || {
                u32::try_from(parsed)
                    .map_err(|_| anyhow!("stub option '{}' is out of range: {}", key, parsed))
            };
            match key {
                "width" => config.width = narrow()?,
                "height" => config.height = narrow()?,
                "fps" => config.target_fps = narrow()?,
                "drop_every" => config.drop_every = (parsed > 0).then_some(parsed),
                other => return Err(anyhow!("unknown stub option '{}'", other)),
            }
        }
        if config.width == 0 || config.height == 0 {
            return Err(anyhow!("stub frame size must be non-zero"));
        }
        expected_len(config.width, config.height)?;
        Ok(config)
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    frame_count: u64,
    reads: u64,
    last_frame_at: Option<Instant>,
    open: bool,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        log::info!(
            "SyntheticSource: connected to {} ({}x{} @ {} fps)",
            config.name,
            config.width,
            config.height,
            config.target_fps
        );
        Self {
            config,
            frame_count: 0,
            reads: 0,
            last_frame_at: None,
            open: true,
        }
    }

    fn pace(&mut self) {
        if self.config.target_fps == 0 {
            return;
        }
        let interval = Duration::from_millis((1000 / self.config.target_fps).max(1) as u64);
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_frame_at = Some(Instant::now());
    }

    /// Diagonal colour bands that drift one pixel per frame.
    fn generate_pixels(&self) -> Result<Vec<u8>> {
        let width = self.config.width as usize;
        let height = self.config.height as usize;
        let mut pixels = vec![0u8; expected_len(self.config.width, self.config.height)?];
        for y in 0..height {
            for x in 0..width {
                let offset = (y * width + x) * 3;
                let band = (x + y + self.frame_count as usize) % 256;
                pixels[offset] = band as u8;
                pixels[offset + 1] = (255 - band) as u8;
                pixels[offset + 2] = ((y * 255) / height.max(1)) as u8;
            }
        }
        Ok(pixels)
    }
}

impl FrameSource for SyntheticSource {
    fn read(&mut self) -> Result<RawFrame> {
        if !self.open {
            return Err(anyhow!("synthetic source {} is closed", self.config.name));
        }
        self.reads += 1;
        if let Some(every) = self.config.drop_every {
            if self.reads % every == 0 {
                return Err(anyhow!("synthetic source {} dropped a frame", self.config.name));
            }
        }
        self.pace();
        self.frame_count += 1;
        RawFrame::new(
            self.generate_pixels()?,
            self.config.width,
            self.config.height,
            self.frame_count,
        )
    }

    fn is_ready(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        if self.open {
            log::debug!("SyntheticSource: closed {}", self.config.name);
        }
        self.open = false;
    }

    fn properties(&self) -> DeviceProperties {
        DeviceProperties::new(
            self.config.width,
            self.config.height,
            Some(self.config.target_fps as f64),
        )
    }

    fn describe(&self) -> String {
        format!("{} (synthetic)", self.config.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unpaced(drop_every: Option<u64>) -> SyntheticSource {
        SyntheticSource::new(SyntheticConfig {
            name: "stub://test".to_string(),
            width: 16,
            height: 8,
            target_fps: 0,
            drop_every,
        })
    }

    #[test]
    fn synthetic_source_produces_frames() -> Result<()> {
        let mut source = unpaced(None);
        let frame = source.read()?;
        assert_eq!(frame.dimensions(), (16, 8));
        assert_eq!(frame.sequence, 1);
        assert_eq!(source.read()?.sequence, 2);
        Ok(())
    }

    #[test]
    fn consecutive_frames_differ() -> Result<()> {
        let mut source = unpaced(None);
        let a = source.read()?;
        let b = source.read()?;
        assert_ne!(a.pixels(), b.pixels());
        Ok(())
    }

    #[test]
    fn drop_every_fails_periodically() {
        let mut source = unpaced(Some(3));
        assert!(source.read().is_ok());
        assert!(source.read().is_ok());
        assert!(source.read().is_err());
        assert!(source.read().is_ok());
    }

    #[test]
    fn closed_source_is_not_ready() {
        let mut source = unpaced(None);
        source.close();
        source.close();
        assert!(!source.is_ready());
        assert!(source.read().is_err());
    }

    #[test]
    fn descriptor_options_override_settings() -> Result<()> {
        let config = SyntheticConfig::from_descriptor(
            "stub://front?width=320&height=240&fps=15&drop_every=50",
            &CaptureSettings::default(),
        )?;
        assert_eq!(config.name, "stub://front");
        assert_eq!((config.width, config.height), (320, 240));
        assert_eq!(config.target_fps, 15);
        assert_eq!(config.drop_every, Some(50));
        Ok(())
    }

    #[test]
    fn descriptor_rejects_unknown_options() {
        let settings = CaptureSettings::default();
        assert!(SyntheticConfig::from_descriptor("stub://x?zoom=2", &settings).is_err());
        assert!(SyntheticConfig::from_descriptor("stub://x?width=abc", &settings).is_err());
        assert!(SyntheticConfig::from_descriptor("stub://x?width=0", &settings).is_err());
    }

    #[test]
    fn descriptor_rejects_sizes_that_do_not_fit() {
        let settings = CaptureSettings::default();
        let err = SyntheticConfig::from_descriptor("stub://x?width=4294967297", &settings)
            .unwrap_err();
        assert!(err.to_string().contains("out of range"), "{}", err);
        assert!(SyntheticConfig::from_descriptor("stub://x?fps=4294967296", &settings).is_err());
        if usize::BITS == 32 {
            assert!(SyntheticConfig::from_descriptor(
                "stub://x?width=65536&height=65536",
                &settings
            )
            .is_err());
        }
    }

    #[test]
    fn oversized_config_fails_read_instead_of_panicking() {
        let mut source = SyntheticSource::new(SyntheticConfig {
            width: u32::MAX,
            height: u32::MAX,
            target_fps: 0,
            ..SyntheticConfig::default()
        });
        assert!(source.read().is_err());
    }

    #[test]
    fn reports_target_fps_as_device_fps() {
        let source = SyntheticSource::new(SyntheticConfig::default());
        assert_eq!(source.properties().fps, Some(25.0));
    }
}
