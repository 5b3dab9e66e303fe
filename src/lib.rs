//! camwatch: camera session manager.
//!
//! One capture device, many viewers. A `CameraSession` owns the device,
//! reconnects it when reads fail, serves JPEG frames (or captioned
//! placeholders while the device is down) and optionally records every frame
//! it reads through a bounded queue drained by a background writer.
//!
//! # Module Structure
//!
//! - `frame`: raw and encoded frame types, device properties
//! - `ingest`: frame sources (synthetic, V4L2, RTSP, HTTP, local files)
//! - `reconnect`: backoff schedule and give-up tracking
//! - `encode`: JPEG encoding, placeholder synthesis, multipart framing
//! - `recording`: bounded queue, recording worker, video writers
//! - `session`: the camera session orchestrator
//! - `config`: file + environment configuration
//! - `api`: HTTP routes (`/video_feed`, `/record`, `/screenshot`, ...)

pub mod api;
pub mod config;
pub mod encode;
pub mod frame;
pub mod ingest;
pub mod reconnect;
pub mod recording;
pub mod session;

pub use config::{CamwatchConfig, RecordingFormat};
pub use encode::{multipart_chunk, EncoderConfig, FrameEncoder};
pub use frame::{DeviceProperties, EncodedFrame, FrameKind, RawFrame};
#[cfg(feature = "ingest-file-ffmpeg")]
pub use ingest::file::{FileConfig, FileSource};
#[cfg(feature = "ingest-http")]
pub use ingest::http::{HttpConfig, HttpSource};
#[cfg(feature = "rtsp-gstreamer")]
pub use ingest::rtsp::{RtspConfig, RtspSource};
#[cfg(feature = "ingest-v4l2")]
pub use ingest::v4l2::{V4l2Config, V4l2Source};
pub use ingest::{
    CaptureSettings, DefaultOpener, FrameSource, SourceDescriptor, SourceOpener, SyntheticConfig,
    SyntheticSource,
};
pub use reconnect::{DeviceState, ReconnectPolicy, ReconnectTracker};
pub use recording::{
    MjpegFileWriter, MjpegWriterFactory, Recorder, RecorderConfig, RecorderSnapshot,
    RecordingSpec, RecordingSummary, VideoWriter, WriterFactory,
};
pub use session::{CameraSession, Fault, SessionOptions, SessionStatus};
