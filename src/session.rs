//! Camera session: one capture device shared by many viewers.
//!
//! Lock order is `control` -> `device` -> `link`/`recorder`; `link` and
//! `recorder` are only ever held briefly and never together. `get_frame`
//! enqueues for recording while it still holds the device lock, so the
//! recording sees frames in read order. Encoding runs after the device lock
//! is released.
//!
//! A reconnect waits its backoff and opens the source without holding the
//! device lock. Only one caller reconnects at a time; others get a
//! placeholder straight away, and `status`/`reset_device` only touch `link`.

use anyhow::{anyhow, bail, Context, Result};
use chrono::Local;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::encode::FrameEncoder;
use crate::frame::{EncodedFrame, RawFrame};
use crate::ingest::{DefaultOpener, FrameSource, SourceDescriptor, SourceOpener};
use crate::reconnect::{DeviceState, ReconnectPolicy, ReconnectTracker};
use crate::recording::{
    recording_path, MjpegWriterFactory, Recorder, RecorderConfig, RecorderSnapshot,
    RecordingSpec, RecordingSummary, WriterFactory,
};

pub const CAPTION_RECONNECTING: &str = "RECONNECTING";
pub const CAPTION_NO_SIGNAL: &str = "NO SIGNAL";
pub const CAPTION_UNAVAILABLE: &str = "DEVICE UNAVAILABLE";
pub const CAPTION_ENCODE_ERROR: &str = "ENCODE ERROR";

/// Frame rate assumed when the device reports none.
pub const DEFAULT_FPS_FALLBACK: f64 = 25.0;

/// Most recent fault observed by the session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum Fault {
    DeviceOpen(String),
    DeviceRead(String),
    RecordingWrite(String),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::DeviceOpen(msg) => write!(f, "device open failed: {}", msg),
            Fault::DeviceRead(msg) => write!(f, "device read failed: {}", msg),
            Fault::RecordingWrite(msg) => write!(f, "recording write failed: {}", msg),
        }
    }
}

impl std::error::Error for Fault {}

/// Everything a session needs besides its source descriptor.
pub struct SessionOptions {
    pub reconnect: ReconnectPolicy,
    pub recorder: RecorderConfig,
    pub recordings_dir: PathBuf,
    pub fps_fallback: f64,
    pub encoder: FrameEncoder,
    pub opener: Arc<dyn SourceOpener>,
    pub writers: Arc<dyn WriterFactory>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        let encoder = FrameEncoder::default();
        Self {
            reconnect: ReconnectPolicy::default(),
            recorder: RecorderConfig::default(),
            recordings_dir: PathBuf::from("recordings"),
            fps_fallback: DEFAULT_FPS_FALLBACK,
            writers: Arc::new(MjpegWriterFactory::new(encoder.clone())),
            encoder,
            opener: Arc::new(DefaultOpener::default()),
        }
    }
}

/// Serializable view of a session for `/status`.
#[derive(Clone, Debug, Serialize)]
pub struct SessionStatus {
    pub source: String,
    pub device: Option<String>,
    pub device_state: DeviceState,
    pub reconnecting: bool,
    pub recording: bool,
    pub recording_path: Option<PathBuf>,
    pub frames_served: u64,
    pub placeholders_served: u64,
    pub reconnect_attempts: u64,
    pub consecutive_failures: u32,
    pub recorder: Option<RecorderSnapshot>,
    pub recording_degraded: bool,
    pub last_recording: Option<RecordingSummary>,
    pub last_fault: Option<Fault>,
}

/// Why no frame could be read on this request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outage {
    Closed,
    NoSignal,
    Reconnecting,
    Unavailable,
}

impl Outage {
    fn caption(self) -> &'static str {
        match self {
            Outage::Closed | Outage::NoSignal => CAPTION_NO_SIGNAL,
            Outage::Reconnecting => CAPTION_RECONNECTING,
            Outage::Unavailable => CAPTION_UNAVAILABLE,
        }
    }
}

impl fmt::Display for Outage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outage::Closed => write!(f, "session is shut down"),
            Outage::NoSignal => write!(f, "no device connected"),
            Outage::Reconnecting => write!(f, "device is reconnecting"),
            Outage::Unavailable => write!(f, "device unavailable until reset"),
        }
    }
}

struct DeviceSlot {
    handle: Option<Box<dyn FrameSource>>,
    /// Set by a failed read; cleared by a successful reopen.
    read_failed: bool,
    closed: bool,
}

impl DeviceSlot {
    fn is_ready(&self) -> bool {
        !self.read_failed && self.handle.as_ref().is_some_and(|h| h.is_ready())
    }

    fn close_handle(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close();
        }
    }
}

/// Connection bookkeeping readable without the device lock.
struct Link {
    tracker: ReconnectTracker,
    state: DeviceState,
    device: Option<String>,
}

/// Clears the in-progress flag when the reconnecting caller is done.
struct ReconnectClaim<'a>(&'a AtomicBool);

impl<'a> ReconnectClaim<'a> {
    fn try_claim(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ReconnectClaim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct CameraSession {
    source: SourceDescriptor,
    opener: Arc<dyn SourceOpener>,
    writers: Arc<dyn WriterFactory>,
    encoder: FrameEncoder,
    recorder_config: RecorderConfig,
    recordings_dir: PathBuf,
    fps_fallback: f64,

    control: Mutex<()>,
    device: Mutex<DeviceSlot>,
    link: Mutex<Link>,
    reconnecting: AtomicBool,
    recorder: Mutex<Option<Recorder>>,
    last_recording: Mutex<Option<RecordingSummary>>,
    last_fault: Mutex<Option<Fault>>,

    frames_served: AtomicU64,
    placeholders_served: AtomicU64,
}

impl CameraSession {
    /// Build a session and try to open the device once.
    ///
    /// An open failure is logged and leaves the session without a device; the
    /// first frame request retries.
    pub fn open(source: SourceDescriptor, options: SessionOptions) -> Result<Self> {
        options.reconnect.validate()?;
        if options.recorder.queue_capacity == 0 {
            bail!("recording queue capacity must be > 0");
        }
        if !(options.fps_fallback.is_finite() && options.fps_fallback > 0.0) {
            bail!("fps fallback must be positive");
        }

        let session = Self {
            opener: options.opener,
            writers: options.writers,
            encoder: options.encoder,
            recorder_config: options.recorder,
            recordings_dir: options.recordings_dir,
            fps_fallback: options.fps_fallback,
            control: Mutex::new(()),
            device: Mutex::new(DeviceSlot {
                handle: None,
                read_failed: false,
                closed: false,
            }),
            link: Mutex::new(Link {
                tracker: ReconnectTracker::new(options.reconnect),
                state: DeviceState::Reconnecting,
                device: None,
            }),
            reconnecting: AtomicBool::new(false),
            recorder: Mutex::new(None),
            last_recording: Mutex::new(None),
            last_fault: Mutex::new(None),
            frames_served: AtomicU64::new(0),
            placeholders_served: AtomicU64::new(0),
            source,
        };

        {
            let mut slot = session.lock_device();
            match session.opener.open(&session.source) {
                Ok(handle) => {
                    log::info!("opened {}", handle.describe());
                    let mut link = session.lock_link();
                    if handle.is_ready() {
                        link.state = DeviceState::Connected;
                    }
                    link.device = Some(handle.describe());
                    slot.handle = Some(handle);
                }
                Err(err) => {
                    log::warn!("failed to open {}: {:#}", session.source, err);
                    session.set_fault(Fault::DeviceOpen(format!("{:#}", err)));
                }
            }
        }
        Ok(session)
    }

    pub fn source(&self) -> &SourceDescriptor {
        &self.source
    }

    /// Next frame for a viewer. Never fails: outages yield a placeholder.
    pub fn get_frame(&self) -> EncodedFrame {
        let raw = match self.capture() {
            Ok(raw) => raw,
            Err(outage) => return self.placeholder(outage.caption()),
        };
        match self.encoder.encode(&raw) {
            Ok(jpeg) => {
                self.frames_served.fetch_add(1, Ordering::Relaxed);
                EncodedFrame::live(jpeg)
            }
            Err(err) => {
                log::warn!("failed to encode frame {}: {:#}", raw.sequence, err);
                self.placeholder(CAPTION_ENCODE_ERROR)
            }
        }
    }

    /// Read one raw frame, reconnecting at most once.
    fn capture(&self) -> std::result::Result<RawFrame, Outage> {
        {
            let mut slot = self.lock_device();
            if slot.closed {
                return Err(Outage::Closed);
            }
            if self.lock_link().state == DeviceState::Unavailable {
                return Err(Outage::Unavailable);
            }
            if slot.is_ready() {
                if let Some(frame) = self.read_locked(&mut slot) {
                    return Ok(frame);
                }
                drop(slot);
                return Err(match self.reconnect() {
                    Err(Outage::Unavailable) => Outage::Unavailable,
                    Err(Outage::Closed) => Outage::Closed,
                    _ => Outage::Reconnecting,
                });
            }
        }

        self.reconnect()?;
        let mut slot = self.lock_device();
        if slot.closed {
            return Err(Outage::Closed);
        }
        if !slot.is_ready() {
            return Err(Outage::NoSignal);
        }
        self.read_locked(&mut slot).ok_or(Outage::Reconnecting)
    }

    /// One read from the open handle; on success the frame is offered to the
    /// active recording before the device lock is released.
    fn read_locked(&self, slot: &mut DeviceSlot) -> Option<RawFrame> {
        let handle = slot.handle.as_mut()?;
        match handle.read() {
            Ok(frame) => {
                if let Some(recorder) = self.lock_recorder().as_ref() {
                    recorder.offer(frame.clone());
                }
                Some(frame)
            }
            Err(err) => {
                log::warn!("read from {} failed: {:#}", handle.describe(), err);
                self.set_fault(Fault::DeviceRead(format!("{:#}", err)));
                slot.read_failed = true;
                None
            }
        }
    }

    /// Close the current handle, wait the backoff, reopen the descriptor.
    ///
    /// Returns `Reconnecting` without waiting when another caller already
    /// holds the reconnect.
    fn reconnect(&self) -> std::result::Result<(), Outage> {
        let Some(_claim) = ReconnectClaim::try_claim(&self.reconnecting) else {
            return Err(Outage::Reconnecting);
        };
        {
            let mut slot = self.lock_device();
            if slot.closed {
                return Err(Outage::Closed);
            }
            slot.close_handle();
        }
        let (backoff, attempt) = {
            let mut link = self.lock_link();
            if link.state == DeviceState::Unavailable {
                return Err(Outage::Unavailable);
            }
            link.state = DeviceState::Reconnecting;
            link.device = None;
            let attempt = link.tracker.consecutive_failures().saturating_add(1);
            (link.tracker.begin_attempt(), attempt)
        };
        log::info!(
            "reconnecting to {} in {:?} (attempt {})",
            self.source,
            backoff,
            attempt
        );
        if !backoff.is_zero() {
            std::thread::sleep(backoff);
        }

        let opened = self.opener.open(&self.source);
        let mut slot = self.lock_device();
        let failure = match opened {
            Ok(mut handle) if slot.closed => {
                handle.close();
                return Err(Outage::Closed);
            }
            Ok(handle) if handle.is_ready() => {
                log::info!("reconnected to {}", handle.describe());
                let mut link = self.lock_link();
                link.tracker.record_success();
                link.state = DeviceState::Connected;
                link.device = Some(handle.describe());
                slot.handle = Some(handle);
                slot.read_failed = false;
                return Ok(());
            }
            Ok(mut handle) => {
                handle.close();
                format!("{} opened but is not ready", self.source)
            }
            Err(err) => format!("{:#}", err),
        };
        drop(slot);

        log::warn!("reconnect to {} failed: {}", self.source, failure);
        self.set_fault(Fault::DeviceOpen(failure));
        let mut link = self.lock_link();
        if link.tracker.record_failure() {
            log::error!(
                "giving up on {} after {} consecutive failures",
                self.source,
                link.tracker.consecutive_failures()
            );
            link.state = DeviceState::Unavailable;
            return Err(Outage::Unavailable);
        }
        Err(Outage::NoSignal)
    }

    fn placeholder(&self, caption: &str) -> EncodedFrame {
        self.placeholders_served.fetch_add(1, Ordering::Relaxed);
        match self.encoder.placeholder(caption) {
            Ok(jpeg) => EncodedFrame::placeholder(jpeg),
            Err(err) => {
                log::error!("failed to render placeholder: {:#}", err);
                EncodedFrame::placeholder(Vec::new())
            }
        }
    }

    pub fn is_recording(&self) -> bool {
        self.lock_recorder().is_some()
    }

    /// Flip the recording state; returns the new state.
    pub fn toggle_recording(&self) -> Result<bool> {
        let _control = self.lock_control();
        if self.is_recording() {
            self.stop_recording_locked()?;
            Ok(false)
        } else {
            self.start_recording_locked()?;
            Ok(true)
        }
    }

    /// Start recording. A no-op when already recording.
    pub fn start_recording(&self) -> Result<()> {
        let _control = self.lock_control();
        self.start_recording_locked()
    }

    /// Stop recording after draining the queue. `None` when idle.
    pub fn stop_recording(&self) -> Result<Option<RecordingSummary>> {
        let _control = self.lock_control();
        self.stop_recording_locked()
    }

    /// Sizes the recording from a freshly read frame; network sources only
    /// learn their dimensions once a frame has arrived. That frame opens the
    /// recording.
    fn start_recording_locked(&self) -> Result<()> {
        if self.is_recording() {
            return Ok(());
        }

        let first = self
            .capture()
            .map_err(|outage| anyhow!("cannot record: {} for {}", outage, self.source))?;
        let fps = self
            .lock_device()
            .handle
            .as_ref()
            .map_or(self.fps_fallback, |handle| {
                handle.properties().fps_or(self.fps_fallback)
            });

        std::fs::create_dir_all(&self.recordings_dir).with_context(|| {
            format!(
                "create recordings directory {}",
                self.recordings_dir.display()
            )
        })?;
        let (width, height) = first.dimensions();
        let spec = RecordingSpec {
            path: recording_path(&self.recordings_dir, self.writers.extension(), Local::now()),
            width,
            height,
            fps,
        };
        let writer = self
            .writers
            .create(&spec)
            .with_context(|| format!("open recording {}", spec.path.display()))?;
        let recorder = Recorder::start(writer, spec, &self.recorder_config)?;
        recorder.offer(first);
        *self.lock_recorder() = Some(recorder);
        Ok(())
    }

    fn stop_recording_locked(&self) -> Result<Option<RecordingSummary>> {
        // Disarm before draining so no new frames are offered.
        let Some(recorder) = self.lock_recorder().take() else {
            return Ok(None);
        };
        let summary = recorder.stop()?;
        if summary.write_errors > 0 {
            self.set_fault(Fault::RecordingWrite(format!(
                "{} frames failed to write to {}",
                summary.write_errors,
                summary.path.display()
            )));
        }
        if let Some(err) = summary.finish_error.as_ref() {
            self.set_fault(Fault::RecordingWrite(err.clone()));
        }
        *self
            .last_recording
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(summary.clone());
        Ok(Some(summary))
    }

    /// Capture one frame and write it as JPEG to `path`, replacing any
    /// previous screenshot.
    pub fn screenshot(&self, path: &Path) -> Result<PathBuf> {
        let frame = self
            .capture()
            .map_err(|outage| anyhow!("screenshot failed: {} for {}", outage, self.source))?;

        let jpeg = self.encoder.encode(&frame)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create screenshot directory {}", parent.display()))?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, &jpeg)
            .with_context(|| format!("write screenshot {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("move screenshot into {}", path.display()))?;
        log::info!("screenshot saved to {}", path.display());
        Ok(path.to_path_buf())
    }

    pub fn status(&self) -> SessionStatus {
        let (device, device_state, reconnect_attempts, consecutive_failures) = {
            let link = self.lock_link();
            (
                link.device.clone(),
                link.state,
                link.tracker.total_attempts(),
                link.tracker.consecutive_failures(),
            )
        };
        let (recording_path, recorder) = {
            let guard = self.lock_recorder();
            match guard.as_ref() {
                Some(recorder) => (Some(recorder.spec().path.clone()), Some(recorder.snapshot())),
                None => (None, None),
            }
        };
        let last_recording = self
            .last_recording
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        SessionStatus {
            source: self.source.to_string(),
            device,
            device_state,
            reconnecting: self.reconnecting.load(Ordering::Acquire),
            recording: recorder.is_some(),
            recording_path,
            frames_served: self.frames_served.load(Ordering::Relaxed),
            placeholders_served: self.placeholders_served.load(Ordering::Relaxed),
            reconnect_attempts,
            consecutive_failures,
            recording_degraded: recorder.as_ref().is_some_and(|r| r.degraded()),
            recorder,
            last_recording,
            last_fault: self
                .last_fault
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    /// Leave the `Unavailable` state; the next frame request reconnects.
    pub fn reset_device(&self) {
        let mut link = self.lock_link();
        link.tracker.reset();
        if link.state == DeviceState::Unavailable {
            log::info!("device {} reset; reconnecting on next request", self.source);
            link.state = DeviceState::Reconnecting;
        }
    }

    /// Stop any recording (draining it) and close the device. Idempotent.
    pub fn shutdown(&self) {
        let _control = self.lock_control();
        if self.lock_device().closed {
            return;
        }
        if let Err(err) = self.stop_recording_locked() {
            log::error!("failed to stop recording during shutdown: {:#}", err);
        }
        let mut slot = self.lock_device();
        slot.close_handle();
        slot.closed = true;
        self.lock_link().device = None;
        log::info!("session for {} shut down", self.source);
    }

    fn set_fault(&self, fault: Fault) {
        *self.last_fault.lock().unwrap_or_else(PoisonError::into_inner) = Some(fault);
    }

    fn lock_control(&self) -> MutexGuard<'_, ()> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_device(&self) -> MutexGuard<'_, DeviceSlot> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_recorder(&self) -> MutexGuard<'_, Option<Recorder>> {
        self.recorder.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
