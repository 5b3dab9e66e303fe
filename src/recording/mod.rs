//! Buffered recording pipeline.
//!
//! A `Recorder` owns one output file for one Idle -> Recording -> Idle cycle:
//! - The capture path offers frames with `offer`, which never blocks. When the
//!   bounded queue is full the frame is dropped and counted.
//! - A single worker thread drains the queue into a `VideoWriter`, polling with
//!   a short timeout so a stop request is noticed promptly.
//! - `stop` is cooperative: it raises the stop flag, closes the queue and joins
//!   the worker, which keeps writing until the queue is empty. The writer is
//!   handed back through the join handle and finalised afterwards.
//!
//! Write faults are counted and logged; they never reach the live path.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::frame::RawFrame;

#[cfg(feature = "record-gstreamer")]
pub mod mp4;
pub mod mjpeg;

#[cfg(feature = "record-gstreamer")]
pub use mp4::{Mp4FileWriter, Mp4WriterFactory};
pub use mjpeg::{MjpegFileWriter, MjpegWriterFactory};

/// Default pending-frame queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Default worker poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const WRITE_ERROR_LOG_EVERY: u64 = 100;

/// Parameters fixed when a recording starts.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordingSpec {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// Persistent sink for recorded frames.
pub trait VideoWriter: Send {
    fn write_frame(&mut self, frame: &RawFrame) -> Result<()>;

    /// Flush and close the output. Further writes fail.
    fn finish(&mut self) -> Result<()>;

    fn path(&self) -> &Path;
}

/// Creates a writer for each new recording.
pub trait WriterFactory: Send + Sync {
    /// File extension, without the dot.
    fn extension(&self) -> &str;

    fn create(&self, spec: &RecordingSpec) -> Result<Box<dyn VideoWriter>>;
}

/// Queue/worker tuning.
#[derive(Clone, Debug)]
pub struct RecorderConfig {
    pub queue_capacity: usize,
    pub poll_interval: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Default)]
struct RecorderStats {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    written: AtomicU64,
    write_errors: AtomicU64,
}

/// Point-in-time copy of a recorder's counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RecorderSnapshot {
    pub frames_enqueued: u64,
    pub frames_dropped: u64,
    pub frames_written: u64,
    pub write_errors: u64,
    pub pending: usize,
}

impl RecorderSnapshot {
    pub fn degraded(&self) -> bool {
        self.write_errors > 0
    }
}

/// Outcome of a finished recording.
#[derive(Clone, Debug, Serialize)]
pub struct RecordingSummary {
    pub path: PathBuf,
    pub frames_written: u64,
    pub frames_dropped: u64,
    pub write_errors: u64,
    pub duration_secs: f64,
    /// Set when the writer failed to finalise the file.
    pub finish_error: Option<String>,
}

pub struct Recorder {
    spec: RecordingSpec,
    sender: Option<Sender<RawFrame>>,
    stop: Arc<AtomicBool>,
    stats: Arc<RecorderStats>,
    worker: Option<JoinHandle<Box<dyn VideoWriter>>>,
    started_at: Instant,
}

impl Recorder {
    /// Spawn the worker for `writer`. Exactly one worker per recorder.
    pub fn start(
        writer: Box<dyn VideoWriter>,
        spec: RecordingSpec,
        config: &RecorderConfig,
    ) -> Result<Self> {
        if config.queue_capacity == 0 {
            return Err(anyhow!("recording queue capacity must be > 0"));
        }
        let (sender, receiver) = bounded::<RawFrame>(config.queue_capacity);
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(RecorderStats::default());

        let worker_stop = stop.clone();
        let worker_stats = stats.clone();
        let poll_interval = config.poll_interval;
        let worker = std::thread::Builder::new()
            .name("camwatch-recorder".into())
            .spawn(move || run_worker(receiver, writer, worker_stop, worker_stats, poll_interval))
            .context("spawn recording worker")?;

        log::info!(
            "recording started: {} ({}x{} @ {:.2} fps)",
            spec.path.display(),
            spec.width,
            spec.height,
            spec.fps
        );
        Ok(Self {
            spec,
            sender: Some(sender),
            stop,
            stats,
            worker: Some(worker),
            started_at: Instant::now(),
        })
    }

    pub fn spec(&self) -> &RecordingSpec {
        &self.spec
    }

    /// Queue a frame without blocking. Returns false if it was dropped.
    pub fn offer(&self, frame: RawFrame) -> bool {
        let Some(sender) = self.sender.as_ref() else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        match sender.try_send(frame) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Frames queued but not yet written.
    pub fn pending(&self) -> usize {
        self.sender.as_ref().map(|s| s.len()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> RecorderSnapshot {
        RecorderSnapshot {
            frames_enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            frames_dropped: self.stats.dropped.load(Ordering::Relaxed),
            frames_written: self.stats.written.load(Ordering::Relaxed),
            write_errors: self.stats.write_errors.load(Ordering::Relaxed),
            pending: self.pending(),
        }
    }

    /// Drain the queue, join the worker and finalise the file.
    pub fn stop(mut self) -> Result<RecordingSummary> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<RecordingSummary> {
        let worker = self
            .worker
            .take()
            .ok_or_else(|| anyhow!("recording already stopped"))?;
        self.stop.store(true, Ordering::SeqCst);
        self.sender = None;

        let mut writer = worker
            .join()
            .map_err(|_| anyhow!("recording worker panicked"))?;
        let finish_error = writer.finish().err().map(|err| {
            log::error!("failed to finalise {}: {:#}", self.spec.path.display(), err);
            format!("{:#}", err)
        });

        let snapshot = self.snapshot();
        let summary = RecordingSummary {
            path: self.spec.path.clone(),
            frames_written: snapshot.frames_written,
            frames_dropped: snapshot.frames_dropped,
            write_errors: snapshot.write_errors,
            duration_secs: self.started_at.elapsed().as_secs_f64(),
            finish_error,
        };
        log::info!(
            "recording stopped: {} (written={} dropped={} write_errors={})",
            summary.path.display(),
            summary.frames_written,
            summary.frames_dropped,
            summary.write_errors
        );
        Ok(summary)
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(err) = self.shutdown() {
                log::error!("recording shutdown failed: {:#}", err);
            }
        }
    }
}

fn run_worker(
    receiver: Receiver<RawFrame>,
    mut writer: Box<dyn VideoWriter>,
    stop: Arc<AtomicBool>,
    stats: Arc<RecorderStats>,
    poll_interval: Duration,
) -> Box<dyn VideoWriter> {
    while !stop.load(Ordering::SeqCst) || !receiver.is_empty() {
        match receiver.recv_timeout(poll_interval) {
            Ok(frame) => match writer.write_frame(&frame) {
                Ok(()) => {
                    stats.written.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    let errors = stats.write_errors.fetch_add(1, Ordering::Relaxed) + 1;
                    if errors == 1 || errors % WRITE_ERROR_LOG_EVERY == 0 {
                        log::warn!(
                            "recording write failed for {} ({} errors so far): {:#}",
                            writer.path().display(),
                            errors,
                            err
                        );
                    }
                }
            },
            Err(RecvTimeoutError::Timeout) => continue,
            // Only reported once the queue is empty and the sender is gone.
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    writer
}

/// `dir/video_<YYYYmmdd-HHMMSS>.<ext>`, suffixed `-N` if the name is taken.
pub fn recording_path(dir: &Path, extension: &str, now: DateTime<Local>) -> PathBuf {
    let stem = format!("video_{}", now.format("%Y%m%d-%H%M%S"));
    let candidate = dir.join(format!("{}.{}", stem, extension));
    if !candidate.exists() {
        return candidate;
    }
    (1u32..)
        .map(|n| dir.join(format!("{}-{}.{}", stem, n, extension)))
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records sequence numbers; optionally slow or failing.
    struct MemoryWriter {
        path: PathBuf,
        written: Arc<Mutex<Vec<u64>>>,
        finished: Arc<AtomicBool>,
        delay: Duration,
        fail_sequences: Vec<u64>,
    }

    impl MemoryWriter {
        fn boxed(written: Arc<Mutex<Vec<u64>>>, delay: Duration) -> Box<dyn VideoWriter> {
            Box::new(Self {
                path: PathBuf::from("memory.mjpeg"),
                written,
                finished: Arc::new(AtomicBool::new(false)),
                delay,
                fail_sequences: Vec::new(),
            })
        }
    }

    impl VideoWriter for MemoryWriter {
        fn write_frame(&mut self, frame: &RawFrame) -> Result<()> {
            std::thread::sleep(self.delay);
            if self.fail_sequences.contains(&frame.sequence) {
                return Err(anyhow!("disk full"));
            }
            self.written.lock().unwrap().push(frame.sequence);
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn path(&self) -> &Path {
            &self.path
        }
    }

    fn spec() -> RecordingSpec {
        RecordingSpec {
            path: PathBuf::from("memory.mjpeg"),
            width: 2,
            height: 2,
            fps: 25.0,
        }
    }

    fn frame(sequence: u64) -> RawFrame {
        RawFrame::filled(2, 2, [0, 0, 0], sequence).unwrap()
    }

    fn config(capacity: usize) -> RecorderConfig {
        RecorderConfig {
            queue_capacity: capacity,
            poll_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn writes_all_frames_in_order_when_capacity_suffices() -> Result<()> {
        let written = Arc::new(Mutex::new(Vec::new()));
        let recorder = Recorder::start(MemoryWriter::boxed(written.clone(), Duration::ZERO), spec(), &config(16))?;
        for seq in 1..=10 {
            assert!(recorder.offer(frame(seq)));
        }
        let summary = recorder.stop()?;
        assert_eq!(summary.frames_written, 10);
        assert_eq!(summary.frames_dropped, 0);
        assert_eq!(*written.lock().unwrap(), (1..=10).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn stop_drains_queued_frames_before_returning() -> Result<()> {
        let written = Arc::new(Mutex::new(Vec::new()));
        let recorder = Recorder::start(
            MemoryWriter::boxed(written.clone(), Duration::from_millis(20)),
            spec(),
            &config(8),
        )?;
        for seq in 1..=5 {
            assert!(recorder.offer(frame(seq)));
        }
        let summary = recorder.stop()?;
        assert_eq!(summary.frames_written, 5);
        assert_eq!(*written.lock().unwrap(), vec![1, 2, 3, 4, 5]);
        Ok(())
    }

    #[test]
    fn full_queue_drops_without_reordering() -> Result<()> {
        let written = Arc::new(Mutex::new(Vec::new()));
        let recorder = Recorder::start(
            MemoryWriter::boxed(written.clone(), Duration::from_millis(5)),
            spec(),
            &config(2),
        )?;
        let offered = 50u64;
        for seq in 1..=offered {
            recorder.offer(frame(seq));
        }
        let summary = recorder.stop()?;
        let written = written.lock().unwrap().clone();

        assert!(summary.frames_dropped > 0);
        assert_eq!(summary.frames_written + summary.frames_dropped, offered);
        assert_eq!(written.len() as u64, summary.frames_written);
        assert!(written.windows(2).all(|w| w[0] < w[1]), "{:?}", written);
        Ok(())
    }

    #[test]
    fn write_faults_are_counted_not_fatal() -> Result<()> {
        let written = Arc::new(Mutex::new(Vec::new()));
        let writer = Box::new(MemoryWriter {
            path: PathBuf::from("memory.mjpeg"),
            written: written.clone(),
            finished: Arc::new(AtomicBool::new(false)),
            delay: Duration::ZERO,
            fail_sequences: vec![2, 4],
        });
        let recorder = Recorder::start(writer, spec(), &config(8))?;
        for seq in 1..=5 {
            recorder.offer(frame(seq));
        }
        let summary = recorder.stop()?;
        assert_eq!(summary.write_errors, 2);
        assert_eq!(*written.lock().unwrap(), vec![1, 3, 5]);
        Ok(())
    }

    #[test]
    fn stop_finishes_writer() -> Result<()> {
        let finished = Arc::new(AtomicBool::new(false));
        let writer = Box::new(MemoryWriter {
            path: PathBuf::from("memory.mjpeg"),
            written: Arc::new(Mutex::new(Vec::new())),
            finished: finished.clone(),
            delay: Duration::ZERO,
            fail_sequences: Vec::new(),
        });
        let recorder = Recorder::start(writer, spec(), &config(4))?;
        recorder.stop()?;
        assert!(finished.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let result = Recorder::start(MemoryWriter::boxed(written, Duration::ZERO), spec(), &config(0));
        assert!(result.is_err());
    }

    #[test]
    fn recording_path_is_timestamped_and_unique() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let now = Local::now();
        let first = recording_path(dir.path(), "mjpeg", now);
        let name = first.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("video_"));
        assert!(name.ends_with(".mjpeg"));
        assert_eq!(name.len(), "video_20240101-120000.mjpeg".len());

        std::fs::write(&first, b"")?;
        let second = recording_path(dir.path(), "mjpeg", now);
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("-1.mjpeg"));
        Ok(())
    }
}
