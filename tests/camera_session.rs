use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

use camwatch::{
    CameraSession, CaptureSettings, DefaultOpener, DeviceState, ReconnectPolicy, SessionOptions,
    SourceDescriptor,
};

fn count_jpegs(bytes: &[u8]) -> usize {
    bytes.windows(3).filter(|w| *w == [0xFF, 0xD8, 0xFF]).count()
}

fn options(dir: &std::path::Path) -> SessionOptions {
    SessionOptions {
        reconnect: ReconnectPolicy::fixed(Duration::from_millis(10)),
        recordings_dir: dir.join("recordings"),
        opener: Arc::new(DefaultOpener::new(CaptureSettings {
            target_fps: 0,
            width: 32,
            height: 24,
        })),
        ..SessionOptions::default()
    }
}

#[test]
fn records_synthetic_frames_to_mjpeg_file() -> Result<()> {
    let dir = tempdir()?;
    let session = CameraSession::open(SourceDescriptor::parse("stub://lobby")?, options(dir.path()))?;

    assert!(session.toggle_recording()?);
    for _ in 0..12 {
        assert!(!session.get_frame().is_placeholder());
    }
    let summary = session.stop_recording()?.expect("recording summary");
    // Starting reads one frame to size the file; it is recorded too.
    assert_eq!(summary.frames_written, 13);
    assert_eq!(summary.frames_dropped, 0);
    assert!(summary.finish_error.is_none());

    let name = summary.path.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("video_") && name.ends_with(".mjpeg"));
    assert_eq!(summary.path.parent(), Some(dir.path().join("recordings").as_path()));
    assert_eq!(count_jpegs(&std::fs::read(&summary.path)?), 13);

    let status = session.status();
    assert!(!status.recording);
    assert_eq!(status.frames_served, 12);
    assert_eq!(status.last_recording.unwrap().frames_written, 13);
    Ok(())
}

#[test]
fn flaky_source_serves_placeholders_and_recovers() -> Result<()> {
    let dir = tempdir()?;
    let session = CameraSession::open(
        SourceDescriptor::parse("stub://flaky?drop_every=3")?,
        options(dir.path()),
    )?;

    let frames: Vec<_> = (0..9).map(|_| session.get_frame()).collect();
    let placeholders = frames.iter().filter(|f| f.is_placeholder()).count();
    assert!(placeholders >= 2, "placeholders={}", placeholders);
    assert!(frames.iter().any(|f| !f.is_placeholder()));
    assert!(frames.iter().all(|f| f.data.starts_with(&[0xFF, 0xD8])));

    let status = session.status();
    assert_eq!(status.device_state, DeviceState::Connected);
    assert_eq!(status.reconnect_attempts as usize, placeholders);
    assert_eq!(status.placeholders_served as usize, placeholders);
    Ok(())
}

#[test]
fn missing_backend_is_not_fatal() -> Result<()> {
    let dir = tempdir()?;
    let mut opts = options(dir.path());
    opts.reconnect = ReconnectPolicy::fixed(Duration::ZERO).with_max_attempts(2);
    let session = CameraSession::open(SourceDescriptor::parse("unsupported://camera")?, opts)?;

    for _ in 0..3 {
        let frame = session.get_frame();
        assert!(frame.is_placeholder());
        assert!(!frame.data.is_empty());
    }
    let status = session.status();
    assert_eq!(status.device_state, DeviceState::Unavailable);
    assert!(status.last_fault.is_some());
    assert!(session.start_recording().is_err());
    assert!(session.screenshot(&dir.path().join("shot.jpg")).is_err());
    Ok(())
}

#[test]
fn concurrent_viewers_share_one_device() -> Result<()> {
    let dir = tempdir()?;
    let session = Arc::new(CameraSession::open(
        SourceDescriptor::parse("stub://shared")?,
        options(dir.path()),
    )?);
    session.start_recording()?;

    let viewers: Vec<_> = (0..4)
        .map(|_| {
            let session = session.clone();
            std::thread::spawn(move || {
                (0..10)
                    .filter(|_| !session.get_frame().is_placeholder())
                    .count()
            })
        })
        .collect();
    let served: usize = viewers.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(served, 40);

    let summary = session.stop_recording()?.expect("recording summary");
    assert_eq!(summary.frames_written + summary.frames_dropped, 41);
    session.shutdown();
    Ok(())
}
