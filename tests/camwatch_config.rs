use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use camwatch::config::{CamwatchConfig, RecordingFormat};
use camwatch::{SourceDescriptor, WriterFactory};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CAMWATCH_CONFIG",
        "CAMWATCH_SOURCE",
        "CAMWATCH_API_ADDR",
        "CAMWATCH_RECORDINGS_DIR",
        "CAMWATCH_SCREENSHOT_PATH",
        "CAMWATCH_RECORDING_FORMAT",
        "CAMWATCH_FPS_FALLBACK",
        "CAMWATCH_QUEUE_CAPACITY",
        "CAMWATCH_RECONNECT_BACKOFF_MS",
        "CAMWATCH_RECONNECT_MAX_ATTEMPTS",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = CamwatchConfig::load().expect("load config");
    assert_eq!(cfg.source, "0");
    assert_eq!(cfg.source_descriptor().unwrap(), SourceDescriptor::Device(0));
    assert_eq!(cfg.api_addr, "127.0.0.1:5000");
    assert_eq!(cfg.recordings_dir.to_str(), Some("recordings"));
    assert_eq!(cfg.screenshot_path.to_str(), Some("screenshot.jpg"));
    assert_eq!(cfg.recording_format, RecordingFormat::Mjpeg);
    assert_eq!(cfg.fps_fallback, 25.0);
    assert_eq!(cfg.queue_capacity, 100);
    assert_eq!(cfg.reconnect.initial_backoff, Duration::from_secs(1));
    assert_eq!(cfg.reconnect.max_attempts, None);
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "source": "rtsp://camera-1/stream",
            "api": { "addr": "0.0.0.0:9000" },
            "capture": { "target_fps": 12, "width": 800, "height": 600 },
            "recording": { "dir": "/var/lib/camwatch", "fps_fallback": 10, "queue_capacity": 32 },
            "reconnect": { "backoff_ms": 250, "multiplier": 2.0, "max_backoff_ms": 4000, "max_attempts": 8 },
            "screenshot_path": "/tmp/shot.jpg",
            "jpeg_quality": 70
        }"#,
    );

    std::env::set_var("CAMWATCH_CONFIG", file.path());
    std::env::set_var("CAMWATCH_SOURCE", "stub://lobby");
    std::env::set_var("CAMWATCH_QUEUE_CAPACITY", "64");
    std::env::set_var("CAMWATCH_RECONNECT_MAX_ATTEMPTS", "3");

    let cfg = CamwatchConfig::load().expect("load config");

    assert_eq!(cfg.source, "stub://lobby");
    assert_eq!(cfg.api_addr, "0.0.0.0:9000");
    assert_eq!(cfg.capture.target_fps, 12);
    assert_eq!(cfg.capture.width, 800);
    assert_eq!(cfg.capture.height, 600);
    assert_eq!(cfg.recordings_dir.to_str(), Some("/var/lib/camwatch"));
    assert_eq!(cfg.fps_fallback, 10.0);
    assert_eq!(cfg.queue_capacity, 64);
    assert_eq!(cfg.screenshot_path.to_str(), Some("/tmp/shot.jpg"));
    assert_eq!(cfg.jpeg_quality, 70);
    assert_eq!(cfg.reconnect.initial_backoff, Duration::from_millis(250));
    assert_eq!(cfg.reconnect.multiplier, 2.0);
    assert_eq!(cfg.reconnect.max_backoff, Duration::from_secs(4));
    assert_eq!(cfg.reconnect.max_attempts, Some(3));

    clear_env();
}

#[test]
fn backoff_env_raises_fixed_cap() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CAMWATCH_RECONNECT_BACKOFF_MS", "2500");
    let cfg = CamwatchConfig::load().expect("load config");
    assert_eq!(cfg.reconnect.backoff_for(0), Duration::from_millis(2500));
    assert_eq!(cfg.reconnect.backoff_for(5), Duration::from_millis(2500));

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CAMWATCH_QUEUE_CAPACITY", "0");
    assert!(CamwatchConfig::load().is_err());
    clear_env();

    std::env::set_var("CAMWATCH_FPS_FALLBACK", "fast");
    assert!(CamwatchConfig::load().is_err());
    clear_env();

    std::env::set_var("CAMWATCH_RECORDING_FORMAT", "avi");
    assert!(CamwatchConfig::load().is_err());
    clear_env();

    let file = write_config(r#"{ "reconnect": { "multiplier": 0.5 } }"#);
    std::env::set_var("CAMWATCH_CONFIG", file.path());
    assert!(CamwatchConfig::load().is_err());
    clear_env();

    let file = write_config(r#"{ "unknown_key": true }"#);
    std::env::set_var("CAMWATCH_CONFIG", file.path());
    assert!(CamwatchConfig::load().is_err());
    clear_env();
}

#[test]
fn session_options_follow_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CAMWATCH_QUEUE_CAPACITY", "7");
    let cfg = CamwatchConfig::load().expect("load config");
    let options = cfg.session_options().expect("session options");
    assert_eq!(options.recorder.queue_capacity, 7);
    assert_eq!(options.writers.extension(), "mjpeg");
    assert_eq!(options.encoder.config().placeholder_width, 640);

    clear_env();
}
