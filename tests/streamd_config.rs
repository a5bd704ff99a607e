use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use streamwatch::config::StreamdConfig;
use streamwatch::deliver::PacingMode;
use streamwatch::ProcessorKind;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "STREAMD_CONFIG",
        "STREAMD_SOURCE_URL",
        "STREAMD_VIEWER_ADDR",
        "STREAMD_BUFFER_SIZE",
        "STREAMD_RECONNECT_DELAY_SECS",
        "STREAMD_STALE_TIMEOUT_SECS",
        "STREAMD_TARGET_FPS",
        "STREAMD_HISTORY_PATH",
        "STREAMD_DB_PATH",
        "STREAMD_DETECT_TYPES",
        "STREAMD_RECORDING_DIR",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "source": {
            "url": "rtsp://camera-1/live",
            "buffer_size": 12,
            "reconnect_delay_secs": 2
        },
        "delivery": {
            "target_fps": 15,
            "jpeg_quality": 70,
            "pacing": "measured"
        },
        "viewer": { "addr": "0.0.0.0:9000" },
        "recording": { "output_dir": "/var/lib/streamd/recordings", "max_duration_secs": 600 },
        "history": { "detect_types": ["person"] }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("STREAMD_CONFIG", file.path());
    std::env::set_var("STREAMD_TARGET_FPS", "25");
    std::env::set_var("STREAMD_DETECT_TYPES", "bird, bottle");

    let cfg = StreamdConfig::load().expect("load config");
    assert_eq!(cfg.source.url, "rtsp://camera-1/live");
    assert_eq!(cfg.source.buffer_size, 12);
    assert_eq!(cfg.source.reconnect_delay, Duration::from_secs(2));
    assert_eq!(cfg.delivery.target_fps, 25);
    assert_eq!(cfg.delivery.jpeg_quality, 70);
    assert_eq!(cfg.delivery.pacing, PacingMode::Measured);
    assert_eq!(cfg.viewer_addr, "0.0.0.0:9000");
    assert_eq!(
        cfg.recording.output_dir,
        PathBuf::from("/var/lib/streamd/recordings")
    );
    assert_eq!(cfg.recording.max_duration, Duration::from_secs(600));
    assert_eq!(cfg.history.detect_types, vec!["bird", "bottle"]);

    let session = cfg.session_settings();
    assert_eq!(session.buffer_size, 12);
    assert_eq!(session.capture.reconnect_delay, Duration::from_secs(2));
    assert_eq!(cfg.server_config().delivery.target_fps, 25);
    assert_eq!(cfg.control_defaults().max_duration, Duration::from_secs(600));

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
        [source]
        url = "stub://garden?fps=5"
        stale_timeout_secs = 4

        [delivery]
        processor = "passthrough"

        [sessions]
        join_timeout_ms = 500
    "#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");
    std::env::set_var("STREAMD_CONFIG", file.path());

    let cfg = StreamdConfig::load().expect("load config");
    assert_eq!(cfg.source.url, "stub://garden?fps=5");
    assert_eq!(cfg.source.stale_timeout, Duration::from_secs(4));
    assert_eq!(cfg.delivery.processor, ProcessorKind::Passthrough);
    assert_eq!(cfg.join_timeout, Duration::from_millis(500));
    // Unset sections keep their defaults.
    assert_eq!(cfg.viewer_addr, "127.0.0.1:8081");
    assert_eq!(cfg.history.detect_types, vec!["bottle", "bird"]);

    clear_env();
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = StreamdConfig::load().expect("load config");
    assert_eq!(cfg.source.url, "stub://default_stream");
    assert_eq!(cfg.source.buffer_size, 30);
    assert_eq!(cfg.recording.frame_interval, 30);
    assert_eq!(cfg.history.db_path, "streamd.db");
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("STREAMD_BUFFER_SIZE", "0");
    assert!(StreamdConfig::load().is_err());
    clear_env();

    std::env::set_var("STREAMD_TARGET_FPS", "fast");
    assert!(StreamdConfig::load().is_err());
    clear_env();

    std::env::set_var("STREAMD_SOURCE_URL", "gopher://camera");
    assert!(StreamdConfig::load().is_err());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, br#"{ "unknown_section": {} }"#).expect("write");
    std::env::set_var("STREAMD_CONFIG", file.path());
    assert!(StreamdConfig::load().is_err());
    clear_env();
}
