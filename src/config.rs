use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::analysis::DEFAULT_FRAME_INTERVAL;
use crate::api::ServerConfig;
use crate::capture::CaptureSettings;
use crate::control::ControlDefaults;
use crate::deliver::{DeliverySettings, PacingMode, EMPTY_WAIT};
use crate::detect::{CategoryFilter, ProcessorKind};
use crate::ingest::SourceSettings;
use crate::record::RecorderSettings;
use crate::session::SessionSettings;

const DEFAULT_SOURCE_URL: &str = "stub://default_stream";
const DEFAULT_BUFFER_SIZE: usize = 30;
const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;
const DEFAULT_STALE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;
const DEFAULT_OPEN_TIMEOUT_MS: u64 = 5000;
const DEFAULT_TARGET_FPS: u32 = 30;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_VIEWER_ADDR: &str = "127.0.0.1:8081";
const DEFAULT_RECORDING_DIR: &str = "recordings";
const DEFAULT_MAX_DURATION_SECS: u64 = 3600;
const DEFAULT_RECORDING_FPS: f64 = 30.0;
const DEFAULT_HISTORY_PATH: &str = "history";
const DEFAULT_DB_PATH: &str = "streamd.db";
const DEFAULT_DETECT_TYPES: &[&str] = &["bottle", "bird"];
const DEFAULT_JOIN_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StreamdConfigFile {
    source: Option<SourceConfigFile>,
    delivery: Option<DeliveryConfigFile>,
    viewer: Option<ViewerConfigFile>,
    recording: Option<RecordingConfigFile>,
    history: Option<HistoryConfigFile>,
    sessions: Option<SessionsConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
    buffer_size: Option<usize>,
    reconnect_delay_secs: Option<u64>,
    stale_timeout_secs: Option<u64>,
    read_timeout_ms: Option<u64>,
    open_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DeliveryConfigFile {
    target_fps: Option<u32>,
    jpeg_quality: Option<u8>,
    pacing: Option<PacingMode>,
    processor: Option<ProcessorKind>,
}

#[derive(Debug, Deserialize, Default)]
struct ViewerConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordingConfigFile {
    output_dir: Option<PathBuf>,
    max_duration_secs: Option<u64>,
    frame_interval: Option<u64>,
    default_fps: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct HistoryConfigFile {
    path: Option<PathBuf>,
    db_path: Option<String>,
    detect_types: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct SessionsConfigFile {
    join_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct StreamdConfig {
    pub source: SourceSection,
    pub delivery: DeliverySection,
    pub viewer_addr: String,
    pub recording: RecordingSection,
    pub history: HistorySection,
    pub join_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SourceSection {
    pub url: String,
    pub buffer_size: usize,
    pub reconnect_delay: Duration,
    pub stale_timeout: Duration,
    pub read_timeout: Duration,
    pub open_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DeliverySection {
    pub target_fps: u32,
    pub jpeg_quality: u8,
    pub pacing: PacingMode,
    pub processor: ProcessorKind,
}

#[derive(Debug, Clone)]
pub struct RecordingSection {
    pub output_dir: PathBuf,
    pub max_duration: Duration,
    pub frame_interval: u64,
    pub default_fps: f64,
}

#[derive(Debug, Clone)]
pub struct HistorySection {
    pub path: PathBuf,
    pub db_path: String,
    pub detect_types: Vec<String>,
}

impl StreamdConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("STREAMD_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: StreamdConfigFile) -> Self {
        let source = file.source.unwrap_or_default();
        let delivery = file.delivery.unwrap_or_default();
        let recording = file.recording.unwrap_or_default();
        let history = file.history.unwrap_or_default();
        Self {
            source: SourceSection {
                url: source.url.unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
                buffer_size: source.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
                reconnect_delay: Duration::from_secs(
                    source
                        .reconnect_delay_secs
                        .unwrap_or(DEFAULT_RECONNECT_DELAY_SECS),
                ),
                stale_timeout: Duration::from_secs(
                    source
                        .stale_timeout_secs
                        .unwrap_or(DEFAULT_STALE_TIMEOUT_SECS),
                ),
                read_timeout: Duration::from_millis(
                    source.read_timeout_ms.unwrap_or(DEFAULT_READ_TIMEOUT_MS),
                ),
                open_timeout: Duration::from_millis(
                    source.open_timeout_ms.unwrap_or(DEFAULT_OPEN_TIMEOUT_MS),
                ),
            },
            delivery: DeliverySection {
                target_fps: delivery.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
                jpeg_quality: delivery.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
                pacing: delivery.pacing.unwrap_or_default(),
                processor: delivery.processor.unwrap_or_default(),
            },
            viewer_addr: file
                .viewer
                .and_then(|viewer| viewer.addr)
                .unwrap_or_else(|| DEFAULT_VIEWER_ADDR.to_string()),
            recording: RecordingSection {
                output_dir: recording
                    .output_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_RECORDING_DIR)),
                max_duration: Duration::from_secs(
                    recording
                        .max_duration_secs
                        .unwrap_or(DEFAULT_MAX_DURATION_SECS),
                ),
                frame_interval: recording.frame_interval.unwrap_or(DEFAULT_FRAME_INTERVAL),
                default_fps: recording.default_fps.unwrap_or(DEFAULT_RECORDING_FPS),
            },
            history: HistorySection {
                path: history
                    .path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_HISTORY_PATH)),
                db_path: history
                    .db_path
                    .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
                detect_types: history.detect_types.unwrap_or_else(|| {
                    DEFAULT_DETECT_TYPES.iter().map(|t| t.to_string()).collect()
                }),
            },
            join_timeout: Duration::from_millis(
                file.sessions
                    .and_then(|s| s.join_timeout_ms)
                    .unwrap_or(DEFAULT_JOIN_TIMEOUT_MS),
            ),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_nonempty("STREAMD_SOURCE_URL") {
            self.source.url = url;
        }
        if let Some(addr) = env_nonempty("STREAMD_VIEWER_ADDR") {
            self.viewer_addr = addr;
        }
        if let Some(size) = env_nonempty("STREAMD_BUFFER_SIZE") {
            self.source.buffer_size = size
                .parse()
                .map_err(|_| anyhow!("STREAMD_BUFFER_SIZE must be a positive integer"))?;
        }
        if let Some(secs) = env_nonempty("STREAMD_RECONNECT_DELAY_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                anyhow!("STREAMD_RECONNECT_DELAY_SECS must be an integer number of seconds")
            })?;
            self.source.reconnect_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = env_nonempty("STREAMD_STALE_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                anyhow!("STREAMD_STALE_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.source.stale_timeout = Duration::from_secs(secs);
        }
        if let Some(fps) = env_nonempty("STREAMD_TARGET_FPS") {
            self.delivery.target_fps = fps
                .parse()
                .map_err(|_| anyhow!("STREAMD_TARGET_FPS must be a positive integer"))?;
        }
        if let Some(path) = env_nonempty("STREAMD_HISTORY_PATH") {
            self.history.path = PathBuf::from(path);
        }
        if let Some(path) = env_nonempty("STREAMD_DB_PATH") {
            self.history.db_path = path;
        }
        if let Ok(types) = std::env::var("STREAMD_DETECT_TYPES") {
            let parsed = split_csv(&types);
            if !parsed.is_empty() {
                self.history.detect_types = parsed;
            }
        }
        if let Some(dir) = env_nonempty("STREAMD_RECORDING_DIR") {
            self.recording.output_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        crate::ingest::parse_address(&self.source.url)
            .map_err(|e| anyhow!("invalid source url: {}", e))?;
        if self.source.buffer_size == 0 {
            return Err(anyhow!("source.buffer_size must be greater than zero"));
        }
        if self.delivery.target_fps == 0 {
            return Err(anyhow!("delivery.target_fps must be greater than zero"));
        }
        if !(1..=100).contains(&self.delivery.jpeg_quality) {
            return Err(anyhow!("delivery.jpeg_quality must be within 1..=100"));
        }
        if self.source.stale_timeout < self.source.read_timeout {
            return Err(anyhow!(
                "source.stale_timeout ({:?}) must not be shorter than read_timeout ({:?})",
                self.source.stale_timeout,
                self.source.read_timeout
            ));
        }
        if self.recording.max_duration.is_zero() {
            return Err(anyhow!("recording.max_duration_secs must be greater than zero"));
        }
        if self.recording.default_fps.is_nan() || self.recording.default_fps <= 0.0 {
            return Err(anyhow!("recording.default_fps must be positive"));
        }
        Ok(())
    }

    pub fn source_settings(&self) -> SourceSettings {
        SourceSettings {
            read_timeout: self.source.read_timeout,
            open_timeout: self.source.open_timeout,
        }
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            stale_timeout: self.source.stale_timeout,
            reconnect_delay: self.source.reconnect_delay,
            ..CaptureSettings::default()
        }
    }

    pub fn delivery_settings(&self) -> DeliverySettings {
        DeliverySettings {
            target_fps: self.delivery.target_fps,
            jpeg_quality: self.delivery.jpeg_quality,
            pacing: self.delivery.pacing,
            empty_wait: EMPTY_WAIT,
        }
    }

    pub fn recorder_settings(&self) -> RecorderSettings {
        RecorderSettings {
            output_dir: self.recording.output_dir.clone(),
            default_fps: self.recording.default_fps,
            jpeg_quality: self.delivery.jpeg_quality,
            join_timeout: self.join_timeout,
            ..RecorderSettings::default()
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            buffer_size: self.source.buffer_size,
            capture: self.capture_settings(),
            recorder: self.recorder_settings(),
            join_timeout: self.join_timeout,
            analysis_processor: self.delivery.processor,
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            addr: self.viewer_addr.clone(),
            delivery: self.delivery_settings(),
            processor: self.delivery.processor,
        }
    }

    pub fn control_defaults(&self) -> ControlDefaults {
        ControlDefaults {
            source_url: self.source.url.clone(),
            max_duration: self.recording.max_duration,
            frame_interval: self.recording.frame_interval,
        }
    }

    pub fn category_filter(&self) -> CategoryFilter {
        CategoryFilter::new(self.history.detect_types.iter().cloned())
    }
}

impl Default for StreamdConfig {
    fn default() -> Self {
        Self::from_file(StreamdConfigFile::default())
    }
}

fn read_config_file(path: &Path) -> Result<StreamdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = StreamdConfig::default();
        assert_eq!(cfg.source.url, DEFAULT_SOURCE_URL);
        assert_eq!(cfg.source.buffer_size, 30);
        assert_eq!(cfg.source.reconnect_delay, Duration::from_secs(5));
        assert_eq!(cfg.delivery.target_fps, 30);
        assert_eq!(cfg.delivery.jpeg_quality, 80);
        assert_eq!(cfg.delivery.pacing, PacingMode::Fixed);
        assert_eq!(cfg.history.detect_types, vec!["bottle", "bird"]);
        assert_eq!(cfg.join_timeout, Duration::from_secs(2));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = StreamdConfig::default();
        cfg.source.buffer_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = StreamdConfig::default();
        cfg.delivery.jpeg_quality = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = StreamdConfig::default();
        cfg.source.stale_timeout = Duration::from_millis(100);
        assert!(cfg.validate().is_err());

        let mut cfg = StreamdConfig::default();
        cfg.source.url = "ftp://nope".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn split_csv_trims_and_skips_blanks() {
        assert_eq!(split_csv(" bird, ,bottle ,"), vec!["bird", "bottle"]);
    }

    #[test]
    fn toml_sections_parse() {
        let file: StreamdConfigFile = toml::from_str(
            r#"
            [delivery]
            pacing = "measured"
            processor = "passthrough"

            [history]
            detect_types = ["*"]
            "#,
        )
        .expect("toml");
        let cfg = StreamdConfig::from_file(file);
        assert_eq!(cfg.delivery.pacing, PacingMode::Measured);
        assert_eq!(cfg.delivery.processor, ProcessorKind::Passthrough);
        assert!(cfg.category_filter().accepts_all());
    }
}
