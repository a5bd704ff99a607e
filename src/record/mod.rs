//! Duration-capped recording straight from a frame source.
//!
//! The recorder bypasses the frame buffer: its thread reads every frame,
//! encodes it and appends it to a `.svr` file. The thread ends on stop, on
//! the duration cap, when the source closes, or after too many bad reads in
//! a row. Whatever the exit path, the file is flushed and the source is
//! closed exactly once.

mod format;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::deliver::FrameEncoder;
use crate::error::{ReadError, StreamError};
use crate::ingest::{FrameSource, SourceFactory};
use crate::worker::{JoinOutcome, StopSignal, Worker};
use crate::{now_s, random_hex};

pub use format::{
    probe_recording, RecordedFrame, RecordingHeader, RecordingInfo, RecordingReader,
    RecordingWriter, EXTENSION, MAGIC,
};

#[derive(Clone, Debug, PartialEq)]
pub struct RecorderSettings {
    pub output_dir: PathBuf,
    /// Used when the source does not report a frame rate.
    pub default_fps: f64,
    pub jpeg_quality: u8,
    pub max_consecutive_failures: u32,
    pub failure_pause: Duration,
    pub join_timeout: Duration,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recordings"),
            default_fps: 30.0,
            jpeg_quality: crate::deliver::DEFAULT_JPEG_QUALITY,
            max_consecutive_failures: 100,
            failure_pause: Duration::from_millis(10),
            join_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingEnd {
    Stopped,
    MaxDuration,
    SourceClosed,
    TooManyFailures,
    WriteFailed,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecordingOutcome {
    pub path: PathBuf,
    pub frames: u64,
    pub duration_secs: f64,
    pub ended: RecordingEnd,
}

/// `recording_<epoch>_<hex8>.svr`
pub fn recording_file_name(epoch_s: u64) -> String {
    format!("recording_{}_{}.{}", epoch_s, random_hex(4), EXTENSION)
}

pub struct Recorder {
    address: String,
    path: PathBuf,
    started_at: Instant,
    max_duration: Duration,
    stop: StopSignal,
    worker: Option<Worker<RecordingOutcome>>,
    outcome: Option<RecordingOutcome>,
    join_timeout: Duration,
}

impl Recorder {
    /// Open the source, allocate the output file and start recording.
    ///
    /// Fails fast if the source cannot be opened or the file cannot be
    /// created; in both cases nothing is left running.
    pub fn start(
        factory: &dyn SourceFactory,
        address: &str,
        max_duration: Duration,
        settings: &RecorderSettings,
    ) -> Result<Self, StreamError> {
        let mut source = factory.create(address)?;
        let info = source.open(address)?;

        let prepared = fs::create_dir_all(&settings.output_dir)
            .map_err(|e| StreamError::resource(&settings.output_dir, e))
            .and_then(|_| {
                let epoch = now_s().map_err(|e| StreamError::SessionStart {
                    address: address.to_string(),
                    reason: e.to_string(),
                })?;
                RecordingWriter::create(settings.output_dir.join(recording_file_name(epoch)))
            });
        let writer = match prepared {
            Ok(writer) => writer,
            Err(err) => {
                source.close();
                return Err(err);
            }
        };
        let path = writer.path().to_path_buf();

        let stop = StopSignal::new();
        let task = RecordingTask {
            address: address.to_string(),
            source,
            writer,
            encoder: FrameEncoder::new(settings.jpeg_quality),
            fps: usable_fps(info.fps).unwrap_or(settings.default_fps).max(1.0),
            fps_settled: usable_fps(info.fps).is_some(),
            max_duration,
            stop: stop.clone(),
            max_consecutive_failures: settings.max_consecutive_failures,
            failure_pause: settings.failure_pause,
            released: false,
        };
        let worker = Worker::spawn(format!("record-{}", address), move || {
            let mut task = task;
            task.run()
        })
        .map_err(|e| StreamError::SessionStart {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

        log::info!(
            "recording {} to {} (max {:?})",
            address,
            path.display(),
            max_duration
        );
        Ok(Self {
            address: address.to_string(),
            path,
            started_at: Instant::now(),
            max_duration,
            stop,
            worker: Some(worker),
            outcome: None,
            join_timeout: settings.join_timeout,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn output_path(&self) -> &Path {
        &self.path
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    /// True once the recording thread has exited on its own or been stopped.
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, |w| w.is_finished())
    }

    pub fn outcome(&self) -> Option<&RecordingOutcome> {
        self.outcome.as_ref()
    }

    /// Ask the recording thread to finish without waiting for it.
    pub fn request_stop(&self) {
        self.stop.stop();
    }

    /// Stop recording and return the output path. Later calls return the
    /// same path without doing anything.
    pub fn stop(&mut self) -> PathBuf {
        if let Some(mut worker) = self.worker.take() {
            self.stop.stop();
            match worker.join_timeout(self.join_timeout) {
                JoinOutcome::Finished(outcome) => {
                    log::info!(
                        "recording {} finished: {} frames, {:.2}s ({:?})",
                        outcome.path.display(),
                        outcome.frames,
                        outcome.duration_secs,
                        outcome.ended
                    );
                    self.outcome = Some(outcome);
                }
                JoinOutcome::Panicked => {
                    log::error!("recording thread for {} panicked", self.address)
                }
                JoinOutcome::TimedOut | JoinOutcome::AlreadyJoined => {}
            }
        }
        self.path.clone()
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.stop();
    }
}

struct RecordingTask {
    address: String,
    source: Box<dyn FrameSource>,
    writer: RecordingWriter,
    encoder: FrameEncoder,
    fps: f64,
    /// False while `fps` is still the configured fallback.
    fps_settled: bool,
    max_duration: Duration,
    stop: StopSignal,
    max_consecutive_failures: u32,
    failure_pause: Duration,
    released: bool,
}

impl RecordingTask {
    fn run(&mut self) -> RecordingOutcome {
        let ended = self.record();
        self.release();
        RecordingOutcome {
            path: self.writer.path().to_path_buf(),
            frames: self.writer.frames(),
            duration_secs: self.writer.duration().as_secs_f64(),
            ended,
        }
    }

    fn record(&mut self) -> RecordingEnd {
        let started = Instant::now();
        let mut failures = 0u32;
        loop {
            if self.stop.is_stopped() {
                return RecordingEnd::Stopped;
            }
            if started.elapsed() >= self.max_duration {
                return RecordingEnd::MaxDuration;
            }

            let frame = match self.source.read_frame() {
                Ok(frame) if frame.is_valid() => frame,
                Ok(_) | Err(ReadError::Timeout(_)) | Err(ReadError::Transport(_))
                    if failures < self.max_consecutive_failures =>
                {
                    failures += 1;
                    self.stop.wait_timeout(self.failure_pause);
                    continue;
                }
                Err(ReadError::Closed) => {
                    log::info!("recording {}: source closed", self.address);
                    return RecordingEnd::SourceClosed;
                }
                Ok(_) | Err(_) => {
                    log::warn!(
                        "recording {}: {} consecutive bad reads, giving up",
                        self.address,
                        failures + 1
                    );
                    return RecordingEnd::TooManyFailures;
                }
            };
            failures = 0;
            self.settle_fps();

            let pts = Duration::from_secs_f64(self.writer.frames() as f64 / self.fps);
            if pts > self.max_duration {
                return RecordingEnd::MaxDuration;
            }
            let jpeg = match self.encoder.encode(&frame) {
                Ok(jpeg) => jpeg,
                Err(err) => {
                    log::warn!("recording {}: skipping frame: {:#}", self.address, err);
                    continue;
                }
            };
            let header = RecordingHeader {
                width: frame.width,
                height: frame.height,
                fps: self.fps as f32,
            };
            let written = self
                .writer
                .ensure_header(header)
                .and_then(|_| self.writer.append(pts, &jpeg));
            if let Err(err) = written {
                log::error!(
                    "recording {}: write to {} failed: {}",
                    self.address,
                    self.writer.path().display(),
                    err
                );
                return RecordingEnd::WriteFailed;
            }
        }
    }

    /// Some transports only learn their frame rate once decoding starts.
    /// Take it before the header is written; after that the rate is fixed.
    fn settle_fps(&mut self) {
        if self.fps_settled {
            return;
        }
        self.fps_settled = true;
        if self.writer.frames() > 0 {
            return;
        }
        if let Some(fps) = usable_fps(self.source.stream_info().fps) {
            log::info!("recording {}: source reports {:.2} fps", self.address, fps);
            self.fps = fps.max(1.0);
        }
    }

    /// Flush the file and close the source. Runs once.
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = self.writer.finish() {
            log::error!(
                "recording {}: failed to flush {}: {}",
                self.address,
                self.writer.path().display(),
                err
            );
        }
        self.source.close();
    }
}

impl Drop for RecordingTask {
    fn drop(&mut self) {
        self.release();
    }
}

fn usable_fps(fps: Option<f64>) -> Option<f64> {
    fps.filter(|f| f.is_finite() && *f > 0.0)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::ingest::{SourceSettings, StreamInfo, StreamSourceFactory};

    fn settings(dir: &Path) -> RecorderSettings {
        RecorderSettings {
            output_dir: dir.to_path_buf(),
            default_fps: 10.0,
            ..RecorderSettings::default()
        }
    }

    fn factory() -> StreamSourceFactory {
        StreamSourceFactory::new(SourceSettings {
            read_timeout: Duration::from_millis(50),
            open_timeout: Duration::from_millis(200),
        })
    }

    #[test]
    fn file_name_shape() {
        let name = recording_file_name(42);
        assert!(name.starts_with("recording_42_"));
        assert!(name.ends_with(".svr"));
        assert_eq!(name.len(), "recording_42_".len() + 8 + ".svr".len());
    }

    #[test]
    fn start_then_immediate_stop_leaves_a_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut recorder = Recorder::start(
            &factory(),
            "stub://cam?fps=50&width=16&height=8",
            Duration::from_secs(60),
            &settings(dir.path()),
        )?;
        let path = recorder.stop();
        assert!(path.exists());
        assert!(path.starts_with(dir.path()));

        let info = probe_recording(&path)?;
        if info.frames > 0 {
            assert!(std::fs::metadata(&path)?.len() > 0);
            assert_eq!((info.width, info.height), (16, 8));
        }
        assert_eq!(recorder.stop(), path, "second stop returns the same path");
        assert_eq!(
            recorder.outcome().map(|o| o.ended),
            Some(RecordingEnd::Stopped)
        );
        Ok(())
    }

    #[test]
    fn duration_cap_bounds_recorded_length() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let max = Duration::from_secs(1);
        let mut recorder = Recorder::start(
            &factory(),
            "stub://cam?fps=0&width=8&height=8",
            max,
            &settings(dir.path()),
        )?;
        let deadline = Instant::now() + Duration::from_secs(5);
        while !recorder.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        let path = recorder.stop();
        let outcome = recorder.outcome().cloned().expect("outcome");
        assert_eq!(outcome.ended, RecordingEnd::MaxDuration);

        let info = probe_recording(&path)?;
        let period = 1.0 / f64::from(info.fps);
        assert!(info.frames > 0);
        assert!(info.duration_secs <= max.as_secs_f64() + period + 1e-6);
        assert_eq!(info.frames, outcome.frames);
        Ok(())
    }

    #[test]
    fn closed_source_ends_recording() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut recorder = Recorder::start(
            &factory(),
            "stub://cam?fps=0&frames=5&eos=true",
            Duration::from_secs(60),
            &settings(dir.path()),
        )?;
        let deadline = Instant::now() + Duration::from_secs(5);
        while !recorder.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        let path = recorder.stop();
        let outcome = recorder.outcome().expect("outcome");
        assert_eq!(outcome.ended, RecordingEnd::SourceClosed);
        assert_eq!(probe_recording(&path)?.frames, 5);
        Ok(())
    }

    #[test]
    fn unopenable_source_fails_fast_without_a_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let err = Recorder::start(
            &factory(),
            "stub://cam?fail_open=true",
            Duration::from_secs(1),
            &settings(dir.path()),
        )
        .err()
        .expect("start should fail");
        assert!(matches!(err, StreamError::Transport { .. }));
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }

    /// Reports no frame rate at open and 25 fps once frames flow, then
    /// closes after `frames` reads.
    struct LateRateSource {
        frames: u64,
        read: u64,
        open: bool,
    }

    impl FrameSource for LateRateSource {
        fn open(&mut self, _address: &str) -> Result<StreamInfo, StreamError> {
            self.open = true;
            Ok(StreamInfo::default())
        }

        fn read_frame(&mut self) -> Result<Frame, ReadError> {
            if !self.open || self.read >= self.frames {
                return Err(ReadError::Closed);
            }
            self.read += 1;
            Ok(Frame::rgb(vec![(self.read * 30) as u8; 4 * 4 * 3], 4, 4, self.read))
        }

        fn close(&mut self) {
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn stream_info(&self) -> StreamInfo {
            StreamInfo {
                width: Some(4),
                height: Some(4),
                fps: (self.read > 0).then_some(25.0),
            }
        }
    }

    struct LateRateFactory;

    impl SourceFactory for LateRateFactory {
        fn create(&self, _address: &str) -> Result<Box<dyn FrameSource>, StreamError> {
            Ok(Box::new(LateRateSource {
                frames: 3,
                read: 0,
                open: false,
            }))
        }
    }

    #[test]
    fn rate_reported_after_open_sets_the_header() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut recorder = Recorder::start(
            &LateRateFactory,
            "rtsp://camera/late",
            Duration::from_secs(60),
            &settings(dir.path()),
        )?;
        let deadline = Instant::now() + Duration::from_secs(5);
        while !recorder.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        let path = recorder.stop();
        assert_eq!(
            recorder.outcome().map(|o| o.ended),
            Some(RecordingEnd::SourceClosed)
        );

        let info = probe_recording(&path)?;
        assert_eq!(info.frames, 3);
        assert_eq!(info.fps, 25.0, "not the 10 fps fallback");

        let mut reader = RecordingReader::open(&path)?;
        let mut pts = Vec::new();
        while let Some(frame) = reader.next_frame()? {
            pts.push(frame.pts.as_secs_f64());
        }
        assert_eq!(pts.len(), 3);
        for (got, want) in pts.iter().zip([0.0, 0.04, 0.08]) {
            assert!((got - want).abs() < 1e-4, "pts {:?}", pts);
        }
        Ok(())
    }

    #[test]
    fn request_stop_lets_the_thread_finish_before_join() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut recorder = Recorder::start(
            &factory(),
            "stub://cam?fps=20&width=8&height=8",
            Duration::from_secs(60),
            &settings(dir.path()),
        )?;
        recorder.request_stop();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !recorder.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(recorder.is_finished());
        recorder.stop();
        assert_eq!(
            recorder.outcome().map(|o| o.ended),
            Some(RecordingEnd::Stopped)
        );
        Ok(())
    }

    #[test]
    fn unwritable_output_is_resource_error() {
        let settings = RecorderSettings {
            output_dir: PathBuf::from("/proc/definitely/not/writable"),
            ..RecorderSettings::default()
        };
        let err = Recorder::start(&factory(), "stub://cam", Duration::from_secs(1), &settings)
            .err()
            .expect("start should fail");
        assert!(matches!(err, StreamError::Resource { .. }));
    }
}
