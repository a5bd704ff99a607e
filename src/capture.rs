//! Capture loop: drives a `FrameSource` into a `FrameBuffer`.
//!
//! The loop owns an explicit reconnect state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Streaming <-> (valid frames)
//!                     |             |
//!                     v             v  read closed/failed, or stale
//!                 Reconnecting <----+
//!                     |  after reconnect_delay
//!                     +--> Connecting
//! any state -> Stopped  (stop signal or max duration)
//! ```
//!
//! Only this loop writes the state. Other components observe it through a
//! read-only `StateCell` or an optional transition channel. The loop shares
//! nothing mutable with delivery except the frame buffer.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use serde::Serialize;

use crate::error::StreamError;
use crate::frame::{Frame, FrameBuffer};
use crate::ingest::FrameSource;
use crate::worker::StopSignal;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
    Stopped,
}

impl CaptureState {
    fn as_u8(self) -> u8 {
        match self {
            CaptureState::Disconnected => 0,
            CaptureState::Connecting => 1,
            CaptureState::Streaming => 2,
            CaptureState::Reconnecting => 3,
            CaptureState::Stopped => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => CaptureState::Connecting,
            2 => CaptureState::Streaming,
            3 => CaptureState::Reconnecting,
            4 => CaptureState::Stopped,
            _ => CaptureState::Disconnected,
        }
    }
}

/// Read-only view of a capture loop's current state.
#[derive(Clone, Debug)]
pub struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(CaptureState::Disconnected.as_u8())))
    }

    fn set(&self, state: CaptureState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }

    pub fn get(&self) -> CaptureState {
        CaptureState::from_u8(self.0.load(Ordering::Acquire))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: CaptureState,
    pub to: CaptureState,
    pub at: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureSettings {
    /// Longest tolerated gap without a valid frame before reconnecting.
    pub stale_timeout: Duration,
    /// Pause between a failure and the next open attempt.
    pub reconnect_delay: Duration,
    /// Pause after an idle read that is not yet stale.
    pub idle_backoff: Duration,
    /// Hard cap on how long the loop runs.
    pub max_duration: Option<Duration>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            stale_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            idle_backoff: Duration::from_millis(10),
            max_duration: None,
        }
    }
}

/// Live counters, readable while the loop runs.
#[derive(Debug, Default)]
pub struct CaptureCounters {
    frames_captured: AtomicU64,
    invalid_frames: AtomicU64,
    evictions: AtomicU64,
    open_failures: AtomicU64,
    reconnects: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub invalid_frames: u64,
    /// Frames dropped from a full buffer to make room.
    pub evictions: u64,
    pub open_failures: u64,
    pub reconnects: u64,
}

impl CaptureCounters {
    pub fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            invalid_frames: self.invalid_frames.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            open_failures: self.open_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// What a finished capture loop reports.
#[derive(Clone, Copy, Debug)]
pub struct CaptureSummary {
    pub stats: CaptureStats,
    pub ran_for: Duration,
}

pub struct CaptureLoop {
    source: Box<dyn FrameSource>,
    address: String,
    buffer: Arc<FrameBuffer>,
    settings: CaptureSettings,
    stop: StopSignal,
    state: CaptureState,
    cell: StateCell,
    counters: Arc<CaptureCounters>,
    observer: Option<Sender<Transition>>,
    source_is_open: bool,
}

impl CaptureLoop {
    pub fn new(
        source: Box<dyn FrameSource>,
        address: impl Into<String>,
        buffer: Arc<FrameBuffer>,
        settings: CaptureSettings,
        stop: StopSignal,
    ) -> Self {
        Self {
            source,
            address: address.into(),
            buffer,
            settings,
            stop,
            state: CaptureState::Disconnected,
            cell: StateCell::new(),
            counters: Arc::new(CaptureCounters::default()),
            observer: None,
            source_is_open: false,
        }
    }

    /// Publish every transition on `tx`.
    pub fn with_observer(mut self, tx: Sender<Transition>) -> Self {
        self.observer = Some(tx);
        self
    }

    /// The caller already opened the source; the first Connecting step skips `open`.
    pub fn with_open_source(mut self) -> Self {
        self.source_is_open = true;
        self
    }

    pub fn state_cell(&self) -> StateCell {
        self.cell.clone()
    }

    pub fn counters(&self) -> Arc<CaptureCounters> {
        self.counters.clone()
    }

    /// Run until stopped. Always closes the source before returning.
    pub fn run(mut self) -> CaptureSummary {
        let started = Instant::now();
        let mut last_success = Instant::now();
        self.transition(CaptureState::Connecting);

        loop {
            if self.stop.is_stopped() {
                log::info!("capture {}: stop requested", self.address);
                break;
            }
            if let Some(max) = self.settings.max_duration {
                if started.elapsed() >= max {
                    log::info!("capture {}: reached max duration {:?}", self.address, max);
                    break;
                }
            }
            match self.state {
                CaptureState::Connecting => self.connect(&mut last_success),
                CaptureState::Streaming => self.stream_once(&mut last_success),
                CaptureState::Reconnecting => {
                    self.source.close();
                    self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "capture {}: connection lost, retrying in {:?}",
                        self.address,
                        self.settings.reconnect_delay
                    );
                    if self.stop.wait_timeout(self.settings.reconnect_delay) {
                        break;
                    }
                    self.transition(CaptureState::Connecting);
                }
                CaptureState::Disconnected | CaptureState::Stopped => break,
            }
        }

        self.source.close();
        self.transition(CaptureState::Stopped);
        log::info!("capture {}: stopped", self.address);
        CaptureSummary {
            stats: self.counters.snapshot(),
            ran_for: started.elapsed(),
        }
    }

    fn connect(&mut self, last_success: &mut Instant) {
        let opened = if std::mem::take(&mut self.source_is_open) {
            Ok(())
        } else {
            self.source.open(&self.address).map(|_| ())
        };

        if let Err(err) = opened {
            self.counters.open_failures.fetch_add(1, Ordering::Relaxed);
            log::warn!("capture {}: open failed: {}", self.address, err);
            self.transition(CaptureState::Reconnecting);
            return;
        }

        // Some transports need several reads to stabilise; a bad first read
        // does not abort startup.
        match self.source.read_frame() {
            Ok(frame) if frame.is_valid() => self.admit(frame),
            Ok(_) => {
                self.counters.invalid_frames.fetch_add(1, Ordering::Relaxed);
                log::debug!("capture {}: first frame invalid, continuing", self.address);
            }
            Err(err) => log::warn!(
                "capture {}: first frame read failed ({}), continuing",
                self.address,
                err
            ),
        }
        *last_success = Instant::now();
        self.transition(CaptureState::Streaming);
    }

    fn stream_once(&mut self, last_success: &mut Instant) {
        match self.source.read_frame() {
            Ok(frame) if frame.is_valid() => {
                *last_success = Instant::now();
                self.admit(frame);
                return;
            }
            Ok(_) => {
                self.counters.invalid_frames.fetch_add(1, Ordering::Relaxed);
                log::debug!("capture {}: skipping invalid frame", self.address);
            }
            Err(err) if err.is_fatal() => {
                log::warn!("capture {}: read failed: {}", self.address, err);
                self.transition(CaptureState::Reconnecting);
                return;
            }
            Err(_) => {}
        }

        let silent_for = last_success.elapsed();
        if silent_for > self.settings.stale_timeout {
            log::warn!(
                "capture {}: {}; reinitialising connection",
                self.address,
                StreamError::StaleData(silent_for)
            );
            self.transition(CaptureState::Reconnecting);
        } else {
            self.stop.wait_timeout(self.settings.idle_backoff);
        }
    }

    fn admit(&self, frame: Frame) {
        self.counters.frames_captured.fetch_add(1, Ordering::Relaxed);
        if self.buffer.put(frame) {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            log::trace!("capture {}: buffer full, dropped oldest frame", self.address);
        }
    }

    fn transition(&mut self, to: CaptureState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        self.cell.set(to);
        log::debug!("capture {}: {:?} -> {:?}", self.address, from, to);
        if let Some(tx) = &self.observer {
            let _ = tx.send(Transition {
                from,
                to,
                at: Instant::now(),
            });
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReadError;
    use crate::ingest::StreamInfo;
    use std::collections::VecDeque;

    /// Scripted source: each read pops the next outcome; an empty script times out.
    struct ScriptedSource {
        open_ok: bool,
        script: VecDeque<Result<Frame, ReadError>>,
        open: bool,
    }

    impl ScriptedSource {
        fn new(open_ok: bool, script: Vec<Result<Frame, ReadError>>) -> Self {
            Self {
                open_ok,
                script: script.into(),
                open: false,
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn open(&mut self, address: &str) -> Result<StreamInfo, StreamError> {
            if self.open_ok {
                self.open = true;
                Ok(StreamInfo::default())
            } else {
                Err(StreamError::transport(address, "refused"))
            }
        }

        fn read_frame(&mut self) -> Result<Frame, ReadError> {
            match self.script.pop_front() {
                Some(outcome) => outcome,
                None => {
                    std::thread::sleep(Duration::from_millis(2));
                    Err(ReadError::Timeout(Duration::from_millis(2)))
                }
            }
        }

        fn close(&mut self) {
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    fn frame(seq: u64) -> Frame {
        Frame::rgb(vec![1; 12], 2, 2, seq)
    }

    fn settings() -> CaptureSettings {
        CaptureSettings {
            stale_timeout: Duration::from_millis(60),
            reconnect_delay: Duration::from_millis(30),
            idle_backoff: Duration::from_millis(2),
            max_duration: None,
        }
    }

    #[test]
    fn valid_frames_reach_the_buffer() {
        let buffer = Arc::new(FrameBuffer::new(8));
        let source = ScriptedSource::new(true, (1..=5).map(|i| Ok(frame(i))).collect());
        let stop = StopSignal::new();
        let capture = CaptureLoop::new(
            Box::new(source),
            "stub://scripted",
            buffer.clone(),
            settings(),
            stop.clone(),
        );
        let counters = capture.counters();
        let cell = capture.state_cell();
        let handle = std::thread::spawn(move || capture.run());

        let deadline = Instant::now() + Duration::from_secs(2);
        while buffer.len() < 5 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(cell.get(), CaptureState::Streaming);
        stop.stop();
        let summary = handle.join().expect("capture thread");

        assert_eq!(summary.stats.frames_captured, 5);
        assert_eq!(counters.snapshot().frames_captured, 5);
        assert_eq!(cell.get(), CaptureState::Stopped);
        let seqs: Vec<u64> = std::iter::from_fn(|| buffer.try_get()).map(|f| f.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn full_buffer_counts_evictions() {
        let buffer = Arc::new(FrameBuffer::new(2));
        let source = ScriptedSource::new(true, (1..=5).map(|i| Ok(frame(i))).collect());
        let stop = StopSignal::new();
        let capture = CaptureLoop::new(
            Box::new(source),
            "stub://scripted",
            buffer.clone(),
            settings(),
            stop.clone(),
        );
        let counters = capture.counters();
        let handle = std::thread::spawn(move || capture.run());

        let deadline = Instant::now() + Duration::from_secs(2);
        while counters.snapshot().frames_captured < 5 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        stop.stop();
        let summary = handle.join().expect("capture thread");

        assert_eq!(summary.stats.evictions, 3);
        let seqs: Vec<u64> = std::iter::from_fn(|| buffer.try_get()).map(|f| f.sequence).collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[test]
    fn invalid_frames_do_not_trigger_reconnect_before_stale() {
        let buffer = Arc::new(FrameBuffer::new(4));
        let mut script: Vec<Result<Frame, ReadError>> = vec![Ok(frame(1))];
        script.extend((0..3).map(|_| Ok(Frame::rgb(Vec::new(), 0, 0, 0))));
        script.push(Ok(frame(2)));
        let source = ScriptedSource::new(true, script);
        let (tx, rx) = crossbeam_channel::unbounded();
        let stop = StopSignal::new();
        let mut cfg = settings();
        cfg.stale_timeout = Duration::from_secs(5);
        let capture = CaptureLoop::new(Box::new(source), "stub://s", buffer.clone(), cfg, stop.clone())
            .with_observer(tx);
        let counters = capture.counters();
        let handle = std::thread::spawn(move || capture.run());

        std::thread::sleep(Duration::from_millis(50));
        stop.stop();
        handle.join().expect("capture thread");

        let states: Vec<CaptureState> = rx.try_iter().map(|t| t.to).collect();
        assert!(!states.contains(&CaptureState::Reconnecting));
        assert_eq!(counters.snapshot().invalid_frames, 3);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn closed_read_reconnects_immediately() {
        let buffer = Arc::new(FrameBuffer::new(4));
        let source = ScriptedSource::new(true, vec![Ok(frame(1)), Err(ReadError::Closed)]);
        let (tx, rx) = crossbeam_channel::unbounded();
        let stop = StopSignal::new();
        let capture =
            CaptureLoop::new(Box::new(source), "stub://s", buffer, settings(), stop.clone())
                .with_observer(tx);
        let handle = std::thread::spawn(move || capture.run());

        let first_reconnect = rx
            .iter()
            .find(|t| t.to == CaptureState::Reconnecting)
            .expect("reconnecting transition");
        assert_eq!(first_reconnect.from, CaptureState::Streaming);
        stop.stop();
        let summary = handle.join().expect("capture thread");
        assert!(summary.stats.reconnects >= 1);
    }

    #[test]
    fn max_duration_stops_the_loop() {
        let buffer = Arc::new(FrameBuffer::new(4));
        let source = ScriptedSource::new(true, Vec::new());
        let mut cfg = settings();
        cfg.stale_timeout = Duration::from_secs(5);
        cfg.max_duration = Some(Duration::from_millis(40));
        let capture = CaptureLoop::new(Box::new(source), "stub://s", buffer, cfg, StopSignal::new());
        let cell = capture.state_cell();
        let summary = capture.run();
        assert!(summary.ran_for >= Duration::from_millis(40));
        assert!(summary.ran_for < Duration::from_secs(2));
        assert_eq!(cell.get(), CaptureState::Stopped);
    }

    #[test]
    fn stop_interrupts_reconnect_delay() {
        let buffer = Arc::new(FrameBuffer::new(4));
        let source = ScriptedSource::new(false, Vec::new());
        let mut cfg = settings();
        cfg.reconnect_delay = Duration::from_secs(30);
        let stop = StopSignal::new();
        let capture = CaptureLoop::new(Box::new(source), "stub://s", buffer, cfg, stop.clone());
        let started = Instant::now();
        let handle = std::thread::spawn(move || capture.run());
        std::thread::sleep(Duration::from_millis(20));
        stop.stop();
        handle.join().expect("capture thread");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn failing_open_never_streams_and_respects_delay() {
        let buffer = Arc::new(FrameBuffer::new(4));
        let source = ScriptedSource::new(false, Vec::new());
        let (tx, rx) = crossbeam_channel::unbounded();
        let stop = StopSignal::new();
        let capture = CaptureLoop::new(Box::new(source), "stub://down", buffer, settings(), stop.clone())
            .with_observer(tx);
        let handle = std::thread::spawn(move || capture.run());
        std::thread::sleep(Duration::from_millis(200));
        stop.stop();
        let summary = handle.join().expect("capture thread");

        let transitions: Vec<Transition> = rx.try_iter().collect();
        assert!(transitions.iter().all(|t| t.to != CaptureState::Streaming));
        let attempts: Vec<Instant> = transitions
            .iter()
            .filter(|t| t.to == CaptureState::Connecting)
            .map(|t| t.at)
            .collect();
        assert!(attempts.len() >= 2, "expected repeated attempts");
        for pair in attempts.windows(2) {
            assert!(pair[1] - pair[0] >= settings().reconnect_delay);
        }
        assert!(summary.stats.open_failures >= 2);
        assert_eq!(summary.stats.frames_captured, 0);
    }

    #[test]
    fn silent_source_is_detected_as_stale() {
        let buffer = Arc::new(FrameBuffer::new(4));
        let source = ScriptedSource::new(true, vec![Ok(frame(1))]);
        let (tx, rx) = crossbeam_channel::unbounded();
        let stop = StopSignal::new();
        let capture = CaptureLoop::new(Box::new(source), "stub://quiet", buffer, settings(), stop.clone())
            .with_observer(tx);
        let handle = std::thread::spawn(move || capture.run());

        let streaming = rx
            .iter()
            .find(|t| t.to == CaptureState::Streaming)
            .expect("streaming transition");
        let stale = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("reconnecting transition");
        stop.stop();
        handle.join().expect("capture thread");

        assert_eq!(stale.to, CaptureState::Reconnecting);
        let gap = stale.at - streaming.at;
        assert!(gap >= settings().stale_timeout);
        assert!(gap < settings().stale_timeout + Duration::from_millis(500));
    }

    #[test]
    fn state_round_trips_through_cell() {
        let cell = StateCell::new();
        for state in [
            CaptureState::Connecting,
            CaptureState::Streaming,
            CaptureState::Reconnecting,
            CaptureState::Stopped,
            CaptureState::Disconnected,
        ] {
            cell.set(state);
            assert_eq!(cell.get(), state);
        }
    }
}
