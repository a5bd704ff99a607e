//! Session lifecycle: start, stop and list live sessions and recordings.
//!
//! A `SessionManager` is created once and shared (`Arc<SessionManager>`).
//! The session table lock is only held to insert, remove or snapshot
//! entries; thread joins always happen outside it and are bounded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::analysis::{analyze_recording, AnalysisReport, HistoryTarget};
use crate::capture::{
    CaptureCounters, CaptureLoop, CaptureSettings, CaptureState, CaptureStats, CaptureSummary,
    StateCell,
};
use crate::deliver::FrameEncoder;
use crate::detect::{CategoryFilter, ProcessorKind};
use crate::error::StreamError;
use crate::frame::{BufferStats, FrameBuffer, DEFAULT_BUFFER_FRAMES};
use crate::ingest::SourceFactory;
use crate::new_session_id;
use crate::record::{Recorder, RecorderSettings, RecordingOutcome};
use crate::storage::PersistenceHandle;
use crate::worker::{JoinOutcome, StopSignal, Worker};

#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub buffer_size: usize,
    pub capture: CaptureSettings,
    pub recorder: RecorderSettings,
    pub join_timeout: Duration,
    /// Processor used when analysing stopped recordings.
    pub analysis_processor: ProcessorKind,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_FRAMES,
            capture: CaptureSettings::default(),
            recorder: RecorderSettings::default(),
            join_timeout: Duration::from_secs(2),
            analysis_processor: ProcessorKind::default(),
        }
    }
}

/// Where detections worth keeping are sent.
#[derive(Clone)]
pub struct HistoryBinding {
    pub handle: PersistenceHandle,
    pub filter: CategoryFilter,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Live,
    Recording,
}

/// Handle returned to whoever drives delivery for a live session.
#[derive(Clone, Debug)]
pub struct LiveSession {
    pub id: String,
    pub address: String,
    pub buffer: Arc<FrameBuffer>,
    pub stop: StopSignal,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub address: String,
    pub kind: SessionKind,
    pub uptime_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<CaptureState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture: Option<CaptureStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer: Option<BufferStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StopSummary {
    pub session_id: String,
    pub address: String,
    pub kind: SessionKind,
    pub uptime_secs: f64,
    /// False when the background thread outlived the join timeout.
    pub joined: bool,
    pub drained_frames: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture: Option<CaptureStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecordingStarted {
    pub session_id: String,
    pub output_path: PathBuf,
    pub address: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecordingStopped {
    pub session_id: String,
    pub output_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RecordingOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_error: Option<String>,
}

struct LiveEntry {
    address: String,
    buffer: Arc<FrameBuffer>,
    stop: StopSignal,
    state: StateCell,
    counters: Arc<CaptureCounters>,
    worker: Worker<CaptureSummary>,
    started_at: Instant,
}

struct RecordingEntry {
    recorder: Recorder,
}

enum Entry {
    Live(LiveEntry),
    Recording(RecordingEntry),
}

impl Entry {
    fn kind(&self) -> SessionKind {
        match self {
            Entry::Live(_) => SessionKind::Live,
            Entry::Recording(_) => SessionKind::Recording,
        }
    }

    fn is_finished(&self) -> bool {
        match self {
            Entry::Live(live) => live.worker.is_finished(),
            Entry::Recording(rec) => rec.recorder.is_finished(),
        }
    }

    fn summary(&self, id: &str) -> SessionSummary {
        match self {
            Entry::Live(live) => SessionSummary {
                session_id: id.to_string(),
                address: live.address.clone(),
                kind: SessionKind::Live,
                uptime_secs: live.started_at.elapsed().as_secs_f64(),
                state: Some(live.state.get()),
                capture: Some(live.counters.snapshot()),
                buffer: Some(live.buffer.stats()),
                output_path: None,
            },
            Entry::Recording(rec) => SessionSummary {
                session_id: id.to_string(),
                address: rec.recorder.address().to_string(),
                kind: SessionKind::Recording,
                uptime_secs: rec.recorder.uptime().as_secs_f64(),
                state: None,
                capture: None,
                buffer: None,
                output_path: Some(rec.recorder.output_path().to_path_buf()),
            },
        }
    }
}

pub struct SessionManager {
    factory: Arc<dyn SourceFactory>,
    settings: SessionSettings,
    history: Option<HistoryBinding>,
    sessions: Mutex<HashMap<String, Entry>>,
}

impl SessionManager {
    pub fn new(factory: Arc<dyn SourceFactory>, settings: SessionSettings) -> Self {
        Self {
            factory,
            settings,
            history: None,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_history(mut self, history: HistoryBinding) -> Self {
        self.history = Some(history);
        self
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn history(&self) -> Option<&HistoryBinding> {
        self.history.as_ref()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open `address` and start capturing into a fresh buffer.
    ///
    /// The open happens on the caller's thread so that an unreachable source
    /// is reported here instead of turning into a reconnect loop.
    pub fn start_session(&self, address: &str) -> Result<LiveSession, StreamError> {
        let mut source = self.factory.create(address)?;
        let info = source.open(address)?;
        log::debug!("opened {} ({:?})", address, info);

        let id = new_session_id();
        let buffer = Arc::new(FrameBuffer::new(self.settings.buffer_size));
        let stop = StopSignal::new();
        let capture = CaptureLoop::new(
            source,
            address,
            buffer.clone(),
            self.settings.capture,
            stop.clone(),
        )
        .with_open_source();
        let state = capture.state_cell();
        let counters = capture.counters();
        let worker = Worker::spawn(format!("capture-{}", id), move || capture.run()).map_err(
            |e| StreamError::SessionStart {
                address: address.to_string(),
                reason: e.to_string(),
            },
        )?;

        self.sessions().insert(
            id.clone(),
            Entry::Live(LiveEntry {
                address: address.to_string(),
                buffer: buffer.clone(),
                stop: stop.clone(),
                state,
                counters,
                worker,
                started_at: Instant::now(),
            }),
        );
        log::info!("session {} started for {}", id, address);
        Ok(LiveSession {
            id,
            address: address.to_string(),
            buffer,
            stop,
        })
    }

    /// Stop a session of either kind and release everything it holds.
    pub fn stop_session(&self, id: &str) -> Result<StopSummary, StreamError> {
        let entry = self
            .sessions()
            .remove(id)
            .ok_or_else(|| StreamError::UnknownSession(id.to_string()))?;
        let summary = self.finish_entry(id, entry);
        log::info!("session {} stopped", id);
        Ok(summary)
    }

    pub fn start_recording(
        &self,
        address: &str,
        max_duration: Duration,
    ) -> Result<RecordingStarted, StreamError> {
        let recorder = Recorder::start(
            self.factory.as_ref(),
            address,
            max_duration,
            &self.settings.recorder,
        )?;
        let id = new_session_id();
        let started = RecordingStarted {
            session_id: id.clone(),
            output_path: recorder.output_path().to_path_buf(),
            address: address.to_string(),
        };
        self.sessions()
            .insert(id, Entry::Recording(RecordingEntry { recorder }));
        Ok(started)
    }

    /// Stop a recording and optionally analyse the finished file.
    pub fn stop_recording(
        &self,
        id: &str,
        analyze: bool,
        frame_interval: u64,
    ) -> Result<RecordingStopped, StreamError> {
        let mut recorder = {
            let mut sessions = self.sessions();
            match sessions.remove(id) {
                Some(Entry::Recording(rec)) => rec.recorder,
                Some(live @ Entry::Live(_)) => {
                    sessions.insert(id.to_string(), live);
                    return Err(StreamError::UnknownSession(id.to_string()));
                }
                None => return Err(StreamError::UnknownSession(id.to_string())),
            }
        };
        let output_path = recorder.stop();
        let outcome = recorder.outcome().cloned();

        let mut stopped = RecordingStopped {
            session_id: id.to_string(),
            output_path,
            outcome,
            analysis: None,
            analysis_error: None,
        };
        if analyze {
            match self.analyze(id, &stopped.output_path, frame_interval) {
                Ok(report) => stopped.analysis = Some(report),
                Err(err) => {
                    log::warn!("analysis of {} failed: {:#}", stopped.output_path.display(), err);
                    stopped.analysis_error = Some(format!("{:#}", err));
                }
            }
        }
        Ok(stopped)
    }

    fn analyze(&self, id: &str, path: &Path, frame_interval: u64) -> anyhow::Result<AnalysisReport> {
        let mut processor = self.settings.analysis_processor.build();
        let all = CategoryFilter::all();
        let (filter, target) = match &self.history {
            Some(history) => (
                &history.filter,
                Some(HistoryTarget {
                    session_id: id,
                    handle: &history.handle,
                    encoder: FrameEncoder::new(self.settings.recorder.jpeg_quality),
                }),
            ),
            None => (&all, None),
        };
        analyze_recording(path, processor.as_mut(), filter, frame_interval, target)
    }

    /// Active sessions. Live sessions whose capture thread already exited are
    /// reaped here; recordings that reached their cap stay until stopped so
    /// their path and analysis remain reachable, but are not listed.
    pub fn list_active(&self) -> Vec<SessionSummary> {
        let (mut active, reaped) = {
            let mut sessions = self.sessions();
            let dead: Vec<String> = sessions
                .iter()
                .filter(|(_, e)| matches!(e, Entry::Live(_)) && e.is_finished())
                .map(|(id, _)| id.clone())
                .collect();
            let reaped: Vec<(String, Entry)> = dead
                .into_iter()
                .filter_map(|id| sessions.remove(&id).map(|e| (id, e)))
                .collect();
            let active: Vec<SessionSummary> = sessions
                .iter()
                .filter(|(_, e)| !e.is_finished())
                .map(|(id, e)| e.summary(id))
                .collect();
            (active, reaped)
        };
        for (id, entry) in reaped {
            log::info!("reaping session {} whose capture loop exited", id);
            self.finish_entry(&id, entry);
        }
        active.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        active
    }

    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }

    /// Stop every session. Signals all of them first so they wind down in
    /// parallel, then joins each.
    pub fn shutdown(&self) {
        let entries: Vec<(String, Entry)> = self.sessions().drain().collect();
        if entries.is_empty() {
            return;
        }
        log::info!("stopping {} session(s)", entries.len());
        for (_, entry) in &entries {
            match entry {
                Entry::Live(live) => live.stop.stop(),
                Entry::Recording(rec) => rec.recorder.request_stop(),
            }
        }
        for (id, entry) in entries {
            self.finish_entry(&id, entry);
        }
    }

    fn finish_entry(&self, id: &str, entry: Entry) -> StopSummary {
        let kind = entry.kind();
        match entry {
            Entry::Live(mut live) => {
                live.stop.stop();
                let (joined, capture) = match live.worker.join_timeout(self.settings.join_timeout) {
                    JoinOutcome::Finished(summary) => (true, Some(summary.stats)),
                    JoinOutcome::Panicked => {
                        log::error!("capture thread for session {} panicked", id);
                        (true, Some(live.counters.snapshot()))
                    }
                    JoinOutcome::TimedOut | JoinOutcome::AlreadyJoined => {
                        (false, Some(live.counters.snapshot()))
                    }
                };
                StopSummary {
                    session_id: id.to_string(),
                    address: live.address,
                    kind,
                    uptime_secs: live.started_at.elapsed().as_secs_f64(),
                    joined,
                    drained_frames: live.buffer.drain(),
                    capture,
                    output_path: None,
                }
            }
            Entry::Recording(mut rec) => {
                let uptime_secs = rec.recorder.uptime().as_secs_f64();
                let path = rec.recorder.stop();
                StopSummary {
                    session_id: id.to_string(),
                    address: rec.recorder.address().to_string(),
                    kind,
                    uptime_secs,
                    joined: rec.recorder.outcome().is_some(),
                    drained_frames: 0,
                    capture: None,
                    output_path: Some(path),
                }
            }
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
