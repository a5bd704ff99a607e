//! Control operations exposed to operators: start and stop recordings, list
//! what is running. Results are serde types so any front end (HTTP, CLI) can
//! return them as JSON.

use std::sync::Arc;
use std::time::Duration;

use crate::analysis::DEFAULT_FRAME_INTERVAL;
use crate::error::StreamError;
use crate::session::{RecordingStarted, RecordingStopped, SessionManager, SessionSummary};

/// Values used when a request leaves them out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlDefaults {
    pub source_url: String,
    pub max_duration: Duration,
    pub frame_interval: u64,
}

impl Default for ControlDefaults {
    fn default() -> Self {
        Self {
            source_url: "stub://default_stream".to_string(),
            max_duration: Duration::from_secs(3600),
            frame_interval: DEFAULT_FRAME_INTERVAL,
        }
    }
}

#[derive(Clone)]
pub struct Control {
    manager: Arc<SessionManager>,
    defaults: ControlDefaults,
}

impl Control {
    pub fn new(manager: Arc<SessionManager>, defaults: ControlDefaults) -> Self {
        Self { manager, defaults }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn defaults(&self) -> &ControlDefaults {
        &self.defaults
    }

    pub fn start_recording(
        &self,
        address: Option<&str>,
        max_duration: Option<Duration>,
    ) -> Result<RecordingStarted, StreamError> {
        let address = address
            .filter(|a| !a.trim().is_empty())
            .unwrap_or(&self.defaults.source_url);
        let max_duration = max_duration
            .filter(|d| !d.is_zero())
            .unwrap_or(self.defaults.max_duration);
        self.manager.start_recording(address, max_duration)
    }

    pub fn stop_recording(
        &self,
        session_id: &str,
        analyze: bool,
        frame_interval: Option<u64>,
    ) -> Result<RecordingStopped, StreamError> {
        let interval = frame_interval
            .filter(|n| *n > 0)
            .unwrap_or(self.defaults.frame_interval);
        self.manager.stop_recording(session_id, analyze, interval)
    }

    pub fn list_active_sessions(&self) -> Vec<SessionSummary> {
        self.manager.list_active()
    }
}
