//! Error taxonomy for the streaming core.
//!
//! Transport and staleness failures are recovered inside the capture loop and
//! never reach a viewer. Only session creation failures and unknown ids are
//! surfaced to callers of the session manager.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    /// Open or read failure on the upstream transport.
    #[error("transport error on {address}: {reason}")]
    Transport { address: String, reason: String },

    /// No valid frame arrived within the stale window.
    #[error("no valid frame for {0:?}")]
    StaleData(Duration),

    /// The external frame processor failed.
    #[error("frame processor failed: {0}")]
    Processor(String),

    /// The persistence sink rejected a record.
    #[error("persistence failed: {0}")]
    Persistence(String),

    /// A file or handle could not be allocated.
    #[error("resource error on {}: {source}", path.display())]
    Resource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The session could not be started at all.
    #[error("session for {address} could not start: {reason}")]
    SessionStart { address: String, reason: String },

    #[error("unknown session {0}")]
    UnknownSession(String),
}

impl StreamError {
    pub fn transport(address: impl Into<String>, reason: impl ToString) -> Self {
        Self::Transport {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    pub fn resource(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Resource {
            path: path.into(),
            source,
        }
    }
}

/// Outcome of a failed `FrameSource::read_frame`.
///
/// `Timeout` only counts against staleness; `Closed` and `Transport` make the
/// capture loop reconnect right away.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReadError {
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error("stream closed")]
    Closed,
    #[error("transport failure: {0}")]
    Transport(String),
}

impl ReadError {
    /// True when the failure means the transport is gone.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReadError::Closed | ReadError::Transport(_))
    }
}
