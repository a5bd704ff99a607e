//! streamwatch
//!
//! Live video stream ingestion, viewing, recording and frame analysis.
//!
//! # Architecture
//!
//! A capture loop per session keeps a bounded frame buffer filled from a
//! stream source, reconnecting when the source fails or goes stale. Viewers
//! drain the buffer through a frame processor, encode to JPEG and receive one
//! JSON line per frame. Recordings write frames into a `.svr` container until
//! a duration cap or an explicit stop, and can be analyzed afterwards.
//!
//! # Module Structure
//!
//! - `frame`: frames and the bounded drop-oldest buffer
//! - `ingest`: stream addresses and frame sources
//! - `capture`: the reconnecting capture loop
//! - `detect`: frame processors, detections and category filters
//! - `deliver`: JPEG encoding, pacing and the viewer delivery loop
//! - `record`: the recording container and the recorder task
//! - `analysis`: offline analysis of finished recordings
//! - `storage`: detection history persistence
//! - `session`, `control`, `api`: session bookkeeping and operator surfaces

use anyhow::Result;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod analysis;
pub mod api;
pub mod capture;
pub mod config;
pub mod control;
pub mod deliver;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod record;
pub mod session;
pub mod storage;
pub mod worker;

pub use analysis::{analyze_recording, AnalysisReport, AnalyzedFrame};
pub use api::{ServerConfig, ServerHandle, ViewerServer};
pub use capture::{CaptureLoop, CaptureSettings, CaptureState, CaptureStats};
pub use config::StreamdConfig;
pub use control::{Control, ControlDefaults};
pub use detect::{CategoryFilter, Detections, FrameProcessor, Processed, ProcessorKind};
pub use error::{ReadError, StreamError};
pub use frame::{Frame, FrameBuffer, DEFAULT_BUFFER_FRAMES};
pub use ingest::{FrameSource, SourceFactory, SourceSettings, StreamInfo, StreamSourceFactory};
pub use record::{probe_recording, Recorder, RecorderSettings, RecordingInfo};
pub use session::{SessionManager, SessionSettings};
pub use storage::{
    MemorySink, PersistenceHandle, PersistenceSink, PersistenceWorker, SqliteHistorySink,
};

/// Name of a private shared in-memory SQLite database.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:streamwatch_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

pub(crate) fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

/// `bytes` random bytes, hex encoded.
pub fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

pub fn new_session_id() -> String {
    random_hex(8)
}
