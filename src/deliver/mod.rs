//! Per-viewer delivery loop.
//!
//! Drains the session's frame buffer, runs the frame processor, encodes the
//! result and pushes it to the viewer at a paced rate. Frames matching the
//! history filter are handed to the persistence worker without waiting.

mod encode;
mod pacing;
mod viewer;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;

use crate::detect::{CategoryFilter, Detections, FrameProcessor, Processed};
use crate::error::StreamError;
use crate::frame::{Frame, FrameBuffer};
use crate::storage::{PersistenceHandle, PersistenceJob};
use crate::worker::StopSignal;

pub use encode::{decode_jpeg, FrameEncoder, DEFAULT_JPEG_QUALITY};
pub use pacing::{Pacer, PacingMode, DEFAULT_TARGET_FPS, MAX_MEASURED_FPS, MIN_MEASURED_FPS};
pub use viewer::{viewer_line, TcpViewerConnection};

/// Wait applied when the buffer is empty.
pub const EMPTY_WAIT: Duration = Duration::from_millis(10);

/// What accompanies each encoded frame to the viewer.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub fps: f64,
    pub source: String,
    pub detections: Detections,
}

/// A real-time channel to one viewer.
pub trait LiveConnection: Send {
    fn send_frame(&mut self, encoded: &[u8], meta: &FrameMetadata) -> Result<()>;

    fn is_connected(&self) -> bool;
}

impl<C: LiveConnection + ?Sized> LiveConnection for Box<C> {
    fn send_frame(&mut self, encoded: &[u8], meta: &FrameMetadata) -> Result<()> {
        (**self).send_frame(encoded, meta)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliverySettings {
    pub target_fps: u32,
    pub jpeg_quality: u8,
    pub pacing: PacingMode,
    pub empty_wait: Duration,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            target_fps: DEFAULT_TARGET_FPS,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            pacing: PacingMode::Fixed,
            empty_wait: EMPTY_WAIT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryEnd {
    Stopped,
    Disconnected,
    SendFailed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    pub frames_sent: u64,
    pub processor_errors: u64,
    pub encode_errors: u64,
    pub persisted: u64,
    pub persist_dropped: u64,
    pub ended: DeliveryEnd,
}

struct History {
    session_id: String,
    filter: CategoryFilter,
    handle: PersistenceHandle,
}

pub struct DeliveryLoop {
    buffer: Arc<FrameBuffer>,
    processor: Box<dyn FrameProcessor>,
    connection: Box<dyn LiveConnection>,
    encoder: FrameEncoder,
    pacer: Pacer,
    empty_wait: Duration,
    stop: StopSignal,
    source: String,
    history: Option<History>,
}

impl DeliveryLoop {
    pub fn new(
        buffer: Arc<FrameBuffer>,
        processor: Box<dyn FrameProcessor>,
        connection: Box<dyn LiveConnection>,
        settings: DeliverySettings,
        stop: StopSignal,
    ) -> Self {
        Self {
            buffer,
            processor,
            connection,
            encoder: FrameEncoder::new(settings.jpeg_quality),
            pacer: Pacer::new(settings.pacing, settings.target_fps),
            empty_wait: settings.empty_wait,
            stop,
            source: String::new(),
            history: None,
        }
    }

    /// Label sent to the viewer as the frame source.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Save frames whose detections match `filter`.
    pub fn with_history(
        mut self,
        session_id: impl Into<String>,
        filter: CategoryFilter,
        handle: PersistenceHandle,
    ) -> Self {
        self.history = Some(History {
            session_id: session_id.into(),
            filter,
            handle,
        });
        self
    }

    pub fn run(mut self) -> DeliveryStats {
        let mut stats = DeliveryStats {
            frames_sent: 0,
            processor_errors: 0,
            encode_errors: 0,
            persisted: 0,
            persist_dropped: 0,
            ended: DeliveryEnd::Stopped,
        };
        if let Err(err) = self.processor.warm_up() {
            log::warn!("processor {} warm-up failed: {:#}", self.processor.name(), err);
        }

        let ended = loop {
            if self.stop.is_stopped() {
                break DeliveryEnd::Stopped;
            }
            if !self.connection.is_connected() {
                break DeliveryEnd::Disconnected;
            }
            let cycle_start = Instant::now();

            let Some(frame) = self.buffer.try_get() else {
                if self.stop.wait_timeout(self.empty_wait) {
                    break DeliveryEnd::Stopped;
                }
                continue;
            };
            self.pacer.observe(frame.captured_at());

            let processed = match self.processor.process(&frame) {
                Ok(processed) => processed,
                Err(err) => {
                    stats.processor_errors += 1;
                    let err = StreamError::Processor(format!("{}: {:#}", self.processor.name(), err));
                    log::warn!("frame {}: {}; sending unannotated", frame.sequence, err);
                    Processed::default()
                }
            };
            let output: &Frame = processed
                .annotated
                .as_ref()
                .filter(|f| f.is_valid())
                .unwrap_or(&frame);

            let jpeg = match self.encoder.encode(output) {
                Ok(jpeg) => jpeg,
                Err(err) => {
                    stats.encode_errors += 1;
                    log::warn!("skipping frame {}: {:#}", frame.sequence, err);
                    continue;
                }
            };

            self.submit_history(&jpeg, &processed.detections, &mut stats);

            let meta = FrameMetadata {
                sequence: frame.sequence,
                fps: self.pacer.fps(),
                source: self.source.clone(),
                detections: processed.detections,
            };
            if !self.connection.is_connected() {
                break DeliveryEnd::Disconnected;
            }
            if let Err(err) = self.connection.send_frame(&jpeg, &meta) {
                log::info!("viewer for {} went away: {:#}", self.source, err);
                break DeliveryEnd::SendFailed;
            }
            stats.frames_sent += 1;

            let period = self.pacer.period();
            let elapsed = cycle_start.elapsed();
            if elapsed < period && self.stop.wait_timeout(period - elapsed) {
                break DeliveryEnd::Stopped;
            }
        };
        stats.ended = ended;

        log::debug!(
            "delivery for {} ended ({:?}) after {} frames",
            self.source,
            stats.ended,
            stats.frames_sent
        );
        stats
    }

    fn submit_history(&self, jpeg: &[u8], detections: &Detections, stats: &mut DeliveryStats) {
        let Some(history) = &self.history else {
            return;
        };
        let categories = history.filter.select(detections);
        if categories.is_empty() {
            return;
        }
        let job = PersistenceJob {
            session_id: history.session_id.clone(),
            categories,
            jpeg: jpeg.to_vec(),
        };
        if history.handle.try_submit(job) {
            stats.persisted += 1;
        } else {
            stats.persist_dropped += 1;
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
