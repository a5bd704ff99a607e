//! Offline analysis of a finished recording.
//!
//! Reads a `.svr` file back, runs a frame processor on every
//! `frame_interval`-th frame and reports what was found. Frames whose
//! detections pass the category filter can be saved to history.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;

use crate::deliver::{decode_jpeg, FrameEncoder};
use crate::detect::{CategoryFilter, Detections, FrameProcessor};
use crate::error::StreamError;
use crate::record::RecordingReader;
use crate::storage::{PersistenceHandle, PersistenceJob};

pub const DEFAULT_FRAME_INTERVAL: u64 = 30;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AnalyzedFrame {
    pub index: u64,
    pub time_secs: f64,
    pub detections: Detections,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub path: PathBuf,
    pub total_frames: u64,
    pub fps: f32,
    pub duration_secs: f64,
    pub frame_interval: u64,
    /// Sampled frames that had at least one detection.
    pub frames: Vec<AnalyzedFrame>,
    pub frames_analyzed: u64,
    pub frames_saved: u64,
    pub processor_errors: u64,
}

/// Where interesting frames go, and under which session id.
pub struct HistoryTarget<'a> {
    pub session_id: &'a str,
    pub handle: &'a PersistenceHandle,
    pub encoder: FrameEncoder,
}

pub fn analyze_recording(
    path: &Path,
    processor: &mut dyn FrameProcessor,
    filter: &CategoryFilter,
    frame_interval: u64,
    history: Option<HistoryTarget<'_>>,
) -> Result<AnalysisReport> {
    let interval = frame_interval.max(1);
    let mut reader = RecordingReader::open(path)?;
    let header = reader.header();
    let mut report = AnalysisReport {
        path: path.to_path_buf(),
        total_frames: 0,
        fps: header.map_or(0.0, |h| h.fps),
        duration_secs: 0.0,
        frame_interval: interval,
        frames: Vec::new(),
        frames_analyzed: 0,
        frames_saved: 0,
        processor_errors: 0,
    };

    while let Some(recorded) = reader.next_frame()? {
        report.total_frames += 1;
        report.duration_secs = recorded.pts.as_secs_f64()
            + header.map_or(0.0, |h| h.frame_period().as_secs_f64());
        if recorded.index % interval != 0 {
            continue;
        }

        report.frames_analyzed += 1;
        let frame = match decode_jpeg(&recorded.jpeg, recorded.index) {
            Ok(frame) => frame,
            Err(err) => {
                report.processor_errors += 1;
                log::warn!(
                    "skipping undecodable frame {} of {}: {:#}",
                    recorded.index,
                    path.display(),
                    err
                );
                continue;
            }
        };
        let processed = match processor.process(&frame) {
            Ok(processed) => processed,
            Err(err) => {
                report.processor_errors += 1;
                let err = StreamError::Processor(format!("{:#}", err));
                log::warn!("analysis of frame {}: {}", recorded.index, err);
                continue;
            }
        };
        if processed.detections.is_empty() {
            continue;
        }

        if let Some(target) = &history {
            let categories = filter.select(&processed.detections);
            if !categories.is_empty() {
                let output = processed.annotated.as_ref().unwrap_or(&frame);
                let jpeg = target.encoder.encode(output)?;
                let job = PersistenceJob {
                    session_id: target.session_id.to_string(),
                    categories,
                    jpeg,
                };
                // Offline analysis waits for queue room instead of dropping.
                if target.handle.submit(job) {
                    report.frames_saved += 1;
                }
            }
        }

        report.frames.push(AnalyzedFrame {
            index: recorded.index,
            time_secs: recorded.pts.as_secs_f64(),
            detections: processed.detections,
        });
    }

    log::info!(
        "analyzed {}: {} of {} frames, {} with detections",
        path.display(),
        report.frames_analyzed,
        report.total_frames,
        report.frames.len()
    );
    Ok(report)
}
