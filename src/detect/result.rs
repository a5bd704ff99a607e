//! Per-frame detection results, keyed by category.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::frame::Frame;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CategoryStats {
    pub count: u32,
    pub confidences: Vec<f32>,
}

/// Detected categories for one frame. Ordered so serialized output is stable.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Detections(BTreeMap<String, CategoryStats>);

impl Detections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one detection of `category` at `confidence`.
    pub fn record(&mut self, category: &str, confidence: f32) {
        let entry = self.0.entry(category.to_string()).or_default();
        entry.count += 1;
        entry.confidences.push(confidence);
    }

    pub fn get(&self, category: &str) -> Option<&CategoryStats> {
        self.0.get(category)
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn total(&self) -> u32 {
        self.0.values().map(|s| s.count).sum()
    }
}

/// Output of one `FrameProcessor::process` call.
#[derive(Debug, Default)]
pub struct Processed {
    /// Replacement pixels, when the processor drew on the frame.
    pub annotated: Option<Frame>,
    pub detections: Detections,
}

impl Processed {
    pub fn unannotated(detections: Detections) -> Self {
        Self {
            annotated: None,
            detections,
        }
    }
}
