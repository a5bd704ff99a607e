use anyhow::Result;

use crate::detect::backend::FrameProcessor;
use crate::detect::result::{Detections, Processed};
use crate::frame::Frame;

/// Detects nothing and leaves frames untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughProcessor;

impl FrameProcessor for PassthroughProcessor {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn process(&mut self, _frame: &Frame) -> Result<Processed> {
        Ok(Processed::unannotated(Detections::new()))
    }
}
