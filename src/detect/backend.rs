use anyhow::Result;
use serde::Deserialize;

use crate::detect::backends::{MotionProcessor, PassthroughProcessor};
use crate::detect::result::Processed;
use crate::frame::Frame;

/// Per-frame analysis run by the delivery loop and by recording analysis.
///
/// A processor is owned by exactly one loop, so `process` takes `&mut self`
/// and implementations may keep state between frames. Processors must treat
/// the input frame as read-only; drawing happens on a copy returned in
/// `Processed::annotated`.
pub trait FrameProcessor: Send {
    fn name(&self) -> &'static str;

    fn process(&mut self, frame: &Frame) -> Result<Processed>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<P: FrameProcessor + ?Sized> FrameProcessor for Box<P> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn process(&mut self, frame: &Frame) -> Result<Processed> {
        (**self).process(frame)
    }

    fn warm_up(&mut self) -> Result<()> {
        (**self).warm_up()
    }
}

/// Built-in processors selectable from configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorKind {
    Passthrough,
    #[default]
    Motion,
}

impl ProcessorKind {
    pub fn build(self) -> Box<dyn FrameProcessor> {
        match self {
            ProcessorKind::Passthrough => Box::new(PassthroughProcessor),
            ProcessorKind::Motion => Box::new(MotionProcessor::new()),
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "passthrough" | "none" => Some(ProcessorKind::Passthrough),
            "motion" => Some(ProcessorKind::Motion),
            _ => None,
        }
    }
}
