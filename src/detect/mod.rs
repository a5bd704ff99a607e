//! Frame processing: the processor seam, built-in processors, and the
//! history category filter.

mod backend;
mod backends;
mod filter;
mod result;

pub use backend::{FrameProcessor, ProcessorKind};
pub use backends::{MotionProcessor, PassthroughProcessor};
pub use filter::{CategoryFilter, WILDCARD};
pub use result::{CategoryStats, Detections, Processed};
