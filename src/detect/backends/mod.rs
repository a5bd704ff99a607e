mod motion;
mod passthrough;

pub use motion::MotionProcessor;
pub use passthrough::PassthroughProcessor;
