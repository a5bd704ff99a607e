use anyhow::{bail, Result};
use sha2::{Digest, Sha256};

use crate::detect::backend::FrameProcessor;
use crate::detect::result::{Detections, Processed};
use crate::frame::{Frame, RGB_CHANNELS};

pub const MOTION_CATEGORY: &str = "motion";
const MOTION_CONFIDENCE: f32 = 0.85;
const BORDER_PX: u32 = 2;
const BORDER_RGB: [u8; 3] = [255, 0, 0];

/// Hash-based motion detector.
///
/// Reports `"motion"` whenever a frame's pixels differ from the previous
/// frame's, and returns a copy of the frame with a red border drawn on it.
#[derive(Default)]
pub struct MotionProcessor {
    last_hash: Option<[u8; 32]>,
}

impl MotionProcessor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameProcessor for MotionProcessor {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn process(&mut self, frame: &Frame) -> Result<Processed> {
        if !frame.is_valid() {
            bail!(
                "frame {} has invalid shape {}x{}x{}",
                frame.sequence,
                frame.width,
                frame.height,
                frame.channels
            );
        }
        let current: [u8; 32] = Sha256::digest(frame.pixels()).into();
        let motion = self.last_hash.is_some_and(|prev| prev != current);
        self.last_hash = Some(current);

        if !motion {
            return Ok(Processed::default());
        }
        let mut detections = Detections::new();
        detections.record(MOTION_CATEGORY, MOTION_CONFIDENCE);
        Ok(Processed {
            annotated: Some(frame.with_pixels(draw_border(frame))),
            detections,
        })
    }
}

fn draw_border(frame: &Frame) -> Vec<u8> {
    let mut pixels = frame.pixels().to_vec();
    let (w, h) = (frame.width, frame.height);
    let border = BORDER_PX.min(w / 2).min(h / 2).max(1);
    let channels = RGB_CHANNELS as usize;
    for y in 0..h {
        for x in 0..w {
            let edge = x < border || y < border || x >= w - border || y >= h - border;
            if edge {
                let at = (y as usize * w as usize + x as usize) * channels;
                pixels[at..at + channels].copy_from_slice(&BORDER_RGB);
            }
        }
    }
    pixels
}
