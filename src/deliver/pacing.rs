//! Output pacing for the delivery loop.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

pub const DEFAULT_TARGET_FPS: u32 = 30;
pub const MIN_MEASURED_FPS: f64 = 1.0;
pub const MAX_MEASURED_FPS: f64 = 120.0;
const EWMA_ALPHA: f64 = 0.2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacingMode {
    /// Emit at the configured target rate.
    #[default]
    Fixed,
    /// Emit at the rate frames actually arrive, smoothed and clamped.
    Measured,
}

#[derive(Clone, Debug)]
pub struct Pacer {
    mode: PacingMode,
    target_fps: f64,
    avg_delta: Option<f64>,
    last_capture: Option<Instant>,
}

impl Pacer {
    pub fn new(mode: PacingMode, target_fps: u32) -> Self {
        Self {
            mode,
            target_fps: f64::from(target_fps.max(1)),
            avg_delta: None,
            last_capture: None,
        }
    }

    /// Feed the capture instant of the frame about to be delivered.
    pub fn observe(&mut self, captured_at: Instant) {
        if let Some(prev) = self.last_capture {
            if captured_at > prev {
                let delta = (captured_at - prev).as_secs_f64();
                self.avg_delta = Some(match self.avg_delta {
                    Some(avg) => avg + EWMA_ALPHA * (delta - avg),
                    None => delta,
                });
            }
        }
        self.last_capture = Some(captured_at);
    }

    /// Frames per second currently targeted.
    pub fn fps(&self) -> f64 {
        match (self.mode, self.avg_delta) {
            (PacingMode::Measured, Some(avg)) if avg > 0.0 => {
                (1.0 / avg).clamp(MIN_MEASURED_FPS, MAX_MEASURED_FPS)
            }
            _ => self.target_fps,
        }
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_mode_ignores_arrivals() {
        let mut pacer = Pacer::new(PacingMode::Fixed, 30);
        let t0 = Instant::now();
        pacer.observe(t0);
        pacer.observe(t0 + Duration::from_millis(500));
        assert_eq!(pacer.fps(), 30.0);
        assert_eq!(pacer.period(), Duration::from_secs_f64(1.0 / 30.0));
    }

    #[test]
    fn measured_mode_tracks_arrival_rate() {
        let mut pacer = Pacer::new(PacingMode::Measured, 30);
        assert_eq!(pacer.fps(), 30.0, "falls back to target before samples");
        let t0 = Instant::now();
        for i in 0..20 {
            pacer.observe(t0 + Duration::from_millis(100 * i));
        }
        assert!((pacer.fps() - 10.0).abs() < 0.01);
    }

    #[test]
    fn measured_mode_is_clamped() {
        let mut pacer = Pacer::new(PacingMode::Measured, 30);
        let t0 = Instant::now();
        pacer.observe(t0);
        pacer.observe(t0 + Duration::from_micros(100));
        assert_eq!(pacer.fps(), MAX_MEASURED_FPS);

        let mut slow = Pacer::new(PacingMode::Measured, 30);
        slow.observe(t0);
        slow.observe(t0 + Duration::from_secs(10));
        assert_eq!(slow.fps(), MIN_MEASURED_FPS);
    }

    #[test]
    fn zero_target_is_treated_as_one() {
        assert_eq!(Pacer::new(PacingMode::Fixed, 0).fps(), 1.0);
    }
}
