//! Adaptive frames-in-flight throttle.

use gridflow_core::ThrottleSettings;
use tracing::trace;

/// Picks how many frames may be in flight from a decaying mean frame time.
///
/// With a 1/60 s target, a 30 Hz frame time yields the lower bound and a
/// 240 Hz frame time yields 4: short frames can afford more queued work
/// before the queue adds a visible frame of latency.
#[derive(Clone, Debug)]
pub struct AdaptiveThrottle {
    target_latency: f64,
    min_frames: usize,
    max_frames: usize,
    decay: f64,
    sum: f64,
    count: f64,
}

impl AdaptiveThrottle {
    /// Creates a throttle with no samples.
    pub fn new(settings: &ThrottleSettings) -> Self {
        Self {
            target_latency: settings.target_latency,
            min_frames: settings.min_frames,
            max_frames: settings.max_frames,
            decay: settings.decay,
            sum: 0.0,
            count: 0.0,
        }
    }

    /// Adds one frame time in seconds. Non-finite or non-positive samples
    /// are ignored.
    pub fn record(&mut self, frame_time: f64) {
        if !frame_time.is_finite() || frame_time <= 0.0 {
            trace!("Throttle ignored frame time {}", frame_time);
            return;
        }
        self.sum = self.sum * self.decay + frame_time;
        self.count = self.count * self.decay + 1.0;
    }

    /// Decaying mean frame time, or `None` before the first sample.
    pub fn mean_frame_time(&self) -> Option<f64> {
        (self.count > 0.0).then(|| self.sum / self.count)
    }

    /// Frames-in-flight bound for [`FramePipeline::wait_for_frames`](crate::FramePipeline::wait_for_frames).
    pub fn desired_frames_in_flight(&self) -> usize {
        match self.mean_frame_time() {
            Some(mean) => {
                let frames = (self.target_latency / mean).round();
                (frames as usize).clamp(self.min_frames, self.max_frames)
            }
            None => self.max_frames,
        }
    }

    /// Drops all samples.
    pub fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0.0;
    }
}
