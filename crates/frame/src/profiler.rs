//! Label-keyed CPU and GPU timings for an overlay.
//!
//! CPU time is the wall time between `profile_begin` and `profile_end`.
//! GPU time is measured from the submission that carries the scope to the
//! frame start at which its fence was first seen retired, so it includes
//! queueing and is only as precise as the frame rate.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{FrameError, FrameResult};
use crate::fence::FenceValue;

/// Weight of the newest sample in the smoothed values.
const SMOOTHING: f64 = 0.1;

/// Smoothed timings of one label.
#[derive(Clone, Debug, PartialEq)]
pub struct ProfileSample {
    /// Scope label.
    pub label: String,
    /// Smoothed CPU time in milliseconds.
    pub cpu_ms: f64,
    /// Smoothed GPU time in milliseconds, once a scope has retired.
    pub gpu_ms: Option<f64>,
    /// Completed scopes.
    pub count: u64,
}

#[derive(Default)]
struct LabelStats {
    cpu_ms: Option<f64>,
    gpu_ms: Option<f64>,
    count: u64,
}

struct PendingGpu {
    label: String,
    fence: FenceValue,
    submitted_at: Option<Instant>,
}

fn smooth(current: Option<f64>, sample: Duration) -> f64 {
    let sample = sample.as_secs_f64() * 1000.0;
    match current {
        Some(value) => value * (1.0 - SMOOTHING) + sample * SMOOTHING,
        None => sample,
    }
}

/// Collects profile scopes.
#[derive(Default)]
pub struct Profiler {
    open: HashMap<String, Instant>,
    pending: Vec<PendingGpu>,
    labels: BTreeMap<String, LabelStats>,
}

impl Profiler {
    /// Creates an empty profiler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a scope. Reopening a label restarts it.
    pub fn profile_begin(&mut self, label: &str) {
        self.open.insert(label.to_string(), Instant::now());
    }

    /// Closes a scope whose GPU work signals `fence`.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::UnknownProfileLabel`] if `label` is not open.
    pub fn profile_end(&mut self, label: &str, fence: FenceValue) -> FrameResult<()> {
        let start = self
            .open
            .remove(label)
            .ok_or_else(|| FrameError::UnknownProfileLabel(label.to_string()))?;

        let stats = self.labels.entry(label.to_string()).or_default();
        stats.cpu_ms = Some(smooth(stats.cpu_ms, start.elapsed()));
        stats.count += 1;

        self.pending.push(PendingGpu {
            label: label.to_string(),
            fence,
            submitted_at: None,
        });
        Ok(())
    }

    /// Records when the submission signaling `fence` was handed to the GPU.
    pub fn mark_submitted(&mut self, fence: FenceValue, at: Instant) {
        for pending in &mut self.pending {
            if pending.fence == fence && pending.submitted_at.is_none() {
                pending.submitted_at = Some(at);
            }
        }
    }

    /// Resolves the GPU time of every scope whose fence is `<= completed`.
    pub fn resolve(&mut self, completed: FenceValue, now: Instant) {
        let labels = &mut self.labels;
        self.pending.retain(|pending| {
            if pending.fence > completed {
                return true;
            }
            if let Some(submitted_at) = pending.submitted_at {
                let gpu = now.saturating_duration_since(submitted_at);
                let stats = labels.entry(pending.label.clone()).or_default();
                stats.gpu_ms = Some(smooth(stats.gpu_ms, gpu));
                trace!("Profile '{}' GPU {:?}", pending.label, gpu);
            }
            false
        });
    }

    /// Scopes whose GPU time is not yet known.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Smoothed timings of every label, sorted by label.
    pub fn report(&self) -> Vec<ProfileSample> {
        self.labels
            .iter()
            .filter_map(|(label, stats)| {
                Some(ProfileSample {
                    label: label.clone(),
                    cpu_ms: stats.cpu_ms?,
                    gpu_ms: stats.gpu_ms,
                    count: stats.count,
                })
            })
            .collect()
    }
}
