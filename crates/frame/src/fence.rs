//! Per-queue fence timelines.
//!
//! A [`FenceTimeline`] wraps one [`GpuQueue`] and owns its counter. Every
//! submission is tagged with the next value; the CPU learns which work has
//! finished by comparing against the completed value.
//!
//! ```text
//!   submitted:  1   2   3   4   5
//!   completed:  1   2   3
//!                           ^-- in flight: 4, 5
//! ```

use tracing::trace;

use crate::backend::GpuQueue;
use crate::error::{FrameError, FrameResult};

/// A point on a queue's timeline. Strictly increasing per queue; 0 means
/// "nothing submitted" and is always complete.
pub type FenceValue = u64;

/// The job a hardware queue does in the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueRole {
    /// Frame rendering and presentation.
    Render,
    /// Grid simulation (compute).
    Grid,
    /// Transfers between devices.
    Copy,
}

impl QueueRole {
    /// Returns a human-readable name for the role.
    pub fn name(self) -> &'static str {
        match self {
            QueueRole::Render => "render",
            QueueRole::Grid => "grid",
            QueueRole::Copy => "copy",
        }
    }
}

/// Monotonic fence counter of one queue.
///
/// Only the owner of the timeline submits to the queue, so the next value
/// is always `last_submitted() + 1`.
pub struct FenceTimeline<Q: GpuQueue> {
    queue: Q,
    last_submitted: FenceValue,
    last_completed: FenceValue,
}

impl<Q: GpuQueue> FenceTimeline<Q> {
    /// Wraps `queue`, continuing from whatever the queue already completed.
    ///
    /// The queue must be idle; timelines are only created at session init and
    /// after a full drain.
    pub fn new(queue: Q) -> FrameResult<Self> {
        let completed = queue.completed_value()?;
        Ok(Self {
            queue,
            last_submitted: completed,
            last_completed: completed,
        })
    }

    /// Returns the wrapped queue.
    #[inline]
    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Role of the wrapped queue.
    #[inline]
    pub fn role(&self) -> QueueRole {
        self.queue.role()
    }

    /// Highest value handed to the queue.
    #[inline]
    pub fn last_submitted(&self) -> FenceValue {
        self.last_submitted
    }

    /// Value the next submission will signal.
    #[inline]
    pub fn next_value(&self) -> FenceValue {
        self.last_submitted + 1
    }

    /// Completed value as of the last poll or wait. Never queries the GPU.
    #[inline]
    pub fn last_known_completed(&self) -> FenceValue {
        self.last_completed
    }

    /// Issues the next value, marked complete once prior work finishes.
    pub fn signal(&mut self) -> FrameResult<FenceValue> {
        let value = self.next_value();
        self.queue.signal(value)?;
        self.last_submitted = value;
        Ok(value)
    }

    /// Submits `recorder` tagged with the next value and returns it.
    pub fn submit(&mut self, recorder: &mut Q::Recorder) -> FrameResult<FenceValue> {
        let value = self.next_value();
        self.queue.submit(recorder, value)?;
        self.last_submitted = value;
        trace!("{} queue submitted fence {}", self.role().name(), value);
        Ok(value)
    }

    /// Queries the GPU's highest finished value.
    pub fn completed(&self) -> FrameResult<FenceValue> {
        self.queue.completed_value()
    }

    /// Queries the completed value and caches it.
    pub fn poll(&mut self) -> FrameResult<FenceValue> {
        let completed = self.queue.completed_value()?;
        self.last_completed = self.last_completed.max(completed);
        Ok(self.last_completed)
    }

    /// Returns true once `value` has completed.
    pub fn is_complete(&mut self, value: FenceValue) -> FrameResult<bool> {
        if value <= self.last_completed {
            return Ok(true);
        }
        Ok(self.poll()? >= value)
    }

    /// Number of submissions not yet finished.
    pub fn in_flight(&mut self) -> FrameResult<u64> {
        let completed = self.poll()?;
        Ok(self.last_submitted.saturating_sub(completed))
    }

    /// Blocks until the timeline reaches `value`.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::FenceNotSubmitted`] if `value` was never
    /// submitted; waiting for it would never return.
    pub fn block_until(&mut self, value: FenceValue) -> FrameResult<()> {
        if value > self.last_submitted {
            return Err(FrameError::FenceNotSubmitted {
                role: self.role(),
                requested: value,
                last_submitted: self.last_submitted,
            });
        }
        if self.is_complete(value)? {
            return Ok(());
        }

        trace!("Blocking on {} fence {}", self.role().name(), value);
        self.queue.wait_value(value)?;
        self.last_completed = self.last_completed.max(value);
        Ok(())
    }

    /// Blocks until every submitted value has completed.
    pub fn drain(&mut self) -> FrameResult<()> {
        self.block_until(self.last_submitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::{Completion, SoftQueue};

    fn timeline(completion: Completion) -> FenceTimeline<SoftQueue> {
        FenceTimeline::new(SoftQueue::new(QueueRole::Render, completion)).unwrap()
    }

    #[test]
    fn test_values_strictly_increase() {
        let mut fence = timeline(Completion::Manual);
        let a = fence.signal().unwrap();
        let b = fence.signal().unwrap();
        let c = fence.signal().unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(fence.next_value(), 4);
    }

    #[test]
    fn test_zero_is_always_complete() {
        let mut fence = timeline(Completion::Manual);
        assert!(fence.is_complete(0).unwrap());
        fence.block_until(0).unwrap();
    }

    #[test]
    fn test_block_until_unsubmitted_value_fails() {
        let mut fence = timeline(Completion::OnWait);
        fence.signal().unwrap();
        let err = fence.block_until(5).unwrap_err();
        assert!(matches!(
            err,
            FrameError::FenceNotSubmitted {
                role: QueueRole::Render,
                requested: 5,
                last_submitted: 1,
            }
        ));
    }

    #[test]
    fn test_block_until_completes() {
        let mut fence = timeline(Completion::OnWait);
        for _ in 0..3 {
            fence.signal().unwrap();
        }
        assert_eq!(fence.in_flight().unwrap(), 3);
        fence.block_until(2).unwrap();
        assert!(fence.completed().unwrap() >= 2);
        assert_eq!(fence.in_flight().unwrap(), 1);
        fence.drain().unwrap();
        assert_eq!(fence.in_flight().unwrap(), 0);
    }

    #[test]
    fn test_poll_tracks_manual_retirement() {
        let queue = SoftQueue::new(QueueRole::Grid, Completion::Manual);
        let mut fence = FenceTimeline::new(queue.clone()).unwrap();
        fence.signal().unwrap();
        fence.signal().unwrap();
        assert_eq!(fence.poll().unwrap(), 0);
        queue.retire_through(1).unwrap();
        assert_eq!(fence.poll().unwrap(), 1);
        assert_eq!(fence.last_known_completed(), 1);
    }

    #[test]
    fn test_new_continues_from_completed() {
        let queue = SoftQueue::new(QueueRole::Copy, Completion::OnWait);
        let mut first = FenceTimeline::new(queue.clone()).unwrap();
        first.signal().unwrap();
        first.signal().unwrap();
        first.drain().unwrap();
        drop(first);

        let mut second = FenceTimeline::new(queue).unwrap();
        assert_eq!(second.last_submitted(), 2);
        assert_eq!(second.signal().unwrap(), 3);
    }
}
