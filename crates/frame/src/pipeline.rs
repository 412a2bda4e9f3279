//! Frame pipeline and frame-slot recycling.
//!
//! This module provides the [`FramePipeline`] struct, which owns the N frame
//! slots of the render queue and sequences every rendered frame. It handles:
//!
//! - Per-slot command recorders and upload rings
//! - Backpressure on the Nth-previous frame at frame start
//! - Fence values dependents use to tag and reclaim transient resources
//! - Skipping presentation when the swap chain is already far enough ahead
//!
//! # Overview
//!
//! ```text
//!   frame_id:   0    1    2    3    4    5
//!   slot:       0    1    2    0    1    2
//!   fence:      1    2    3    4    5    6
//!                              ^-- frame 3 waits for fence 1 (frame 0)
//! ```
//!
//! Frame K reuses slot `K mod N` only after the fence of frame K−N has
//! retired, so at most N frames are ever submitted and unfinished.
//!
//! # Example
//!
//! ```
//! use glam::Vec4;
//! use gridflow_core::UploadSettings;
//! use gridflow_frame::soft::{Completion, SoftQueue, SoftSwapchain};
//! use gridflow_frame::{FramePipeline, QueueRole};
//!
//! # fn main() -> gridflow_frame::FrameResult<()> {
//! let queue = SoftQueue::new(QueueRole::Render, Completion::OnWait);
//! let swapchain = SoftSwapchain::new(queue.clone(), 3, 2);
//! let mut pipeline = FramePipeline::new(queue, swapchain, 3, &UploadSettings::default())?;
//!
//! for _ in 0..10 {
//!     let frame = pipeline.frame_start(Vec4::new(0.1, 0.1, 0.1, 1.0))?;
//!     assert_eq!(frame.fence_value, frame.frame_id + 1);
//!
//!     // Record commands and write transient data tagged with frame.fence_value...
//!     pipeline.upload_mut()?.write(&[1.0f32, 2.0, 3.0])?;
//!
//!     pipeline.frame_present(false)?;
//! }
//! pipeline.wait_for_all_frames()?;
//! # Ok(())
//! # }
//! ```

use glam::Vec4;
use gridflow_core::UploadSettings;
use tracing::{debug, info, trace};

use crate::backend::{CommandRecorder, GpuQueue, PresentTarget};
use crate::error::{FrameError, FrameResult};
use crate::fence::{FenceTimeline, FenceValue};
use crate::ring::RingAllocator;

/// Per-frame resources.
///
/// Each slot owns a command recorder and an upload ring. Both are reset at
/// the start of the slot's next frame, after the fence recorded here has
/// retired.
pub struct FrameSlot<Q: GpuQueue> {
    /// Recorder for this slot's render commands.
    recorder: Q::Recorder,
    /// Fence value signaled by this slot's last submission (0 if never used).
    fence_value: FenceValue,
    /// Transient upload memory written during this slot's frame.
    upload: RingAllocator<Q::Blocks>,
}

impl<Q: GpuQueue> FrameSlot<Q> {
    fn new(queue: &Q, upload: &UploadSettings) -> FrameResult<Self> {
        Ok(Self {
            recorder: queue.create_recorder()?,
            fence_value: 0,
            upload: RingAllocator::new(queue.block_source(), upload),
        })
    }

    /// Fence value of this slot's last submission.
    #[inline]
    pub fn fence_value(&self) -> FenceValue {
        self.fence_value
    }

    /// Returns this slot's upload ring.
    #[inline]
    pub fn upload(&self) -> &RingAllocator<Q::Blocks> {
        &self.upload
    }
}

/// Where the pipeline is within the current frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    /// Between frames.
    Idle,
    /// Between `frame_start` and `frame_present`.
    Recording,
    /// Commands submitted, presentation not yet decided.
    Submitted,
    /// Presentation queued.
    PresentPending,
}

impl FrameState {
    /// Returns a human-readable name for the state.
    pub fn name(self) -> &'static str {
        match self {
            FrameState::Idle => "Idle",
            FrameState::Recording => "Recording",
            FrameState::Submitted => "Submitted",
            FrameState::PresentPending => "PresentPending",
        }
    }
}

/// Fence values of the frame being recorded.
///
/// Resources written during the frame are owned by it until `fence_value`
/// retires; anything tagged with a value `<= last_completed` is free.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameContext {
    /// Monotonic frame counter.
    pub frame_id: u64,
    /// Slot index, `frame_id mod N`.
    pub frame_index: usize,
    /// Highest render fence value known to be complete.
    pub last_completed: FenceValue,
    /// Fence value this frame's submission will signal.
    pub fence_value: FenceValue,
}

/// Whether `frame_present` queued an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    /// The back buffer was queued for presentation.
    Presented,
    /// The swap chain already buffered enough frames; the frame was submitted
    /// but not presented.
    Skipped,
}

/// Sequences frames on the render queue.
///
/// # Frames in Flight
///
/// The pipeline keeps N slots. [`frame_start`](Self::frame_start) blocks
/// until the slot's previous submission retires, which is the primary
/// backpressure point. [`wait_for_frames`](Self::wait_for_frames) tightens
/// the bound further at the throttle's request.
///
/// # Thread Safety
///
/// The pipeline is driven by a single thread.
pub struct FramePipeline<Q: GpuQueue, P: PresentTarget> {
    /// Render queue timeline. Only the pipeline signals it.
    timeline: FenceTimeline<Q>,
    /// Swap chain frames are presented to.
    present: P,
    /// Per-frame resources.
    slots: Vec<FrameSlot<Q>>,
    /// Frames started and presented so far.
    frame_id: u64,
    /// Current state within the frame.
    state: FrameState,
}

impl<Q: GpuQueue, P: PresentTarget> FramePipeline<Q, P> {
    /// Creates a pipeline with `frame_count` slots on `queue`.
    ///
    /// # Arguments
    ///
    /// * `queue` - The render queue
    /// * `present` - The swap chain frames are presented to
    /// * `frame_count` - Number of frame slots (N)
    /// * `upload` - Settings of each slot's upload ring
    ///
    /// # Errors
    ///
    /// Returns an error if `frame_count` is zero or a recorder cannot be
    /// created.
    pub fn new(
        queue: Q,
        present: P,
        frame_count: usize,
        upload: &UploadSettings,
    ) -> FrameResult<Self> {
        if frame_count == 0 {
            return Err(gridflow_core::Error::Config(
                "frame_count must be at least 1".to_string(),
            )
            .into());
        }

        let mut slots = Vec::with_capacity(frame_count);
        for i in 0..frame_count {
            slots.push(FrameSlot::new(&queue, upload)?);
            debug!("Created frame slot {}", i);
        }

        let timeline = FenceTimeline::new(queue)?;
        info!("Frame pipeline created with {} frame slots", frame_count);

        Ok(Self {
            timeline,
            present,
            slots,
            frame_id: 0,
            state: FrameState::Idle,
        })
    }

    /// Starts a frame.
    ///
    /// Blocks until the slot's previous submission has retired, then resets
    /// the slot's recorder and upload ring and records a clear of the
    /// current back buffer.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidState`] unless the pipeline is idle.
    pub fn frame_start(&mut self, clear_color: Vec4) -> FrameResult<FrameContext> {
        self.expect_state("frame_start", FrameState::Idle)?;

        let index = self.frame_index();
        let reuse_after = self.slots[index].fence_value;
        self.timeline.block_until(reuse_after)?;
        self.timeline.poll()?;

        let back_buffer = self.present.back_buffer_index();
        let slot = &mut self.slots[index];
        slot.recorder.reset()?;
        slot.upload.reset();
        slot.recorder.begin()?;
        slot.recorder.clear(back_buffer, clear_color);

        self.state = FrameState::Recording;
        let context = self.context();
        trace!(
            "Frame {} started in slot {} (completed {}, signals {})",
            context.frame_id, context.frame_index, context.last_completed, context.fence_value
        );
        Ok(context)
    }

    /// Submits the frame and presents it unless the swap chain is behind.
    ///
    /// The frame's fence is signaled and the frame counter advances whether
    /// or not an image is presented. With `full_sync`, every slot is drained
    /// before returning.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidState`] unless a frame is being recorded.
    /// Once the frame is submitted, a failure to present or drain is
    /// returned after the pipeline has already moved on to the next frame.
    pub fn frame_present(&mut self, full_sync: bool) -> FrameResult<PresentOutcome> {
        self.expect_state("frame_present", FrameState::Recording)?;

        let index = self.frame_index();
        let slot = &mut self.slots[index];
        slot.recorder.end()?;
        slot.fence_value = self.timeline.submit(&mut slot.recorder)?;
        self.state = FrameState::Submitted;

        // The submission is in the slot now, so the frame ends even if
        // presenting or draining fails.
        let outcome = self.present_or_skip();
        let drained = if full_sync {
            self.wait_for_all_frames()
        } else {
            Ok(())
        };

        self.frame_id += 1;
        self.state = FrameState::Idle;
        let outcome = outcome?;
        drained?;
        Ok(outcome)
    }

    fn present_or_skip(&mut self) -> FrameResult<PresentOutcome> {
        if self.present.latency_ready()? {
            self.state = FrameState::PresentPending;
            self.present.present()?;
            Ok(PresentOutcome::Presented)
        } else {
            trace!("Frame {} not presented, swap chain is ahead", self.frame_id);
            Ok(PresentOutcome::Skipped)
        }
    }

    /// Blocks until fewer than `max_in_flight` frames are unfinished.
    ///
    /// While the bound is exceeded, waits on the oldest unfinished slot.
    /// A bound of zero is treated as one.
    pub fn wait_for_frames(&mut self, max_in_flight: usize) -> FrameResult<()> {
        let limit = max_in_flight.max(1);
        loop {
            let completed = self.timeline.poll()?;
            let mut unfinished = 0;
            let mut oldest = FenceValue::MAX;
            for slot in &self.slots {
                if slot.fence_value > completed {
                    unfinished += 1;
                    oldest = oldest.min(slot.fence_value);
                }
            }
            if unfinished < limit {
                return Ok(());
            }
            trace!(
                "{} frames in flight, limit {}, waiting for fence {}",
                unfinished, limit, oldest
            );
            self.timeline.block_until(oldest)?;
        }
    }

    /// Blocks until every submitted frame has finished.
    pub fn wait_for_all_frames(&mut self) -> FrameResult<()> {
        self.timeline.drain()
    }

    /// Number of submitted frames that have not finished.
    pub fn unfinished_frames(&mut self) -> FrameResult<usize> {
        let completed = self.timeline.poll()?;
        Ok(self
            .slots
            .iter()
            .filter(|slot| slot.fence_value > completed)
            .count())
    }

    /// Returns the current frame's recorder.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidState`] unless a frame is being recorded.
    pub fn recorder_mut(&mut self) -> FrameResult<&mut Q::Recorder> {
        self.expect_state("recorder_mut", FrameState::Recording)?;
        let index = self.frame_index();
        Ok(&mut self.slots[index].recorder)
    }

    /// Returns the current frame's upload ring.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidState`] unless a frame is being recorded.
    pub fn upload_mut(&mut self) -> FrameResult<&mut RingAllocator<Q::Blocks>> {
        self.expect_state("upload_mut", FrameState::Recording)?;
        let index = self.frame_index();
        Ok(&mut self.slots[index].upload)
    }

    /// Fence values of the current frame.
    pub fn context(&self) -> FrameContext {
        FrameContext {
            frame_id: self.frame_id,
            frame_index: self.frame_index(),
            last_completed: self.timeline.last_known_completed(),
            fence_value: self.timeline.next_value(),
        }
    }

    /// Returns the render queue's timeline.
    #[inline]
    pub fn timeline(&self) -> &FenceTimeline<Q> {
        &self.timeline
    }

    /// Returns the render queue's timeline mutably.
    #[inline]
    pub fn timeline_mut(&mut self) -> &mut FenceTimeline<Q> {
        &mut self.timeline
    }

    /// Returns the render queue.
    #[inline]
    pub fn queue(&self) -> &Q {
        self.timeline.queue()
    }

    /// Returns the swap chain.
    #[inline]
    pub fn present_target(&self) -> &P {
        &self.present
    }

    /// Returns the slot at `index`.
    pub fn slot(&self, index: usize) -> Option<&FrameSlot<Q>> {
        self.slots.get(index)
    }

    /// Frames presented so far; the id of the next or current frame.
    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    /// Slot index of the next or current frame.
    #[inline]
    pub fn frame_index(&self) -> usize {
        (self.frame_id % self.slots.len() as u64) as usize
    }

    /// Number of frame slots (N).
    #[inline]
    pub fn frame_count(&self) -> usize {
        self.slots.len()
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> FrameState {
        self.state
    }

    fn expect_state(&self, operation: &'static str, expected: FrameState) -> FrameResult<()> {
        if self.state != expected {
            return Err(FrameError::InvalidState {
                operation,
                state: self.state.name(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::QueueRole;
    use crate::soft::{Completion, SoftCommand, SoftQueue, SoftRecorder, SoftSwapchain};

    const CLEAR: Vec4 = Vec4::new(0.0, 0.0, 0.0, 1.0);

    fn pipeline(frame_count: usize) -> (SoftQueue, FramePipeline<SoftQueue, SoftSwapchain>) {
        let queue = SoftQueue::new(QueueRole::Render, Completion::OnWait);
        let swapchain = SoftSwapchain::new(queue.clone(), 3, 8);
        let pipeline =
            FramePipeline::new(queue.clone(), swapchain, frame_count, &UploadSettings::default())
                .unwrap();
        (queue, pipeline)
    }

    #[test]
    fn test_zero_frame_count_rejected() {
        let queue = SoftQueue::new(QueueRole::Render, Completion::OnWait);
        let swapchain = SoftSwapchain::new(queue.clone(), 3, 2);
        assert!(FramePipeline::new(queue, swapchain, 0, &UploadSettings::default()).is_err());
    }

    #[test]
    fn test_fence_value_is_frame_id_plus_one() {
        let (_, mut pipeline) = pipeline(3);
        for expected in 0..7 {
            let frame = pipeline.frame_start(CLEAR).unwrap();
            assert_eq!(frame.frame_id, expected);
            assert_eq!(frame.frame_index, (expected % 3) as usize);
            assert_eq!(frame.fence_value, expected + 1);
            pipeline.frame_present(false).unwrap();
        }
    }

    #[test]
    fn test_out_of_order_calls_rejected() {
        let (_, mut pipeline) = pipeline(2);
        assert!(matches!(
            pipeline.frame_present(false),
            Err(FrameError::InvalidState {
                operation: "frame_present",
                state: "Idle"
            })
        ));
        assert!(pipeline.recorder_mut().is_err());

        pipeline.frame_start(CLEAR).unwrap();
        assert!(matches!(
            pipeline.frame_start(CLEAR),
            Err(FrameError::InvalidState {
                operation: "frame_start",
                state: "Recording"
            })
        ));
    }

    #[test]
    fn test_frame_start_waits_for_nth_previous_frame() {
        let (queue, mut pipeline) = pipeline(3);
        for _ in 0..3 {
            pipeline.frame_start(CLEAR).unwrap();
            pipeline.frame_present(false).unwrap();
        }
        assert_eq!(queue.completed_value().unwrap(), 0);

        let frame = pipeline.frame_start(CLEAR).unwrap();
        assert_eq!(queue.completed_value().unwrap(), 1);
        assert_eq!(frame.last_completed, 1);
    }

    #[test]
    fn test_recorder_starts_with_clear() {
        let (_, mut pipeline) = pipeline(2);
        let color = Vec4::new(0.2, 0.4, 0.6, 1.0);
        pipeline.frame_start(color).unwrap();
        let recorder: &mut SoftRecorder = pipeline.recorder_mut().unwrap();
        recorder.barrier();
        assert_eq!(
            recorder.commands(),
            &[
                SoftCommand::Clear {
                    back_buffer: 0,
                    color
                },
                SoftCommand::Barrier
            ]
        );
    }

    #[test]
    fn test_full_sync_drains_all_frames() {
        let (queue, mut pipeline) = pipeline(3);
        pipeline.frame_start(CLEAR).unwrap();
        pipeline.frame_present(false).unwrap();
        pipeline.frame_start(CLEAR).unwrap();
        pipeline.frame_present(true).unwrap();

        assert_eq!(queue.completed_value().unwrap(), 2);
        assert_eq!(pipeline.unfinished_frames().unwrap(), 0);
        assert_eq!(pipeline.state(), FrameState::Idle);
    }

    #[test]
    fn test_wait_for_frames_bounds_in_flight() {
        let (_, mut pipeline) = pipeline(6);
        for _ in 0..6 {
            pipeline.frame_start(CLEAR).unwrap();
            pipeline.frame_present(false).unwrap();
        }
        assert_eq!(pipeline.unfinished_frames().unwrap(), 6);

        pipeline.wait_for_frames(4).unwrap();
        assert_eq!(pipeline.unfinished_frames().unwrap(), 3);

        pipeline.wait_for_frames(0).unwrap();
        assert_eq!(pipeline.unfinished_frames().unwrap(), 0);
    }

    #[test]
    fn test_upload_ring_reset_per_slot() {
        let (_, mut pipeline) = pipeline(2);
        pipeline.frame_start(CLEAR).unwrap();
        let first = pipeline.upload_mut().unwrap().allocate(300).unwrap();
        pipeline.frame_present(false).unwrap();

        pipeline.frame_start(CLEAR).unwrap();
        pipeline.upload_mut().unwrap().allocate(300).unwrap();
        pipeline.frame_present(false).unwrap();

        // Slot 0 again: its ring restarts at offset 0 of the same block.
        pipeline.frame_start(CLEAR).unwrap();
        let again = pipeline.upload_mut().unwrap().allocate(300).unwrap();
        assert_eq!(again.ptr(), first.ptr());
        assert_eq!(pipeline.slot(1).unwrap().upload().used_bytes(), 512);
    }

    /// Swap chain whose first present fails.
    struct LostOnce {
        lost: bool,
    }

    impl PresentTarget for LostOnce {
        fn back_buffer_index(&self) -> usize {
            0
        }

        fn latency_ready(&mut self) -> FrameResult<bool> {
            Ok(true)
        }

        fn present(&mut self) -> FrameResult<()> {
            if self.lost {
                return Ok(());
            }
            self.lost = true;
            Err(FrameError::Backend("present lost".to_string()))
        }
    }

    #[test]
    fn test_failed_present_still_ends_frame() {
        let queue = SoftQueue::new(QueueRole::Render, Completion::OnWait);
        let mut pipeline = FramePipeline::new(
            queue.clone(),
            LostOnce { lost: false },
            2,
            &UploadSettings::default(),
        )
        .unwrap();

        pipeline.frame_start(CLEAR).unwrap();
        assert!(matches!(
            pipeline.frame_present(false),
            Err(FrameError::Backend(msg)) if msg == "present lost"
        ));
        assert_eq!(pipeline.state(), FrameState::Idle);
        assert_eq!(pipeline.frame_id(), 1);
        assert_eq!(queue.submitted_value(), 1);

        let frame = pipeline.frame_start(CLEAR).unwrap();
        assert_eq!(frame.frame_id, 1);
        assert_eq!(frame.fence_value, 2);
        assert_eq!(pipeline.frame_present(true).unwrap(), PresentOutcome::Presented);
        assert_eq!(pipeline.unfinished_frames().unwrap(), 0);
    }

    #[test]
    fn test_skipped_present_still_advances() {
        let queue = SoftQueue::new(QueueRole::Render, Completion::OnWait);
        let swapchain = SoftSwapchain::new(queue.clone(), 2, 1);
        let mut pipeline =
            FramePipeline::new(queue, swapchain, 3, &UploadSettings::default()).unwrap();

        pipeline.frame_start(CLEAR).unwrap();
        assert_eq!(pipeline.frame_present(false).unwrap(), PresentOutcome::Presented);
        pipeline.frame_start(CLEAR).unwrap();
        assert_eq!(pipeline.frame_present(false).unwrap(), PresentOutcome::Skipped);
        assert_eq!(pipeline.frame_id(), 2);
        assert_eq!(pipeline.present_target().skipped(), 1);
    }
}
