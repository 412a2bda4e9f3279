//! Interfaces the frame pipeline consumes from a GPU backend.
//!
//! The pipeline never creates driver objects itself. A backend hands it
//! queues, command recorders, upload blocks, binding tables and a present
//! target through these traits, and the pipeline only sequences their use.
//!
//! Two backends implement them: [`soft`](crate::soft), an emulated device
//! used by tests and the headless demo, and the Vulkan backend in
//! `gridflow-rhi`.

use glam::Vec4;

use crate::error::FrameResult;
use crate::fence::{FenceValue, QueueRole};
use crate::ring::BlockSource;

/// Records GPU commands between `begin` and `end`.
///
/// This is the command-list-plus-allocator pair of a frame slot. `reset`
/// reclaims the recorder's memory and is only legal once the last
/// submission that used it has retired.
pub trait CommandRecorder {
    /// Reclaims the recorder's memory.
    fn reset(&mut self) -> FrameResult<()>;

    /// Starts recording.
    fn begin(&mut self) -> FrameResult<()>;

    /// Finishes recording; the recorder becomes submittable.
    fn end(&mut self) -> FrameResult<()>;

    /// Clears back buffer `back_buffer` to `color`.
    fn clear(&mut self, back_buffer: usize, color: Vec4);

    /// Full execution and memory barrier between the commands before and after.
    fn barrier(&mut self);
}

/// A hardware queue with its own fence timeline.
///
/// Handles are cheap to clone and refer to the same queue.
pub trait GpuQueue: Clone {
    /// Command recorder type for this queue.
    type Recorder: CommandRecorder;
    /// Source of CPU-writable, GPU-visible upload blocks.
    type Blocks: BlockSource;

    /// Role this queue was created for.
    fn role(&self) -> QueueRole;

    /// Creates a recorder whose commands can be submitted to this queue.
    fn create_recorder(&self) -> FrameResult<Self::Recorder>;

    /// Returns a source of upload blocks on this queue's device.
    fn block_source(&self) -> Self::Blocks;

    /// Submits `recorder` and signals `signal` on this queue's timeline once
    /// it and all prior work have finished.
    fn submit(&self, recorder: &mut Self::Recorder, signal: FenceValue) -> FrameResult<()>;

    /// Signals `signal` once all prior work on this queue has finished.
    fn signal(&self, signal: FenceValue) -> FrameResult<()>;

    /// Makes the next submission on this queue wait on the GPU until
    /// `producer` reaches `value`. Does not block the CPU.
    fn wait_on(&self, producer: &Self, value: FenceValue) -> FrameResult<()>;

    /// Highest fence value the GPU has finished on this queue.
    fn completed_value(&self) -> FrameResult<FenceValue>;

    /// Blocks the calling thread until the timeline reaches `value`.
    ///
    /// There is no timeout: a value that is never signaled is a hang.
    fn wait_value(&self, value: FenceValue) -> FrameResult<()>;
}

/// The swap-chain-like object a frame is presented to.
pub trait PresentTarget {
    /// Index of the back buffer the current frame renders into.
    fn back_buffer_index(&self) -> usize;

    /// Polls the frame-latency wait object with a zero timeout.
    ///
    /// Returns `false` when the swap chain already buffers enough frames and
    /// presenting now would only queue more latency.
    fn latency_ready(&mut self) -> FrameResult<bool>;

    /// Queues the current back buffer for presentation.
    fn present(&mut self) -> FrameResult<()>;
}

/// Capability flags read once at session init.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// A second device is available for simulation work.
    pub dedicated_device: bool,
    /// A queue separate from the render queue is available for simulation work.
    pub dedicated_queue: bool,
    /// Video memory of the dedicated device in bytes.
    pub dedicated_video_memory: u64,
}

/// Which device a queue is requested from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DevicePlacement {
    /// The device that owns the render queue.
    Primary,
    /// The dedicated simulation device.
    Secondary,
}

/// Creates the queue-scoped objects a session needs.
pub trait QueueProvider {
    /// Queue handle type.
    type Queue: GpuQueue;
    /// Handle of a GPU binding table.
    type BindingTable: Copy;

    /// Capability flags of this provider.
    fn capabilities(&self) -> Capabilities;

    /// Returns the queue for `role` on `placement`.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::QueueUnavailable`](crate::FrameError::QueueUnavailable)
    /// when the device has no such queue.
    fn queue(&self, role: QueueRole, placement: DevicePlacement) -> FrameResult<Self::Queue>;

    /// Creates a binding table with `capacity` descriptor slots.
    fn binding_table(&self, capacity: u32) -> FrameResult<Self::BindingTable>;
}
