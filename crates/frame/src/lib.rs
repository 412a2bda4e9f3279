//! GPU command submission and transient resource lifetimes.
//!
//! This crate lets a single CPU thread reuse transient GPU-visible resources
//! (command recorders, upload memory, descriptor slots) while several frames
//! are in flight across up to three hardware queues:
//!
//! - [`FenceTimeline`]: per-queue fence counter
//! - [`RingAllocator`]: transient upload memory
//! - [`DynamicDescriptorHeap`]: ring reservation of binding-table slots
//! - [`FramePipeline`]: N frame slots and frame-start backpressure
//! - [`AdaptiveThrottle`]: frames-in-flight target from frame time
//! - [`MultiQueueOrchestrator`]: render/grid/copy queue composition
//!
//! [`Session`] owns all of them. Backends plug in through the traits in
//! [`backend`]; [`soft`] is an emulated device.

pub mod backend;
pub mod descriptor;
pub mod error;
pub mod fence;
pub mod orchestrator;
pub mod pipeline;
pub mod profiler;
pub mod proxy;
pub mod ring;
pub mod session;
pub mod soft;
pub mod throttle;

pub use backend::{
    Capabilities, CommandRecorder, DevicePlacement, GpuQueue, PresentTarget, QueueProvider,
};
pub use descriptor::{DescriptorReservation, DynamicDescriptorHeap};
pub use error::{FrameError, FrameResult};
pub use fence::{FenceTimeline, FenceValue, QueueRole};
pub use orchestrator::{AuxContext, MultiQueueOrchestrator, OrchestratorStats, reconfigure};
pub use pipeline::{FrameContext, FramePipeline, FrameSlot, FrameState, PresentOutcome};
pub use profiler::{ProfileSample, Profiler};
pub use proxy::{Proxy, Requirement};
pub use ring::{BackingBlock, BlockSource, RingAllocation, RingAllocator, align_up};
pub use session::Session;
pub use throttle::AdaptiveThrottle;
