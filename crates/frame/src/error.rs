//! Error types for the frame pipeline.

use thiserror::Error;

use crate::fence::{FenceValue, QueueRole};

/// Error type for frame pipeline and queue orchestration operations.
#[derive(Error, Debug)]
pub enum FrameError {
    /// A wait was requested for a fence value no submission will ever signal.
    #[error(
        "{role:?} queue: waited for fence value {requested}, but only {last_submitted} was submitted"
    )]
    FenceNotSubmitted {
        /// Queue whose timeline was waited on.
        role: QueueRole,
        /// Requested fence value.
        requested: FenceValue,
        /// Highest value submitted so far.
        last_submitted: FenceValue,
    },

    /// A single upload request exceeds the block capacity.
    #[error("Upload of {requested} bytes exceeds block capacity {capacity}")]
    AllocationTooLarge {
        /// Requested size in bytes, aligned unless alignment overflows.
        requested: u64,
        /// Capacity of one backing block.
        capacity: u64,
    },

    /// A descriptor reservation would overwrite slots the GPU may still read.
    #[error(
        "Descriptor heap exhausted: {requested} slots would overlap a reservation live until fence {wait_for}"
    )]
    DescriptorHeapExhausted {
        /// Requested slot count.
        requested: u32,
        /// Fence value after which the conflicting region is free.
        wait_for: FenceValue,
    },

    /// A descriptor reservation is larger than the whole heap.
    #[error("Descriptor reservation of {requested} slots exceeds heap capacity {capacity}")]
    DescriptorCountTooLarge {
        /// Requested slot count.
        requested: u32,
        /// Heap capacity.
        capacity: u32,
    },

    /// An operation was called out of order.
    #[error("{operation} is not valid in state {state}")]
    InvalidState {
        /// Operation that was attempted.
        operation: &'static str,
        /// State the component was in.
        state: &'static str,
    },

    /// A context was popped that is not on top of the context stack.
    #[error("Context mismatch: expected {expected:?}, found {found:?}")]
    ContextMismatch {
        /// Context the caller tried to pop.
        expected: QueueRole,
        /// Context actually on top (None if the stack was empty).
        found: Option<QueueRole>,
    },

    /// A queue required by the orchestration mode is not available.
    #[error("No {0:?} queue available")]
    QueueUnavailable(QueueRole),

    /// `profile_end` was called for a label without a matching `profile_begin`.
    #[error("Profile label '{0}' was never opened")]
    UnknownProfileLabel(String),

    /// Error reported by the GPU backend.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Configuration error.
    #[error(transparent)]
    Core(#[from] gridflow_core::Error),
}

/// Result type alias for frame pipeline operations.
pub type FrameResult<T> = std::result::Result<T, FrameError>;
