//! Vulkan backend error types.

use gridflow_frame::FrameError;
use thiserror::Error;

/// Vulkan backend error type.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    VulkanError(#[from] ash::vk::Result),

    /// Failed to load Vulkan library
    #[error("Failed to load Vulkan: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// No GPU supports timeline semaphores and a graphics queue
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// The device was created without a queue of this family
    #[error("No queue created for family {0}")]
    MissingQueue(u32),

    /// An upload block was allocated without a host mapping
    #[error("Allocation '{0}' is not host visible")]
    NotHostVisible(&'static str),

    /// A recorder was used in the wrong recording state
    #[error("Command buffer is {state}, expected {expected}")]
    RecorderState {
        /// State the command buffer was in.
        state: &'static str,
        /// State the operation needed.
        expected: &'static str,
    },
}

/// Result type alias for Vulkan backend operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;

impl From<RhiError> for FrameError {
    fn from(err: RhiError) -> Self {
        FrameError::Backend(err.to_string())
    }
}
