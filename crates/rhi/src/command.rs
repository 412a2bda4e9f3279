//! Command pools and command buffers as frame-slot recorders.
//!
//! Every [`CommandBuffer`] owns its own [`CommandPool`], so resetting a
//! recorder reclaims all of its memory in one `vkResetCommandPool` call. A
//! recorder remembers the queue and fence value of its last submission and
//! refuses to reset before that value has retired.
//!
//! # Example
//!
//! ```no_run
//! use gridflow_frame::{CommandRecorder, GpuQueue};
//! use gridflow_rhi::queue::RoleQueue;
//!
//! # fn example(queue: RoleQueue) -> gridflow_frame::FrameResult<()> {
//! let mut cmd = queue.create_recorder()?;
//! cmd.begin()?;
//! cmd.barrier();
//! cmd.end()?;
//! queue.submit(&mut cmd, queue.submitted_value() + 1)?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use glam::Vec4;
use gridflow_frame::{CommandRecorder, FenceValue, FrameResult, GpuQueue};
use tracing::{debug, warn};

use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::image::BackBuffers;
use crate::queue::RoleQueue;

/// Vulkan command pool wrapper.
///
/// Command pools are not thread-safe; each recorder owns one.
pub struct CommandPool {
    device: Arc<Device>,
    pool: vk::CommandPool,
    queue_family_index: u32,
}

impl CommandPool {
    /// Creates a transient command pool for `queue_family_index`.
    ///
    /// # Errors
    ///
    /// Returns an error if pool creation fails.
    pub fn new(device: Arc<Device>, queue_family_index: u32) -> RhiResult<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let pool = unsafe { device.handle().create_command_pool(&create_info, None)? };
        debug!(
            "Command pool created for queue family {}",
            queue_family_index
        );

        Ok(Self {
            device,
            pool,
            queue_family_index,
        })
    }

    /// Returns the Vulkan command pool handle.
    #[inline]
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Returns the queue family this pool allocates for.
    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    fn allocate_primary(&self) -> RhiResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { self.device.handle().allocate_command_buffers(&alloc_info)? };
        buffers
            .into_iter()
            .next()
            .ok_or(RhiError::VulkanError(vk::Result::ERROR_UNKNOWN))
    }

    /// Resets every command buffer allocated from this pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the reset fails.
    pub fn reset(&self) -> RhiResult<()> {
        unsafe {
            self.device
                .handle()
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?;
        }
        Ok(())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_command_pool(self.pool, None);
        }
        debug!(
            "Command pool destroyed for queue family {}",
            self.queue_family_index
        );
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecordingState {
    Initial,
    Recording,
    Executable,
    Submitted,
}

impl RecordingState {
    fn name(self) -> &'static str {
        match self {
            RecordingState::Initial => "initial",
            RecordingState::Recording => "recording",
            RecordingState::Executable => "executable",
            RecordingState::Submitted => "submitted",
        }
    }
}

/// A primary command buffer with its own pool.
pub struct CommandBuffer {
    device: Arc<Device>,
    buffer: vk::CommandBuffer,
    back_buffers: Arc<BackBuffers>,
    state: RecordingState,
    last_submit: Option<(RoleQueue, FenceValue)>,
    // Dropped after `buffer`'s last use; destroying the pool frees it.
    pool: CommandPool,
}

impl CommandBuffer {
    /// Allocates a command buffer for `queue_family_index`.
    ///
    /// `back_buffers` are the images [`clear`](CommandRecorder::clear)
    /// addresses by index.
    ///
    /// # Errors
    ///
    /// Returns an error if pool creation or allocation fails.
    pub fn new(
        device: Arc<Device>,
        queue_family_index: u32,
        back_buffers: Arc<BackBuffers>,
    ) -> RhiResult<Self> {
        let pool = CommandPool::new(Arc::clone(&device), queue_family_index)?;
        let buffer = pool.allocate_primary()?;
        Ok(Self {
            device,
            buffer,
            back_buffers,
            state: RecordingState::Initial,
            last_submit: None,
            pool,
        })
    }

    /// Returns the Vulkan command buffer handle.
    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    /// Returns the pool this buffer was allocated from.
    #[inline]
    pub fn pool(&self) -> &CommandPool {
        &self.pool
    }

    /// Checks that the buffer can be submitted.
    pub(crate) fn ensure_executable(&self) -> RhiResult<()> {
        self.expect_state(RecordingState::Executable)
    }

    /// Records that the buffer was submitted to `queue` signaling `value`.
    pub(crate) fn mark_submitted(&mut self, queue: RoleQueue, value: FenceValue) {
        self.state = RecordingState::Submitted;
        self.last_submit = Some((queue, value));
    }

    fn expect_state(&self, expected: RecordingState) -> RhiResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(RhiError::RecorderState {
                state: self.state.name(),
                expected: expected.name(),
            })
        }
    }

    fn recording(&self, command: &str) -> bool {
        if self.state == RecordingState::Recording {
            true
        } else {
            warn!(
                "Dropped {} recorded in state {}",
                command,
                self.state.name()
            );
            false
        }
    }
}

impl CommandRecorder for CommandBuffer {
    fn reset(&mut self) -> FrameResult<()> {
        if let Some((queue, value)) = &self.last_submit
            && queue.completed_value()? < *value
        {
            return Err(RhiError::RecorderState {
                state: "in flight",
                expected: "retired",
            }
            .into());
        }
        self.pool.reset()?;
        self.state = RecordingState::Initial;
        Ok(())
    }

    fn begin(&mut self) -> FrameResult<()> {
        self.expect_state(RecordingState::Initial)?;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .handle()
                .begin_command_buffer(self.buffer, &begin_info)
                .map_err(RhiError::from)?;
        }
        self.state = RecordingState::Recording;
        Ok(())
    }

    fn end(&mut self) -> FrameResult<()> {
        self.expect_state(RecordingState::Recording)?;
        unsafe {
            self.device
                .handle()
                .end_command_buffer(self.buffer)
                .map_err(RhiError::from)?;
        }
        self.state = RecordingState::Executable;
        Ok(())
    }

    fn clear(&mut self, back_buffer: usize, color: Vec4) {
        if !self.recording("clear") {
            return;
        }
        let Some(image) = self.back_buffers.image(back_buffer) else {
            warn!("Clear of unknown back buffer {}", back_buffer);
            return;
        };

        let range = vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .level_count(1)
            .layer_count(1);
        // The previous contents are discarded, so the old layout is irrelevant.
        let to_transfer = vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(range);
        let clear_color = vk::ClearColorValue {
            float32: color.to_array(),
        };

        let device = self.device.handle();
        unsafe {
            device.cmd_pipeline_barrier(
                self.buffer,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );
            device.cmd_clear_color_image(
                self.buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &clear_color,
                &[range],
            );
        }
    }

    fn barrier(&mut self) {
        if !self.recording("barrier") {
            return;
        }
        let memory_barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE);
        unsafe {
            self.device.handle().cmd_pipeline_barrier(
                self.buffer,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[memory_barrier],
                &[],
                &[],
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(RecordingState::Initial.name(), "initial");
        assert_eq!(RecordingState::Executable.name(), "executable");
    }

    #[test]
    fn test_command_buffer_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<CommandBuffer>();
    }
}
