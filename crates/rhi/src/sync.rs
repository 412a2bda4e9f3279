//! Timeline semaphores.
//!
//! A timeline semaphore carries a monotonically increasing 64-bit counter
//! that queue submissions signal and that both the host and other queues can
//! wait on. It is the Vulkan counterpart of a queue's fence timeline: every
//! [`RoleQueue`](crate::queue::RoleQueue) owns one and signals it with each
//! submission.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gridflow_rhi::device::Device;
//! use gridflow_rhi::sync::TimelineSemaphore;
//!
//! # fn example(device: Arc<Device>) -> Result<(), gridflow_rhi::RhiError> {
//! let timeline = TimelineSemaphore::new(device, 0)?;
//! timeline.signal(1)?;
//! timeline.wait(1, u64::MAX)?;
//! assert_eq!(timeline.value()?, 1);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::RhiResult;

/// Vulkan timeline semaphore wrapper.
pub struct TimelineSemaphore {
    device: Arc<Device>,
    semaphore: vk::Semaphore,
}

impl TimelineSemaphore {
    /// Creates a timeline semaphore whose counter starts at `initial`.
    ///
    /// # Errors
    ///
    /// Returns an error if semaphore creation fails.
    pub fn new(device: Arc<Device>, initial: u64) -> RhiResult<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);

        let semaphore = unsafe { device.handle().create_semaphore(&create_info, None)? };
        debug!("Created timeline semaphore at {}", initial);

        Ok(Self { device, semaphore })
    }

    /// Returns the Vulkan semaphore handle.
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Current counter value. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns an error if the device was lost.
    pub fn value(&self) -> RhiResult<u64> {
        let value = unsafe {
            self.device
                .handle()
                .get_semaphore_counter_value(self.semaphore)?
        };
        Ok(value)
    }

    /// Blocks until the counter reaches `value` or `timeout` nanoseconds pass.
    ///
    /// # Errors
    ///
    /// Returns `VulkanError(TIMEOUT)` if the timeout expires first.
    pub fn wait(&self, value: u64, timeout: u64) -> RhiResult<()> {
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        unsafe { self.device.handle().wait_semaphores(&wait_info, timeout)? };
        Ok(())
    }

    /// Sets the counter from the host.
    ///
    /// `value` must be greater than the current value and than every value
    /// still pending on a queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal fails.
    pub fn signal(&self, value: u64) -> RhiResult<()> {
        let signal_info = vk::SemaphoreSignalInfo::default()
            .semaphore(self.semaphore)
            .value(value);
        unsafe { self.device.handle().signal_semaphore(&signal_info)? };
        Ok(())
    }
}

impl Drop for TimelineSemaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_semaphore(self.semaphore, None);
        }
        debug!("Destroyed timeline semaphore");
    }
}
