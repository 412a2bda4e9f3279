//! Offscreen back buffers and the present chain built on them.
//!
//! The Vulkan backend is headless: frames render into a ring of device-local
//! color images instead of swapchain images. [`OffscreenPresenter`] walks
//! that ring and applies the same frame-latency limit a swap chain's
//! waitable object would, using the render queue's timeline in place of
//! presentation feedback.

use std::collections::VecDeque;
use std::sync::{Arc, PoisonError};

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gridflow_frame::{FenceValue, FrameResult, GpuQueue, PresentTarget};
use tracing::{debug, error, info, trace};

use crate::device::Device;
use crate::error::RhiResult;
use crate::queue::RoleQueue;

/// Color format of the back buffers.
pub const BACK_BUFFER_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// A ring of device-local color images.
pub struct BackBuffers {
    device: Arc<Device>,
    images: Vec<(vk::Image, Option<Allocation>)>,
    extent: vk::Extent2D,
}

impl BackBuffers {
    /// Creates `count` color images of `width` x `height`.
    ///
    /// # Errors
    ///
    /// Returns an error if image creation or memory allocation fails.
    pub fn new(device: Arc<Device>, width: u32, height: u32, count: usize) -> RhiResult<Self> {
        let extent = vk::Extent2D { width, height };
        let mut back_buffers = Self {
            device,
            images: Vec::with_capacity(count),
            extent,
        };
        for index in 0..count {
            back_buffers.push_image(index)?;
        }

        info!(
            "Created {} offscreen back buffer(s) of {}x{}",
            count, width, height
        );
        Ok(back_buffers)
    }

    fn push_image(&mut self, index: usize) -> RhiResult<()> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(BACK_BUFFER_FORMAT)
            .extent(vk::Extent3D {
                width: self.extent.width,
                height: self.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let device = self.device.handle();
        let image = unsafe { device.create_image(&image_info, None)? };
        // Owned from here on, so Drop cleans up after a failed allocation.
        self.images.push((image, None));

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let allocation = self
            .device
            .allocator()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allocate(&AllocationCreateDesc {
                name: "back buffer",
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })?;

        unsafe { device.bind_image_memory(image, allocation.memory(), allocation.offset())? };
        if let Some(entry) = self.images.last_mut() {
            entry.1 = Some(allocation);
        }

        debug!("Created back buffer {}", index);
        Ok(())
    }

    /// Image handle of back buffer `index`.
    pub fn image(&self, index: usize) -> Option<vk::Image> {
        self.images.get(index).map(|(image, _)| *image)
    }

    /// Number of back buffers.
    #[inline]
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// Returns whether the ring has no images.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Size of every back buffer.
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for BackBuffers {
    fn drop(&mut self) {
        let mut allocator = self
            .device
            .allocator()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for (image, allocation) in self.images.drain(..) {
            if let Some(allocation) = allocation
                && let Err(e) = allocator.free(allocation)
            {
                error!("Failed to free back buffer memory: {:?}", e);
            }
            unsafe { self.device.handle().destroy_image(image, None) };
        }
        debug!("Destroyed back buffers");
    }
}

/// [`PresentTarget`] over a [`BackBuffers`] ring.
pub struct OffscreenPresenter {
    back_buffers: Arc<BackBuffers>,
    queue: RoleQueue,
    latency: u64,
    current: usize,
    queued: VecDeque<FenceValue>,
    presented: u64,
}

impl OffscreenPresenter {
    /// Creates a presenter over `back_buffers` for work submitted to `queue`.
    ///
    /// At most `latency` presented frames may still be executing before
    /// [`latency_ready`](PresentTarget::latency_ready) reports `false`.
    pub fn new(back_buffers: Arc<BackBuffers>, queue: RoleQueue, latency: u64) -> Self {
        Self {
            back_buffers,
            queue,
            latency: latency.max(1),
            current: 0,
            queued: VecDeque::new(),
            presented: 0,
        }
    }

    /// Frames presented so far.
    #[inline]
    pub fn presented(&self) -> u64 {
        self.presented
    }

    /// The back buffer ring.
    #[inline]
    pub fn back_buffers(&self) -> &Arc<BackBuffers> {
        &self.back_buffers
    }
}

impl PresentTarget for OffscreenPresenter {
    fn back_buffer_index(&self) -> usize {
        self.current
    }

    fn latency_ready(&mut self) -> FrameResult<bool> {
        let completed = self.queue.completed_value()?;
        while self.queued.front().is_some_and(|&value| value <= completed) {
            self.queued.pop_front();
        }
        Ok((self.queued.len() as u64) < self.latency)
    }

    fn present(&mut self) -> FrameResult<()> {
        self.queued.push_back(self.queue.submitted_value());
        self.current = (self.current + 1) % self.back_buffers.len().max(1);
        self.presented += 1;
        trace!("Presented offscreen frame {}", self.presented);
        Ok(())
    }
}
