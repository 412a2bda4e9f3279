//! Host-mapped upload blocks backing the transient upload ring.
//!
//! Each [`UploadBlock`] is a persistently mapped `CpuToGpu` buffer. The
//! ring bump-allocates inside it through the mapped pointer and the GPU reads
//! the same memory through the buffer handle, so there is no staging copy.

use std::ptr::NonNull;
use std::sync::{Arc, PoisonError};

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gridflow_frame::{BackingBlock, BlockSource, FrameResult};
use tracing::{debug, error};

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Buffer usages an upload block can serve.
const UPLOAD_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::TRANSFER_SRC.as_raw()
        | vk::BufferUsageFlags::UNIFORM_BUFFER.as_raw()
        | vk::BufferUsageFlags::STORAGE_BUFFER.as_raw(),
);

/// A persistently mapped, GPU-readable buffer.
pub struct UploadBlock {
    device: Arc<Device>,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    capacity: u64,
    mapped: NonNull<u8>,
}

// Safety: the mapping stays valid for the block's lifetime and is only
// written through the ring that owns the block.
unsafe impl Send for UploadBlock {}

impl UploadBlock {
    /// Creates a mapped buffer of `capacity` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if buffer or memory allocation fails, or
    /// [`RhiError::NotHostVisible`] if the allocator returned memory without
    /// a host mapping.
    pub fn new(device: Arc<Device>, capacity: u64) -> RhiResult<Self> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(capacity)
            .usage(UPLOAD_USAGE)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.handle().create_buffer(&buffer_info, None)? };
        let requirements = unsafe { device.handle().get_buffer_memory_requirements(buffer) };

        let allocation = device
            .allocator()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allocate(&AllocationCreateDesc {
                name: "upload block",
                requirements,
                location: MemoryLocation::CpuToGpu,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            });

        // From here on `block` owns the buffer and frees it on any error.
        let mut block = Self {
            device,
            buffer,
            allocation: None,
            capacity,
            mapped: NonNull::dangling(),
        };
        let allocation = block.allocation.insert(allocation?);

        unsafe {
            block.device.handle().bind_buffer_memory(
                buffer,
                allocation.memory(),
                allocation.offset(),
            )?;
        }
        block.mapped = allocation
            .mapped_ptr()
            .ok_or(RhiError::NotHostVisible("upload block"))?
            .cast();

        debug!("Created upload block: {} bytes", capacity);
        Ok(block)
    }

    /// Returns the Vulkan buffer handle.
    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }
}

impl BackingBlock for UploadBlock {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn mapped_ptr(&self) -> NonNull<u8> {
        self.mapped
    }
}

impl Drop for UploadBlock {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            let mut allocator = self
                .device
                .allocator()
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = allocator.free(allocation) {
                error!("Failed to free upload block: {:?}", e);
            }
        }

        unsafe {
            self.device.handle().destroy_buffer(self.buffer, None);
        }
        debug!("Destroyed upload block");
    }
}

/// Creates [`UploadBlock`]s on one device.
#[derive(Clone)]
pub struct UploadBlockSource {
    device: Arc<Device>,
}

impl UploadBlockSource {
    /// Creates a block source for `device`.
    pub fn new(device: Arc<Device>) -> Self {
        Self { device }
    }
}

impl BlockSource for UploadBlockSource {
    type Block = UploadBlock;

    fn create_block(&mut self, capacity: u64) -> FrameResult<UploadBlock> {
        Ok(UploadBlock::new(Arc::clone(&self.device), capacity)?)
    }
}
