//! Vulkan logical device, its queues and the memory allocator.
//!
//! One queue is created per distinct family the pipeline uses: the graphics
//! family always, the dedicated compute and transfer families when present.
//! Beyond the core set only timeline semaphores and the two descriptor
//! indexing features the binding table needs are enabled.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gridflow_rhi::device::Device;
//! use gridflow_rhi::instance::Instance;
//! use gridflow_rhi::physical_device::select_physical_device;
//!
//! let instance = Arc::new(Instance::new(false).expect("Failed to create instance"));
//! let gpu = select_physical_device(instance.handle()).expect("No suitable GPU found");
//! let device = Device::new(&instance, &gpu).expect("Failed to create logical device");
//! assert!(device.queue(gpu.queue_families.graphics).is_some());
//! ```

use std::mem::ManuallyDrop;
use std::sync::{Arc, Mutex, PoisonError};

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use tracing::{debug, error, info};

use crate::error::RhiResult;
use crate::instance::Instance;
use crate::physical_device::{PhysicalDeviceInfo, QueueFamilies};

/// Vulkan logical device wrapper.
///
/// Shared between queues, recorders and upload blocks through `Arc`. Queue
/// submission is serialized internally, since `vkQueueSubmit` requires
/// external synchronization of the queue.
pub struct Device {
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    allocator: ManuallyDrop<Mutex<Allocator>>,
    queues: Vec<(u32, vk::Queue)>,
    queue_families: QueueFamilies,
    submit_lock: Mutex<()>,
    // Outlives `device`: fields drop after `Drop::drop` has destroyed it.
    instance: Arc<Instance>,
}

impl Device {
    /// Creates the logical device and the allocator.
    ///
    /// # Arguments
    ///
    /// * `instance` - The Vulkan instance
    /// * `gpu` - The selected physical device
    ///
    /// # Errors
    ///
    /// Returns an error if device creation or allocator initialization fails.
    pub fn new(instance: &Arc<Instance>, gpu: &PhysicalDeviceInfo) -> RhiResult<Arc<Self>> {
        let families = gpu.queue_families.unique();
        let priorities = [1.0f32];

        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
            })
            .collect();

        let mut features_1_2 = vk::PhysicalDeviceVulkan12Features::default()
            .timeline_semaphore(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_storage_buffer_update_after_bind(true);
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .push_next(&mut features_1_2);

        let device = unsafe {
            instance
                .handle()
                .create_device(gpu.device, &create_info, None)?
        };

        let queues: Vec<(u32, vk::Queue)> = families
            .iter()
            .map(|&family| (family, unsafe { device.get_device_queue(family, 0) }))
            .collect();
        debug!("Retrieved queues for families {:?}", families);

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.handle().clone(),
            device: device.clone(),
            physical_device: gpu.device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        });
        let allocator = match allocator {
            Ok(allocator) => allocator,
            Err(err) => {
                unsafe { device.destroy_device(None) };
                return Err(err.into());
            }
        };

        info!(
            "Logical device created with {} queue(s)",
            queues.len()
        );

        Ok(Arc::new(Self {
            device,
            physical_device: gpu.device,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            queues,
            queue_families: gpu.queue_families,
            submit_lock: Mutex::new(()),
            instance: Arc::clone(instance),
        }))
    }

    /// Returns the Vulkan logical device handle.
    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    /// Returns the instance the device was created from.
    #[inline]
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    /// Returns the physical device handle.
    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Returns the queue families the device was created with.
    #[inline]
    pub fn queue_families(&self) -> &QueueFamilies {
        &self.queue_families
    }

    /// Returns the queue created for `family`, if any.
    pub fn queue(&self, family: u32) -> Option<vk::Queue> {
        self.queues
            .iter()
            .find(|(index, _)| *index == family)
            .map(|(_, queue)| *queue)
    }

    /// Returns the GPU memory allocator.
    #[inline]
    pub fn allocator(&self) -> &Mutex<Allocator> {
        &self.allocator
    }

    /// Submits batches to `queue`.
    ///
    /// # Safety
    ///
    /// Every handle referenced by `submits` must be valid, and command
    /// buffers must be executable.
    pub unsafe fn submit(&self, queue: vk::Queue, submits: &[vk::SubmitInfo]) -> RhiResult<()> {
        let _guard = self
            .submit_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        unsafe {
            self.device
                .queue_submit(queue, submits, vk::Fence::null())?;
        }
        Ok(())
    }

    /// Waits for the device to become idle.
    ///
    /// # Errors
    ///
    /// Returns an error if the wait fails.
    pub fn wait_idle(&self) -> RhiResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                error!("Failed to wait for device idle during drop: {:?}", e);
            }
            // The allocator frees its memory blocks through the device.
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
        info!("Logical device destroyed");
    }
}

// Safety: handles are plain values, the allocator and queue submission are
// behind mutexes.
unsafe impl Send for Device {}
unsafe impl Sync for Device {}
