//! Physical device selection and capability query.
//!
//! A device qualifies when it exposes a graphics queue family and supports
//! timeline semaphores and partially bound, update-after-bind storage
//! buffer arrays (the binding table of the descriptor heap). Among qualifying devices discrete GPUs win, then
//! devices with a dedicated compute family, then the larger device-local
//! heap.
//!
//! # Example
//!
//! ```no_run
//! use gridflow_rhi::instance::Instance;
//! use gridflow_rhi::physical_device::select_physical_device;
//!
//! let instance = Instance::new(false).expect("Failed to create instance");
//! let gpu = select_physical_device(instance.handle()).expect("No suitable GPU found");
//! println!("{:?}, dedicated compute: {}", gpu, gpu.queue_families.has_dedicated_compute());
//! ```

use ash::vk;
use tracing::{debug, info, warn};

use crate::error::{RhiError, RhiResult};

/// Queue families used by the frame pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilies {
    /// Family of the render queue.
    pub graphics: u32,
    /// Compute family without graphics, for simulation work.
    pub compute: Option<u32>,
    /// Transfer-only family, for copies.
    pub transfer: Option<u32>,
}

impl QueueFamilies {
    /// Picks the graphics family and the dedicated compute and transfer
    /// families from the reported family flags.
    ///
    /// Returns `None` when no family supports graphics.
    pub fn from_flags(families: &[vk::QueueFlags]) -> Option<Self> {
        let graphics = families
            .iter()
            .position(|flags| flags.contains(vk::QueueFlags::GRAPHICS))?;

        let compute = families.iter().position(|flags| {
            flags.contains(vk::QueueFlags::COMPUTE) && !flags.contains(vk::QueueFlags::GRAPHICS)
        });
        let transfer = families.iter().position(|flags| {
            flags.contains(vk::QueueFlags::TRANSFER)
                && !flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        });

        Some(Self {
            graphics: graphics as u32,
            compute: compute.map(|index| index as u32),
            transfer: transfer.map(|index| index as u32),
        })
    }

    /// Whether simulation can run on a queue other than the render queue.
    #[inline]
    pub fn has_dedicated_compute(&self) -> bool {
        self.compute.is_some()
    }

    /// Distinct family indices, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        let mut families = vec![self.graphics];
        for family in [self.compute, self.transfer].into_iter().flatten() {
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }
}

/// A physical device that can drive the frame pipeline.
#[derive(Clone)]
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle.
    pub device: vk::PhysicalDevice,
    /// Device properties (name, limits, API version, etc.).
    pub properties: vk::PhysicalDeviceProperties,
    /// Memory heaps and types.
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Queue families the pipeline uses.
    pub queue_families: QueueFamilies,
    /// Largest binding table the device can hold.
    pub max_binding_table_slots: u32,
}

impl PhysicalDeviceInfo {
    /// Returns the device name as a string.
    pub fn device_name(&self) -> &str {
        device_name(&self.properties)
    }

    /// Returns whether the device is a discrete GPU.
    #[inline]
    pub fn is_discrete(&self) -> bool {
        self.properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
    }

    /// Total device-local memory in bytes.
    pub fn device_local_memory(&self) -> u64 {
        self.memory_properties
            .memory_heaps
            .iter()
            .take(self.memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum()
    }

    /// Ordering key; higher is preferred.
    fn rank(&self) -> (bool, bool, u64) {
        (
            self.is_discrete(),
            self.queue_families.has_dedicated_compute(),
            self.device_local_memory(),
        )
    }
}

impl std::fmt::Debug for PhysicalDeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let version = self.properties.api_version;
        f.debug_struct("PhysicalDeviceInfo")
            .field("name", &self.device_name())
            .field("discrete", &self.is_discrete())
            .field(
                "api_version",
                &format!(
                    "{}.{}",
                    vk::api_version_major(version),
                    vk::api_version_minor(version)
                ),
            )
            .field("queue_families", &self.queue_families)
            .finish()
    }
}

/// Selects the most suitable physical device.
///
/// # Errors
///
/// Returns [`RhiError::NoSuitableGpu`] if no device has a graphics queue
/// and the required Vulkan 1.2 features.
pub fn select_physical_device(instance: &ash::Instance) -> RhiResult<PhysicalDeviceInfo> {
    let devices = unsafe { instance.enumerate_physical_devices()? };
    info!("Found {} GPU(s)", devices.len());

    let selected = devices
        .into_iter()
        .filter_map(|device| inspect(instance, device))
        .max_by_key(PhysicalDeviceInfo::rank)
        .ok_or_else(|| {
            warn!("No GPU has a graphics queue and the required Vulkan 1.2 features");
            RhiError::NoSuitableGpu
        })?;

    info!(
        "Selected GPU '{}' (graphics family {}, compute {:?}, transfer {:?}, {} MiB local)",
        selected.device_name(),
        selected.queue_families.graphics,
        selected.queue_families.compute,
        selected.queue_families.transfer,
        selected.device_local_memory() >> 20
    );
    Ok(selected)
}

fn inspect(instance: &ash::Instance, device: vk::PhysicalDevice) -> Option<PhysicalDeviceInfo> {
    let properties = unsafe { instance.get_physical_device_properties(device) };
    let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };

    let name = device_name(&properties);

    if properties.api_version < crate::instance::API_VERSION {
        debug!("GPU '{}' skipped: Vulkan 1.2 not supported", name);
        return None;
    }

    let mut features_1_2 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut features_1_2);
    unsafe { instance.get_physical_device_features2(device, &mut features) };
    if features_1_2.timeline_semaphore == vk::FALSE {
        debug!("GPU '{}' skipped: no timeline semaphores", name);
        return None;
    }
    if features_1_2.descriptor_binding_partially_bound == vk::FALSE
        || features_1_2.descriptor_binding_storage_buffer_update_after_bind == vk::FALSE
    {
        debug!("GPU '{}' skipped: no update-after-bind storage buffers", name);
        return None;
    }

    let mut properties_1_2 = vk::PhysicalDeviceVulkan12Properties::default();
    let mut properties2 = vk::PhysicalDeviceProperties2::default().push_next(&mut properties_1_2);
    unsafe { instance.get_physical_device_properties2(device, &mut properties2) };
    let max_binding_table_slots =
        properties_1_2.max_descriptor_set_update_after_bind_storage_buffers;

    let flags: Vec<vk::QueueFlags> =
        unsafe { instance.get_physical_device_queue_family_properties(device) }
            .iter()
            .map(|family| {
                if family.queue_count == 0 {
                    vk::QueueFlags::empty()
                } else {
                    family.queue_flags
                }
            })
            .collect();

    let Some(queue_families) = QueueFamilies::from_flags(&flags) else {
        debug!("GPU '{}' skipped: no graphics queue family", name);
        return None;
    };

    Some(PhysicalDeviceInfo {
        device,
        properties,
        memory_properties,
        queue_families,
        max_binding_table_slots,
    })
}

fn device_name(properties: &vk::PhysicalDeviceProperties) -> &str {
    properties
        .device_name_as_c_str()
        .ok()
        .and_then(|name| name.to_str().ok())
        .unwrap_or("Unknown Device")
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRAPHICS: vk::QueueFlags = vk::QueueFlags::from_raw(
        vk::QueueFlags::GRAPHICS.as_raw()
            | vk::QueueFlags::COMPUTE.as_raw()
            | vk::QueueFlags::TRANSFER.as_raw(),
    );
    const COMPUTE: vk::QueueFlags =
        vk::QueueFlags::from_raw(vk::QueueFlags::COMPUTE.as_raw() | vk::QueueFlags::TRANSFER.as_raw());

    #[test]
    fn test_discrete_layout() {
        let families = QueueFamilies::from_flags(&[GRAPHICS, COMPUTE, vk::QueueFlags::TRANSFER])
            .unwrap();
        assert_eq!(families.graphics, 0);
        assert_eq!(families.compute, Some(1));
        assert_eq!(families.transfer, Some(2));
        assert!(families.has_dedicated_compute());
        assert_eq!(families.unique(), vec![0, 1, 2]);
    }

    #[test]
    fn test_single_family() {
        let families = QueueFamilies::from_flags(&[GRAPHICS]).unwrap();
        assert_eq!(families.compute, None);
        assert_eq!(families.transfer, None);
        assert!(!families.has_dedicated_compute());
        assert_eq!(families.unique(), vec![0]);
    }

    #[test]
    fn test_no_graphics_family() {
        assert_eq!(QueueFamilies::from_flags(&[COMPUTE]), None);
        assert_eq!(QueueFamilies::from_flags(&[]), None);
    }

    #[test]
    fn test_empty_family_ignored() {
        let families =
            QueueFamilies::from_flags(&[vk::QueueFlags::empty(), GRAPHICS, COMPUTE]).unwrap();
        assert_eq!(families.graphics, 1);
        assert_eq!(families.compute, Some(2));
    }
}
