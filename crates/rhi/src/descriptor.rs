//! Binding tables for the dynamic descriptor heap.
//!
//! A binding table is one descriptor set holding a single, partially bound
//! array of storage buffer descriptors. The descriptor heap hands out ranges
//! of that array by index; the slots are written after the set is bound,
//! which is why the layout and pool use the update-after-bind flags.
//!
//! The set handle is what the frame pipeline stores. [`BindingTables`]
//! keeps the layout and pool behind every handle alive until the device
//! goes away.

use std::sync::{Arc, Mutex, PoisonError};

use ash::vk;
use tracing::{debug, info};

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Layout, pool and set of one binding table.
pub struct BindingTable {
    device: Arc<Device>,
    layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
    capacity: u32,
}

impl BindingTable {
    /// Creates a table of `capacity` storage buffer slots.
    ///
    /// # Errors
    ///
    /// Returns an error if layout, pool or set creation fails.
    pub fn new(device: Arc<Device>, capacity: u32) -> RhiResult<Self> {
        let binding_flags = [vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND];
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(capacity)
            .stage_flags(vk::ShaderStageFlags::ALL)];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut flags_info);

        let handle = device.handle();
        let layout = unsafe { handle.create_descriptor_set_layout(&layout_info, None)? };

        let pool_sizes = [vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(capacity)];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = match unsafe { handle.create_descriptor_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(err) => {
                unsafe { handle.destroy_descriptor_set_layout(layout, None) };
                return Err(err.into());
            }
        };

        // From here on Drop destroys the pool and the layout.
        let mut table = Self {
            device,
            layout,
            pool,
            set: vk::DescriptorSet::null(),
            capacity,
        };

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { table.device.handle().allocate_descriptor_sets(&alloc_info)? };
        table.set = sets
            .into_iter()
            .next()
            .ok_or(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_POOL_MEMORY))?;

        debug!("Created binding table with {} slot(s)", capacity);
        Ok(table)
    }

    /// Returns the descriptor set handle.
    #[inline]
    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    /// Returns the layout, for pipeline layout creation.
    #[inline]
    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl Drop for BindingTable {
    fn drop(&mut self) {
        unsafe {
            // Destroying the pool frees the set.
            self.device.handle().destroy_descriptor_pool(self.pool, None);
            self.device
                .handle()
                .destroy_descriptor_set_layout(self.layout, None);
        }
        debug!("Destroyed binding table");
    }
}

/// Owner of every binding table created on a device.
pub struct BindingTables {
    device: Arc<Device>,
    max_slots: u32,
    tables: Mutex<Vec<BindingTable>>,
}

impl BindingTables {
    /// Creates an empty registry for tables of at most `max_slots` slots.
    pub fn new(device: Arc<Device>, max_slots: u32) -> Self {
        Self {
            device,
            max_slots,
            tables: Mutex::new(Vec::new()),
        }
    }

    /// Creates a table and returns its set handle.
    ///
    /// # Errors
    ///
    /// Returns `VulkanError(ERROR_OUT_OF_POOL_MEMORY)` if `capacity` exceeds
    /// the device limit, or any error of [`BindingTable::new`].
    pub fn create(&self, capacity: u32) -> RhiResult<vk::DescriptorSet> {
        if capacity > self.max_slots {
            return Err(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        }
        let table = BindingTable::new(Arc::clone(&self.device), capacity)?;
        let set = table.set();
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        tables.push(table);
        info!("Binding table {} created ({} slots)", tables.len(), capacity);
        Ok(set)
    }

    /// Number of live tables.
    pub fn len(&self) -> usize {
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns whether no table was created yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
