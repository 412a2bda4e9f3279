//! The Vulkan [`QueueProvider`].
//!
//! [`VulkanProvider`] brings up the whole backend from configuration:
//! instance, device, one [`RoleQueue`] per available role, the offscreen back
//! buffers and the binding table registry. Every device object holds the
//! device, and the device holds the instance, so queues handed to a session
//! stay valid even if the provider is dropped first.
//!
//! Only one device is ever opened, so multi-GPU orchestration is reported
//! unavailable and requests for it downgrade.

use std::sync::Arc;

use ash::vk;
use gridflow_core::VulkanSettings;
use gridflow_frame::{
    Capabilities, DevicePlacement, FrameError, FrameResult, QueueProvider, QueueRole,
};
use tracing::info;

use crate::descriptor::BindingTables;
use crate::device::Device;
use crate::error::RhiResult;
use crate::image::{BackBuffers, OffscreenPresenter};
use crate::instance::Instance;
use crate::physical_device::{PhysicalDeviceInfo, select_physical_device};
use crate::queue::RoleQueue;

/// Vulkan backend for a session.
///
/// # Example
///
/// ```no_run
/// use gridflow_core::Config;
/// use gridflow_frame::Session;
/// use gridflow_rhi::VulkanProvider;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::default();
/// let provider = VulkanProvider::new(&config.vulkan)?;
/// let session = Session::new(&provider, provider.presenter(), &config)?;
/// assert!(!session.capabilities().dedicated_device);
/// # Ok(())
/// # }
/// ```
pub struct VulkanProvider {
    render: RoleQueue,
    grid: Option<RoleQueue>,
    copy: Option<RoleQueue>,
    tables: BindingTables,
    back_buffers: Arc<BackBuffers>,
    swap_chain_latency: u64,
    gpu: PhysicalDeviceInfo,
    device: Arc<Device>,
}

impl VulkanProvider {
    /// Creates the backend described by `settings`.
    ///
    /// # Errors
    ///
    /// Returns an error if Vulkan cannot be loaded, no suitable GPU exists,
    /// or any device object fails to be created.
    pub fn new(settings: &VulkanSettings) -> RhiResult<Self> {
        let instance = Arc::new(Instance::new(settings.validation)?);
        let gpu = select_physical_device(instance.handle())?;
        let device = Device::new(&instance, &gpu)?;

        let back_buffers = Arc::new(BackBuffers::new(
            Arc::clone(&device),
            settings.width,
            settings.height,
            settings.back_buffer_count,
        )?);

        let families = gpu.queue_families;
        let queue = |role, family| {
            RoleQueue::new(Arc::clone(&device), role, family, Arc::clone(&back_buffers))
        };
        let render = queue(QueueRole::Render, families.graphics)?;
        let grid = families
            .compute
            .map(|family| queue(QueueRole::Grid, family))
            .transpose()?;
        let copy = families
            .transfer
            .map(|family| queue(QueueRole::Copy, family))
            .transpose()?;

        let tables = BindingTables::new(Arc::clone(&device), gpu.max_binding_table_slots);

        info!(
            "Vulkan backend ready: '{}', dedicated compute queue: {}",
            gpu.device_name(),
            grid.is_some()
        );

        Ok(Self {
            render,
            grid,
            copy,
            tables,
            back_buffers,
            swap_chain_latency: settings.swap_chain_latency,
            gpu,
            device,
        })
    }

    /// Creates a present target over the back buffers for the render queue.
    pub fn presenter(&self) -> OffscreenPresenter {
        OffscreenPresenter::new(
            Arc::clone(&self.back_buffers),
            self.render.clone(),
            self.swap_chain_latency,
        )
    }

    /// The selected physical device.
    #[inline]
    pub fn gpu(&self) -> &PhysicalDeviceInfo {
        &self.gpu
    }

    /// The logical device.
    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Binding tables created so far.
    #[inline]
    pub fn binding_tables(&self) -> &BindingTables {
        &self.tables
    }
}

impl QueueProvider for VulkanProvider {
    type Queue = RoleQueue;
    type BindingTable = vk::DescriptorSet;

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            dedicated_device: false,
            dedicated_queue: self.grid.is_some(),
            dedicated_video_memory: 0,
        }
    }

    fn queue(&self, role: QueueRole, placement: DevicePlacement) -> FrameResult<RoleQueue> {
        if placement == DevicePlacement::Secondary {
            return Err(FrameError::QueueUnavailable(role));
        }
        let queue = match role {
            QueueRole::Render => Some(&self.render),
            QueueRole::Grid => self.grid.as_ref(),
            QueueRole::Copy => self.copy.as_ref(),
        };
        queue.cloned().ok_or(FrameError::QueueUnavailable(role))
    }

    fn binding_table(&self, capacity: u32) -> FrameResult<vk::DescriptorSet> {
        Ok(self.tables.create(capacity)?)
    }
}
