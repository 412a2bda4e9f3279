//! Vulkan backend for the gridflow frame pipeline.
//!
//! This crate implements the `gridflow-frame` backend traits on top of `ash`:
//! - Headless instance and physical device selection
//! - Logical device with one queue per role
//! - Timeline semaphores as queue fences
//! - Command buffers, mapped upload blocks and binding tables
//! - Offscreen back buffers as the present target
//!
//! [`VulkanProvider`] assembles all of it from [`gridflow_core::VulkanSettings`].

mod error;

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod image;
pub mod instance;
pub mod physical_device;
pub mod provider;
pub mod queue;
pub mod sync;

pub use error::{RhiError, RhiResult};
pub use image::OffscreenPresenter;
pub use provider::VulkanProvider;
pub use queue::RoleQueue;

// Re-export ash types that users might need
pub use ash::vk;
