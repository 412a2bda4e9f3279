//! Core utilities for gridflow.
//!
//! This crate provides foundational types and utilities used across the workspace:
//! - Error types and result aliases
//! - Logging initialization
//! - Frame clock
//! - Configuration loading and validation

mod config;
mod error;
mod logging;
mod timer;

pub use config::{
    BackendKind, Config, DescriptorSettings, FrameSettings, OrchestrationMode, OversizePolicy,
    QueueSettings, SoftGpuSettings, ThrottleSettings, UploadSettings, VulkanSettings,
};
pub use error::{Error, Result};
pub use logging::{DEFAULT_FILTER, init_logging};
pub use timer::Timer;
