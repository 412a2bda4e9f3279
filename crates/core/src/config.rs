//! Session configuration.
//!
//! Configuration is read from a RON file. Every section falls back to its
//! defaults, so an empty file `()` is a valid configuration.
//!
//! # Example
//!
//! ```
//! use gridflow_core::{Config, OrchestrationMode};
//!
//! let config = Config::from_ron_str(
//!     "(frames: (frame_count: 2), queues: (mode: InterQueue))",
//! ).unwrap();
//! assert_eq!(config.frames.frame_count, 2);
//! assert_eq!(config.queues.mode, OrchestrationMode::InterQueue);
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Which GPU backend drives the session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    /// Emulated GPU queues in host memory.
    #[default]
    Soft,
    /// Vulkan through `ash`.
    Vulkan,
}

/// How simulation work is spread across hardware queues.
///
/// The configured value is a request; the session downgrades it when the
/// device lacks the capability.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrchestrationMode {
    /// Simulation and rendering share the render queue.
    #[default]
    Unified,
    /// Simulation runs on a dedicated compute queue of the render device.
    InterQueue,
    /// Simulation runs on a second device; results cross via the copy queue.
    MultiGpu,
}

impl OrchestrationMode {
    /// Returns a human-readable name for the mode.
    pub fn name(self) -> &'static str {
        match self {
            OrchestrationMode::Unified => "unified",
            OrchestrationMode::InterQueue => "inter-queue",
            OrchestrationMode::MultiGpu => "multi-gpu",
        }
    }
}

/// What the upload ring does with a request larger than one block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OversizePolicy {
    /// Append a block large enough for the request.
    #[default]
    Grow,
    /// Fail with `AllocationTooLarge`.
    Reject,
}

/// Frame pipeline settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameSettings {
    /// Number of frame slots (N). Bounds frames in flight at frame start.
    pub frame_count: usize,
    /// Frames the demo harness renders before exiting.
    pub frames: u64,
    /// Scene switch period in frames (0 disables switching).
    pub transition_every: u64,
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            frame_count: 3,
            frames: 600,
            transition_every: 240,
        }
    }
}

/// Upload ring settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    /// Capacity of one backing block in bytes.
    pub block_size: u64,
    /// Alignment of every allocation in bytes. Must be a power of two.
    pub alignment: u64,
    /// Handling of requests larger than `block_size`.
    pub oversize: OversizePolicy,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024,
            alignment: 256,
            oversize: OversizePolicy::Grow,
        }
    }
}

/// Dynamic descriptor heap settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorSettings {
    /// Total slots in the binding table.
    pub capacity: u32,
    /// Expected worst-case slots reserved by one frame.
    ///
    /// Only used to size the heap: `validate` requires `capacity` to hold
    /// this many slots for every frame slot. A frame that reserves more is
    /// not refused here; it may have to wait for older frames instead.
    pub max_per_frame: u32,
}

impl Default for DescriptorSettings {
    fn default() -> Self {
        Self {
            capacity: 4096,
            max_per_frame: 256,
        }
    }
}

/// Adaptive frames-in-flight throttle settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleSettings {
    /// Disables `wait_for_frames` throttling when false.
    pub enabled: bool,
    /// Latency the throttle aims for, in seconds.
    pub target_latency: f64,
    /// Lower bound of the frames-in-flight target.
    pub min_frames: usize,
    /// Upper bound of the frames-in-flight target.
    pub max_frames: usize,
    /// Per-frame decay of the frame-time window.
    pub decay: f64,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            target_latency: 1.0 / 60.0,
            min_frames: 2,
            max_frames: 6,
            decay: 0.99,
        }
    }
}

/// Queue orchestration settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Requested orchestration mode.
    pub mode: OrchestrationMode,
    /// Auxiliary submissions allowed in flight before a simulation step is skipped.
    pub max_aux_in_flight: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            mode: OrchestrationMode::InterQueue,
            max_aux_in_flight: 2,
        }
    }
}

/// Parameters of the emulated GPU.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftGpuSettings {
    /// Simulated cost of one render submission in microseconds.
    pub frame_cost_us: u64,
    /// Simulated cost of one grid submission in microseconds.
    pub grid_cost_us: u64,
    /// Report a second device for multi-GPU mode.
    pub dedicated_device: bool,
    /// Report a dedicated compute queue.
    pub dedicated_queue: bool,
    /// Frames the soft swap chain buffers before presentation is skipped.
    pub swap_chain_latency: u64,
}

impl Default for SoftGpuSettings {
    fn default() -> Self {
        Self {
            frame_cost_us: 4_000,
            grid_cost_us: 6_000,
            dedicated_device: false,
            dedicated_queue: true,
            swap_chain_latency: 2,
        }
    }
}

/// Parameters of the Vulkan backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VulkanSettings {
    /// Enable the Khronos validation layer if it is installed.
    pub validation: bool,
    /// Back buffer width in pixels.
    pub width: u32,
    /// Back buffer height in pixels.
    pub height: u32,
    /// Offscreen back buffers in the present chain.
    pub back_buffer_count: usize,
    /// Frames the present chain buffers before presentation is skipped.
    pub swap_chain_latency: u64,
}

impl Default for VulkanSettings {
    fn default() -> Self {
        Self {
            validation: cfg!(debug_assertions),
            width: 1280,
            height: 720,
            back_buffer_count: 3,
            swap_chain_latency: 2,
        }
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// GPU backend.
    pub backend: BackendKind,
    /// Frame pipeline settings.
    pub frames: FrameSettings,
    /// Upload ring settings.
    pub upload: UploadSettings,
    /// Descriptor heap settings.
    pub descriptors: DescriptorSettings,
    /// Throttle settings.
    pub throttle: ThrottleSettings,
    /// Queue orchestration settings.
    pub queues: QueueSettings,
    /// Emulated GPU settings.
    pub soft_gpu: SoftGpuSettings,
    /// Vulkan backend settings.
    pub vulkan: VulkanSettings,
    /// Tracing filter used when `RUST_LOG` is unset.
    pub log_filter: Option<String>,
}

impl Config {
    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, does not parse, or
    /// fails [`validate`](Self::validate).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config: Config = ron::from_str(&contents).map_err(|source| Error::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Loads `path` if given, otherwise returns the validated defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                debug!("No config file given, using defaults");
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Parses and validates a configuration from a RON string.
    pub fn from_ron_str(source: &str) -> Result<Self> {
        let config: Config = ron::from_str(source).map_err(|source| Error::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the cross-field invariants the frame pipeline relies on.
    ///
    /// The descriptor heap must hold the worst case of every frame slot
    /// reserving `max_per_frame` slots at once, otherwise a wrap could reach
    /// a region the GPU still reads.
    pub fn validate(&self) -> Result<()> {
        if self.frames.frame_count == 0 {
            return Err(Error::Config("frame_count must be at least 1".to_string()));
        }

        let upload = &self.upload;
        if !upload.alignment.is_power_of_two() {
            return Err(Error::Config(format!(
                "upload alignment {} is not a power of two",
                upload.alignment
            )));
        }
        if upload.block_size < upload.alignment {
            return Err(Error::Config(format!(
                "upload block size {} is smaller than alignment {}",
                upload.block_size, upload.alignment
            )));
        }

        let descriptors = &self.descriptors;
        let worst_case = u64::from(descriptors.max_per_frame) * self.frames.frame_count as u64;
        if u64::from(descriptors.capacity) < worst_case {
            return Err(Error::Config(format!(
                "descriptor capacity {} is below max_per_frame {} x frame_count {}",
                descriptors.capacity, descriptors.max_per_frame, self.frames.frame_count
            )));
        }

        let throttle = &self.throttle;
        if throttle.min_frames == 0 || throttle.min_frames > throttle.max_frames {
            return Err(Error::Config(format!(
                "throttle bounds [{}, {}] are invalid",
                throttle.min_frames, throttle.max_frames
            )));
        }
        if !(throttle.target_latency > 0.0) {
            return Err(Error::Config(
                "throttle target_latency must be positive".to_string(),
            ));
        }
        if !(throttle.decay > 0.0 && throttle.decay < 1.0) {
            return Err(Error::Config(format!(
                "throttle decay {} must be in (0, 1)",
                throttle.decay
            )));
        }

        if self.queues.max_aux_in_flight == 0 {
            return Err(Error::Config(
                "max_aux_in_flight must be at least 1".to_string(),
            ));
        }

        let vulkan = &self.vulkan;
        if vulkan.back_buffer_count == 0 || vulkan.width == 0 || vulkan.height == 0 {
            return Err(Error::Config(format!(
                "vulkan back buffers {}x{} x{} are invalid",
                vulkan.width, vulkan.height, vulkan.back_buffer_count
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.upload.alignment, 256);
        assert_eq!(config.throttle.min_frames, 2);
        assert_eq!(config.throttle.max_frames, 6);
    }

    #[test]
    fn test_empty_ron_uses_defaults() {
        let config = Config::from_ron_str("()").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_ron_str(
            "(backend: Vulkan, upload: (block_size: 4096, oversize: Reject))",
        )
        .unwrap();
        assert_eq!(config.backend, BackendKind::Vulkan);
        assert_eq!(config.upload.block_size, 4096);
        assert_eq!(config.upload.alignment, 256);
        assert_eq!(config.upload.oversize, OversizePolicy::Reject);
    }

    #[test]
    fn test_undersized_descriptor_heap_rejected() {
        let result = Config::from_ron_str(
            "(frames: (frame_count: 4), descriptors: (capacity: 512, max_per_frame: 256))",
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_bad_alignment_rejected() {
        let result = Config::from_ron_str("(upload: (alignment: 300))");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_inverted_throttle_bounds_rejected() {
        let result = Config::from_ron_str("(throttle: (min_frames: 5, max_frames: 3))");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_vulkan_section() {
        let config =
            Config::from_ron_str("(backend: Vulkan, vulkan: (width: 64, height: 32))").unwrap();
        assert_eq!(config.backend, BackendKind::Vulkan);
        assert_eq!(config.vulkan.width, 64);
        assert_eq!(config.vulkan.back_buffer_count, 3);

        assert!(Config::from_ron_str("(vulkan: (back_buffer_count: 0))").is_err());
    }

    #[test]
    fn test_parse_error_reported() {
        let result = Config::from_ron_str("(frames: (frame_count: \"three\"))");
        assert!(matches!(result, Err(Error::Parse { .. })));
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load("/nonexistent/gridflow.ron");
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
