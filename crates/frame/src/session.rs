//! The session object owning every frame-scoped component.
//!
//! A [`Session`] is created once at init and passed explicitly to the frame
//! loop. It wires the throttle into frame start, feeds the profiler with the
//! frame's fence values, and turns descriptor-heap exhaustion into a wait
//! on the render timeline.
//!
//! # Example
//!
//! ```
//! use glam::Vec4;
//! use gridflow_core::Config;
//! use gridflow_frame::Session;
//! use gridflow_frame::soft::{Completion, SoftDevice};
//!
//! # fn main() -> gridflow_frame::FrameResult<()> {
//! let config = Config::default();
//! let device = SoftDevice::new(&config.soft_gpu, Completion::OnWait);
//! let swapchain = device.swapchain(3);
//! let mut session = Session::new(&device, swapchain, &config)?;
//!
//! for _ in 0..4 {
//!     session.begin_frame(Vec4::ZERO)?;
//!     if session.update_begin(1.0 / 60.0)? {
//!         session.upload(&[0.5f32; 16])?;
//!     }
//!     session.update_end()?;
//!     session.draw_begin()?;
//!     let table = session.reserve_descriptors(8)?;
//!     assert_eq!(table.count, 8);
//!     session.draw_end()?;
//!     session.end_frame(false)?;
//! }
//! session.shutdown()?;
//! # Ok(())
//! # }
//! ```

use std::time::Instant;

use bytemuck::Pod;
use glam::Vec4;
use gridflow_core::{Config, OrchestrationMode, Timer};
use tracing::{info, warn};

use crate::backend::{Capabilities, DevicePlacement, GpuQueue, PresentTarget, QueueProvider};
use crate::descriptor::{DescriptorReservation, DynamicDescriptorHeap};
use crate::error::{FrameError, FrameResult};
use crate::fence::QueueRole;
use crate::orchestrator::MultiQueueOrchestrator;
use crate::pipeline::{FrameContext, FramePipeline, FrameState, PresentOutcome};
use crate::profiler::Profiler;
use crate::proxy::Proxy;
use crate::ring::RingAllocation;
use crate::throttle::AdaptiveThrottle;

/// Frame-scoped state of one rendering session.
pub struct Session<D: QueueProvider, P: PresentTarget> {
    pipeline: FramePipeline<D::Queue, P>,
    orchestrator: MultiQueueOrchestrator<D::Queue>,
    throttle: AdaptiveThrottle,
    throttle_enabled: bool,
    profiler: Profiler,
    descriptors: DynamicDescriptorHeap<D::BindingTable>,
    timer: Timer,
    capabilities: Capabilities,
}

impl<D: QueueProvider, P: PresentTarget> Session<D, P> {
    /// Builds every component from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the provider
    /// cannot create a required queue or binding table.
    pub fn new(provider: &D, present: P, config: &Config) -> FrameResult<Self> {
        config.validate()?;

        let capabilities = provider.capabilities();
        info!(
            "Session capabilities: dedicated device {}, dedicated queue {}, {} MiB video memory",
            capabilities.dedicated_device,
            capabilities.dedicated_queue,
            capabilities.dedicated_video_memory >> 20
        );

        let render = provider.queue(QueueRole::Render, DevicePlacement::Primary)?;
        let pipeline = FramePipeline::new(
            render,
            present,
            config.frames.frame_count,
            &config.upload,
        )?;
        let orchestrator = MultiQueueOrchestrator::new(provider, &config.queues)?;
        let table = provider.binding_table(config.descriptors.capacity)?;
        let descriptors = DynamicDescriptorHeap::new(table, config.descriptors.capacity);

        Ok(Self {
            pipeline,
            orchestrator,
            throttle: AdaptiveThrottle::new(&config.throttle),
            throttle_enabled: config.throttle.enabled,
            profiler: Profiler::new(),
            descriptors,
            timer: Timer::new(),
            capabilities,
        })
    }

    /// Throttles, then starts the frame.
    ///
    /// Scopes and descriptor ranges owned by frames that have retired are
    /// released here.
    pub fn begin_frame(&mut self, clear_color: Vec4) -> FrameResult<FrameContext> {
        if self.throttle_enabled {
            let max_in_flight = self.throttle.desired_frames_in_flight();
            self.pipeline.wait_for_frames(max_in_flight)?;
        }

        let frame = self.pipeline.frame_start(clear_color)?;
        self.profiler.resolve(frame.last_completed, Instant::now());
        self.descriptors.retire(frame.last_completed);
        Ok(frame)
    }

    /// Submits and presents the frame, then samples the frame time.
    pub fn end_frame(&mut self, full_sync: bool) -> FrameResult<PresentOutcome> {
        let fence = self.pipeline.context().fence_value;
        let submitted_at = Instant::now();
        let outcome = self.pipeline.frame_present(full_sync)?;
        self.profiler.mark_submitted(fence, submitted_at);

        let frame_time = self.timer.tick();
        self.throttle.record(frame_time.as_secs_f64());
        Ok(outcome)
    }

    /// Reserves `count` descriptor slots owned by the current frame.
    ///
    /// If the heap refuses because a live range is in the way, blocks on the
    /// render timeline until that range retires and retries once.
    pub fn reserve_descriptors(
        &mut self,
        count: u32,
    ) -> FrameResult<DescriptorReservation<D::BindingTable>> {
        let frame = self.pipeline.context();
        match self
            .descriptors
            .reserve(count, frame.last_completed, frame.fence_value)
        {
            Err(FrameError::DescriptorHeapExhausted { wait_for, .. }) => {
                warn!(
                    "Descriptor heap full, waiting for fence {} to reserve {} slots",
                    wait_for, count
                );
                let timeline = self.pipeline.timeline_mut();
                timeline.block_until(wait_for)?;
                let completed = timeline.poll()?;
                self.descriptors
                    .reserve(count, completed, frame.fence_value)
            }
            result => result,
        }
    }

    /// Copies `data` into the current frame's upload ring.
    pub fn upload<T: Pod>(&mut self, data: &[T]) -> FrameResult<RingAllocation> {
        self.pipeline.upload_mut()?.write(data)
    }

    /// See [`MultiQueueOrchestrator::update_begin`].
    pub fn update_begin(&mut self, dt: f64) -> FrameResult<bool> {
        self.orchestrator.update_begin(dt)
    }

    /// See [`MultiQueueOrchestrator::update_end`].
    pub fn update_end(&mut self) -> FrameResult<()> {
        self.orchestrator.update_end()
    }

    /// See [`MultiQueueOrchestrator::pre_draw_begin`].
    pub fn pre_draw_begin(&mut self) -> FrameResult<()> {
        self.orchestrator.pre_draw_begin()
    }

    /// See [`MultiQueueOrchestrator::pre_draw_end`].
    pub fn pre_draw_end(&mut self) -> FrameResult<()> {
        self.orchestrator.pre_draw_end()
    }

    /// See [`MultiQueueOrchestrator::draw_begin`].
    pub fn draw_begin(&mut self) -> FrameResult<()> {
        self.orchestrator.draw_begin()
    }

    /// See [`MultiQueueOrchestrator::draw_end`].
    pub fn draw_end(&mut self) -> FrameResult<()> {
        self.orchestrator.draw_end()
    }

    /// Recorder of the active context.
    pub fn recorder(&mut self) -> FrameResult<&mut <D::Queue as GpuQueue>::Recorder> {
        self.orchestrator.active_recorder(&mut self.pipeline)
    }

    /// Wraps a grid result for the render queue.
    pub fn publish<T>(&mut self, payload: T) -> Proxy<T> {
        self.orchestrator.publish(&self.pipeline, payload)
    }

    /// Returns the payload if it is complete on the CPU timeline.
    pub fn try_get<'p, T>(&mut self, proxy: &'p Proxy<T>) -> FrameResult<Option<&'p T>> {
        self.orchestrator.try_get(&mut self.pipeline, proxy)
    }

    /// Orders the current frame after the proxy's producer.
    pub fn acquire<'p, T>(&mut self, proxy: &'p Proxy<T>) -> FrameResult<&'p T> {
        self.orchestrator.acquire(&mut self.pipeline, proxy)
    }

    /// Opens a profile scope.
    pub fn profile_begin(&mut self, label: &str) {
        self.profiler.profile_begin(label);
    }

    /// Closes a profile scope owned by the current frame.
    pub fn profile_end(&mut self, label: &str) -> FrameResult<()> {
        let fence = self.pipeline.context().fence_value;
        self.profiler.profile_end(label, fence)
    }

    /// Drains all queues and rebuilds the queue contexts for `request`.
    ///
    /// Must be called between frames, normally right after a full-sync
    /// [`end_frame`](Self::end_frame).
    pub fn reconfigure(
        &mut self,
        provider: &D,
        request: OrchestrationMode,
    ) -> FrameResult<OrchestrationMode> {
        if self.pipeline.state() != FrameState::Idle {
            return Err(FrameError::InvalidState {
                operation: "reconfigure",
                state: self.pipeline.state().name(),
            });
        }
        self.pipeline.wait_for_all_frames()?;
        self.orchestrator.reconfigure(provider, request)
    }

    /// Blocks until every queue is idle.
    pub fn shutdown(&mut self) -> FrameResult<()> {
        self.orchestrator.drain()?;
        self.pipeline.wait_for_all_frames()?;
        info!("Session drained after {} frames", self.pipeline.frame_id());
        Ok(())
    }

    /// Returns the frame pipeline.
    pub fn pipeline(&self) -> &FramePipeline<D::Queue, P> {
        &self.pipeline
    }

    /// Returns the frame pipeline mutably.
    pub fn pipeline_mut(&mut self) -> &mut FramePipeline<D::Queue, P> {
        &mut self.pipeline
    }

    /// Returns the orchestrator.
    pub fn orchestrator(&self) -> &MultiQueueOrchestrator<D::Queue> {
        &self.orchestrator
    }

    /// Returns the orchestrator mutably.
    pub fn orchestrator_mut(&mut self) -> &mut MultiQueueOrchestrator<D::Queue> {
        &mut self.orchestrator
    }

    /// Returns the throttle.
    pub fn throttle(&self) -> &AdaptiveThrottle {
        &self.throttle
    }

    /// Returns the profiler.
    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    /// Returns the descriptor heap.
    pub fn descriptors(&self) -> &DynamicDescriptorHeap<D::BindingTable> {
        &self.descriptors
    }

    /// Capability flags read at init.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Orchestration mode in effect.
    pub fn mode(&self) -> OrchestrationMode {
        self.orchestrator.mode()
    }
}

#[cfg(test)]
mod tests {
    use gridflow_core::DescriptorSettings;

    use super::*;
    use crate::soft::{Completion, SoftDevice, SoftSwapchain};

    fn session(config: &Config) -> (SoftDevice, Session<SoftDevice, SoftSwapchain>) {
        let device = SoftDevice::new(&config.soft_gpu, Completion::OnWait);
        let swapchain = device.swapchain(3);
        let session = Session::new(&device, swapchain, config).unwrap();
        (device, session)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = Config::default();
        config.frames.frame_count = 0;
        let device = SoftDevice::new(&config.soft_gpu, Completion::OnWait);
        let result = Session::new(&device, device.swapchain(3), &config);
        assert!(matches!(result, Err(FrameError::Core(_))));
    }

    #[test]
    fn test_reserve_blocks_and_retries() {
        let mut config = Config::default();
        config.frames.frame_count = 2;
        config.throttle.enabled = false;
        config.descriptors = DescriptorSettings {
            capacity: 64,
            max_per_frame: 32,
        };
        let (device, mut session) = session(&config);

        // Above max_per_frame, which only sizes the heap.
        session.begin_frame(Vec4::ZERO).unwrap();
        session.reserve_descriptors(40).unwrap();
        session.end_frame(false).unwrap();

        session.begin_frame(Vec4::ZERO).unwrap();
        session.reserve_descriptors(20).unwrap();
        // Wraps into frame 0's range; frame 0 must retire first.
        let reservation = session.reserve_descriptors(30).unwrap();
        assert_eq!(reservation.start, 0);
        assert_eq!(device.render_queue().completed_value().unwrap(), 1);
        session.end_frame(false).unwrap();
    }

    #[test]
    fn test_reserve_within_one_frame_overflow_fails() {
        let mut config = Config::default();
        config.frames.frame_count = 2;
        config.descriptors = DescriptorSettings {
            capacity: 64,
            max_per_frame: 32,
        };
        let (_, mut session) = session(&config);

        session.begin_frame(Vec4::ZERO).unwrap();
        session.reserve_descriptors(40).unwrap();
        let err = session.reserve_descriptors(40).unwrap_err();
        assert!(matches!(err, FrameError::FenceNotSubmitted { requested: 1, .. }));
    }

    #[test]
    fn test_profile_scopes_resolve_on_later_frames() {
        let config = Config::default();
        let (_, mut session) = session(&config);

        for _ in 0..6 {
            session.begin_frame(Vec4::ZERO).unwrap();
            session.profile_begin("frame");
            session.profile_end("frame").unwrap();
            session.end_frame(false).unwrap();
        }
        let report = session.profiler().report();
        assert_eq!(report[0].count, 6);
        assert!(report[0].gpu_ms.is_some());
        assert!(session.profiler().pending() < 6);
    }

    #[test]
    fn test_reconfigure_outside_frame_only() {
        let mut config = Config::default();
        config.soft_gpu.dedicated_queue = true;
        let (device, mut session) = session(&config);
        assert_eq!(session.mode(), OrchestrationMode::InterQueue);

        session.begin_frame(Vec4::ZERO).unwrap();
        assert!(session.reconfigure(&device, OrchestrationMode::Unified).is_err());
        session.end_frame(true).unwrap();

        let mode = session
            .reconfigure(&device, OrchestrationMode::MultiGpu)
            .unwrap();
        assert_eq!(mode, OrchestrationMode::InterQueue);
        assert_eq!(
            session.orchestrator().requested_mode(),
            OrchestrationMode::MultiGpu
        );
    }
}
