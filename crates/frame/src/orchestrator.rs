//! Multi-queue orchestration.
//!
//! The orchestrator composes the render queue with an optional dedicated
//! grid (compute) queue and, for multi-GPU, a copy queue on the render
//! device. It owns the auxiliary queues' fence timelines and recorders and
//! keeps a stack of the contexts currently being recorded, so simulation
//! commands never land on the render queue's recorder by accident.
//!
//! ```text
//!   Unified      render ─┬─ grid work (same recorder)
//!   InterQueue   render ◄── grid          GPU-side wait
//!   MultiGpu     render ◄── copy ◄── grid CPU wait + transfer
//! ```

use gridflow_core::{OrchestrationMode, QueueSettings};
use tracing::{debug, info, trace, warn};

use crate::backend::{
    Capabilities, CommandRecorder, DevicePlacement, GpuQueue, PresentTarget, QueueProvider,
};
use crate::error::{FrameError, FrameResult};
use crate::fence::{FenceTimeline, FenceValue, QueueRole};
use crate::pipeline::FramePipeline;
use crate::proxy::{Proxy, Requirement};

/// Picks the orchestration mode the device supports.
///
/// Multi-GPU needs a dedicated device and inter-queue a dedicated queue.
/// An unavailable request falls back to the next simpler mode.
pub fn reconfigure(capabilities: &Capabilities, request: OrchestrationMode) -> OrchestrationMode {
    match request {
        OrchestrationMode::MultiGpu if capabilities.dedicated_device => {
            OrchestrationMode::MultiGpu
        }
        OrchestrationMode::MultiGpu | OrchestrationMode::InterQueue
            if capabilities.dedicated_queue =>
        {
            OrchestrationMode::InterQueue
        }
        _ => OrchestrationMode::Unified,
    }
}

struct AuxSlot<Q: GpuQueue> {
    recorder: Q::Recorder,
    fence_value: FenceValue,
}

/// Recording context of an auxiliary queue.
///
/// Holds a small ring of recorders; each is reused only after its last
/// submission has retired.
pub struct AuxContext<Q: GpuQueue> {
    timeline: FenceTimeline<Q>,
    slots: Vec<AuxSlot<Q>>,
    current: usize,
    open: bool,
    eager_flush: bool,
}

impl<Q: GpuQueue> AuxContext<Q> {
    fn new(queue: Q, slot_count: usize) -> FrameResult<Self> {
        let mut slots = Vec::with_capacity(slot_count);
        for _ in 0..slot_count.max(1) {
            slots.push(AuxSlot {
                recorder: queue.create_recorder()?,
                fence_value: 0,
            });
        }
        debug!(
            "Created {} context with {} recorders",
            queue.role().name(),
            slots.len()
        );
        Ok(Self {
            timeline: FenceTimeline::new(queue)?,
            slots,
            current: 0,
            open: false,
            eager_flush: false,
        })
    }

    fn begin(&mut self) -> FrameResult<()> {
        if self.open {
            return Ok(());
        }
        let slot = &mut self.slots[self.current];
        self.timeline.block_until(slot.fence_value)?;
        slot.recorder.reset()?;
        slot.recorder.begin()?;
        self.open = true;
        Ok(())
    }

    fn flush(&mut self) -> FrameResult<Option<FenceValue>> {
        self.eager_flush = false;
        if !self.open {
            return Ok(None);
        }
        let slot = &mut self.slots[self.current];
        slot.recorder.end()?;
        let value = self.timeline.submit(&mut slot.recorder)?;
        slot.fence_value = value;
        self.current = (self.current + 1) % self.slots.len();
        self.open = false;
        Ok(Some(value))
    }

    fn drain(&mut self) -> FrameResult<()> {
        self.flush()?;
        self.timeline.drain()
    }

    /// Role of the wrapped queue.
    pub fn role(&self) -> QueueRole {
        self.timeline.role()
    }

    /// Returns the fence timeline of the wrapped queue.
    pub fn timeline(&self) -> &FenceTimeline<Q> {
        &self.timeline
    }

    /// True while commands are being recorded.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Returns the open recorder.
    pub fn recorder_mut(&mut self) -> Option<&mut Q::Recorder> {
        if self.open {
            Some(&mut self.slots[self.current].recorder)
        } else {
            None
        }
    }
}

enum Topology<Q: GpuQueue> {
    Unified,
    InterQueue {
        grid: AuxContext<Q>,
    },
    MultiGpu {
        grid: AuxContext<Q>,
        copy: AuxContext<Q>,
    },
}

impl<Q: GpuQueue> Topology<Q> {
    fn build<D>(provider: &D, mode: OrchestrationMode, slot_count: usize) -> FrameResult<Self>
    where
        D: QueueProvider<Queue = Q>,
    {
        Ok(match mode {
            OrchestrationMode::Unified => Topology::Unified,
            OrchestrationMode::InterQueue => Topology::InterQueue {
                grid: AuxContext::new(
                    provider.queue(QueueRole::Grid, DevicePlacement::Primary)?,
                    slot_count,
                )?,
            },
            OrchestrationMode::MultiGpu => Topology::MultiGpu {
                grid: AuxContext::new(
                    provider.queue(QueueRole::Grid, DevicePlacement::Secondary)?,
                    slot_count,
                )?,
                copy: AuxContext::new(
                    provider.queue(QueueRole::Copy, DevicePlacement::Primary)?,
                    slot_count,
                )?,
            },
        })
    }

    fn mode(&self) -> OrchestrationMode {
        match self {
            Topology::Unified => OrchestrationMode::Unified,
            Topology::InterQueue { .. } => OrchestrationMode::InterQueue,
            Topology::MultiGpu { .. } => OrchestrationMode::MultiGpu,
        }
    }

    fn contexts_mut(&mut self) -> Vec<&mut AuxContext<Q>> {
        match self {
            Topology::Unified => Vec::new(),
            Topology::InterQueue { grid } => vec![grid],
            Topology::MultiGpu { grid, copy } => vec![grid, copy],
        }
    }

    fn context_mut(&mut self, role: QueueRole) -> Option<&mut AuxContext<Q>> {
        match (self, role) {
            (Topology::InterQueue { grid }, QueueRole::Grid)
            | (Topology::MultiGpu { grid, .. }, QueueRole::Grid) => Some(grid),
            (Topology::MultiGpu { copy, .. }, QueueRole::Copy) => Some(copy),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UpdateState {
    Idle,
    Open,
    Skipped,
}

/// Simulation step counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OrchestratorStats {
    /// Steps that advanced the simulation.
    pub steps: u64,
    /// Steps skipped because an auxiliary queue was at its cap.
    pub skipped_steps: u64,
    /// Proxies acquired by the render queue.
    pub acquisitions: u64,
}

/// Routes simulation and render work to the right queues.
///
/// The brackets mirror the frame loop:
///
/// ```text
///   update_begin(dt) -> bool   grid context pushed (if true)
///   update_end()               grid submission flushed
///   pre_draw_begin/end         render context, aux fences re-polled
///   draw_begin/end             render context
/// ```
pub struct MultiQueueOrchestrator<Q: GpuQueue> {
    requested: OrchestrationMode,
    topology: Topology<Q>,
    stack: Vec<QueueRole>,
    update: UpdateState,
    max_aux_in_flight: u64,
    generation: u64,
    simulated_time: f64,
    stats: OrchestratorStats,
}

impl<Q: GpuQueue> MultiQueueOrchestrator<Q> {
    /// Selects a mode for `settings.mode` and creates its queue contexts.
    pub fn new<D>(provider: &D, settings: &QueueSettings) -> FrameResult<Self>
    where
        D: QueueProvider<Queue = Q>,
    {
        let mut orchestrator = Self {
            requested: settings.mode,
            topology: Topology::Unified,
            stack: Vec::new(),
            update: UpdateState::Idle,
            max_aux_in_flight: settings.max_aux_in_flight.max(1),
            generation: 0,
            simulated_time: 0.0,
            stats: OrchestratorStats::default(),
        };
        orchestrator.reconfigure(provider, settings.mode)?;
        Ok(orchestrator)
    }

    /// Drains every auxiliary queue and rebuilds the contexts for `request`.
    ///
    /// Returns the mode actually selected. The caller drains the render
    /// queue first (a full-sync present) so no frame still references
    /// auxiliary results.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidState`] while any context is open.
    pub fn reconfigure<D>(
        &mut self,
        provider: &D,
        request: OrchestrationMode,
    ) -> FrameResult<OrchestrationMode>
    where
        D: QueueProvider<Queue = Q>,
    {
        if !self.stack.is_empty() || self.update != UpdateState::Idle {
            return Err(FrameError::InvalidState {
                operation: "reconfigure",
                state: "context open",
            });
        }

        self.drain()?;

        let mode = reconfigure(&provider.capabilities(), request);
        if mode != request {
            warn!(
                "Requested {} orchestration is unsupported, using {}",
                request.name(),
                mode.name()
            );
        }

        // Old contexts are dropped only after the new ones exist.
        let slots = self.max_aux_in_flight as usize + 1;
        self.topology = Topology::build(provider, mode, slots)?;
        self.requested = request;
        self.generation += 1;
        info!("Queue orchestration: {} (generation {})", mode.name(), self.generation);
        Ok(mode)
    }

    /// Opens a simulation step.
    ///
    /// Returns false when an auxiliary queue already has
    /// `max_aux_in_flight` submissions unfinished; the caller must skip the
    /// step and may still call [`update_end`](Self::update_end), which is
    /// then a no-op. Unified mode always advances.
    pub fn update_begin(&mut self, dt: f64) -> FrameResult<bool> {
        if self.update != UpdateState::Idle {
            return Err(FrameError::InvalidState {
                operation: "update_begin",
                state: "update open",
            });
        }

        let cap = self.max_aux_in_flight;
        for context in self.topology.contexts_mut() {
            let in_flight = context.timeline.in_flight()?;
            if in_flight >= cap {
                debug!(
                    "Simulation step skipped: {} queue has {} submissions in flight",
                    context.role().name(),
                    in_flight
                );
                self.update = UpdateState::Skipped;
                self.stats.skipped_steps += 1;
                return Ok(false);
            }
        }

        for context in self.topology.contexts_mut() {
            context.eager_flush = true;
        }
        if let Some(grid) = self.topology.context_mut(QueueRole::Grid) {
            grid.begin()?;
        }

        self.stack.push(QueueRole::Grid);
        self.update = UpdateState::Open;
        self.simulated_time += dt;
        self.stats.steps += 1;
        Ok(true)
    }

    /// Closes the simulation step and submits the grid work.
    pub fn update_end(&mut self) -> FrameResult<()> {
        match self.update {
            UpdateState::Skipped => {
                self.update = UpdateState::Idle;
                return Ok(());
            }
            UpdateState::Idle => {
                return Err(FrameError::InvalidState {
                    operation: "update_end",
                    state: "no update open",
                });
            }
            UpdateState::Open => {}
        }

        self.pop(QueueRole::Grid)?;
        for context in self.topology.contexts_mut() {
            let pushed = context.role() == QueueRole::Grid;
            if (pushed || context.eager_flush)
                && let Some(value) = context.flush()?
            {
                trace!("{} context flushed fence {}", context.role().name(), value);
            }
        }
        self.update = UpdateState::Idle;
        Ok(())
    }

    /// Pushes the render context and refreshes auxiliary fence state.
    ///
    /// Does not force a flush of auxiliary work.
    pub fn pre_draw_begin(&mut self) -> FrameResult<()> {
        for context in self.topology.contexts_mut() {
            context.timeline.poll()?;
        }
        self.stack.push(QueueRole::Render);
        Ok(())
    }

    /// Pops the render context pushed by [`pre_draw_begin`](Self::pre_draw_begin).
    pub fn pre_draw_end(&mut self) -> FrameResult<()> {
        self.pop(QueueRole::Render)
    }

    /// Pushes the render context.
    pub fn draw_begin(&mut self) -> FrameResult<()> {
        self.stack.push(QueueRole::Render);
        Ok(())
    }

    /// Pops the render context pushed by [`draw_begin`](Self::draw_begin).
    pub fn draw_end(&mut self) -> FrameResult<()> {
        self.pop(QueueRole::Render)
    }

    /// Recorder of the context on top of the stack.
    ///
    /// In unified mode the grid context aliases the frame's render recorder.
    pub fn active_recorder<'a, P: PresentTarget>(
        &'a mut self,
        pipeline: &'a mut FramePipeline<Q, P>,
    ) -> FrameResult<&'a mut Q::Recorder> {
        match self.stack.last().copied() {
            None => Err(FrameError::InvalidState {
                operation: "active_recorder",
                state: "no context",
            }),
            Some(QueueRole::Render) => pipeline.recorder_mut(),
            Some(role) => match self.topology.context_mut(role) {
                None => pipeline.recorder_mut(),
                Some(context) => context.recorder_mut().ok_or(FrameError::InvalidState {
                    operation: "active_recorder",
                    state: "context closed",
                }),
            },
        }
    }

    /// Wraps a grid-produced result for handoff to the render queue.
    ///
    /// The requirement is the grid submission currently being recorded, or
    /// the last one if none is open. In unified mode the result is ordered
    /// by the render queue itself and tagged with the current frame.
    pub fn publish<T, P: PresentTarget>(
        &mut self,
        pipeline: &FramePipeline<Q, P>,
        payload: T,
    ) -> Proxy<T> {
        let requirement = match self.topology.context_mut(QueueRole::Grid) {
            Some(grid) => Requirement {
                role: QueueRole::Grid,
                value: if grid.open {
                    grid.timeline.next_value()
                } else {
                    grid.timeline.last_submitted()
                },
            },
            None => Requirement {
                role: QueueRole::Render,
                value: pipeline.context().fence_value,
            },
        };
        Proxy::new(payload, vec![requirement], self.generation)
    }

    /// Returns the payload once every requirement is complete on the CPU.
    pub fn try_get<'p, T, P: PresentTarget>(
        &mut self,
        pipeline: &mut FramePipeline<Q, P>,
        proxy: &'p Proxy<T>,
    ) -> FrameResult<Option<&'p T>> {
        if proxy.generation() != self.generation {
            return Ok(Some(proxy.payload()));
        }
        for requirement in proxy.requirements() {
            let complete = match requirement.role {
                QueueRole::Render => pipeline.timeline_mut().is_complete(requirement.value)?,
                role => match self.topology.context_mut(role) {
                    Some(context) => context.timeline.is_complete(requirement.value)?,
                    None => true,
                },
            };
            if !complete {
                return Ok(None);
            }
        }
        Ok(Some(proxy.payload()))
    }

    /// Transfers ownership of the payload to the render queue.
    ///
    /// Flushes the producer if the required value has not been submitted,
    /// then orders the render queue's next submission after it. In
    /// inter-queue mode this is a GPU-side wait. Across devices the CPU
    /// waits for the grid device, a copy-queue transfer is recorded, and
    /// the render queue waits on the copy.
    ///
    /// Inside an update bracket the flushed grid context is reopened, so
    /// later grid commands of the step go into a new submission.
    pub fn acquire<'p, T, P: PresentTarget>(
        &mut self,
        pipeline: &mut FramePipeline<Q, P>,
        proxy: &'p Proxy<T>,
    ) -> FrameResult<&'p T> {
        if proxy.generation() != self.generation {
            return Ok(proxy.payload());
        }

        for requirement in proxy.requirements() {
            match (&mut self.topology, requirement.role) {
                (Topology::InterQueue { grid }, QueueRole::Grid) => {
                    ensure_submitted(grid, requirement.value)?;
                    pipeline.queue().wait_on(grid.timeline.queue(), requirement.value)?;
                }
                (Topology::MultiGpu { grid, copy }, QueueRole::Grid) => {
                    ensure_submitted(grid, requirement.value)?;
                    grid.timeline.block_until(requirement.value)?;

                    copy.begin()?;
                    if let Some(recorder) = copy.recorder_mut() {
                        recorder.barrier();
                    }
                    if let Some(copied) = copy.flush()? {
                        pipeline.queue().wait_on(copy.timeline.queue(), copied)?;
                    }
                }
                (Topology::MultiGpu { copy, .. }, QueueRole::Copy) => {
                    pipeline.queue().wait_on(copy.timeline.queue(), requirement.value)?;
                }
                // Produced on the render queue, or on a queue this mode
                // aliases to it: submission order already covers it.
                _ => {}
            }
        }

        self.stats.acquisitions += 1;
        Ok(proxy.payload())
    }

    /// Blocks until every auxiliary submission has finished.
    pub fn drain(&mut self) -> FrameResult<()> {
        for context in self.topology.contexts_mut() {
            context.drain()?;
        }
        Ok(())
    }

    /// Unfinished submissions on the auxiliary queue for `role`.
    pub fn aux_in_flight(&mut self, role: QueueRole) -> FrameResult<u64> {
        match self.topology.context_mut(role) {
            Some(context) => context.timeline.in_flight(),
            None => Ok(0),
        }
    }

    /// Auxiliary context for `role`, if the mode has one.
    pub fn context(&mut self, role: QueueRole) -> Option<&AuxContext<Q>> {
        self.topology.context_mut(role).map(|context| &*context)
    }

    /// Mode currently in effect.
    pub fn mode(&self) -> OrchestrationMode {
        self.topology.mode()
    }

    /// Mode last requested.
    pub fn requested_mode(&self) -> OrchestrationMode {
        self.requested
    }

    /// Context on top of the stack.
    pub fn current_context(&self) -> Option<QueueRole> {
        self.stack.last().copied()
    }

    /// Number of contexts pushed.
    pub fn context_depth(&self) -> usize {
        self.stack.len()
    }

    /// Topology generation; bumped by every reconfigure.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Total simulated time of advanced steps, in seconds.
    pub fn simulated_time(&self) -> f64 {
        self.simulated_time
    }

    /// Step counters.
    pub fn stats(&self) -> OrchestratorStats {
        self.stats
    }

    fn pop(&mut self, expected: QueueRole) -> FrameResult<()> {
        match self.stack.last().copied() {
            Some(role) if role == expected => {
                self.stack.pop();
                Ok(())
            }
            found => Err(FrameError::ContextMismatch { expected, found }),
        }
    }
}

fn ensure_submitted<Q: GpuQueue>(
    producer: &mut AuxContext<Q>,
    value: FenceValue,
) -> FrameResult<()> {
    if value <= producer.timeline.last_submitted() {
        return Ok(());
    }
    trace!(
        "Flushing {} context for acquire of fence {}",
        producer.role().name(),
        value
    );
    let reopen = producer.open;
    producer.flush()?;
    if reopen {
        producer.begin()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use gridflow_core::{SoftGpuSettings, UploadSettings};

    use super::*;
    use crate::soft::{Completion, SoftDevice, SoftQueue, SoftSwapchain};

    type Orchestrator = MultiQueueOrchestrator<SoftQueue>;
    type Pipeline = FramePipeline<SoftQueue, SoftSwapchain>;

    fn device(dedicated_device: bool, dedicated_queue: bool) -> SoftDevice {
        let settings = SoftGpuSettings {
            dedicated_device,
            dedicated_queue,
            ..SoftGpuSettings::default()
        };
        SoftDevice::new(&settings, Completion::OnWait)
    }

    fn setup(device: &SoftDevice, mode: OrchestrationMode) -> (Orchestrator, Pipeline) {
        let settings = QueueSettings {
            mode,
            max_aux_in_flight: 2,
        };
        let orchestrator = MultiQueueOrchestrator::new(device, &settings).unwrap();
        let pipeline = FramePipeline::new(
            device.render_queue().clone(),
            device.swapchain(3),
            3,
            &UploadSettings::default(),
        )
        .unwrap();
        (orchestrator, pipeline)
    }

    fn caps(dedicated_device: bool, dedicated_queue: bool) -> Capabilities {
        Capabilities {
            dedicated_device,
            dedicated_queue,
            dedicated_video_memory: 0,
        }
    }

    #[test]
    fn test_multi_gpu_downgrades_to_inter_queue() {
        assert_eq!(
            reconfigure(&caps(false, true), OrchestrationMode::MultiGpu),
            OrchestrationMode::InterQueue
        );
    }

    #[test]
    fn test_mode_selection_table() {
        use OrchestrationMode::*;
        assert_eq!(reconfigure(&caps(true, true), MultiGpu), MultiGpu);
        assert_eq!(reconfigure(&caps(true, false), MultiGpu), MultiGpu);
        assert_eq!(reconfigure(&caps(false, false), MultiGpu), Unified);
        assert_eq!(reconfigure(&caps(true, true), InterQueue), InterQueue);
        assert_eq!(reconfigure(&caps(true, false), InterQueue), Unified);
        assert_eq!(reconfigure(&caps(true, true), Unified), Unified);
    }

    #[test]
    fn test_unified_always_advances() {
        let device = device(false, false);
        let (mut orchestrator, mut pipeline) = setup(&device, OrchestrationMode::InterQueue);
        assert_eq!(orchestrator.mode(), OrchestrationMode::Unified);

        pipeline.frame_start(glam::Vec4::ZERO).unwrap();
        for _ in 0..5 {
            assert!(orchestrator.update_begin(1.0 / 60.0).unwrap());
            // Grid work lands on the frame's render recorder.
            orchestrator.active_recorder(&mut pipeline).unwrap().barrier();
            orchestrator.update_end().unwrap();
        }
        assert_eq!(pipeline.recorder_mut().unwrap().commands().len(), 6);
    }

    #[test]
    fn test_inter_queue_skips_at_cap() {
        let device = device(false, true);
        let (mut orchestrator, _) = setup(&device, OrchestrationMode::InterQueue);
        assert_eq!(orchestrator.mode(), OrchestrationMode::InterQueue);

        for _ in 0..2 {
            assert!(orchestrator.update_begin(0.01).unwrap());
            orchestrator.update_end().unwrap();
        }
        assert_eq!(orchestrator.aux_in_flight(QueueRole::Grid).unwrap(), 2);

        assert!(!orchestrator.update_begin(0.01).unwrap());
        assert_eq!(orchestrator.context_depth(), 0);
        orchestrator.update_end().unwrap();

        let grid = device.queue(QueueRole::Grid, DevicePlacement::Primary).unwrap();
        grid.wait_value(1).unwrap();
        assert!(orchestrator.update_begin(0.01).unwrap());
        orchestrator.update_end().unwrap();

        let stats = orchestrator.stats();
        assert_eq!((stats.steps, stats.skipped_steps), (3, 1));
        assert!((orchestrator.simulated_time() - 0.03).abs() < 1e-12);
    }

    #[test]
    fn test_unbalanced_brackets_rejected() {
        let device = device(false, true);
        let (mut orchestrator, _) = setup(&device, OrchestrationMode::InterQueue);

        assert!(matches!(
            orchestrator.draw_end(),
            Err(FrameError::ContextMismatch {
                expected: QueueRole::Render,
                found: None
            })
        ));
        assert!(orchestrator.update_end().is_err());

        orchestrator.update_begin(0.0).unwrap();
        assert!(matches!(
            orchestrator.pre_draw_end(),
            Err(FrameError::ContextMismatch {
                expected: QueueRole::Render,
                found: Some(QueueRole::Grid)
            })
        ));
        assert!(orchestrator.reconfigure(&device, OrchestrationMode::Unified).is_err());
        orchestrator.update_end().unwrap();
    }

    #[test]
    fn test_inter_queue_acquire_orders_render_after_grid() {
        let device = device(false, true);
        let (mut orchestrator, mut pipeline) = setup(&device, OrchestrationMode::InterQueue);

        pipeline.frame_start(glam::Vec4::ZERO).unwrap();
        assert!(orchestrator.update_begin(0.01).unwrap());
        let proxy = orchestrator.publish(&pipeline, 42u32);
        assert_eq!(
            proxy.requirements(),
            &[Requirement {
                role: QueueRole::Grid,
                value: 1
            }]
        );
        orchestrator.update_end().unwrap();

        assert_eq!(orchestrator.try_get(&mut pipeline, &proxy).unwrap(), None);

        orchestrator.draw_begin().unwrap();
        assert_eq!(*orchestrator.acquire(&mut pipeline, &proxy).unwrap(), 42);
        orchestrator.draw_end().unwrap();
        pipeline.frame_present(true).unwrap();

        // The render submission could only retire after the grid work.
        let grid = device.queue(QueueRole::Grid, DevicePlacement::Primary).unwrap();
        assert_eq!(grid.completed_value().unwrap(), 1);
        assert_eq!(device.render_queue().stats().cross_queue_waits, 1);
        assert_eq!(orchestrator.try_get(&mut pipeline, &proxy).unwrap(), Some(&42));
    }

    #[test]
    fn test_multi_gpu_acquire_uses_copy_queue() {
        let device = device(true, true);
        let (mut orchestrator, mut pipeline) = setup(&device, OrchestrationMode::MultiGpu);
        assert_eq!(orchestrator.mode(), OrchestrationMode::MultiGpu);

        pipeline.frame_start(glam::Vec4::ZERO).unwrap();
        orchestrator.update_begin(0.01).unwrap();
        let proxy = orchestrator.publish(&pipeline, "density");
        orchestrator.update_end().unwrap();

        orchestrator.acquire(&mut pipeline, &proxy).unwrap();
        let remote = device.queue(QueueRole::Grid, DevicePlacement::Secondary).unwrap();
        let copy = device.queue(QueueRole::Copy, DevicePlacement::Primary).unwrap();
        assert_eq!(remote.completed_value().unwrap(), 1);
        assert_eq!(copy.submitted_value(), 1);
        pipeline.frame_present(true).unwrap();
        assert_eq!(copy.completed_value().unwrap(), 1);
    }

    #[test]
    fn test_acquire_flushes_open_producer() {
        let device = device(false, true);
        let (mut orchestrator, mut pipeline) = setup(&device, OrchestrationMode::InterQueue);
        let grid = device.queue(QueueRole::Grid, DevicePlacement::Primary).unwrap();
        pipeline.frame_start(glam::Vec4::ZERO).unwrap();

        orchestrator.update_begin(0.01).unwrap();
        let proxy = orchestrator.publish(&pipeline, ());
        orchestrator.acquire(&mut pipeline, &proxy).unwrap();
        assert_eq!(grid.submitted_value(), 1);

        // The step keeps recording into a fresh grid submission.
        orchestrator.active_recorder(&mut pipeline).unwrap().barrier();
        orchestrator.update_end().unwrap();
        assert_eq!(grid.submitted_value(), 2);
    }

    #[test]
    fn test_reconfigure_drains_and_invalidates_proxies() {
        let device = device(false, true);
        let (mut orchestrator, mut pipeline) = setup(&device, OrchestrationMode::InterQueue);
        pipeline.frame_start(glam::Vec4::ZERO).unwrap();
        orchestrator.update_begin(0.01).unwrap();
        let proxy = orchestrator.publish(&pipeline, 7);
        orchestrator.update_end().unwrap();
        pipeline.frame_present(true).unwrap();

        let generation = orchestrator.generation();
        let mode = orchestrator
            .reconfigure(&device, OrchestrationMode::Unified)
            .unwrap();
        assert_eq!(mode, OrchestrationMode::Unified);
        assert_eq!(orchestrator.generation(), generation + 1);

        let grid = device.queue(QueueRole::Grid, DevicePlacement::Primary).unwrap();
        assert_eq!(grid.completed_value().unwrap(), 1);
        assert_eq!(orchestrator.try_get(&mut pipeline, &proxy).unwrap(), Some(&7));

        // Switching back continues the grid timeline where it stopped.
        orchestrator
            .reconfigure(&device, OrchestrationMode::InterQueue)
            .unwrap();
        assert_eq!(
            orchestrator.context(QueueRole::Grid).unwrap().timeline().next_value(),
            2
        );
    }
}
