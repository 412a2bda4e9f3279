//! Emulated GPU backend.
//!
//! The soft device implements every backend trait on host memory. Each
//! [`SoftQueue`] keeps a fence timeline in shared state and retires its
//! submissions in order according to a [`Completion`] policy:
//!
//! - [`Completion::OnWait`]: work retires exactly when the CPU waits for it.
//!   Fully deterministic, used by most tests.
//! - [`Completion::Timed`]: each submission costs a fixed amount of GPU time
//!   after the previous one finishes, observed lazily on query.
//! - [`Completion::Manual`]: nothing retires until [`SoftQueue::retire_through`].
//!
//! Cross-queue waits registered with [`GpuQueue::wait_on`] become
//! dependencies of the next submission; that submission cannot retire before
//! its producers do.

use std::alloc::{self, Layout};
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use glam::Vec4;
use gridflow_core::SoftGpuSettings;
use tracing::{debug, info, trace, warn};

use crate::backend::{
    Capabilities, CommandRecorder, DevicePlacement, GpuQueue, PresentTarget, QueueProvider,
};
use crate::error::{FrameError, FrameResult};
use crate::fence::{FenceValue, QueueRole};
use crate::ring::{BackingBlock, BlockSource};

/// Video memory the soft device reports for its second device.
const SOFT_VIDEO_MEMORY: u64 = 4 << 30;

/// Alignment of host upload blocks.
const HOST_BLOCK_ALIGN: usize = 256;

/// When submissions on a soft queue finish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Retire work when the CPU blocks on it.
    OnWait,
    /// Retire work once its simulated cost has elapsed.
    Timed,
    /// Retire work only through [`SoftQueue::retire_through`].
    Manual,
}

/// Counters a soft queue keeps for inspection by tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Command recorders submitted.
    pub submissions: u64,
    /// Bare fence signals.
    pub signals: u64,
    /// Commands executed across all submissions.
    pub commands: u64,
    /// Highest number of unfinished submissions observed.
    pub max_in_flight: u64,
    /// CPU waits that had to block.
    pub blocked_waits: u64,
    /// GPU-side waits registered on other queues.
    pub cross_queue_waits: u64,
}

#[derive(Clone)]
struct Dependency {
    producer: SoftQueue,
    value: FenceValue,
}

#[derive(Clone)]
struct Pending {
    value: FenceValue,
    deps: Vec<Dependency>,
    ready_at: Instant,
}

#[derive(Default)]
struct QueueState {
    submitted: FenceValue,
    completed: FenceValue,
    pending: VecDeque<Pending>,
    waits: Vec<Dependency>,
    busy_until: Option<Instant>,
    stats: QueueStats,
}

struct Shared {
    state: Mutex<QueueState>,
    retired: Condvar,
}

/// An emulated hardware queue. Clones share the same timeline.
#[derive(Clone)]
pub struct SoftQueue {
    role: QueueRole,
    device: u32,
    completion: Completion,
    cost: Duration,
    shared: Arc<Shared>,
}

impl SoftQueue {
    /// Creates a queue whose submissions cost no GPU time.
    pub fn new(role: QueueRole, completion: Completion) -> Self {
        Self::with_cost(role, completion, Duration::ZERO)
    }

    /// Creates a queue whose submissions each cost `cost` of GPU time.
    pub fn with_cost(role: QueueRole, completion: Completion, cost: Duration) -> Self {
        Self {
            role,
            device: 0,
            completion,
            cost,
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                retired: Condvar::new(),
            }),
        }
    }

    fn on_device(mut self, device: u32) -> Self {
        self.device = device;
        self
    }

    /// Index of the emulated device owning this queue.
    #[inline]
    pub fn device(&self) -> u32 {
        self.device
    }

    /// Completion policy of this queue.
    #[inline]
    pub fn completion(&self) -> Completion {
        self.completion
    }

    /// Highest value submitted or signaled so far.
    pub fn submitted_value(&self) -> FenceValue {
        self.lock().submitted
    }

    /// Snapshot of this queue's counters.
    pub fn stats(&self) -> QueueStats {
        self.lock().stats
    }

    /// Retires every submission up to and including `value`.
    ///
    /// Ignores dependencies; the caller plays the role of the GPU.
    pub fn retire_through(&self, value: FenceValue) -> FrameResult<()> {
        let submitted = self.lock().submitted;
        if value > submitted {
            return Err(FrameError::FenceNotSubmitted {
                role: self.role,
                requested: value,
                last_submitted: submitted,
            });
        }
        self.retire_front(value);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn same_queue(&self, other: &SoftQueue) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn enqueue(&self, signal: FenceValue, commands: u64) -> FrameResult<()> {
        let mut state = self.lock();
        if signal <= state.submitted {
            return Err(FrameError::Backend(format!(
                "{} queue: signal {} does not advance past {}",
                self.role.name(),
                signal,
                state.submitted
            )));
        }

        let now = Instant::now();
        let start = state.busy_until.map_or(now, |busy| busy.max(now));
        let ready_at = start + self.cost;
        state.busy_until = Some(ready_at);

        let deps = std::mem::take(&mut state.waits);
        state.pending.push_back(Pending {
            value: signal,
            deps,
            ready_at,
        });
        state.submitted = signal;
        state.stats.commands += commands;
        let in_flight = state.submitted - state.completed;
        state.stats.max_in_flight = state.stats.max_in_flight.max(in_flight);
        Ok(())
    }

    fn retire_front(&self, value: FenceValue) {
        let mut state = self.lock();
        while state.pending.front().is_some_and(|p| p.value <= value) {
            state.pending.pop_front();
        }
        if value > state.completed {
            state.completed = value;
            trace!("{} queue retired fence {}", self.role.name(), value);
        }
        self.shared.retired.notify_all();
    }

    fn retire_ready(&self) -> FrameResult<()> {
        loop {
            let front = match self.lock().pending.front() {
                Some(pending) => pending.clone(),
                None => return Ok(()),
            };
            if Instant::now() < front.ready_at {
                return Ok(());
            }
            for dep in &front.deps {
                if dep.producer.completed_value()? < dep.value {
                    return Ok(());
                }
            }
            self.retire_front(front.value);
        }
    }
}

impl GpuQueue for SoftQueue {
    type Recorder = SoftRecorder;
    type Blocks = HostBlockSource;

    fn role(&self) -> QueueRole {
        self.role
    }

    fn create_recorder(&self) -> FrameResult<SoftRecorder> {
        Ok(SoftRecorder::new(self.role))
    }

    fn block_source(&self) -> HostBlockSource {
        HostBlockSource
    }

    fn submit(&self, recorder: &mut SoftRecorder, signal: FenceValue) -> FrameResult<()> {
        if recorder.state != RecorderState::Executable {
            return Err(FrameError::Backend(format!(
                "{} queue: submitted a recorder in state {:?}",
                self.role.name(),
                recorder.state
            )));
        }
        self.enqueue(signal, recorder.commands.len() as u64)?;
        self.lock().stats.submissions += 1;
        recorder.state = RecorderState::Submitted;
        recorder.last_submit = Some((self.clone(), signal));
        Ok(())
    }

    fn signal(&self, signal: FenceValue) -> FrameResult<()> {
        self.enqueue(signal, 0)?;
        self.lock().stats.signals += 1;
        Ok(())
    }

    fn wait_on(&self, producer: &SoftQueue, value: FenceValue) -> FrameResult<()> {
        if self.same_queue(producer) {
            return Ok(());
        }
        let mut state = self.lock();
        state.waits.push(Dependency {
            producer: producer.clone(),
            value,
        });
        state.stats.cross_queue_waits += 1;
        Ok(())
    }

    fn completed_value(&self) -> FrameResult<FenceValue> {
        if self.completion == Completion::Timed {
            self.retire_ready()?;
        }
        Ok(self.lock().completed)
    }

    fn wait_value(&self, value: FenceValue) -> FrameResult<()> {
        let mut blocked = false;
        loop {
            let front = {
                let mut state = self.lock();
                if state.completed >= value {
                    if blocked {
                        state.stats.blocked_waits += 1;
                    }
                    return Ok(());
                }
                if value > state.submitted {
                    return Err(FrameError::FenceNotSubmitted {
                        role: self.role,
                        requested: value,
                        last_submitted: state.submitted,
                    });
                }
                if self.completion == Completion::Manual {
                    blocked = true;
                    let _state = self
                        .shared
                        .retired
                        .wait_while(state, |s| s.completed < value)
                        .unwrap_or_else(PoisonError::into_inner);
                    continue;
                }
                state.pending.front().cloned()
            };
            blocked = true;

            let Some(front) = front else {
                return Err(FrameError::Backend(format!(
                    "{} queue: fence {} pending without queued work",
                    self.role.name(),
                    value
                )));
            };
            for dep in &front.deps {
                dep.producer.wait_value(dep.value)?;
            }
            if self.completion == Completion::Timed {
                let now = Instant::now();
                if front.ready_at > now {
                    std::thread::sleep(front.ready_at - now);
                }
            }
            self.retire_front(front.value);
        }
    }
}

/// A command recorded by a [`SoftRecorder`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SoftCommand {
    /// Clear of a back buffer.
    Clear {
        /// Back buffer index.
        back_buffer: usize,
        /// Clear color.
        color: Vec4,
    },
    /// Full barrier.
    Barrier,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecorderState {
    Initial,
    Recording,
    Executable,
    Submitted,
}

/// Command recorder of the soft backend.
///
/// Refuses to reset while its last submission is still in flight, so a
/// pipeline that reuses a slot too early fails loudly.
pub struct SoftRecorder {
    role: QueueRole,
    state: RecorderState,
    commands: Vec<SoftCommand>,
    last_submit: Option<(SoftQueue, FenceValue)>,
}

impl SoftRecorder {
    fn new(role: QueueRole) -> Self {
        Self {
            role,
            state: RecorderState::Initial,
            commands: Vec::new(),
            last_submit: None,
        }
    }

    /// Commands recorded since the last reset.
    pub fn commands(&self) -> &[SoftCommand] {
        &self.commands
    }

    /// Fence value of the last submission.
    pub fn last_submitted(&self) -> Option<FenceValue> {
        self.last_submit.as_ref().map(|(_, value)| *value)
    }

    fn record(&mut self, command: SoftCommand) {
        if self.state == RecorderState::Recording {
            self.commands.push(command);
        } else {
            warn!(
                "{} recorder dropped {:?} recorded in state {:?}",
                self.role.name(),
                command,
                self.state
            );
        }
    }
}

impl CommandRecorder for SoftRecorder {
    fn reset(&mut self) -> FrameResult<()> {
        if let Some((queue, value)) = &self.last_submit
            && queue.completed_value()? < *value
        {
            return Err(FrameError::Backend(format!(
                "{} recorder reset while fence {} is in flight",
                self.role.name(),
                value
            )));
        }
        self.commands.clear();
        self.state = RecorderState::Initial;
        Ok(())
    }

    fn begin(&mut self) -> FrameResult<()> {
        if self.state != RecorderState::Initial {
            return Err(FrameError::Backend(format!(
                "{} recorder began in state {:?}",
                self.role.name(),
                self.state
            )));
        }
        self.state = RecorderState::Recording;
        Ok(())
    }

    fn end(&mut self) -> FrameResult<()> {
        if self.state != RecorderState::Recording {
            return Err(FrameError::Backend(format!(
                "{} recorder ended in state {:?}",
                self.role.name(),
                self.state
            )));
        }
        self.state = RecorderState::Executable;
        Ok(())
    }

    fn clear(&mut self, back_buffer: usize, color: Vec4) {
        self.record(SoftCommand::Clear { back_buffer, color });
    }

    fn barrier(&mut self) {
        self.record(SoftCommand::Barrier);
    }
}

/// Host-memory upload block.
pub struct HostBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the block exclusively owns its allocation.
unsafe impl Send for HostBlock {}

impl BackingBlock for HostBlock {
    fn capacity(&self) -> u64 {
        self.layout.size() as u64
    }

    fn mapped_ptr(&self) -> NonNull<u8> {
        self.ptr
    }
}

impl Drop for HostBlock {
    fn drop(&mut self) {
        // SAFETY: allocated in `create_block` with the same layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Allocates [`HostBlock`]s from the global allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostBlockSource;

impl BlockSource for HostBlockSource {
    type Block = HostBlock;

    fn create_block(&mut self, capacity: u64) -> FrameResult<HostBlock> {
        let layout = Layout::from_size_align(capacity.max(1) as usize, HOST_BLOCK_ALIGN)
            .map_err(|e| FrameError::Backend(format!("invalid upload block layout: {e}")))?;
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            FrameError::Backend(format!("failed to allocate {capacity} byte upload block"))
        })?;
        Ok(HostBlock { ptr, layout })
    }
}

/// Swap chain of the soft backend.
///
/// Tracks the render fence of every presented frame; once `latency` of
/// them are still unfinished the latency wait object reports not ready.
pub struct SoftSwapchain {
    queue: SoftQueue,
    image_count: usize,
    latency: u64,
    current: usize,
    queued: VecDeque<FenceValue>,
    presented: u64,
    skipped: u64,
}

impl SoftSwapchain {
    /// Creates a swap chain presenting work from `queue`.
    pub fn new(queue: SoftQueue, image_count: usize, latency: u64) -> Self {
        Self {
            queue,
            image_count: image_count.max(1),
            latency: latency.max(1),
            current: 0,
            queued: VecDeque::new(),
            presented: 0,
            skipped: 0,
        }
    }

    /// Frames actually presented.
    pub fn presented(&self) -> u64 {
        self.presented
    }

    /// Frames whose presentation was skipped.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

impl PresentTarget for SoftSwapchain {
    fn back_buffer_index(&self) -> usize {
        self.current
    }

    fn latency_ready(&mut self) -> FrameResult<bool> {
        let completed = self.queue.completed_value()?;
        while self.queued.front().is_some_and(|&value| value <= completed) {
            self.queued.pop_front();
        }
        let ready = (self.queued.len() as u64) < self.latency;
        if !ready {
            self.skipped += 1;
        }
        Ok(ready)
    }

    fn present(&mut self) -> FrameResult<()> {
        self.queued.push_back(self.queue.submitted_value());
        self.current = (self.current + 1) % self.image_count;
        self.presented += 1;
        Ok(())
    }
}

/// Binding table handle of the soft backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SoftBindingTable {
    /// Unique id of the table.
    pub id: u32,
    /// Number of descriptor slots.
    pub capacity: u32,
}

/// An emulated GPU with a render queue, optional dedicated compute queue,
/// a copy queue and an optional second device.
pub struct SoftDevice {
    settings: SoftGpuSettings,
    render: SoftQueue,
    grid: Option<SoftQueue>,
    copy: SoftQueue,
    remote_grid: Option<SoftQueue>,
    next_table: AtomicU32,
}

impl SoftDevice {
    /// Creates the device described by `settings`.
    pub fn new(settings: &SoftGpuSettings, completion: Completion) -> Self {
        let frame_cost = Duration::from_micros(settings.frame_cost_us);
        let grid_cost = Duration::from_micros(settings.grid_cost_us);

        let render = SoftQueue::with_cost(QueueRole::Render, completion, frame_cost);
        let grid = settings
            .dedicated_queue
            .then(|| SoftQueue::with_cost(QueueRole::Grid, completion, grid_cost));
        let copy = SoftQueue::new(QueueRole::Copy, completion);
        let remote_grid = settings
            .dedicated_device
            .then(|| SoftQueue::with_cost(QueueRole::Grid, completion, grid_cost).on_device(1));

        info!(
            "Soft device created ({:?}): dedicated queue {}, dedicated device {}",
            completion, settings.dedicated_queue, settings.dedicated_device
        );

        Self {
            settings: settings.clone(),
            render,
            grid,
            copy,
            remote_grid,
            next_table: AtomicU32::new(0),
        }
    }

    /// Returns the render queue.
    pub fn render_queue(&self) -> &SoftQueue {
        &self.render
    }

    /// Creates a swap chain presenting from the render queue.
    pub fn swapchain(&self, image_count: usize) -> SoftSwapchain {
        SoftSwapchain::new(
            self.render.clone(),
            image_count,
            self.settings.swap_chain_latency,
        )
    }
}

impl QueueProvider for SoftDevice {
    type Queue = SoftQueue;
    type BindingTable = SoftBindingTable;

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            dedicated_device: self.settings.dedicated_device,
            dedicated_queue: self.settings.dedicated_queue,
            dedicated_video_memory: if self.settings.dedicated_device {
                SOFT_VIDEO_MEMORY
            } else {
                0
            },
        }
    }

    fn queue(&self, role: QueueRole, placement: DevicePlacement) -> FrameResult<SoftQueue> {
        let queue = match (role, placement) {
            (QueueRole::Render, DevicePlacement::Primary) => Some(&self.render),
            (QueueRole::Grid, DevicePlacement::Primary) => self.grid.as_ref(),
            (QueueRole::Grid, DevicePlacement::Secondary) => self.remote_grid.as_ref(),
            (QueueRole::Copy, DevicePlacement::Primary) => Some(&self.copy),
            _ => None,
        };
        queue.cloned().ok_or(FrameError::QueueUnavailable(role))
    }

    fn binding_table(&self, capacity: u32) -> FrameResult<SoftBindingTable> {
        let id = self.next_table.fetch_add(1, Ordering::Relaxed);
        debug!("Created soft binding table {} with {} slots", id, capacity);
        Ok(SoftBindingTable { id, capacity })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorded(queue: &SoftQueue) -> SoftRecorder {
        let mut recorder = queue.create_recorder().unwrap();
        recorder.begin().unwrap();
        recorder.barrier();
        recorder.end().unwrap();
        recorder
    }

    #[test]
    fn test_handles_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        fn assert_send<T: Send>() {}
        assert_send_sync::<SoftQueue>();
        assert_send_sync::<SoftDevice>();
        assert_send::<HostBlock>();
        assert_send::<SoftRecorder>();
    }

    #[test]
    fn test_on_wait_retires_only_when_waited() {
        let queue = SoftQueue::new(QueueRole::Render, Completion::OnWait);
        queue.signal(1).unwrap();
        queue.signal(2).unwrap();
        assert_eq!(queue.completed_value().unwrap(), 0);

        queue.wait_value(1).unwrap();
        assert_eq!(queue.completed_value().unwrap(), 1);
        assert_eq!(queue.stats().blocked_waits, 1);
        assert_eq!(queue.stats().max_in_flight, 2);
    }

    #[test]
    fn test_signal_must_advance() {
        let queue = SoftQueue::new(QueueRole::Render, Completion::OnWait);
        queue.signal(3).unwrap();
        assert!(matches!(queue.signal(3), Err(FrameError::Backend(_))));
    }

    #[test]
    fn test_wait_on_unsubmitted_value_fails() {
        let queue = SoftQueue::new(QueueRole::Grid, Completion::OnWait);
        let err = queue.wait_value(1).unwrap_err();
        assert!(matches!(err, FrameError::FenceNotSubmitted { requested: 1, .. }));
    }

    #[test]
    fn test_cross_queue_dependency_retires_producer_first() {
        let grid = SoftQueue::new(QueueRole::Grid, Completion::OnWait);
        let render = SoftQueue::new(QueueRole::Render, Completion::OnWait);

        grid.signal(1).unwrap();
        render.wait_on(&grid, 1).unwrap();
        render.signal(1).unwrap();

        render.wait_value(1).unwrap();
        assert_eq!(grid.completed_value().unwrap(), 1);
        assert_eq!(render.stats().cross_queue_waits, 1);
    }

    #[test]
    fn test_timed_queue_retires_after_cost() {
        let queue = SoftQueue::with_cost(
            QueueRole::Render,
            Completion::Timed,
            Duration::from_millis(2),
        );
        queue.signal(1).unwrap();
        queue.wait_value(1).unwrap();
        assert_eq!(queue.completed_value().unwrap(), 1);

        queue.signal(2).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(queue.completed_value().unwrap(), 2);
    }

    #[test]
    fn test_manual_retire_through() {
        let queue = SoftQueue::new(QueueRole::Copy, Completion::Manual);
        queue.signal(1).unwrap();
        queue.signal(2).unwrap();
        queue.retire_through(1).unwrap();
        assert_eq!(queue.completed_value().unwrap(), 1);
        assert!(queue.retire_through(3).is_err());

        let waiter = queue.clone();
        let handle = std::thread::spawn(move || waiter.wait_value(2));
        std::thread::sleep(Duration::from_millis(5));
        queue.retire_through(2).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_recorder_reset_while_in_flight_fails() {
        let queue = SoftQueue::new(QueueRole::Render, Completion::OnWait);
        let mut recorder = recorded(&queue);
        queue.submit(&mut recorder, 1).unwrap();

        assert!(matches!(recorder.reset(), Err(FrameError::Backend(_))));
        queue.wait_value(1).unwrap();
        recorder.reset().unwrap();
        assert!(recorder.commands().is_empty());
        assert_eq!(queue.stats().commands, 1);
    }

    #[test]
    fn test_submit_requires_closed_recorder() {
        let queue = SoftQueue::new(QueueRole::Render, Completion::OnWait);
        let mut recorder = queue.create_recorder().unwrap();
        recorder.begin().unwrap();
        assert!(queue.submit(&mut recorder, 1).is_err());
        assert_eq!(queue.submitted_value(), 0);
    }

    #[test]
    fn test_swapchain_skips_when_latency_exceeded() {
        let queue = SoftQueue::new(QueueRole::Render, Completion::OnWait);
        let mut swapchain = SoftSwapchain::new(queue.clone(), 3, 2);

        for value in 1..=2 {
            queue.signal(value).unwrap();
            assert!(swapchain.latency_ready().unwrap());
            swapchain.present().unwrap();
        }
        queue.signal(3).unwrap();
        assert!(!swapchain.latency_ready().unwrap());
        assert_eq!(swapchain.skipped(), 1);

        queue.wait_value(1).unwrap();
        assert!(swapchain.latency_ready().unwrap());
        swapchain.present().unwrap();
        assert_eq!(swapchain.presented(), 3);
        assert_eq!(swapchain.back_buffer_index(), 0);
    }

    #[test]
    fn test_device_queue_availability() {
        let settings = SoftGpuSettings {
            dedicated_device: false,
            dedicated_queue: true,
            ..SoftGpuSettings::default()
        };
        let device = SoftDevice::new(&settings, Completion::OnWait);
        assert!(device.queue(QueueRole::Grid, DevicePlacement::Primary).is_ok());
        assert!(matches!(
            device.queue(QueueRole::Grid, DevicePlacement::Secondary),
            Err(FrameError::QueueUnavailable(QueueRole::Grid))
        ));
        assert_eq!(device.capabilities().dedicated_video_memory, 0);

        let a = device.binding_table(16).unwrap();
        let b = device.binding_table(16).unwrap();
        assert_ne!(a.id, b.id);
    }
}
