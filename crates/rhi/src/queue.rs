//! Hardware queues with timeline-semaphore fences.
//!
//! A [`RoleQueue`] pairs one `vk::Queue` with the timeline semaphore that
//! serves as its fence. Every submission signals the semaphore with the value
//! the frame pipeline assigned to it. Cross-queue dependencies registered by
//! [`wait_on`](GpuQueue::wait_on) are attached as timeline waits to the next
//! submission on the consumer queue, so the GPU orders the work without the
//! CPU blocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use ash::vk;
use gridflow_frame::{FenceValue, FrameError, FrameResult, GpuQueue, QueueRole};
use tracing::{debug, trace};

use crate::buffer::UploadBlockSource;
use crate::command::CommandBuffer;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::image::BackBuffers;
use crate::sync::TimelineSemaphore;

struct QueueShared {
    device: Arc<Device>,
    role: QueueRole,
    family: u32,
    queue: vk::Queue,
    timeline: Arc<TimelineSemaphore>,
    back_buffers: Arc<BackBuffers>,
    submitted: AtomicU64,
    waits: Mutex<Vec<(Arc<TimelineSemaphore>, FenceValue)>>,
}

/// A Vulkan queue serving one [`QueueRole`].
///
/// Cheap to clone; clones share the queue and its timeline.
#[derive(Clone)]
pub struct RoleQueue {
    shared: Arc<QueueShared>,
}

impl RoleQueue {
    /// Wraps the queue of `family` for `role`.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::MissingQueue`] if the device has no queue of
    /// `family`, or an error if the timeline semaphore cannot be created.
    pub fn new(
        device: Arc<Device>,
        role: QueueRole,
        family: u32,
        back_buffers: Arc<BackBuffers>,
    ) -> RhiResult<Self> {
        let queue = device.queue(family).ok_or(RhiError::MissingQueue(family))?;
        let timeline = Arc::new(TimelineSemaphore::new(Arc::clone(&device), 0)?);
        debug!("{} queue bound to family {}", role.name(), family);

        Ok(Self {
            shared: Arc::new(QueueShared {
                device,
                role,
                family,
                queue,
                timeline,
                back_buffers,
                submitted: AtomicU64::new(0),
                waits: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Queue family index.
    #[inline]
    pub fn family(&self) -> u32 {
        self.shared.family
    }

    /// Highest value submitted so far.
    #[inline]
    pub fn submitted_value(&self) -> FenceValue {
        self.shared.submitted.load(Ordering::Acquire)
    }

    /// The timeline semaphore signaled by this queue.
    #[inline]
    pub fn timeline(&self) -> &TimelineSemaphore {
        &self.shared.timeline
    }

    fn submit_batch(
        &self,
        command_buffers: &[vk::CommandBuffer],
        signal: FenceValue,
    ) -> FrameResult<()> {
        let submitted = self.submitted_value();
        if signal <= submitted {
            return Err(FrameError::Backend(format!(
                "{} queue: signal {} does not advance past {}",
                self.shared.role.name(),
                signal,
                submitted
            )));
        }

        let waits = std::mem::take(
            &mut *self
                .shared
                .waits
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let wait_semaphores: Vec<vk::Semaphore> =
            waits.iter().map(|(timeline, _)| timeline.handle()).collect();
        let wait_values: Vec<u64> = waits.iter().map(|(_, value)| *value).collect();
        let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; waits.len()];
        let signal_semaphores = [self.shared.timeline.handle()];
        let signal_values = [signal];

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        unsafe { self.shared.device.submit(self.shared.queue, &[submit])? };
        self.shared.submitted.store(signal, Ordering::Release);

        trace!(
            "{} queue: submitted {} buffer(s), {} wait(s), signal {}",
            self.shared.role.name(),
            command_buffers.len(),
            waits.len(),
            signal
        );
        Ok(())
    }
}

impl GpuQueue for RoleQueue {
    type Recorder = CommandBuffer;
    type Blocks = UploadBlockSource;

    fn role(&self) -> QueueRole {
        self.shared.role
    }

    fn create_recorder(&self) -> FrameResult<CommandBuffer> {
        Ok(CommandBuffer::new(
            Arc::clone(&self.shared.device),
            self.shared.family,
            Arc::clone(&self.shared.back_buffers),
        )?)
    }

    fn block_source(&self) -> UploadBlockSource {
        UploadBlockSource::new(Arc::clone(&self.shared.device))
    }

    fn submit(&self, recorder: &mut CommandBuffer, signal: FenceValue) -> FrameResult<()> {
        recorder.ensure_executable()?;
        self.submit_batch(&[recorder.handle()], signal)?;
        recorder.mark_submitted(self.clone(), signal);
        Ok(())
    }

    fn signal(&self, signal: FenceValue) -> FrameResult<()> {
        self.submit_batch(&[], signal)
    }

    fn wait_on(&self, producer: &Self, value: FenceValue) -> FrameResult<()> {
        if Arc::ptr_eq(&self.shared, &producer.shared) {
            return Ok(());
        }
        self.shared
            .waits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((Arc::clone(&producer.shared.timeline), value));
        trace!(
            "{} queue: next submission waits for {} {}",
            self.shared.role.name(),
            producer.shared.role.name(),
            value
        );
        Ok(())
    }

    fn completed_value(&self) -> FrameResult<FenceValue> {
        Ok(self.shared.timeline.value()?)
    }

    fn wait_value(&self, value: FenceValue) -> FrameResult<()> {
        let last_submitted = self.submitted_value();
        if value > last_submitted {
            return Err(FrameError::FenceNotSubmitted {
                role: self.shared.role,
                requested: value,
                last_submitted,
            });
        }
        self.shared.timeline.wait(value, u64::MAX)?;
        Ok(())
    }
}
