//! Cross-queue result handoff.

use crate::fence::{FenceValue, QueueRole};

/// A producer-side fence point a proxy's payload depends on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Requirement {
    /// Queue that produces the data.
    pub role: QueueRole,
    /// Fence value after which the data is complete.
    pub value: FenceValue,
}

/// A result produced on one queue and consumed on another.
///
/// The payload is usually a handle to GPU memory. It may only be read by
/// the consumer after the requirements are met, which
/// [`MultiQueueOrchestrator::try_get`](crate::MultiQueueOrchestrator::try_get)
/// checks on the CPU and
/// [`MultiQueueOrchestrator::acquire`](crate::MultiQueueOrchestrator::acquire)
/// establishes on the GPU.
#[derive(Clone, Debug)]
pub struct Proxy<T> {
    payload: T,
    requirements: Vec<Requirement>,
    generation: u64,
}

impl<T> Proxy<T> {
    pub(crate) fn new(payload: T, requirements: Vec<Requirement>, generation: u64) -> Self {
        Self {
            payload,
            requirements,
            generation,
        }
    }

    /// Fence points the payload depends on.
    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    /// Queue-topology generation the proxy was published in.
    ///
    /// Producers of an older generation were drained by a reconfigure.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn payload(&self) -> &T {
        &self.payload
    }

    /// Unwraps the payload without any synchronization.
    ///
    /// The caller must already know the requirements are complete.
    pub fn into_inner_unsynchronized(self) -> T {
        self.payload
    }
}
