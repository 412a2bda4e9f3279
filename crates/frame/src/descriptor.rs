//! Ring reservation of a fixed-capacity binding table.
//!
//! A single cursor walks the table. A request that would run past the end
//! wraps to slot 0 and leaves the tail unused. Every reservation stays live
//! until the fence value it was tagged with retires; a request that would
//! overlap a live range is refused with the fence to wait for.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::error::{FrameError, FrameResult};
use crate::fence::FenceValue;

/// A contiguous range of descriptor slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorReservation<H> {
    /// Binding table the slots live in.
    pub heap: H,
    /// First slot.
    pub start: u32,
    /// Number of slots.
    pub count: u32,
}

impl<H> DescriptorReservation<H> {
    /// One past the last slot.
    #[inline]
    pub fn end(&self) -> u32 {
        self.start + self.count
    }

    /// Absolute slot index of the `index`-th slot of this reservation.
    #[inline]
    pub fn slot(&self, index: u32) -> u32 {
        debug_assert!(index < self.count);
        self.start + index
    }
}

#[derive(Clone, Copy, Debug)]
struct LiveRange {
    start: u32,
    count: u32,
    fence: FenceValue,
}

impl LiveRange {
    fn overlaps(&self, start: u32, count: u32) -> bool {
        let (start, end) = (u64::from(start), u64::from(start) + u64::from(count));
        u64::from(self.start) < end && start < self.end()
    }

    fn end(&self) -> u64 {
        u64::from(self.start) + u64::from(self.count)
    }
}

/// Circular allocator over one binding table.
pub struct DynamicDescriptorHeap<H: Copy> {
    heap: H,
    capacity: u32,
    cursor: u32,
    live: VecDeque<LiveRange>,
}

impl<H: Copy> DynamicDescriptorHeap<H> {
    /// Wraps `heap`, which has `capacity` slots.
    pub fn new(heap: H, capacity: u32) -> Self {
        debug!("Descriptor heap created with {} slots", capacity);
        Self {
            heap,
            capacity,
            cursor: 0,
            live: VecDeque::new(),
        }
    }

    /// Reserves `count` contiguous slots for work that retires at `next_value`.
    ///
    /// Ranges tagged with a fence `<= last_completed` are released first.
    ///
    /// # Errors
    ///
    /// - [`FrameError::DescriptorCountTooLarge`] if `count` exceeds the capacity.
    /// - [`FrameError::DescriptorHeapExhausted`] if the range would overlap a
    ///   live reservation; waiting for `wait_for` and retrying succeeds.
    pub fn reserve(
        &mut self,
        count: u32,
        last_completed: FenceValue,
        next_value: FenceValue,
    ) -> FrameResult<DescriptorReservation<H>> {
        if count > self.capacity {
            return Err(FrameError::DescriptorCountTooLarge {
                requested: count,
                capacity: self.capacity,
            });
        }

        self.retire(last_completed);

        let start = if u64::from(self.cursor) + u64::from(count) > u64::from(self.capacity) {
            trace!(
                "Descriptor cursor wraps, {} tail slots skipped",
                self.capacity - self.cursor
            );
            0
        } else {
            self.cursor
        };

        if count == 0 {
            return Ok(DescriptorReservation {
                heap: self.heap,
                start,
                count,
            });
        }

        if let Some(wait_for) = self
            .live
            .iter()
            .filter(|range| range.overlaps(start, count))
            .map(|range| range.fence)
            .max()
        {
            return Err(FrameError::DescriptorHeapExhausted {
                requested: count,
                wait_for,
            });
        }

        match self.live.back_mut() {
            Some(last) if last.fence == next_value && last.end() == u64::from(start) => {
                last.count += count;
            }
            _ => self.live.push_back(LiveRange {
                start,
                count,
                fence: next_value,
            }),
        }
        self.cursor = start + count;

        Ok(DescriptorReservation {
            heap: self.heap,
            start,
            count,
        })
    }

    /// Releases every range whose fence is `<= last_completed`.
    pub fn retire(&mut self, last_completed: FenceValue) {
        self.live.retain(|range| range.fence > last_completed);
    }

    /// Oldest fence still holding slots.
    pub fn oldest_live_fence(&self) -> Option<FenceValue> {
        self.live.iter().map(|range| range.fence).min()
    }

    /// Number of slots held by live reservations.
    pub fn live_slots(&self) -> u32 {
        self.live.iter().map(|range| range.count).sum()
    }

    /// Binding table handle.
    #[inline]
    pub fn heap(&self) -> H {
        self.heap
    }

    /// Total number of slots.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Slot the next reservation starts at unless it wraps.
    #[inline]
    pub fn cursor(&self) -> u32 {
        self.cursor
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn heap(capacity: u32) -> DynamicDescriptorHeap<u32> {
        DynamicDescriptorHeap::new(7, capacity)
    }

    #[test]
    fn test_reservations_are_contiguous() {
        let mut heap = heap(64);
        let a = heap.reserve(10, 0, 1).unwrap();
        let b = heap.reserve(20, 0, 1).unwrap();
        assert_eq!((a.start, a.count, a.heap), (0, 10, 7));
        assert_eq!(b.start, 10);
        assert_eq!(b.end(), 30);
        assert_eq!(heap.live_slots(), 30);
    }

    #[test]
    fn test_huge_capacity_wraps_without_overflow() {
        let mut heap = heap(u32::MAX);
        let half = u32::MAX / 2 + 10;
        let first = heap.reserve(half, 0, 1).unwrap();
        assert_eq!(first.start, 0);

        let err = heap.reserve(half, 0, 2).unwrap_err();
        assert!(matches!(
            err,
            FrameError::DescriptorHeapExhausted { wait_for: 1, .. }
        ));

        let wrapped = heap.reserve(half, 1, 2).unwrap();
        assert_eq!(wrapped.start, 0);
        assert_eq!(heap.cursor(), half);
    }

    #[test]
    fn test_wrap_skips_tail() {
        let mut heap = heap(64);
        heap.reserve(50, 0, 1).unwrap();
        let wrapped = heap.reserve(20, 1, 2).unwrap();
        assert_eq!(wrapped.start, 0);
        assert_eq!(heap.cursor(), 20);
    }

    #[test]
    fn test_overlap_with_live_range_refused() {
        let mut heap = heap(64);
        heap.reserve(40, 0, 1).unwrap();
        heap.reserve(20, 0, 2).unwrap();

        let err = heap.reserve(30, 0, 3).unwrap_err();
        assert!(matches!(
            err,
            FrameError::DescriptorHeapExhausted {
                requested: 30,
                wait_for: 1
            }
        ));

        // Once fence 1 retires the same request fits at slot 0.
        let retry = heap.reserve(30, 1, 3).unwrap();
        assert_eq!(retry.start, 0);
    }

    #[test]
    fn test_wait_for_is_latest_conflicting_fence() {
        let mut heap = heap(64);
        heap.reserve(20, 0, 1).unwrap();
        heap.reserve(20, 0, 2).unwrap();
        heap.reserve(20, 0, 3).unwrap();

        let err = heap.reserve(50, 0, 4).unwrap_err();
        assert!(matches!(
            err,
            FrameError::DescriptorHeapExhausted { wait_for: 3, .. }
        ));
    }

    #[test]
    fn test_count_too_large() {
        let mut heap = heap(64);
        let err = heap.reserve(65, 0, 1).unwrap_err();
        assert!(matches!(
            err,
            FrameError::DescriptorCountTooLarge {
                requested: 65,
                capacity: 64
            }
        ));
    }

    #[test]
    fn test_same_fence_ranges_merge() {
        let mut heap = heap(64);
        heap.reserve(4, 0, 1).unwrap();
        heap.reserve(4, 0, 1).unwrap();
        heap.reserve(4, 0, 2).unwrap();
        assert_eq!(heap.oldest_live_fence(), Some(1));
        heap.retire(1);
        assert_eq!(heap.live_slots(), 4);
        assert_eq!(heap.oldest_live_fence(), Some(2));
    }

    proptest! {
        #[test]
        fn prop_live_reservations_never_overlap(
            steps in prop::collection::vec((1u32..=48, 0u64..=3, any::<bool>()), 1..128)
        ) {
            let mut heap = heap(128);
            let mut fence: FenceValue = 1;
            let mut completed: FenceValue = 0;
            let mut live: Vec<(u32, u32, FenceValue)> = Vec::new();

            for (count, lag, advance) in steps {
                if advance {
                    fence += 1;
                }
                completed = completed.max(fence.saturating_sub(lag + 1));
                live.retain(|&(_, _, f)| f > completed);

                let reservation = match heap.reserve(count, completed, fence) {
                    Ok(reservation) => reservation,
                    Err(FrameError::DescriptorHeapExhausted { wait_for, .. }) => {
                        prop_assert!(wait_for > completed);
                        completed = wait_for;
                        live.retain(|&(_, _, f)| f > completed);
                        heap.reserve(count, completed, fence).unwrap()
                    }
                    Err(other) => return Err(TestCaseError::fail(other.to_string())),
                };

                for &(start, len, _) in &live {
                    prop_assert!(
                        reservation.end() <= start || start + len <= reservation.start,
                        "[{}, {}) overlaps live [{}, {})",
                        reservation.start, reservation.end(), start, start + len
                    );
                }
                live.push((reservation.start, reservation.count, fence));
            }
        }
    }
}
