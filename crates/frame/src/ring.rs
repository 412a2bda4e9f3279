//! Transient upload memory ("versioned buffer").
//!
//! [`RingAllocator`] bump-allocates CPU-writable, GPU-visible memory from a
//! chain of backing blocks. Memory is reclaimed a whole chain at a time by
//! [`reset`](RingAllocator::reset); the allocator does no fence checking of
//! its own. The frame pipeline keeps one ring per frame slot and resets it
//! only after that slot's fence has retired.
//!
//! ```text
//!   block 0 [#### #### #### ....]   <- cursor
//!   block 1 [.... .... .... ....]   appended when block 0 is full
//! ```
//!
//! The chain only grows: blocks are recycled after a reset, never freed.

use std::ptr::NonNull;

use bytemuck::Pod;
use gridflow_core::{OversizePolicy, UploadSettings};
use tracing::debug;

use crate::error::{FrameError, FrameResult};

/// A mapped, CPU-writable allocation the GPU can read.
pub trait BackingBlock {
    /// Size of the block in bytes.
    fn capacity(&self) -> u64;

    /// Host pointer to the start of the block. Valid for the block's lifetime.
    fn mapped_ptr(&self) -> NonNull<u8>;
}

/// Creates backing blocks for a [`RingAllocator`].
pub trait BlockSource {
    /// Block type produced by this source.
    type Block: BackingBlock;

    /// Creates a block of at least `capacity` bytes.
    fn create_block(&mut self, capacity: u64) -> FrameResult<Self::Block>;
}

/// Rounds `value` up to a multiple of `alignment` (a power of two).
///
/// Returns `None` if the rounded value does not fit in a `u64`.
#[inline]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    debug_assert!(alignment.is_power_of_two());
    value
        .checked_add(alignment - 1)
        .map(|v| v & !(alignment - 1))
}

struct RingBlock<B> {
    block: B,
    cursor: u64,
}

/// A region handed out by [`RingAllocator::allocate`].
///
/// Valid until the owning ring is reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingAllocation {
    /// Index of the backing block.
    pub block: usize,
    /// Byte offset inside the block; a multiple of the ring's alignment.
    pub offset: u64,
    /// Size in bytes, rounded up to the alignment.
    pub size: u64,
    ptr: NonNull<u8>,
}

impl RingAllocation {
    /// Host pointer to the first byte.
    #[inline]
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Host address of the first byte.
    #[inline]
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Returns true if the two allocations share any byte.
    pub fn overlaps(&self, other: &RingAllocation) -> bool {
        self.block == other.block
            && self.offset < other.offset + other.size
            && other.offset < self.offset + self.size
    }
}

/// Bump allocator over a growing chain of backing blocks.
pub struct RingAllocator<S: BlockSource> {
    source: S,
    blocks: Vec<RingBlock<S::Block>>,
    current: usize,
    block_size: u64,
    alignment: u64,
    oversize: OversizePolicy,
}

impl<S: BlockSource> RingAllocator<S> {
    /// Creates an empty ring. Blocks are created on first use.
    pub fn new(source: S, settings: &UploadSettings) -> Self {
        Self {
            source,
            blocks: Vec::new(),
            current: 0,
            block_size: settings.block_size,
            alignment: settings.alignment,
            oversize: settings.oversize,
        }
    }

    /// Allocates `size` bytes aligned to the ring's alignment.
    ///
    /// A zero-sized request still takes one alignment unit so every
    /// allocation has a distinct address.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::AllocationTooLarge`] when `size` exceeds the
    /// block size under [`OversizePolicy::Reject`] or cannot be aligned at
    /// all, or a backend error if a new block cannot be created.
    pub fn allocate(&mut self, size: u64) -> FrameResult<RingAllocation> {
        let Some(aligned) = align_up(size.max(1), self.alignment) else {
            return Err(FrameError::AllocationTooLarge {
                requested: size,
                capacity: self.block_size,
            });
        };
        if aligned > self.block_size && self.oversize == OversizePolicy::Reject {
            return Err(FrameError::AllocationTooLarge {
                requested: aligned,
                capacity: self.block_size,
            });
        }

        if !self.fits(self.current, aligned) {
            self.current = match (self.current + 1..self.blocks.len())
                .find(|&index| self.fits(index, aligned))
            {
                Some(index) => index,
                None => self.append_block(aligned)?,
            };
        }

        let index = self.current;
        let ring_block = &mut self.blocks[index];
        let offset = ring_block.cursor;
        ring_block.cursor += aligned;

        // SAFETY: offset + aligned <= capacity was checked by `fits`, so the
        // pointer stays inside the mapped block.
        let ptr = unsafe {
            NonNull::new_unchecked(ring_block.block.mapped_ptr().as_ptr().add(offset as usize))
        };

        Ok(RingAllocation {
            block: index,
            offset,
            size: aligned,
            ptr,
        })
    }

    /// Allocates room for `data` and copies it in.
    pub fn write<T: Pod>(&mut self, data: &[T]) -> FrameResult<RingAllocation> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let allocation = self.allocate(bytes.len() as u64)?;
        // SAFETY: the allocation is at least `bytes.len()` long and no other
        // live allocation overlaps it.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), allocation.ptr().as_ptr(), bytes.len());
        }
        Ok(allocation)
    }

    /// Allocates room for one value and copies it in.
    pub fn write_one<T: Pod>(&mut self, value: &T) -> FrameResult<RingAllocation> {
        self.write(std::slice::from_ref(value))
    }

    /// Rewinds every block's cursor to zero.
    ///
    /// The caller must have proven through the owning fence that the GPU no
    /// longer reads anything allocated since the previous reset.
    pub fn reset(&mut self) {
        for block in &mut self.blocks {
            block.cursor = 0;
        }
        self.current = 0;
    }

    /// Returns the backing block at `index`.
    pub fn block(&self, index: usize) -> Option<&S::Block> {
        self.blocks.get(index).map(|b| &b.block)
    }

    /// Number of blocks in the chain.
    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Write cursor of every block, in chain order.
    pub fn cursors(&self) -> Vec<u64> {
        self.blocks.iter().map(|b| b.cursor).collect()
    }

    /// Bytes handed out since the last reset.
    pub fn used_bytes(&self) -> u64 {
        self.blocks.iter().map(|b| b.cursor).sum()
    }

    /// Total bytes of all blocks.
    pub fn capacity_bytes(&self) -> u64 {
        self.blocks.iter().map(|b| b.block.capacity()).sum()
    }

    /// Alignment of every allocation.
    #[inline]
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    fn fits(&self, index: usize, size: u64) -> bool {
        self.blocks
            .get(index)
            .is_some_and(|b| {
                b.cursor
                    .checked_add(size)
                    .is_some_and(|end| end <= b.block.capacity())
            })
    }

    fn append_block(&mut self, min_size: u64) -> FrameResult<usize> {
        let capacity = self.block_size.max(min_size);
        let block = self.source.create_block(capacity)?;
        self.blocks.push(RingBlock { block, cursor: 0 });
        debug!(
            "Upload ring grew to {} block(s), {} bytes",
            self.blocks.len(),
            self.capacity_bytes()
        );
        Ok(self.blocks.len() - 1)
    }
}
