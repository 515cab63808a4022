// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Placement of fixed-purpose blocks inside the guest's available physical memory.

use crate::arch::x86_64::layout::HIMEM_START;
use crate::utils::align_up;
use crate::vstate::memory::{Address, GuestAddress, GuestUsize, MemoryMap, MemorySegment};

/// Errors returned by the [`Relocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum RelocatorError {
    /// The requested range overlaps a chunk that is already placed.
    Overlap,
    /// No available memory segment can hold the requested range.
    OutOfRange,
    /// Failed to allocate the chunk record.
    OutOfMemory,
}

type Result<T> = std::result::Result<T, RelocatorError>;

/// A placed range of guest physical memory.
///
/// This is only a handle: the memory itself stays with the guest and is reached through
/// the VM session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chunk {
    target: GuestAddress,
    size: GuestUsize,
}

impl Chunk {
    /// Guest physical address of the first byte.
    pub fn target(&self) -> GuestAddress {
        self.target
    }

    /// Length of the chunk in bytes.
    pub fn size(&self) -> GuestUsize {
        self.size
    }

    /// Address of the byte following the chunk.
    pub fn end(&self) -> GuestAddress {
        self.target.unchecked_add(self.size)
    }
}

// Whether [a, a + a_size) and [b, b + b_size) share no byte. Both sizes are non-zero and
// neither range wraps.
fn disjoint(a: u64, a_size: u64, b: u64, b_size: u64) -> bool {
    a > b + (b_size - 1) || a + (a_size - 1) < b
}

/// Owns the chunks placed in one VM session.
///
/// Chunks are kept sorted by ascending target address and never overlap. Every chunk lies
/// entirely inside one available segment of the memory map the relocator was created from.
///
/// # Examples
///
/// ```
/// # use vmm::relocator::Relocator;
/// # use vmm::vstate::memory::{GuestAddress, MemoryMap, MemorySegment};
/// let map = MemoryMap::new(vec![MemorySegment::available(0x10_0000, 0x1ff_ffff)]);
/// let mut relocator = Relocator::new(&map);
/// let chunk = relocator
///     .allocate_anywhere(GuestAddress(0), GuestAddress(0x200_0000), 0x1000, 0x1000)
///     .unwrap();
/// assert_eq!(chunk.target(), GuestAddress(0x10_0000));
/// assert_eq!(relocator.end_of_allocations(), GuestAddress(0x10_1000));
/// ```
#[derive(Debug, Default)]
pub struct Relocator {
    segments: Vec<MemorySegment>,
    chunks: Vec<Chunk>,
}

impl Relocator {
    /// Creates an empty relocator over the available segments of `map`.
    pub fn new(map: &MemoryMap) -> Self {
        Relocator {
            segments: map.available().copied().collect(),
            chunks: Vec::new(),
        }
    }

    /// Places a chunk of `size` bytes at exactly `target`.
    ///
    /// Zero-sized and address-wrapping requests can not be held by any segment and fail
    /// with [`RelocatorError::OutOfRange`].
    pub fn allocate_at(&mut self, target: GuestAddress, size: GuestUsize) -> Result<Chunk> {
        let start = target.raw_value();
        let last = size
            .checked_sub(1)
            .and_then(|len| start.checked_add(len))
            .ok_or(RelocatorError::OutOfRange)?;

        if self
            .chunks
            .iter()
            .any(|chunk| !disjoint(start, size, chunk.target.raw_value(), chunk.size))
        {
            return Err(RelocatorError::Overlap);
        }

        if !self
            .segments
            .iter()
            .any(|seg| seg.contains(start) && seg.contains(last))
        {
            return Err(RelocatorError::OutOfRange);
        }

        self.chunks
            .try_reserve(1)
            .map_err(|_| RelocatorError::OutOfMemory)?;
        let chunk = Chunk { target, size };
        let index = self.chunks.partition_point(|placed| placed.target < target);
        self.chunks.insert(index, chunk);

        Ok(chunk)
    }

    /// Places a chunk of `size` bytes at the lowest `align`-aligned address in
    /// `[min_addr, max_addr]` where [`Relocator::allocate_at`] succeeds.
    ///
    /// Requests starting below 1 MiB are moved up to 1 MiB when the range above it can
    /// still fit them, keeping them out of the real-mode and BIOS area. Otherwise the
    /// caller's floor is kept.
    pub fn allocate_anywhere(
        &mut self,
        min_addr: GuestAddress,
        max_addr: GuestAddress,
        size: GuestUsize,
        align: GuestUsize,
    ) -> Result<Chunk> {
        let max_addr = max_addr.raw_value();
        let mut min_addr = min_addr.raw_value();

        if min_addr < HIMEM_START {
            let fits_above = align
                .checked_add(size)
                .and_then(|len| len.checked_add(HIMEM_START))
                .is_some_and(|end| end < max_addr);
            if fits_above {
                min_addr = HIMEM_START;
            }
        }

        let step = align.max(1);
        let mut addr = align_up(min_addr, align).ok_or(RelocatorError::OutOfRange)?;
        while addr <= max_addr {
            match self.allocate_at(GuestAddress(addr), size) {
                Ok(chunk) => return Ok(chunk),
                Err(RelocatorError::OutOfMemory) => return Err(RelocatorError::OutOfMemory),
                Err(RelocatorError::Overlap) | Err(RelocatorError::OutOfRange) => {}
            }
            addr = match addr.checked_add(step) {
                Some(next) => next,
                None => break,
            };
        }

        Err(RelocatorError::OutOfRange)
    }

    /// Address following the highest placed chunk, or 0 when nothing is placed.
    pub fn end_of_allocations(&self) -> GuestAddress {
        self.chunks
            .last()
            .map(Chunk::end)
            .unwrap_or(GuestAddress(0))
    }

    /// Placed chunks in ascending address order.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Drops every placed chunk. Calling it again is a no-op.
    pub fn release(&mut self) {
        self.chunks.clear();
        self.chunks.shrink_to_fit();
    }
}
