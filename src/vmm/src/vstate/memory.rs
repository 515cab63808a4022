// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

use serde::{Deserialize, Serialize};
pub use vm_memory::{Address, GuestAddress, GuestUsize};

use crate::arch::x86_64::layout::{HIGH_MEM_START, HIMEM_START, LEGACY_MEM_END};

/// Type of a guest physical memory segment.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SegmentType {
    /// Usable RAM.
    Available,
    /// Present in the map but not to be handed out.
    Reserved,
}

/// One range of guest physical memory. `end` is the last byte of the range.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MemorySegment {
    /// First byte of the segment.
    pub start: u64,
    /// Last byte of the segment.
    pub end: u64,
    /// Whether the segment may be allocated from.
    pub kind: SegmentType,
}

impl MemorySegment {
    /// Creates an available segment covering `[start, end]`.
    pub const fn available(start: u64, end: u64) -> Self {
        MemorySegment {
            start,
            end,
            kind: SegmentType::Available,
        }
    }

    /// Creates a reserved segment covering `[start, end]`.
    pub const fn reserved(start: u64, end: u64) -> Self {
        MemorySegment {
            start,
            end,
            kind: SegmentType::Reserved,
        }
    }

    /// Length of the segment in bytes.
    pub const fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Whether `addr` falls inside the segment.
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr <= self.end
    }

    /// Whether the segment may be allocated from.
    pub fn is_available(&self) -> bool {
        self.kind == SegmentType::Available
    }
}

/// The guest physical memory segments declared for one VM session.
///
/// Built once when the session is created and never modified afterwards.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryMap {
    segments: Vec<MemorySegment>,
}

impl MemoryMap {
    /// Wraps an explicit list of segments.
    pub fn new(segments: Vec<MemorySegment>) -> Self {
        MemoryMap { segments }
    }

    /// Declares the segments of a guest with `mem_size` bytes of RAM on a host whose low
    /// memory window ends at `lowmem_limit`.
    ///
    /// ```text
    /// 0     - 640K   usable
    /// 640K  - 1M     VGA window and BIOS, not declared
    /// 1M    - lowmem usable
    /// lowmem - 4G    not declared
    /// 4G    - 4G + himem  usable, only when memory exceeds the low-memory limit
    /// ```
    pub fn for_guest(mem_size: u64, lowmem_limit: u64) -> Self {
        let lowmem = mem_size.min(lowmem_limit);
        let mut segments = vec![MemorySegment::available(0, LEGACY_MEM_END - 1)];

        if lowmem > HIMEM_START {
            segments.push(MemorySegment::available(HIMEM_START, lowmem - 1));
        }

        if mem_size > lowmem_limit {
            let himem = mem_size - lowmem_limit;
            segments.push(MemorySegment::available(
                HIGH_MEM_START,
                HIGH_MEM_START + himem - 1,
            ));
        }

        MemoryMap { segments }
    }

    /// Iterates over every declared segment in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &MemorySegment> {
        self.segments.iter()
    }

    /// Iterates over the segments that may be allocated from.
    pub fn available(&self) -> impl Iterator<Item = &MemorySegment> {
        self.segments.iter().filter(|seg| seg.is_available())
    }

    /// Number of bytes of memory starting at 1 MiB, taken from the segment that straddles it.
    pub fn upper_memory(&self) -> u64 {
        self.segments
            .iter()
            .filter(|seg| seg.start <= HIMEM_START && seg.end >= HIMEM_START)
            .map(|seg| seg.end + 1 - HIMEM_START)
            .last()
            .unwrap_or(0)
    }

    /// Amount of lower memory reported to loaders. The host always provides the first MiB.
    pub fn lower_memory(&self) -> u64 {
        HIMEM_START
    }
}
