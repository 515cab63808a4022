// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

use crate::arch::x86_64::layout::HIMEM_START;
use crate::arch::{BootError, BootState, Handoff, configure_boot};
use crate::logger::{debug, info};
use crate::relocator::{Chunk, Relocator};
use crate::utils::u64_to_usize;
use crate::vstate::host::{HostError, HostInterface};
use crate::vstate::memory::MemoryMap;

/// Errors associated with creating a VM session.
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum VmError {
    /// Guest memory size {0:#x} must be larger than 1 MiB
    MemoryTooSmall(u64),
}

/// One guest being prepared for boot.
///
/// Owns the host handle, the memory map declared for the guest and the relocator that
/// places blocks in it. Everything here is driven from a single thread.
#[derive(Debug)]
pub struct Vm<H: HostInterface> {
    host: H,
    mem_size: u64,
    lowmem: u64,
    himem: u64,
    memory_map: MemoryMap,
    relocator: Option<Relocator>,
}

impl<H: HostInterface> Vm<H> {
    /// Declares the memory segments of a guest with `mem_size` bytes of RAM.
    pub fn new(host: H, mem_size: u64) -> Result<Self, VmError> {
        if mem_size <= HIMEM_START {
            return Err(VmError::MemoryTooSmall(mem_size));
        }

        let lowmem_limit = host.lowmem_limit();
        let lowmem = mem_size.min(lowmem_limit);
        let himem = mem_size.saturating_sub(lowmem_limit);
        let memory_map = MemoryMap::for_guest(mem_size, lowmem_limit);
        for seg in memory_map.iter() {
            debug!(
                "Guest memory segment [{:#x}, {:#x}] {:?}",
                seg.start, seg.end, seg.kind
            );
        }
        info!("Guest memory: {lowmem:#x} bytes low, {himem:#x} bytes high");

        Ok(Vm {
            host,
            mem_size,
            lowmem,
            himem,
            memory_map,
            relocator: None,
        })
    }

    /// Gets a reference to the host.
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Gets a mutable reference to the host.
    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// Total guest memory in bytes.
    pub fn mem_size(&self) -> u64 {
        self.mem_size
    }

    /// Size of the low memory window starting at guest physical address 0.
    pub fn lowmem(&self) -> u64 {
        self.lowmem
    }

    /// Size of the memory relocated above 4 GiB.
    pub fn himem(&self) -> u64 {
        self.himem
    }

    /// The segments declared for this guest.
    pub fn memory_map(&self) -> &MemoryMap {
        &self.memory_map
    }

    /// Returns the session's relocator, creating it on first use.
    pub fn relocator(&mut self) -> &mut Relocator {
        self.relocator
            .get_or_insert_with(|| Relocator::new(&self.memory_map))
    }

    /// Whether a relocator currently exists.
    pub fn has_relocator(&self) -> bool {
        self.relocator.is_some()
    }

    /// Frees every chunk along with the relocator. A no-op when there is none.
    pub fn release_relocator(&mut self) {
        if let Some(mut relocator) = self.relocator.take() {
            relocator.release();
        }
    }

    /// Host-writable view of the guest memory behind `chunk`.
    pub fn chunk_mut(&mut self, chunk: &Chunk) -> Result<&mut [u8], HostError> {
        self.host
            .map_range(chunk.target(), u64_to_usize(chunk.size()))
    }

    /// Programs the boot vCPU for `state` and hands the guest over to the host.
    ///
    /// This is a one-way step: once it returns successfully the guest state must not be
    /// touched again.
    pub fn boot(&mut self, state: &BootState) -> Result<Handoff, BootError> {
        let relocator = self
            .relocator
            .get_or_insert_with(|| Relocator::new(&self.memory_map));
        configure_boot(&mut self.host, relocator, self.lowmem, state)
    }
}
