// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![allow(missing_docs)]

use std::collections::BTreeMap;

use crate::arch::x86_64::gdt::SegmentDescriptor;
use crate::arch::x86_64::layout::HIGH_MEM_START;
use crate::utils::{GIB, u64_to_usize};
use crate::vstate::host::{AlternateEntry, HostError, HostInterface, Register};
use crate::vstate::memory::{Address, GuestAddress};
use crate::vstate::vm::Vm;

/// Low-memory limit reported by [`FakeHost`] unless overridden.
pub const FAKE_LOWMEM_LIMIT: u64 = 3 * GIB;

/// An in-memory stand-in for the hypervisor that records every primitive it is asked for.
#[derive(Debug, Default)]
pub struct FakeHost {
    pub lowmem_limit: u64,
    pub low: Vec<u8>,
    pub high: Vec<u8>,
    pub registers: BTreeMap<Register, u64>,
    pub descriptors: BTreeMap<Register, SegmentDescriptor>,
    pub alternate_entry: Option<AlternateEntry>,
    pub resumed: bool,
    /// Register whose programming is made to fail, for error path tests.
    pub fail_on: Option<Register>,
}

impl FakeHost {
    /// Backs `mem_size` bytes of guest memory split around `lowmem_limit`.
    pub fn new(mem_size: u64, lowmem_limit: u64) -> Self {
        let lowmem = mem_size.min(lowmem_limit);
        let himem = mem_size.saturating_sub(lowmem_limit);
        FakeHost {
            lowmem_limit,
            low: vec![0; u64_to_usize(lowmem)],
            high: vec![0; u64_to_usize(himem)],
            ..Default::default()
        }
    }

    pub fn register(&self, reg: Register) -> Option<u64> {
        self.registers.get(&reg).copied()
    }

    pub fn descriptor(&self, reg: Register) -> Option<SegmentDescriptor> {
        self.descriptors.get(&reg).copied()
    }

    pub fn read(&self, addr: u64, len: usize) -> &[u8] {
        let start = u64_to_usize(addr);
        &self.low[start..start + len]
    }

    pub fn read_u64(&self, addr: u64) -> u64 {
        u64::from_le_bytes(self.read(addr, 8).try_into().unwrap())
    }
}

impl HostInterface for FakeHost {
    fn map_range(&mut self, base: GuestAddress, len: usize) -> Result<&mut [u8], HostError> {
        let addr = base.raw_value();
        let unmapped = HostError::MapRange(addr, len);
        let (window, offset) = if addr < HIGH_MEM_START {
            (&mut self.low, addr)
        } else {
            (&mut self.high, addr - HIGH_MEM_START)
        };
        let start = u64_to_usize(offset);
        let end = start.checked_add(len).ok_or(unmapped.clone())?;
        window.get_mut(start..end).ok_or(unmapped)
    }

    fn set_register(&mut self, _vcpu: u32, reg: Register, value: u64) -> Result<(), HostError> {
        if self.fail_on == Some(reg) {
            return Err(HostError::SetRegister(reg, libc::EINVAL));
        }
        self.registers.insert(reg, value);
        Ok(())
    }

    fn set_descriptor(
        &mut self,
        _vcpu: u32,
        reg: Register,
        desc: SegmentDescriptor,
    ) -> Result<(), HostError> {
        if self.fail_on == Some(reg) {
            return Err(HostError::SetDescriptor(reg, libc::EINVAL));
        }
        self.descriptors.insert(reg, desc);
        Ok(())
    }

    fn setup_alternate_entry(
        &mut self,
        _vcpu: u32,
        entry: AlternateEntry,
    ) -> Result<(), HostError> {
        self.alternate_entry = Some(entry);
        self.registers.insert(Register::Rip, entry.rip);
        self.registers.insert(Register::Cr3, entry.cr3);
        self.registers.insert(Register::Rsp, entry.rsp);
        Ok(())
    }

    fn lowmem_limit(&self) -> u64 {
        self.lowmem_limit
    }

    fn resume(&mut self, _vcpu: u32) -> Result<(), HostError> {
        self.resumed = true;
        Ok(())
    }
}

/// Creates a VM session over a [`FakeHost`] with `mem_size` bytes of memory.
pub fn fake_vm(mem_size: u64) -> Vm<FakeHost> {
    Vm::new(FakeHost::new(mem_size, FAKE_LOWMEM_LIMIT), mem_size).unwrap()
}
