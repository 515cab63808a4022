// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The capability a VM session needs from the hypervisor it drives.

use crate::arch::x86_64::gdt::SegmentDescriptor;
use crate::vstate::memory::GuestAddress;

/// Guest registers and segment registers that can be programmed before entry.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    Rip,
    Rflags,
    Cr0,
    Cr3,
    Cr4,
    Efer,
    Cs,
    Ds,
    Es,
    Fs,
    Gs,
    Ss,
    Tr,
    Ldtr,
    Gdtr,
    Idtr,
}

/// Register state handed to the host's composite 64-bit entry primitive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AlternateEntry {
    /// Kernel entry point.
    pub rip: u64,
    /// Root of the guest page tables.
    pub cr3: u64,
    /// Guest physical address of the descriptor table.
    pub gdt_base: u64,
    /// Initial stack pointer.
    pub rsp: u64,
}

/// Errors reported by a [`HostInterface`] primitive.
#[rustfmt::skip]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum HostError {
    /// Guest range at {0:#x} of length {1:#x} is not mapped
    MapRange(u64, usize),
    /// Failed to set register {0:?}: errno {1}
    SetRegister(Register, i32),
    /// Failed to set descriptor {0:?}: errno {1}
    SetDescriptor(Register, i32),
    /// Failed to set up the 64-bit entry register state: errno {0}
    SetupAlternateEntry(i32),
    /// Failed to resume the guest: errno {0}
    Resume(i32),
}

/// Primitives the relocator and boot-state initializer consume from the hypervisor.
///
/// Implementations are driven by a single thread; none of the methods lock.
pub trait HostInterface {
    /// Returns a host-writable view of the guest physical range `[base, base + len)`.
    fn map_range(&mut self, base: GuestAddress, len: usize) -> Result<&mut [u8], HostError>;

    /// Programs a single register of `vcpu`.
    fn set_register(&mut self, vcpu: u32, reg: Register, value: u64) -> Result<(), HostError>;

    /// Programs the hidden part (base, limit, access rights) of a segment or table register.
    fn set_descriptor(
        &mut self,
        vcpu: u32,
        reg: Register,
        desc: SegmentDescriptor,
    ) -> Result<(), HostError>;

    /// Programs control registers, paging mode and the descriptor-table register of `vcpu`
    /// as a unit, for a 64-bit kernel entry.
    fn setup_alternate_entry(&mut self, vcpu: u32, entry: AlternateEntry)
    -> Result<(), HostError>;

    /// Boundary between the contiguous low memory window and relocated high memory.
    fn lowmem_limit(&self) -> u64;

    /// Signals that boot state is complete and the guest may be run.
    fn resume(&mut self, vcpu: u32) -> Result<(), HostError>;
}
