// Copyright © 2020, Oracle and/or its affiliates.
// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

use serde::{Deserialize, Serialize};

use super::gdt::{GDT_ENTRY_SIZE, SEL_KPL, SegmentDescriptor, gdt_entry, selector, table_bytes};
use super::layout::{
    BOOT_SCRATCH_ALIGN, BOOT_SCRATCH_MAX, BOOT_SCRATCH_MIN, BOOT_TSS_BASE, BOOT_TSS_LIMIT,
    BOOT_VCPU,
};
use crate::arch::{BootError, Handoff};
use crate::logger::{debug, info, warn};
use crate::relocator::{Chunk, Relocator, RelocatorError};
use crate::utils::{align_up, usize_to_u64};
use crate::vstate::host::{AlternateEntry, HostError, HostInterface, Register};
use crate::vstate::memory::{Address, GuestAddress};

/// Entries of the descriptor table copied into the guest for 32-bit entry.
pub const PROTECTED_MODE_GDT_ENTRIES: usize = 5;
/// Entries of the descriptor table copied into the guest for 64-bit entry.
pub const LONG_MODE_GDT_ENTRIES: usize = 3;

/// Bytes reserved for the protected-mode boot scratch block.
pub const BOOT_SCRATCH_SIZE: usize = PROTECTED_MODE_GDT_ENTRIES * GDT_ENTRY_SIZE;

const GUEST_CODE_SEL: u16 = 2;
const GUEST_DATA_SEL: u16 = 3;
const GUEST_TSS_SEL: u16 = 4;

const X86_CR0_PE: u64 = 0x1;
// Reserved bit 1 set, interrupts disabled.
const RFLAGS_RESERVED: u64 = 0x2;

/// General purpose register values a 32-bit protected-mode kernel is entered with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[allow(missing_docs)]
#[serde(default, deny_unknown_fields)]
pub struct ProtectedModeRegs {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    /// Kernel entry point.
    pub eip: u32,
    pub esp: u32,
    pub ebp: u32,
    /// Pointer to the boot parameter structure handed to the kernel.
    pub esi: u32,
    pub edi: u32,
}

/// Register values a 64-bit FreeBSD kernel is entered with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[allow(missing_docs)]
#[serde(default, deny_unknown_fields)]
pub struct LongModeRegs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    /// Kernel entry point.
    pub rip: u64,
    pub rsp: u64,
    /// Root of the page tables the loader built.
    pub cr3: u64,
}

/// The descriptor table a 32-bit kernel finds in GDTR: two null entries, then flat code,
/// flat data and a task-state entry. Selectors 0x10 and 0x18 are the boot CS and DS.
pub fn protected_mode_gdt() -> [u64; PROTECTED_MODE_GDT_ENTRIES] {
    [
        gdt_entry(0, 0, 0),            // NULL
        gdt_entry(0, 0, 0),            // NULL
        gdt_entry(0xc09a, 0, 0xfffff), // CODE
        gdt_entry(0xc092, 0, 0xfffff), // DATA
        gdt_entry(0x8089, 0, 0),       // TSS
    ]
}

/// The descriptor table a 64-bit FreeBSD kernel finds in GDTR.
pub fn long_mode_gdt() -> [u64; LONG_MODE_GDT_ENTRIES] {
    [
        gdt_entry(0, 0, 0),      // NULL
        gdt_entry(0x2098, 0, 0), // CODE, long mode
        gdt_entry(0x0090, 0, 0), // DATA
    ]
}

fn code_segment() -> SegmentDescriptor {
    SegmentDescriptor::from_gdt(gdt_entry(0xc09b, 0, 0xfffff))
}

fn data_segment() -> SegmentDescriptor {
    SegmentDescriptor::from_gdt(gdt_entry(0xc093, 0, 0xfffff))
}

// The TSS is never used but VM entry requires TR to be usable and busy.
fn tss_segment() -> SegmentDescriptor {
    #[allow(clippy::cast_possible_truncation)]
    let base = BOOT_TSS_BASE as u32;
    SegmentDescriptor::from_gdt(gdt_entry(0x008b, base, BOOT_TSS_LIMIT))
}

fn ldt_segment() -> SegmentDescriptor {
    SegmentDescriptor::from_gdt(gdt_entry(0x0082, 0, 0xffff)).unusable()
}

/// Places the protected-mode scratch block in the low window, or right after the highest
/// placed chunk once that window is used up.
fn place_boot_scratch(relocator: &mut Relocator, size: u64) -> Result<Chunk, RelocatorError> {
    match relocator.allocate_anywhere(
        GuestAddress(BOOT_SCRATCH_MIN),
        GuestAddress(BOOT_SCRATCH_MAX),
        size,
        BOOT_SCRATCH_ALIGN,
    ) {
        Ok(chunk) => Ok(chunk),
        Err(RelocatorError::OutOfMemory) => Err(RelocatorError::OutOfMemory),
        Err(_) => {
            let end = relocator.end_of_allocations().raw_value();
            let target = align_up(end, BOOT_SCRATCH_ALIGN).ok_or(RelocatorError::OutOfRange)?;
            relocator.allocate_at(GuestAddress(target), size)
        }
    }
}

fn write_gdt_table<H: HostInterface>(
    host: &mut H,
    addr: GuestAddress,
    bytes: &[u8],
) -> Result<(), BootError> {
    host.map_range(addr, bytes.len())
        .map_err(BootError::CopyDescriptorTable)?
        .copy_from_slice(bytes);
    Ok(())
}

fn configure_protected_mode_sregs<H: HostInterface>(host: &mut H) -> Result<(), HostError> {
    // Protected mode, paging disabled, no extensions.
    host.set_register(BOOT_VCPU, Register::Cr0, X86_CR0_PE)?;
    host.set_register(BOOT_VCPU, Register::Cr4, 0)?;
    host.set_register(BOOT_VCPU, Register::Rflags, RFLAGS_RESERVED)?;

    let data_seg = data_segment();
    host.set_descriptor(BOOT_VCPU, Register::Cs, code_segment())?;
    for reg in [
        Register::Ds,
        Register::Es,
        Register::Fs,
        Register::Gs,
        Register::Ss,
    ] {
        host.set_descriptor(BOOT_VCPU, reg, data_seg)?;
    }
    host.set_descriptor(BOOT_VCPU, Register::Tr, tss_segment())?;
    host.set_descriptor(BOOT_VCPU, Register::Ldtr, ldt_segment())?;

    host.set_register(
        BOOT_VCPU,
        Register::Cs,
        u64::from(selector(GUEST_CODE_SEL, SEL_KPL)),
    )?;
    let data_sel = u64::from(selector(GUEST_DATA_SEL, SEL_KPL));
    for reg in [
        Register::Ds,
        Register::Es,
        Register::Fs,
        Register::Gs,
        Register::Ss,
    ] {
        host.set_register(BOOT_VCPU, reg, data_sel)?;
    }
    host.set_register(
        BOOT_VCPU,
        Register::Tr,
        u64::from(selector(GUEST_TSS_SEL, SEL_KPL)),
    )?;
    host.set_register(BOOT_VCPU, Register::Ldtr, 0)?;

    Ok(())
}

fn signal_handoff<H: HostInterface>(host: &mut H, table_addr: u64) -> Result<Handoff, BootError> {
    if table_addr == 0 {
        warn!("Descriptor table landed at address 0, not resuming the guest");
        return Ok(Handoff::Withheld);
    }
    host.resume(BOOT_VCPU)?;
    Ok(Handoff::Resumed)
}

/// Brings the boot vCPU into the state a 32-bit protected-mode kernel expects at entry:
/// flat 4 GiB CS and DS/ES/FS/GS/SS, paging disabled, interrupts disabled.
///
/// The scratch block holding the descriptor table is placed before any register is touched,
/// so a placement failure leaves the vCPU as it was.
///
/// # Errors
///
/// * [`BootError::Placement`] when the scratch block can not be placed.
/// * [`BootError::Program`] or [`BootError::CopyDescriptorTable`] when the host fails.
pub fn setup_protected_mode_entry<H: HostInterface>(
    host: &mut H,
    relocator: &mut Relocator,
    regs: &ProtectedModeRegs,
) -> Result<Handoff, BootError> {
    let gdt = table_bytes(&protected_mode_gdt());
    let scratch = place_boot_scratch(relocator, usize_to_u64(gdt.len()))
        .map_err(BootError::Placement)?;
    let gdt_addr = scratch.target();
    debug!("Boot descriptor table placed at {:#x}", gdt_addr.raw_value());

    configure_protected_mode_sregs(host)?;
    host.set_register(BOOT_VCPU, Register::Rip, u64::from(regs.eip))?;

    write_gdt_table(host, gdt_addr, &gdt)?;
    #[allow(clippy::cast_possible_truncation)]
    let limit = (gdt.len() - 1) as u32;
    host.set_descriptor(
        BOOT_VCPU,
        Register::Gdtr,
        SegmentDescriptor::new(gdt_addr.raw_value(), limit, 0),
    )?;

    // %esi carries the boot parameters; %ebp, %edi and %ebx are passed through as given.
    for (reg, value) in [
        (Register::Rsp, regs.esp),
        (Register::Rsi, regs.esi),
        (Register::Rbp, regs.ebp),
        (Register::Rdi, regs.edi),
        (Register::Rbx, regs.ebx),
        (Register::Rax, regs.eax),
        (Register::Rcx, regs.ecx),
        (Register::Rdx, regs.edx),
    ] {
        host.set_register(BOOT_VCPU, reg, u64::from(value))?;
    }

    info!("Entering 32-bit kernel at {:#x}", regs.eip);
    signal_handoff(host, gdt_addr.raw_value())
}

/// Brings the boot vCPU into the state a 64-bit FreeBSD kernel expects at entry.
///
/// The descriptor table is copied two table sizes below the top of low memory, which is a
/// fixed spot and is not tracked by the relocator. Paging, control registers and GDTR are
/// programmed by the host as a unit; the loader must already have built the page tables
/// rooted at `regs.cr3`.
pub fn setup_freebsd_entry<H: HostInterface>(
    host: &mut H,
    lowmem: u64,
    regs: &LongModeRegs,
) -> Result<Handoff, BootError> {
    let gdt = table_bytes(&long_mode_gdt());
    let gdt_addr = usize_to_u64(gdt.len())
        .checked_mul(2)
        .and_then(|offset| lowmem.checked_sub(offset))
        .ok_or(BootError::Placement(RelocatorError::OutOfRange))?;
    debug!("64-bit descriptor table placed at {gdt_addr:#x}");

    write_gdt_table(host, GuestAddress(gdt_addr), &gdt)?;
    host.setup_alternate_entry(
        BOOT_VCPU,
        AlternateEntry {
            rip: regs.rip,
            cr3: regs.cr3,
            gdt_base: gdt_addr,
            rsp: regs.rsp,
        },
    )?;

    for (reg, value) in [
        (Register::Rax, regs.rax),
        (Register::Rbx, regs.rbx),
        (Register::Rcx, regs.rcx),
        (Register::Rdx, regs.rdx),
        (Register::Rsi, regs.rsi),
    ] {
        host.set_register(BOOT_VCPU, reg, value)?;
    }

    info!("Entering 64-bit kernel at {:#x}", regs.rip);
    signal_handoff(host, gdt_addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86_64::gdt::DESC_UNUSABLE;
    use crate::test_utils::{FAKE_LOWMEM_LIMIT, FakeHost};
    use crate::utils::MIB;
    use crate::vstate::memory::{MemoryMap, MemorySegment};

    const MEM_SIZE: u64 = 16 * MIB;

    fn setup() -> (FakeHost, Relocator) {
        let host = FakeHost::new(MEM_SIZE, FAKE_LOWMEM_LIMIT);
        let relocator = Relocator::new(&MemoryMap::for_guest(MEM_SIZE, FAKE_LOWMEM_LIMIT));
        (host, relocator)
    }

    fn linux_regs() -> ProtectedModeRegs {
        ProtectedModeRegs {
            eip: 0x0010_0000,
            esp: 0x0009_0000,
            esi: 0x0000_7000,
            eax: 0x2bad_b002,
            ..Default::default()
        }
    }

    #[test]
    fn test_protected_mode_gdt_layout() {
        let bytes = table_bytes(&protected_mode_gdt());
        let words: Vec<u16> = bytes
            .chunks(2)
            .map(|w| u16::from_le_bytes([w[0], w[1]]))
            .collect();
        assert_eq!(
            words,
            vec![
                0x0000, 0x0000, 0x0000, 0x0000, // null
                0x0000, 0x0000, 0x0000, 0x0000, // null #2
                0xffff, 0x0000, 0x9a00, 0x00cf, // code
                0xffff, 0x0000, 0x9200, 0x00cf, // data
                0x0000, 0x0000, 0x8900, 0x0080, // tss
            ]
        );
        assert_eq!(bytes.len(), BOOT_SCRATCH_SIZE);
    }

    #[test]
    fn test_long_mode_gdt_layout() {
        assert_eq!(
            long_mode_gdt(),
            [0, 0x0020_9800_0000_0000, 0x0000_9000_0000_0000]
        );
    }

    #[test]
    fn test_segment_access_rights() {
        assert_eq!(
            code_segment(),
            SegmentDescriptor::new(0, 0xffff_ffff, 0xc09b)
        );
        assert_eq!(
            data_segment(),
            SegmentDescriptor::new(0, 0xffff_ffff, 0xc093)
        );
        assert_eq!(tss_segment(), SegmentDescriptor::new(0x1000, 0x67, 0x8b));
        assert_eq!(
            ldt_segment(),
            SegmentDescriptor::new(0, 0xffff, DESC_UNUSABLE | 0x82)
        );
    }

    #[test]
    fn test_protected_mode_entry() {
        let (mut host, mut relocator) = setup();
        let regs = linux_regs();

        let handoff = setup_protected_mode_entry(&mut host, &mut relocator, &regs).unwrap();
        assert_eq!(handoff, Handoff::Resumed);
        assert!(host.resumed);

        assert_eq!(host.register(Register::Cr0), Some(X86_CR0_PE));
        assert_eq!(host.register(Register::Cr4), Some(0));
        assert_eq!(host.register(Register::Rflags), Some(0x2));
        assert_eq!(host.register(Register::Rip), Some(0x0010_0000));
        assert_eq!(host.register(Register::Rsp), Some(0x0009_0000));
        assert_eq!(host.register(Register::Rsi), Some(0x7000));
        assert_eq!(host.register(Register::Rax), Some(0x2bad_b002));
        for reg in [Register::Rbp, Register::Rdi, Register::Rbx] {
            assert_eq!(host.register(reg), Some(0));
        }

        assert_eq!(host.register(Register::Cs), Some(0x10));
        for reg in [
            Register::Ds,
            Register::Es,
            Register::Fs,
            Register::Gs,
            Register::Ss,
        ] {
            assert_eq!(host.register(reg), Some(0x18));
            assert_eq!(host.descriptor(reg), Some(data_segment()));
        }
        assert_eq!(host.register(Register::Tr), Some(0x20));
        assert_eq!(host.register(Register::Ldtr), Some(0));
        assert_eq!(host.descriptor(Register::Cs), Some(code_segment()));
        assert!(host.descriptor(Register::Ldtr).unwrap().is_unusable());
        assert_eq!(host.descriptor(Register::Tr).unwrap().access & 0x80, 0x80);
    }

    #[test]
    fn test_protected_mode_gdt_copied_to_scratch() {
        let (mut host, mut relocator) = setup();
        setup_protected_mode_entry(&mut host, &mut relocator, &linux_regs()).unwrap();

        let chunk = relocator.chunks()[0];
        assert_eq!(chunk.target(), GuestAddress(BOOT_SCRATCH_MIN));
        assert_eq!(chunk.size(), 40);

        let gdtr = host.descriptor(Register::Gdtr).unwrap();
        assert_eq!(gdtr, SegmentDescriptor::new(BOOT_SCRATCH_MIN, 39, 0));
        assert_eq!(host.read_u64(BOOT_SCRATCH_MIN), 0);
        assert_eq!(host.read_u64(BOOT_SCRATCH_MIN + 16), 0x00cf_9a00_0000_ffff);
        assert_eq!(host.read_u64(BOOT_SCRATCH_MIN + 24), 0x00cf_9200_0000_ffff);
        assert_eq!(host.read_u64(BOOT_SCRATCH_MIN + 32), 0x0080_8900_0000_0000);
    }

    #[test]
    fn test_protected_mode_scratch_falls_back_to_end_of_allocations() {
        let (mut host, mut relocator) = setup();
        relocator.allocate_at(GuestAddress(0x200), 0xEF04).unwrap();

        setup_protected_mode_entry(&mut host, &mut relocator, &linux_regs()).unwrap();

        let gdtr = host.descriptor(Register::Gdtr).unwrap();
        assert_eq!(gdtr.base, 0xF108);
        assert_eq!(host.read_u64(0xF108 + 16), 0x00cf_9a00_0000_ffff);
    }

    #[test]
    fn test_protected_mode_placement_failure_leaves_vcpu_untouched() {
        let mut host = FakeHost::new(MEM_SIZE, FAKE_LOWMEM_LIMIT);
        let mut relocator = Relocator::new(&MemoryMap::new(Vec::new()));

        let err = setup_protected_mode_entry(&mut host, &mut relocator, &linux_regs()).unwrap_err();
        assert_eq!(err, BootError::Placement(RelocatorError::OutOfRange));
        assert!(host.registers.is_empty());
        assert!(host.descriptors.is_empty());
        assert!(!host.resumed);
    }

    #[test]
    fn test_protected_mode_register_failure_does_not_resume() {
        let (mut host, mut relocator) = setup();
        host.fail_on = Some(Register::Rsi);

        let err = setup_protected_mode_entry(&mut host, &mut relocator, &linux_regs()).unwrap_err();
        assert_eq!(
            err,
            BootError::Program(HostError::SetRegister(Register::Rsi, libc::EINVAL))
        );
        assert!(!host.resumed);
    }

    #[test]
    fn test_protected_mode_table_at_zero_is_withheld() {
        let mut host = FakeHost::new(MEM_SIZE, FAKE_LOWMEM_LIMIT);
        // Nothing fits in the scratch window, and the end of allocations is 0.
        let map = MemoryMap::new(vec![MemorySegment::available(0, 0x1ff)]);
        let mut relocator = Relocator::new(&map);

        let handoff = setup_protected_mode_entry(&mut host, &mut relocator, &linux_regs()).unwrap();
        assert_eq!(handoff, Handoff::Withheld);
        assert!(!host.resumed);
        assert_eq!(relocator.chunks()[0].target(), GuestAddress(0));
        assert_eq!(
            host.descriptor(Register::Gdtr),
            Some(SegmentDescriptor::new(0, 39, 0))
        );
        assert_eq!(host.read_u64(16), 0x00cf_9a00_0000_ffff);
        assert_eq!(host.register(Register::Rip), Some(0x0010_0000));
    }

    #[test]
    fn test_freebsd_table_at_zero_is_withheld() {
        let mut host = FakeHost::new(MEM_SIZE, FAKE_LOWMEM_LIMIT);
        let regs = LongModeRegs {
            rip: 0x0020_0000,
            ..Default::default()
        };

        let handoff = setup_freebsd_entry(&mut host, 48, &regs).unwrap();
        assert_eq!(handoff, Handoff::Withheld);
        assert!(!host.resumed);
        assert_eq!(host.alternate_entry.map(|entry| entry.gdt_base), Some(0));
        assert_eq!(host.read_u64(8), 0x0020_9800_0000_0000);
    }

    #[test]
    fn test_freebsd_entry_low_memory_too_small() {
        let mut host = FakeHost::new(MEM_SIZE, FAKE_LOWMEM_LIMIT);

        let err = setup_freebsd_entry(&mut host, 40, &LongModeRegs::default()).unwrap_err();
        assert_eq!(err, BootError::Placement(RelocatorError::OutOfRange));
        assert!(host.alternate_entry.is_none());
        assert!(host.registers.is_empty());
        assert!(!host.resumed);
    }

    #[test]
    fn test_freebsd_entry() {
        let mut host = FakeHost::new(MEM_SIZE, FAKE_LOWMEM_LIMIT);
        let regs = LongModeRegs {
            rip: 0xffff_ffff_8020_0000,
            cr3: 0x0030_0000,
            rsp: 0x0040_0000,
            rax: 1,
            rbx: 2,
            rcx: 3,
            rdx: 4,
            rsi: 5,
        };

        let handoff = setup_freebsd_entry(&mut host, MEM_SIZE, &regs).unwrap();
        assert_eq!(handoff, Handoff::Resumed);
        assert!(host.resumed);

        let gdt_addr = MEM_SIZE - 48;
        assert_eq!(
            host.alternate_entry,
            Some(AlternateEntry {
                rip: regs.rip,
                cr3: regs.cr3,
                gdt_base: gdt_addr,
                rsp: regs.rsp,
            })
        );
        assert_eq!(host.read_u64(gdt_addr), 0);
        assert_eq!(host.read_u64(gdt_addr + 8), 0x0020_9800_0000_0000);
        assert_eq!(host.read_u64(gdt_addr + 16), 0x0000_9000_0000_0000);
        assert_eq!(host.register(Register::Rax), Some(1));
        assert_eq!(host.register(Register::Rbx), Some(2));
        assert_eq!(host.register(Register::Rcx), Some(3));
        assert_eq!(host.register(Register::Rdx), Some(4));
        assert_eq!(host.register(Register::Rsi), Some(5));
    }

    #[test]
    fn test_freebsd_entry_unmapped_table() {
        let mut host = FakeHost::new(MEM_SIZE, FAKE_LOWMEM_LIMIT);
        let err = setup_freebsd_entry(&mut host, 2 * MEM_SIZE, &LongModeRegs::default())
            .unwrap_err();
        assert!(matches!(err, BootError::CopyDescriptorTable(_)));
        assert!(host.alternate_entry.is_none());
        assert!(!host.resumed);
    }
}
