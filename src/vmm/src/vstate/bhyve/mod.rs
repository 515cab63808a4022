// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Host backend driving FreeBSD's bhyve through libvmmapi.

mod bindings;

use std::ffi::{CString, NulError};
use std::io;
use std::os::raw::c_int;
use std::ptr::NonNull;

use bindings::*;

use crate::arch::x86_64::gdt::SegmentDescriptor;
use crate::arch::x86_64::layout::HIGH_MEM_START;
use crate::logger::{debug, info};
use crate::utils::{u64_to_usize, usize_to_u64};
use crate::vstate::host::{AlternateEntry, HostError, HostInterface, Register};
use crate::vstate::memory::{Address, GuestAddress};

/// Errors associated with opening and setting up a bhyve VM.
#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum BhyveError {
    /// Invalid VM name: {0}
    InvalidName(#[from] NulError),
    /// Failed to create VM: {0}
    Create(io::Error),
    /// Failed to open VM: {0}
    Open(io::Error),
    /// Failed to reinitialize existing VM: {0}
    Reinit(io::Error),
    /// The host does not support unrestricted guest execution.
    UnrestrictedGuestUnsupported,
    /// Failed to enable unrestricted guest execution: {0}
    EnableUnrestrictedGuest(io::Error),
    /// Failed to set up {0:#x} bytes of guest memory: {1}
    SetupMemory(u64, io::Error),
    /// Failed to map guest memory at {0:#x}
    MapMemory(u64),
}

// libvmmapi calls either return an errno value directly or return -1 with errno set.
fn vmmapi_error(ret: c_int) -> io::Error {
    match ret {
        ret if ret > 0 => io::Error::from_raw_os_error(ret),
        _ => io::Error::last_os_error(),
    }
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn reg_name(reg: Register) -> c_int {
    let name = match reg {
        Register::Rax => vm_reg_name::VM_REG_GUEST_RAX,
        Register::Rbx => vm_reg_name::VM_REG_GUEST_RBX,
        Register::Rcx => vm_reg_name::VM_REG_GUEST_RCX,
        Register::Rdx => vm_reg_name::VM_REG_GUEST_RDX,
        Register::Rsi => vm_reg_name::VM_REG_GUEST_RSI,
        Register::Rdi => vm_reg_name::VM_REG_GUEST_RDI,
        Register::Rbp => vm_reg_name::VM_REG_GUEST_RBP,
        Register::Rsp => vm_reg_name::VM_REG_GUEST_RSP,
        Register::Rip => vm_reg_name::VM_REG_GUEST_RIP,
        Register::Rflags => vm_reg_name::VM_REG_GUEST_RFLAGS,
        Register::Cr0 => vm_reg_name::VM_REG_GUEST_CR0,
        Register::Cr3 => vm_reg_name::VM_REG_GUEST_CR3,
        Register::Cr4 => vm_reg_name::VM_REG_GUEST_CR4,
        Register::Efer => vm_reg_name::VM_REG_GUEST_EFER,
        Register::Cs => vm_reg_name::VM_REG_GUEST_CS,
        Register::Ds => vm_reg_name::VM_REG_GUEST_DS,
        Register::Es => vm_reg_name::VM_REG_GUEST_ES,
        Register::Fs => vm_reg_name::VM_REG_GUEST_FS,
        Register::Gs => vm_reg_name::VM_REG_GUEST_GS,
        Register::Ss => vm_reg_name::VM_REG_GUEST_SS,
        Register::Tr => vm_reg_name::VM_REG_GUEST_TR,
        Register::Ldtr => vm_reg_name::VM_REG_GUEST_LDTR,
        Register::Gdtr => vm_reg_name::VM_REG_GUEST_GDTR,
        Register::Idtr => vm_reg_name::VM_REG_GUEST_IDTR,
    };
    name as c_int
}

/// A bhyve VM whose memory is mapped into this process.
#[derive(Debug)]
pub struct BhyveVm {
    ctx: NonNull<vmctx>,
    lowmem_limit: u64,
    lowmem: u64,
    himem: u64,
    low: NonNull<u8>,
    high: Option<NonNull<u8>>,
    resumed: bool,
}

impl BhyveVm {
    /// Creates the VM `name`, or reinitializes it when it already exists, and sets up and
    /// maps `mem_size` bytes of guest memory.
    pub fn new(name: &str, mem_size: u64) -> Result<Self, BhyveError> {
        let c_name = CString::new(name)?;

        // SAFETY: `c_name` is a valid NUL-terminated string.
        let created = unsafe { vm_create(c_name.as_ptr()) } == 0;
        if !created && last_errno() != libc::EEXIST {
            return Err(BhyveError::Create(io::Error::last_os_error()));
        }

        // SAFETY: `c_name` is a valid NUL-terminated string.
        let ctx = NonNull::new(unsafe { vm_open(c_name.as_ptr()) })
            .ok_or_else(|| BhyveError::Open(io::Error::last_os_error()))?;

        if !created {
            info!("Reinitializing existing VM {name}");
            // SAFETY: `ctx` was returned by `vm_open`.
            if unsafe { vm_reinit(ctx.as_ptr()) } != 0 {
                return Err(BhyveError::Reinit(io::Error::last_os_error()));
            }
        }

        let mut supported: c_int = 0;
        // SAFETY: `ctx` was returned by `vm_open` and `supported` outlives the call.
        let ret = unsafe {
            vm_get_capability(ctx.as_ptr(), 0, VM_CAP_UNRESTRICTED_GUEST, &mut supported)
        };
        if ret != 0 {
            return Err(BhyveError::UnrestrictedGuestUnsupported);
        }
        // SAFETY: `ctx` was returned by `vm_open`.
        if unsafe { vm_set_capability(ctx.as_ptr(), 0, VM_CAP_UNRESTRICTED_GUEST, 1) } != 0 {
            return Err(BhyveError::EnableUnrestrictedGuest(
                io::Error::last_os_error(),
            ));
        }

        // SAFETY: `ctx` was returned by `vm_open`.
        let ret = unsafe { vm_setup_memory(ctx.as_ptr(), u64_to_usize(mem_size), VM_MMAP_ALL) };
        if ret != 0 {
            return Err(BhyveError::SetupMemory(mem_size, vmmapi_error(ret)));
        }

        // SAFETY: `ctx` was returned by `vm_open`.
        let lowmem_limit = u64::from(unsafe { vm_get_lowmem_limit(ctx.as_ptr()) });
        let lowmem = mem_size.min(lowmem_limit);
        let himem = mem_size.saturating_sub(lowmem_limit);

        let low = Self::map_window(ctx, 0, lowmem)?;
        let high = match himem {
            0 => None,
            len => Some(Self::map_window(ctx, HIGH_MEM_START, len)?),
        };
        debug!("Mapped {lowmem:#x} bytes of low and {himem:#x} bytes of high memory");

        Ok(BhyveVm {
            ctx,
            lowmem_limit,
            lowmem,
            himem,
            low,
            high,
            resumed: false,
        })
    }

    fn map_window(ctx: NonNull<vmctx>, gpa: u64, len: u64) -> Result<NonNull<u8>, BhyveError> {
        // SAFETY: `ctx` was returned by `vm_open` and its memory was set up.
        let ptr = unsafe { vm_map_gpa(ctx.as_ptr(), gpa, u64_to_usize(len)) };
        NonNull::new(ptr.cast::<u8>()).ok_or(BhyveError::MapMemory(gpa))
    }

    /// Whether the guest was handed over to bhyve.
    pub fn resumed(&self) -> bool {
        self.resumed
    }
}

impl HostInterface for BhyveVm {
    fn map_range(&mut self, base: GuestAddress, len: usize) -> Result<&mut [u8], HostError> {
        let addr = base.raw_value();
        let unmapped = HostError::MapRange(addr, len);
        let (window, window_len, offset) = if addr < HIGH_MEM_START {
            (Some(self.low), self.lowmem, addr)
        } else {
            (self.high, self.himem, addr - HIGH_MEM_START)
        };
        let window = window.ok_or(unmapped.clone())?;
        let end = offset
            .checked_add(usize_to_u64(len))
            .ok_or(unmapped.clone())?;
        if end > window_len {
            return Err(unmapped);
        }

        // SAFETY: `[offset, end)` lies within a window of `window_len` bytes that
        // `vm_map_gpa` mapped for the lifetime of the VM, and the returned slice borrows
        // `self` mutably so no other view of it exists.
        Ok(unsafe {
            std::slice::from_raw_parts_mut(window.as_ptr().add(u64_to_usize(offset)), len)
        })
    }

    fn set_register(&mut self, vcpu: u32, reg: Register, value: u64) -> Result<(), HostError> {
        let vcpu = c_int::try_from(vcpu).map_err(|_| HostError::SetRegister(reg, libc::EINVAL))?;
        // SAFETY: `ctx` was returned by `vm_open`.
        match unsafe { vm_set_register(self.ctx.as_ptr(), vcpu, reg_name(reg), value) } {
            0 => Ok(()),
            _ => Err(HostError::SetRegister(reg, last_errno())),
        }
    }

    fn set_descriptor(
        &mut self,
        vcpu: u32,
        reg: Register,
        desc: SegmentDescriptor,
    ) -> Result<(), HostError> {
        let vcpu = c_int::try_from(vcpu).map_err(|_| HostError::SetDescriptor(reg, libc::EINVAL))?;
        // SAFETY: `ctx` was returned by `vm_open`.
        let ret = unsafe {
            vm_set_desc(
                self.ctx.as_ptr(),
                vcpu,
                reg_name(reg),
                desc.base,
                desc.limit,
                desc.access,
            )
        };
        match ret {
            0 => Ok(()),
            _ => Err(HostError::SetDescriptor(reg, last_errno())),
        }
    }

    fn setup_alternate_entry(
        &mut self,
        vcpu: u32,
        entry: AlternateEntry,
    ) -> Result<(), HostError> {
        let vcpu = c_int::try_from(vcpu).map_err(|_| HostError::SetupAlternateEntry(libc::EINVAL))?;
        // SAFETY: `ctx` was returned by `vm_open`.
        let ret = unsafe {
            vm_setup_freebsd_registers(
                self.ctx.as_ptr(),
                vcpu,
                entry.rip,
                entry.cr3,
                entry.gdt_base,
                entry.rsp,
            )
        };
        match ret {
            0 => Ok(()),
            _ => Err(HostError::SetupAlternateEntry(last_errno())),
        }
    }

    fn lowmem_limit(&self) -> u64 {
        self.lowmem_limit
    }

    // bhyve(8) runs the guest once this process exits; record the handoff.
    fn resume(&mut self, vcpu: u32) -> Result<(), HostError> {
        info!("vCPU {vcpu} ready, handing the guest over to bhyve");
        self.resumed = true;
        Ok(())
    }
}
