// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0

#![allow(non_camel_case_types)]
#![allow(missing_docs)]

//! Raw FFI bindings for the FreeBSD libvmmapi library

use std::os::raw::*;

/// Opaque VM handle (`struct vmctx`)
#[repr(C)]
#[derive(Debug)]
pub struct vmctx {
    _private: [u8; 0],
}

/// Guest physical address
pub type vm_paddr_t = u64;

/// Register names understood by `vm_set_register` and `vm_set_desc` (`enum vm_reg_name`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub enum vm_reg_name {
    VM_REG_GUEST_RAX = 0,
    VM_REG_GUEST_RBX = 1,
    VM_REG_GUEST_RCX = 2,
    VM_REG_GUEST_RDX = 3,
    VM_REG_GUEST_RSI = 4,
    VM_REG_GUEST_RDI = 5,
    VM_REG_GUEST_RBP = 6,
    VM_REG_GUEST_CR0 = 15,
    VM_REG_GUEST_CR3 = 16,
    VM_REG_GUEST_CR4 = 17,
    VM_REG_GUEST_RSP = 19,
    VM_REG_GUEST_RIP = 20,
    VM_REG_GUEST_RFLAGS = 21,
    VM_REG_GUEST_ES = 22,
    VM_REG_GUEST_CS = 23,
    VM_REG_GUEST_SS = 24,
    VM_REG_GUEST_DS = 25,
    VM_REG_GUEST_FS = 26,
    VM_REG_GUEST_GS = 27,
    VM_REG_GUEST_LDTR = 28,
    VM_REG_GUEST_TR = 29,
    VM_REG_GUEST_IDTR = 30,
    VM_REG_GUEST_GDTR = 31,
    VM_REG_GUEST_EFER = 32,
}

/// Unrestricted guest execution (`VM_CAP_UNRESTRICTED_GUEST`)
pub const VM_CAP_UNRESTRICTED_GUEST: c_int = 3;
/// Map all guest memory into the caller (`VM_MMAP_ALL`, after `VM_MMAP_NONE` in `enum vm_mmap_style`)
pub const VM_MMAP_ALL: c_int = 1;

#[link(name = "vmmapi")]
unsafe extern "C" {
    /// Creates the VM named `name`. Fails with `EEXIST` when it already exists.
    pub fn vm_create(name: *const c_char) -> c_int;
    /// Opens an existing VM. Returns a null pointer on failure.
    pub fn vm_open(name: *const c_char) -> *mut vmctx;
    /// Resets an existing VM to its initial state.
    pub fn vm_reinit(ctx: *mut vmctx) -> c_int;
    pub fn vm_get_capability(ctx: *mut vmctx, vcpu: c_int, cap: c_int, retval: *mut c_int)
    -> c_int;
    pub fn vm_set_capability(ctx: *mut vmctx, vcpu: c_int, cap: c_int, val: c_int) -> c_int;
    /// Allocates `len` bytes of guest memory split around the low-memory limit.
    pub fn vm_setup_memory(ctx: *mut vmctx, len: usize, style: c_int) -> c_int;
    pub fn vm_get_lowmem_limit(ctx: *mut vmctx) -> u32;
    /// Returns the host address backing `[gaddr, gaddr + len)`, or null when unmapped.
    pub fn vm_map_gpa(ctx: *mut vmctx, gaddr: vm_paddr_t, len: usize) -> *mut c_void;
    pub fn vm_set_register(ctx: *mut vmctx, vcpu: c_int, reg: c_int, val: u64) -> c_int;
    pub fn vm_set_desc(
        ctx: *mut vmctx,
        vcpu: c_int,
        reg: c_int,
        base: u64,
        limit: u32,
        access: u32,
    ) -> c_int;
    /// Programs a 64-bit kernel entry: control registers, EFER, descriptor table, stack.
    pub fn vm_setup_freebsd_registers(
        ctx: *mut vmctx,
        vcpu: c_int,
        rip: u64,
        cr3: u64,
        gdtbase: u64,
        rsp: u64,
    ) -> c_int;
}
