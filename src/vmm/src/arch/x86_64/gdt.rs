// Copyright © 2020, Oracle and/or its affiliates.
//
// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

// For GDT details see arch/x86/include/asm/segment.h

/// Size in bytes of one descriptor table entry.
pub const GDT_ENTRY_SIZE: usize = 8;

/// Access-rights bit marking a segment register as unusable.
pub const DESC_UNUSABLE: u32 = 0x0001_0000;

/// Kernel privilege level.
pub const SEL_KPL: u16 = 0;

/// Constructor for a conventional segment GDT (or LDT) entry. Derived from the kernel's segment.h.
pub fn gdt_entry(flags: u16, base: u32, limit: u32) -> u64 {
    ((u64::from(base) & 0xff00_0000u64) << (56 - 24))
        | ((u64::from(flags) & 0x0000_f0ffu64) << 40)
        | ((u64::from(limit) & 0x000f_0000u64) << (48 - 16))
        | ((u64::from(base) & 0x00ff_ffffu64) << 16)
        | (u64::from(limit) & 0x0000_ffffu64)
}

/// Builds a segment selector from a table index and requested privilege level.
pub const fn selector(index: u16, rpl: u16) -> u16 {
    (index << 3) | rpl
}

/// Serializes a descriptor table into the little-endian byte image the guest expects.
pub fn table_bytes<const N: usize>(table: &[u64; N]) -> Vec<u8> {
    table.iter().flat_map(|entry| entry.to_le_bytes()).collect()
}

fn get_base(entry: u64) -> u64 {
    (((entry) & 0xFF00_0000_0000_0000) >> 32)
        | (((entry) & 0x0000_00FF_0000_0000) >> 16)
        | (((entry) & 0x0000_0000_FFFF_0000) >> 16)
}

// Extract the segment limit from the GDT segment descriptor.
//
// The limit field of a descriptor is 20 bits. With the G flag set it is scaled by 4 KiB, so a
// flat 4 GiB segment is encoded as 0xFFFFF. The limit programmed into a virtual CPU segment
// register is a full 32 bit byte limit and is not scaled by the hardware, so the scaling is
// applied here.
fn get_limit(entry: u64) -> u32 {
    #[allow(clippy::cast_possible_truncation)] // clearly, truncation is not possible
    let limit: u32 =
        ((((entry) & 0x000F_0000_0000_0000) >> 32) | ((entry) & 0x0000_0000_0000_FFFF)) as u32;

    // Perform manual limit scaling if G flag is set
    match get_g(entry) {
        0 => limit,
        _ => (limit << 12) | 0xFFF, // G flag is either 0 or 1
    }
}

fn get_g(entry: u64) -> u8 {
    u8::from(entry & 0x0080_0000_0000_0000 != 0)
}

fn get_p(entry: u64) -> u8 {
    u8::from(entry & 0x0000_8000_0000_0000 != 0)
}

// Type, S, DPL and P in bits 0..8; AVL, L, D/B and G in bits 12..16.
fn get_access(entry: u64) -> u32 {
    #[allow(clippy::cast_possible_truncation)]
    let access = ((entry >> 40) & 0xf0ff) as u32;
    access
}

/// A segment descriptor in the form a virtual CPU segment register is programmed with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// Linear base address.
    pub base: u64,
    /// Byte-granular limit.
    pub limit: u32,
    /// Access rights, including the unusable bit.
    pub access: u32,
}

impl SegmentDescriptor {
    /// Creates a descriptor from raw fields.
    pub const fn new(base: u64, limit: u32, access: u32) -> Self {
        SegmentDescriptor {
            base,
            limit,
            access,
        }
    }

    /// Decodes a GDT entry into the register form of the same segment.
    ///
    /// # Arguments
    ///
    /// * `entry` - The gdt entry.
    pub fn from_gdt(entry: u64) -> Self {
        let mut access = get_access(entry);
        if get_p(entry) == 0 {
            access |= DESC_UNUSABLE;
        }
        SegmentDescriptor {
            base: get_base(entry),
            limit: get_limit(entry),
            access,
        }
    }

    /// Returns the same descriptor marked unusable.
    pub const fn unusable(self) -> Self {
        SegmentDescriptor {
            access: self.access | DESC_UNUSABLE,
            ..self
        }
    }

    /// Whether the unusable bit is set.
    pub const fn is_unusable(&self) -> bool {
        self.access & DESC_UNUSABLE != 0
    }
}
