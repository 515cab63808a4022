// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Magic addresses externally used to lay out x86_64 guests.

use crate::utils::{GIB, KIB, MIB};

/// End of conventional memory, where the VGA window and BIOS area begin.
pub const LEGACY_MEM_END: u64 = 640 * KIB;

/// Start of the high memory.
pub const HIMEM_START: u64 = MIB;

/// Guest physical address where memory above the low-memory limit is relocated.
pub const HIGH_MEM_START: u64 = 4 * GIB;

/// Lowest address considered for the protected-mode boot scratch block.
pub const BOOT_SCRATCH_MIN: u64 = 0x0200;

/// Highest address considered for the protected-mode boot scratch block.
pub const BOOT_SCRATCH_MAX: u64 = 0xF000;

/// Descriptor tables must be 8 byte aligned (SDM 3A, 3.5.1).
pub const BOOT_SCRATCH_ALIGN: u64 = 8;

/// Base of the placeholder task-state segment loaded into TR.
pub const BOOT_TSS_BASE: u64 = 0x1000;

/// Limit of the placeholder task-state segment loaded into TR.
pub const BOOT_TSS_LIMIT: u32 = 0x67;

/// The only vCPU programmed at boot.
pub const BOOT_VCPU: u32 = 0;
