// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Guest-architecture specific boot handoff.

use serde::{Deserialize, Serialize};

use crate::relocator::{Relocator, RelocatorError};
use crate::vstate::host::{HostError, HostInterface};

/// Module for the x86_64 guest entry protocols.
pub mod x86_64;

pub use crate::arch::x86_64::regs::{LongModeRegs, ProtectedModeRegs};

/// The kernel entry protocol to boot with, together with its register values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum BootState {
    /// 32-bit protected-mode entry with paging disabled.
    Protected32(ProtectedModeRegs),
    /// 64-bit entry as used by FreeBSD kernels.
    Freebsd64(LongModeRegs),
}

/// What happened to the guest once its boot state was programmed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handoff {
    /// The host was told to run the guest.
    Resumed,
    /// Boot state was programmed but the guest was not resumed because the descriptor table
    /// address was degenerate.
    Withheld,
}

/// Errors while bringing the boot vCPU to its entry state.
#[rustfmt::skip]
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum BootError {
    /// Failed to place the boot scratch block: {0}
    Placement(RelocatorError),
    /// Failed to program the boot vCPU: {0}
    Program(#[from] HostError),
    /// Failed to copy the descriptor table into guest memory: {0}
    CopyDescriptorTable(HostError),
}

/// Programs the boot vCPU for `state` and resumes the guest.
///
/// `relocator` supplies the protected-mode scratch block, `lowmem` is the size of the low
/// memory window used to place the 64-bit descriptor table.
pub fn configure_boot<H: HostInterface>(
    host: &mut H,
    relocator: &mut Relocator,
    lowmem: u64,
    state: &BootState,
) -> Result<Handoff, BootError> {
    match state {
        BootState::Protected32(regs) => {
            x86_64::regs::setup_protected_mode_entry(host, relocator, regs)
        }
        BootState::Freebsd64(regs) => x86_64::regs::setup_freebsd_entry(host, lowmem, regs),
    }
}
