// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

use crate::arch::x86_64::layout::HIMEM_START;
use crate::utils::{GIB, KIB, MIB, mib_to_bytes};

/// The default memory size of the VM, in MiB.
pub const DEFAULT_MEM_SIZE_MIB: u64 = 256;

/// Errors associated with configuring the guest machine.
#[derive(Debug, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum MachineConfigError {
    /// Invalid memory size '{0}'
    InvalidMemorySize(String),
    /// Guest memory size {0:#x} must be larger than 1 MiB
    MemoryTooSmall(u64),
    /// The VM name must not be empty.
    EmptyVmName,
}

/// Name and memory size of the guest being booted.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MachineConfig {
    /// Name of the VM as known to the host.
    pub vm_name: String,
    /// Guest memory size in bytes.
    pub mem_size: u64,
}

impl MachineConfig {
    /// Builds a validated configuration. `memory` uses the syntax of [`parse_mem_size`] and
    /// defaults to [`DEFAULT_MEM_SIZE_MIB`].
    pub fn new(vm_name: &str, memory: Option<&str>) -> Result<Self, MachineConfigError> {
        if vm_name.is_empty() {
            return Err(MachineConfigError::EmptyVmName);
        }

        let mem_size = match memory {
            Some(size) => parse_mem_size(size)?,
            None => mib_to_bytes(DEFAULT_MEM_SIZE_MIB),
        };
        if mem_size <= HIMEM_START {
            return Err(MachineConfigError::MemoryTooSmall(mem_size));
        }

        Ok(MachineConfig {
            vm_name: vm_name.to_string(),
            mem_size,
        })
    }
}

fn parse_number(digits: &str) -> Option<u64> {
    match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => digits.parse().ok(),
    }
}

/// Parses a guest memory size.
///
/// A plain integer, decimal or `0x` hex, is a byte count, except that values below 1 MiB are
/// read as MiB. Otherwise the number must carry one of the `k`, `m`, `g` or `t` suffixes in
/// any case, optionally followed by `b`.
///
/// ```
/// use vmm::vmm_config::machine_config::parse_mem_size;
///
/// assert_eq!(parse_mem_size("512").unwrap(), 512 << 20);
/// assert_eq!(parse_mem_size("2G").unwrap(), 2 << 30);
/// assert_eq!(parse_mem_size("0x10000000").unwrap(), 256 << 20);
/// ```
pub fn parse_mem_size(size: &str) -> Result<u64, MachineConfigError> {
    let invalid = || MachineConfigError::InvalidMemorySize(size.to_string());

    if let Some(value) = parse_number(size) {
        return Ok(if value < MIB {
            value.checked_mul(MIB).ok_or_else(invalid)?
        } else {
            value
        });
    }

    if !size.is_ascii() {
        return Err(invalid());
    }
    let lower = size.to_ascii_lowercase();
    let unit_str = lower.strip_suffix('b').unwrap_or(&lower);
    let split = unit_str.len().checked_sub(1).ok_or_else(invalid)?;
    let (digits, unit) = unit_str.split_at(split);
    let multiplier = match unit {
        "k" => KIB,
        "m" => MIB,
        "g" => GIB,
        "t" => 1024 * GIB,
        _ => return Err(invalid()),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    digits
        .parse::<u64>()
        .ok()
        .and_then(|value| value.checked_mul(multiplier))
        .ok_or_else(invalid)
}
