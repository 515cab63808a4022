// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Guest physical memory placement and boot handoff for a hypervisor-driven boot loader.
//!
//! A boot loader running on the host places kernel images and boot data in the memory of a
//! not-yet-running guest through a [`relocator::Relocator`], then programs the boot vCPU for
//! the kernel's entry protocol and lets the guest run.
#![deny(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]
#![allow(clippy::blanket_clippy_restriction_lints)]

/// Implements the guest entry protocols.
pub mod arch;
/// Loads a boot plan into a guest and starts it.
pub mod builder;
/// Logging sink for the boot loader.
pub mod logger;
/// Placement of blocks in guest physical memory.
pub mod relocator;
/// Utility functions and constants.
pub mod utils;
/// Wrappers over structures used to configure the boot loader.
pub mod vmm_config;
/// Host backends and the VM session.
pub mod vstate;

#[cfg(test)]
pub mod test_utils;

/// Boot loader exit-code type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    /// Success exit code.
    Ok = 0,
    /// Generic error exit code.
    GenericError = 1,
    /// Generic exit code for an error considered not possible to occur if the program logic is
    /// sound.
    UnexpectedError = 2,
    /// Bad machine configuration or boot plan.
    BadConfiguration = 152,
    /// Command line arguments parsing error.
    ArgParsing = 153,
    /// The host refused to create or set up the VM.
    SessionSetup = 160,
    /// Images or boot data could not be placed in guest memory.
    BootPlacement = 161,
    /// The boot vCPU could not be programmed; the guest was not started.
    BootProgramming = 162,
    /// This host has no hypervisor backend.
    UnsupportedHost = 163,
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code as u8)
    }
}
