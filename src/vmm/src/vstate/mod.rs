// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// Module with the FreeBSD bhyve host backend.
#[cfg(target_os = "freebsd")]
pub mod bhyve;
/// Module with the hypervisor capability consumed by the VM session.
pub mod host;
/// Module with the guest memory map.
pub mod memory;
/// Module with the VM session.
pub mod vm;
