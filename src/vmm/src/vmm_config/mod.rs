// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// Wrapper for the boot plan: images to place and the entry state to program.
pub mod boot_source;
/// Wrapper for configuring the guest name and memory size.
pub mod machine_config;
