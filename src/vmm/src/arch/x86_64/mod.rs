// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

/// Descriptor table entries and their segment register form.
pub mod gdt;
/// Layout for the x86_64 guest.
pub mod layout;
/// Boot vCPU register state for the supported entry protocols.
pub mod regs;
