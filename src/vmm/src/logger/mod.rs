// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]

//! Logging for the boot loader: a single process-wide [`log`] sink that prefixes each line
//! with the local time and the VM name.

mod logging;

use std::sync::LockResult;

pub use log::Level::*;
pub use log::{warn, *};

pub use crate::logger::logging::{
    DEFAULT_INSTANCE_ID, DEFAULT_LEVEL, INSTANCE_ID, LOGGER, LevelFilter, LevelFilterFromStrError,
    Logger, LoggerConfig, LoggerInitError, LoggerUpdateError,
};

fn extract_guard<G>(lock_result: LockResult<G>) -> G {
    match lock_result {
        Ok(guard) => guard,
        // If a thread panics while holding this lock, the writer within should still be usable.
        Err(poisoned) => poisoned.into_inner(),
    }
}
