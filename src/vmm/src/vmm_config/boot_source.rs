// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::arch::BootState;
use crate::vstate::memory::{GuestAddress, GuestUsize};

/// Errors associated with loading a boot plan.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum BootPlanError {
    /// Cannot read boot plan {0:?}: {1}
    Read(PathBuf, io::Error),
    /// Malformed boot plan: {0}
    Parse(#[from] serde_json::Error),
    /// Image {0:?} sets both a fixed load address and a search range.
    ConflictingPlacement(PathBuf),
    /// Image {0:?} must set either `load_addr` or `max_addr`.
    MissingPlacement(PathBuf),
    /// Image {0:?} has an empty search range.
    EmptyRange(PathBuf),
}

/// One raw file to copy into guest memory.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ImageConfig {
    /// Host path of the file. Its bytes are copied verbatim.
    pub path: PathBuf,
    /// Exact guest physical load address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_addr: Option<u64>,
    /// Lowest acceptable load address when searching. Defaults to 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_addr: Option<u64>,
    /// Highest acceptable load address when searching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_addr: Option<u64>,
    /// Required alignment of the load address when searching. Defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub align: Option<GuestUsize>,
}

/// Where an image goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImagePlacement {
    /// At exactly this address.
    Fixed(GuestAddress),
    /// At the lowest suitable address of the range.
    Anywhere {
        /// Lowest acceptable load address.
        min: GuestAddress,
        /// Highest acceptable load address.
        max: GuestAddress,
        /// Alignment of the load address.
        align: GuestUsize,
    },
}

impl ImageConfig {
    /// Resolves the placement fields into a single request.
    pub fn placement(&self) -> Result<ImagePlacement, BootPlanError> {
        let searching = self.min_addr.is_some() || self.max_addr.is_some() || self.align.is_some();
        match (self.load_addr, self.max_addr) {
            (Some(_), _) if searching => Err(BootPlanError::ConflictingPlacement(self.path.clone())),
            (Some(addr), _) => Ok(ImagePlacement::Fixed(GuestAddress(addr))),
            (None, None) => Err(BootPlanError::MissingPlacement(self.path.clone())),
            (None, Some(max)) => {
                let min = self.min_addr.unwrap_or(0);
                if min > max {
                    return Err(BootPlanError::EmptyRange(self.path.clone()));
                }
                Ok(ImagePlacement::Anywhere {
                    min: GuestAddress(min),
                    max: GuestAddress(max),
                    align: self.align.unwrap_or(1),
                })
            }
        }
    }
}

/// What to put in guest memory and how to start the guest.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BootPlan {
    /// Images copied into guest memory, in order.
    #[serde(default)]
    pub images: Vec<ImageConfig>,
    /// Entry protocol and register values.
    pub entry: BootState,
}

impl BootPlan {
    /// Parses and validates a boot plan.
    pub fn from_json(json: &str) -> Result<Self, BootPlanError> {
        let plan: BootPlan = serde_json::from_str(json)?;
        for image in &plan.images {
            image.placement()?;
        }
        Ok(plan)
    }

    /// Reads a boot plan from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, BootPlanError> {
        let json = std::fs::read_to_string(path)
            .map_err(|err| BootPlanError::Read(path.to_path_buf(), err))?;
        Self::from_json(&json)
    }
}
