// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Enables pre-boot setup and handoff of a guest.

use std::io;
use std::path::{Path, PathBuf};

use crate::arch::{BootError, Handoff};
use crate::logger::{debug, error, info};
use crate::relocator::{Chunk, RelocatorError};
use crate::utils::usize_to_u64;
use crate::vmm_config::boot_source::{BootPlan, BootPlanError, ImageConfig, ImagePlacement};
use crate::vstate::host::{HostError, HostInterface};
use crate::vstate::vm::Vm;

/// Errors associated with loading and starting a guest.
#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum StartGuestError {
    /// Invalid boot plan: {0}
    BootPlan(#[from] BootPlanError),
    /// Cannot read image {0:?}: {1}
    ReadImage(PathBuf, io::Error),
    /// Image {0:?} is empty.
    EmptyImage(PathBuf),
    /// Cannot place image {0:?}: {1}
    PlaceImage(PathBuf, RelocatorError),
    /// Cannot copy image into guest memory: {0}
    CopyImage(HostError),
    /// Cannot hand the guest over to the host: {0}
    Boot(#[from] BootError),
}

fn place_image<H: HostInterface>(
    vm: &mut Vm<H>,
    path: &Path,
    placement: ImagePlacement,
    size: u64,
) -> Result<Chunk, StartGuestError> {
    let relocator = vm.relocator();
    let placed = match placement {
        ImagePlacement::Fixed(addr) => relocator.allocate_at(addr, size),
        ImagePlacement::Anywhere { min, max, align } => {
            relocator.allocate_anywhere(min, max, size, align)
        }
    };
    placed.map_err(|err| StartGuestError::PlaceImage(path.to_path_buf(), err))
}

/// Reads `image` from the host and copies it into a freshly placed chunk.
pub fn load_image<H: HostInterface>(
    vm: &mut Vm<H>,
    image: &ImageConfig,
) -> Result<Chunk, StartGuestError> {
    let placement = image.placement()?;
    let contents = std::fs::read(&image.path)
        .map_err(|err| StartGuestError::ReadImage(image.path.clone(), err))?;
    if contents.is_empty() {
        return Err(StartGuestError::EmptyImage(image.path.clone()));
    }

    let chunk = place_image(vm, &image.path, placement, usize_to_u64(contents.len()))?;
    vm.chunk_mut(&chunk)
        .map_err(StartGuestError::CopyImage)?
        .copy_from_slice(&contents);
    info!(
        "Loaded {:?} at {:#x}, {:#x} bytes",
        image.path,
        chunk.target().0,
        chunk.size()
    );

    Ok(chunk)
}

fn load_and_boot<H: HostInterface>(
    vm: &mut Vm<H>,
    plan: &BootPlan,
) -> Result<Handoff, StartGuestError> {
    for image in &plan.images {
        load_image(vm, image)?;
    }
    debug!("Entering guest with {:?}", plan.entry);
    Ok(vm.boot(&plan.entry)?)
}

/// Places every image of `plan` in guest memory, programs the entry state and resumes the
/// guest.
///
/// On failure every chunk placed so far is released and the guest is left stopped.
pub fn build_and_boot<H: HostInterface>(
    vm: &mut Vm<H>,
    plan: &BootPlan,
) -> Result<Handoff, StartGuestError> {
    let result = load_and_boot(vm, plan);
    if let Err(err) = &result {
        error!("Guest boot failed: {err}");
        vm.release_relocator();
    }
    result
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use vmm_sys_util::tempfile::TempFile;

    use super::*;
    use crate::arch::{BootState, LongModeRegs, ProtectedModeRegs};
    use crate::test_utils::fake_vm;
    use crate::utils::MIB;
    use crate::vstate::host::Register;
    use crate::vstate::memory::GuestAddress;

    fn image_file(contents: &[u8]) -> TempFile {
        let file = TempFile::new().unwrap();
        file.as_file().write_all(contents).unwrap();
        file
    }

    fn fixed(file: &TempFile, addr: u64) -> ImageConfig {
        ImageConfig {
            path: file.as_path().to_path_buf(),
            load_addr: Some(addr),
            min_addr: None,
            max_addr: None,
            align: None,
        }
    }

    fn protected_entry(eip: u32) -> BootState {
        BootState::Protected32(ProtectedModeRegs {
            eip,
            ..Default::default()
        })
    }

    #[test]
    fn test_build_and_boot_protected_mode() {
        let kernel = image_file(b"kernel");
        let initrd = image_file(&[0x5a; 0x1800]);
        let plan = BootPlan {
            images: vec![
                fixed(&kernel, MIB),
                ImageConfig {
                    path: initrd.as_path().to_path_buf(),
                    load_addr: None,
                    min_addr: None,
                    max_addr: Some(8 * MIB),
                    align: Some(0x1000),
                },
            ],
            entry: protected_entry(0x10_0000),
        };

        let mut vm = fake_vm(16 * MIB);
        assert_eq!(build_and_boot(&mut vm, &plan).unwrap(), Handoff::Resumed);

        let chunks = vm.relocator().chunks().to_vec();
        // Scratch block, kernel and the initrd raised above 1 MiB and past the kernel.
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].target(), GuestAddress(0x200));
        assert_eq!(chunks[1].target(), GuestAddress(MIB));
        assert_eq!(chunks[2].target(), GuestAddress(MIB + 0x1000));

        let host = vm.host();
        assert_eq!(host.read(MIB, 6), b"kernel");
        assert_eq!(host.read(MIB + 0x1000, 0x1800), &[0x5a; 0x1800][..]);
        assert_eq!(host.register(Register::Rip), Some(0x10_0000));
        assert!(host.resumed);
    }

    #[test]
    fn test_build_and_boot_freebsd() {
        let kernel = image_file(&[0xcc; 0x100]);
        let plan = BootPlan {
            images: vec![fixed(&kernel, 2 * MIB)],
            entry: BootState::Freebsd64(LongModeRegs {
                rip: 2 * MIB,
                cr3: 0x1000,
                ..Default::default()
            }),
        };

        let mut vm = fake_vm(16 * MIB);
        assert_eq!(build_and_boot(&mut vm, &plan).unwrap(), Handoff::Resumed);
        let entry = vm.host().alternate_entry.unwrap();
        assert_eq!(entry.rip, 2 * MIB);
        assert_eq!(entry.gdt_base, 16 * MIB - 48);
        assert_eq!(vm.relocator().chunks().len(), 1);
    }

    #[test]
    fn test_overlapping_images_release_relocator() {
        let first = image_file(&[1; 0x100]);
        let second = image_file(&[2; 0x100]);
        let plan = BootPlan {
            images: vec![fixed(&first, MIB), fixed(&second, MIB + 0x80)],
            entry: protected_entry(0x10_0000),
        };

        let mut vm = fake_vm(16 * MIB);
        let err = build_and_boot(&mut vm, &plan).unwrap_err();
        assert!(
            matches!(err, StartGuestError::PlaceImage(_, RelocatorError::Overlap)),
            "{err}"
        );
        assert!(!vm.has_relocator());
        assert!(!vm.host().resumed);
        assert_eq!(vm.host().register(Register::Rip), None);
    }

    #[test]
    fn test_missing_and_empty_images() {
        let empty = image_file(b"");
        let missing = empty.as_path().with_extension("missing");
        let mut vm = fake_vm(16 * MIB);

        let err = load_image(&mut vm, &fixed(&empty, MIB)).unwrap_err();
        assert!(matches!(err, StartGuestError::EmptyImage(_)), "{err}");

        let mut image = fixed(&empty, MIB);
        image.path = missing;
        let err = load_image(&mut vm, &image).unwrap_err();
        assert!(matches!(err, StartGuestError::ReadImage(_, _)), "{err}");

        // Nothing was placed on the way.
        assert!(vm.relocator().chunks().is_empty());
    }

    #[test]
    fn test_image_outside_guest_memory() {
        let kernel = image_file(&[0; 0x10]);
        let plan = BootPlan {
            images: vec![fixed(&kernel, 0xA_0000)],
            entry: protected_entry(0x10_0000),
        };

        let mut vm = fake_vm(16 * MIB);
        let err = build_and_boot(&mut vm, &plan).unwrap_err();
        assert!(
            matches!(err, StartGuestError::PlaceImage(_, RelocatorError::OutOfRange)),
            "{err}"
        );
        assert!(!vm.has_relocator());
    }
}
