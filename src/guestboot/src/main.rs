// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use clap::Parser;
use vmm::ExitCode;
use vmm::arch::{BootError, Handoff};
use vmm::builder::{StartGuestError, build_and_boot};
use vmm::logger::{
    INSTANCE_ID, LOGGER, LevelFilter, LoggerConfig, LoggerUpdateError, error, info, warn,
};
use vmm::vmm_config::boot_source::{BootPlan, BootPlanError};
use vmm::vmm_config::machine_config::{MachineConfig, MachineConfigError};
use vmm::vstate::host::HostInterface;
use vmm::vstate::memory::{MemoryMap, SegmentType};
use vmm::vstate::vm::{Vm, VmError};

/// Set while waiting for a debugger to attach. Clear it from the debugger to continue.
#[unsafe(no_mangle)]
static HOLD: AtomicBool = AtomicBool::new(false);

#[derive(Debug, thiserror::Error, displaydoc::Display)]
enum MainError {
    /// Failed to configure the logger: {0}
    Logger(LoggerUpdateError),
    /// Invalid machine configuration: {0}
    MachineConfig(#[from] MachineConfigError),
    /// Cannot load boot plan: {0}
    BootPlan(#[from] BootPlanError),
    /// Cannot set up the VM: {0}
    #[cfg(target_os = "freebsd")]
    Bhyve(#[from] vmm::vstate::bhyve::BhyveError),
    /// Cannot set up the VM session: {0}
    Session(#[from] VmError),
    /// This host has no hypervisor backend.
    UnsupportedHost,
    /// Cannot print the memory map: {0}
    PrintMemoryMap(io::Error),
    /// Guest boot failed: {0}
    StartGuest(#[from] StartGuestError),
}

impl MainError {
    fn exit_code(&self) -> ExitCode {
        match self {
            MainError::Logger(_) | MainError::PrintMemoryMap(_) => ExitCode::GenericError,
            MainError::MachineConfig(_) | MainError::BootPlan(_) => ExitCode::BadConfiguration,
            #[cfg(target_os = "freebsd")]
            MainError::Bhyve(_) => ExitCode::SessionSetup,
            MainError::Session(_) => ExitCode::SessionSetup,
            MainError::UnsupportedHost => ExitCode::UnsupportedHost,
            MainError::StartGuest(err) => match err {
                StartGuestError::BootPlan(_) => ExitCode::BadConfiguration,
                StartGuestError::Boot(BootError::Program(_))
                | StartGuestError::Boot(BootError::CopyDescriptorTable(_)) => {
                    ExitCode::BootProgramming
                }
                StartGuestError::ReadImage(..)
                | StartGuestError::EmptyImage(_)
                | StartGuestError::PlaceImage(..)
                | StartGuestError::CopyImage(_)
                | StartGuestError::Boot(BootError::Placement(_)) => ExitCode::BootPlacement,
            },
        }
    }
}

/// Places a kernel and its boot data in a bhyve guest and programs the boot vCPU.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// Name of the VM to create or reuse.
    vm_name: String,
    /// Guest memory size, e.g. 512M or 2G. Plain numbers below 1 MiB are taken as MiB.
    #[arg(short, long, value_name = "SIZE")]
    memory: Option<String>,
    /// JSON file listing the images to load and the entry state.
    #[arg(short = 'f', long, value_name = "PATH")]
    boot_plan: Option<PathBuf>,
    /// Wait for a debugger before touching the VM, for SECS seconds or until HOLD is cleared.
    #[arg(short = 'H', long, value_name = "SECS", num_args = 0..=1)]
    hold: Option<Option<u64>>,
    /// Print the guest memory map and exit.
    #[arg(long)]
    print_mmap: bool,
    /// Path to a file or named pipe for log output.
    #[arg(long, value_name = "PATH")]
    log_path: Option<PathBuf>,
    /// Maximum log level.
    #[arg(long, value_name = "LEVEL")]
    level: Option<LevelFilter>,
    /// Show the log level in log lines.
    #[arg(long)]
    show_level: bool,
    /// Show the source file and line in log lines.
    #[arg(long)]
    show_log_origin: bool,
}

impl Cli {
    fn logger_config(&self) -> LoggerConfig {
        LoggerConfig {
            log_path: self.log_path.clone(),
            level: self.level,
            show_level: Some(self.show_level),
            show_log_origin: Some(self.show_log_origin),
        }
    }
}

fn hold_for_debugger(secs: Option<u64>) {
    HOLD.store(true, Ordering::SeqCst);
    match secs {
        Some(secs) => info!("Holding {secs}s for debugger, pid {}", process::id()),
        None => info!("Holding for debugger until HOLD is cleared, pid {}", process::id()),
    }

    let mut remaining = secs;
    while HOLD.load(Ordering::SeqCst) {
        match remaining.as_mut() {
            Some(0) => break,
            Some(secs) => *secs -= 1,
            None => {}
        }
        thread::sleep(Duration::from_secs(1));
    }
    HOLD.store(false, Ordering::SeqCst);
}

fn print_memory_map(out: &mut impl Write, map: &MemoryMap) -> io::Result<()> {
    for seg in map.iter() {
        let kind = match seg.kind {
            SegmentType::Available => "available",
            SegmentType::Reserved => "reserved",
        };
        writeln!(
            out,
            "{:#018x} - {:#018x} {:#x} bytes {kind}",
            seg.start,
            seg.end,
            seg.size()
        )?;
    }
    writeln!(out, "lower memory: {}KiB", map.lower_memory() >> 10)?;
    writeln!(out, "upper memory: {}KiB", map.upper_memory() >> 10)
}

#[cfg_attr(not(target_os = "freebsd"), allow(dead_code))]
fn prepare_guest<H: HostInterface>(
    host: H,
    config: &MachineConfig,
    plan: Option<&BootPlan>,
    print_mmap: bool,
) -> Result<(), MainError> {
    let mut vm = Vm::new(host, config.mem_size)?;

    if print_mmap {
        return print_memory_map(&mut io::stdout().lock(), vm.memory_map())
            .map_err(MainError::PrintMemoryMap);
    }

    match plan {
        Some(plan) => match build_and_boot(&mut vm, plan)? {
            Handoff::Resumed => info!("Guest {} is ready to run", config.vm_name),
            Handoff::Withheld => warn!("Guest {} was prepared but not resumed", config.vm_name),
        },
        None => info!("No boot plan given, guest memory is set up"),
    }
    Ok(())
}

fn run(cli: Cli) -> Result<(), MainError> {
    // The name can only be set once per process.
    let _ = INSTANCE_ID.set(cli.vm_name.clone());
    LOGGER
        .update(cli.logger_config())
        .map_err(MainError::Logger)?;

    if let Some(secs) = cli.hold {
        hold_for_debugger(secs);
    }

    let config = MachineConfig::new(&cli.vm_name, cli.memory.as_deref())?;
    let plan = cli
        .boot_plan
        .as_deref()
        .map(BootPlan::from_file)
        .transpose()?;

    #[cfg(target_os = "freebsd")]
    {
        let host = vmm::vstate::bhyve::BhyveVm::new(&config.vm_name, config.mem_size)?;
        prepare_guest(host, &config, plan.as_ref(), cli.print_mmap)
    }

    #[cfg(not(target_os = "freebsd"))]
    {
        let _ = (config, plan);
        Err(MainError::UnsupportedHost)
    }
}

fn main() -> process::ExitCode {
    if let Err(err) = LOGGER.init() {
        eprintln!("Failed to register logger: {err}");
        return ExitCode::GenericError.into();
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.use_stderr() {
                true => ExitCode::ArgParsing,
                false => ExitCode::Ok,
            };
            // Nothing left to report to if the terminal is gone.
            let _ = err.print();
            return code.into();
        }
    };

    match run(cli) {
        Ok(()) => ExitCode::Ok.into(),
        Err(err) => {
            error!("{err}");
            err.exit_code().into()
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use vmm::relocator::RelocatorError;
    use vmm::vstate::host::HostError;

    use super::*;

    #[test]
    fn test_cli() {
        Cli::command().debug_assert();

        let cli = Cli::try_parse_from(["guestboot", "-m", "512M", "vm0"]).unwrap();
        assert_eq!(cli.vm_name, "vm0");
        assert_eq!(cli.memory.as_deref(), Some("512M"));
        assert_eq!(cli.hold, None);
        assert!(!cli.print_mmap);

        let cli = Cli::try_parse_from(["guestboot", "vm0", "-H"]).unwrap();
        assert_eq!(cli.hold, Some(None));
        let cli = Cli::try_parse_from(["guestboot", "--hold", "5", "vm0"]).unwrap();
        assert_eq!(cli.hold, Some(Some(5)));

        let cli = Cli::try_parse_from([
            "guestboot",
            "vm0",
            "--level",
            "warning",
            "--show-level",
            "--log-path",
            "/tmp/guestboot.log",
        ])
        .unwrap();
        let config = cli.logger_config();
        assert_eq!(config.level, Some(LevelFilter::Warn));
        assert_eq!(config.show_level, Some(true));
        assert_eq!(config.show_log_origin, Some(false));

        Cli::try_parse_from(["guestboot"]).unwrap_err();
        Cli::try_parse_from(["guestboot", "vm0", "--level", "loud"]).unwrap_err();
    }

    #[test]
    fn test_hold_with_zero_timeout_returns() {
        hold_for_debugger(Some(0));
        assert!(!HOLD.load(Ordering::SeqCst));
    }

    #[test]
    fn test_print_memory_map() {
        let map = MemoryMap::for_guest(256 << 20, 3 << 30);
        let mut out = Vec::new();
        print_memory_map(&mut out, &map).unwrap();
        let out = String::from_utf8(out).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(
            lines[0],
            "0x0000000000000000 - 0x000000000009ffff 0xa0000 bytes available"
        );
        assert_eq!(
            lines[1],
            "0x0000000000100000 - 0x000000000fffffff 0xff00000 bytes available"
        );
        assert_eq!(lines[2], "lower memory: 1024KiB");
        assert_eq!(lines[3], "upper memory: 261120KiB");
    }

    #[test]
    fn test_exit_codes() {
        let placement = MainError::StartGuest(StartGuestError::Boot(BootError::Placement(
            RelocatorError::OutOfRange,
        )));
        assert_eq!(placement.exit_code(), ExitCode::BootPlacement);

        let program = MainError::StartGuest(StartGuestError::Boot(BootError::Program(
            HostError::Resume(libc::EIO),
        )));
        assert_eq!(program.exit_code(), ExitCode::BootProgramming);

        assert_eq!(
            MainError::MachineConfig(MachineConfigError::EmptyVmName).exit_code(),
            ExitCode::BadConfiguration
        );
        assert_eq!(
            MainError::UnsupportedHost.exit_code(),
            ExitCode::UnsupportedHost
        );
    }
}
