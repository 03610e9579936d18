//! pebble-vmm — a minimal type-2 hypervisor that boots an unmodified Linux
//! kernel on top of KVM (spec.md §1, §6).
//!
//! This VMM requires Linux with KVM support. It will not run on other platforms.

#[cfg(target_os = "linux")]
mod boot;
mod config;
#[cfg(target_os = "linux")]
mod devices;
mod error;
#[cfg(target_os = "linux")]
mod kvm;
#[cfg(target_os = "linux")]
mod tty;
#[cfg(target_os = "linux")]
mod vmm;

use clap::Parser;
use std::process::ExitCode;

use config::{Args, VmConfig};
use error::VmmError;

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    match VmConfig::from_args(args).map_err(VmmError::from).and_then(run) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "pebble-vmm exited with an error");
            ExitCode::from(err.exit_code())
        }
    }
}

#[cfg(target_os = "linux")]
fn run(config: VmConfig) -> Result<(), VmmError> {
    tracing::info!(
        kernel = %config.kernel_path.display(),
        memory_bytes = config.memory_bytes,
        "booting guest"
    );

    let mut vm = vmm::Vmm::new(&config)?;
    vm.attach_tty()?;
    vm.run()?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run(_config: VmConfig) -> Result<(), VmmError> {
    Err(VmmError::UnsupportedPlatform)
}
