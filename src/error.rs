//! Top-level error taxonomy.
//!
//! Every subsystem (KVM, boot, devices, config, the orchestrator) defines
//! its own error enum close to where the errors are raised. This module
//! aggregates them into a single type so `main` has one place to map
//! failures onto process exit codes (see spec.md §6/§7).

use thiserror::Error;

use crate::config::ConfigError;

#[cfg(target_os = "linux")]
use crate::vmm::VmError;

/// Top-level VMM error.
#[derive(Error, Debug)]
pub enum VmmError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[cfg(target_os = "linux")]
    #[error(transparent)]
    Vm(#[from] VmError),

    #[error("pebble-vmm requires Linux with KVM support")]
    UnsupportedPlatform,
}

impl VmmError {
    /// Maps this error onto the process exit code documented in spec.md §6.
    pub fn exit_code(&self) -> u8 {
        match self {
            VmmError::Config(ConfigError::InvalidMemoryUnit(_)) => 1,
            #[cfg(target_os = "linux")]
            VmmError::Vm(VmError::ImageRead { .. }) => 9,
            #[cfg(target_os = "linux")]
            VmmError::Vm(VmError::UnexpectedExit(_)) => 99,
            _ => 1,
        }
    }
}
