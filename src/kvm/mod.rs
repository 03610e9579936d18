//! KVM (Kernel-based Virtual Machine) wrapper module.
//!
//! This module provides a safe Rust interface to Linux KVM for hardware-assisted
//! virtualization. KVM allows running virtual machines with near-native performance
//! by leveraging CPU virtualization extensions (Intel VT-x or AMD-V).
//!
//! # KVM Architecture
//!
//! KVM operates as a kernel module that turns Linux into a hypervisor. The VMM
//! (Virtual Machine Monitor, i.e., us) communicates with KVM through ioctls on:
//!
//! - `/dev/kvm` - System-level operations (check API version, create VMs)
//! - VM file descriptor - VM-level operations (create vCPUs, set memory)
//! - vCPU file descriptor - vCPU-level operations (run, get/set registers)
//!
//! # Required VM Components
//!
//! Before a vCPU can run, KVM requires, in order:
//!
//! - **API version check**: the host kernel's KVM ABI must match what this
//!   VMM was built against.
//! - **TSS / identity-map addresses**: Intel VT-x requires these to be set
//!   before the first vCPU is created.
//! - **IRQ chip**: in-kernel PIC + IOAPIC emulation.
//! - **PIT**: the 8254 timer.
//! - **Memory regions**: guest physical memory mappings.
//! - **CPUID**: the feature table exposed to the guest, shaped by
//!   [`cpuid::shape`].
//!
//! The exact sequence lives in [`vm::VmFd`] and is driven by the orchestrator
//! in `crate::vmm` so construction-order invariants stay visible at the call
//! site rather than hidden inside a single constructor.

pub mod cpuid;
mod vcpu;
mod vm;

pub use vcpu::{IoData, IoHandler, VcpuExit, VcpuFd};
pub use vm::{IrqInjector, VmFd};

use kvm_bindings::KVM_MAX_CPUID_ENTRIES;
use kvm_ioctls::Kvm;
use thiserror::Error;

/// The only KVM ABI version this VMM has been validated against.
const EXPECTED_API_VERSION: i32 = 12;

/// Errors that can occur during KVM operations.
#[derive(Error, Debug)]
pub enum KvmError {
    /// Failed to open /dev/kvm device.
    ///
    /// This usually means:
    /// - KVM is not available (not running on Linux, or KVM module not loaded)
    /// - Insufficient permissions (user not in kvm group)
    /// - Running in a VM without nested virtualization enabled
    #[error("Failed to open /dev/kvm: {0}")]
    OpenKvm(#[source] kvm_ioctls::Error),

    /// The host's KVM ABI version doesn't match what this VMM expects.
    #[error("KVM API version {found} is incompatible (expected {EXPECTED_API_VERSION})")]
    ApiIncompatible { found: i32 },

    /// Failed to create a new VM.
    #[error("Failed to create VM: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),

    /// Failed to create a vCPU.
    #[error("Failed to create vCPU: {0}")]
    CreateVcpu(#[source] kvm_ioctls::Error),

    /// Failed to register guest memory with KVM.
    #[error("Failed to set user memory region: {0}")]
    SetMemoryRegion(#[source] kvm_ioctls::Error),

    /// Failed to set CPU registers.
    #[error("Failed to set registers: {0}")]
    SetRegisters(#[source] kvm_ioctls::Error),

    /// Failed to get CPU registers.
    #[error("Failed to get registers: {0}")]
    GetRegisters(#[source] kvm_ioctls::Error),

    /// Failed to run vCPU.
    #[error("Failed to run vCPU: {0}")]
    Run(#[source] kvm_ioctls::Error),

    /// Failed to set TSS/identity-map address (required for Intel VT-x).
    #[error("Failed to set TSS/identity-map address: {0}")]
    SetTssAddress(#[source] kvm_ioctls::Error),

    /// Failed to create in-kernel IRQ chip.
    #[error("Failed to create IRQ chip: {0}")]
    CreateIrqChip(#[source] kvm_ioctls::Error),

    /// Failed to create PIT (Programmable Interval Timer).
    #[error("Failed to create PIT2: {0}")]
    CreatePit2(#[source] kvm_ioctls::Error),

    /// Failed to get supported CPUID entries from KVM.
    #[error("Failed to get supported CPUID: {0}")]
    GetSupportedCpuid(#[source] kvm_ioctls::Error),

    /// Failed to set CPUID entries on vCPU.
    #[error("Failed to set CPUID: {0}")]
    SetCpuid(#[source] kvm_ioctls::Error),

    /// Failed to set a vCPU's IRQ line.
    #[error("Failed to set IRQ line: {0}")]
    SetIrqLine(#[source] kvm_ioctls::Error),

    /// Caller tried to set the TSS/identity-map address after a vCPU already
    /// exists, or the host's supported-CPUID list is missing the KVM
    /// signature leaf [`cpuid::shape`] needs to rewrite.
    #[error("operation requires no vCPU to exist yet")]
    NotReady,

    /// Guest memory is too large to leave room for the TSS and identity map above it.
    #[error("guest memory size leaves no room for the TSS and identity map above it")]
    GMemNotEnough,
}

/// Opens `/dev/kvm`, verifies the API version, and creates a bare VM.
///
/// Everything else (TSS/identity map, IRQ chip, PIT, memory, vCPU, CPUID) is
/// driven explicitly by the caller through the returned [`VmFd`].
///
/// # Errors
///
/// Returns an error if KVM is unavailable, the host ABI version doesn't
/// match, or VM creation fails.
pub fn open() -> Result<(Kvm, VmFd), KvmError> {
    let kvm = Kvm::new().map_err(KvmError::OpenKvm)?;

    let version = kvm.get_api_version();
    if version != EXPECTED_API_VERSION {
        return Err(KvmError::ApiIncompatible { found: version });
    }

    let vm = kvm.create_vm().map_err(KvmError::CreateVm)?;
    Ok((kvm, VmFd::new(vm)))
}

/// Queries the full set of CPUID entries KVM supports on this host. This is
/// the raw material [`cpuid::shape`] rewrites before installing it on a vCPU.
pub fn supported_cpuid(kvm: &Kvm) -> Result<kvm_bindings::CpuId, KvmError> {
    kvm.get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
        .map_err(KvmError::GetSupportedCpuid)
}
