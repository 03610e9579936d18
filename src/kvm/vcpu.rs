//! Virtual CPU management and execution.
//!
//! This module provides the vCPU abstraction for running guest code. A vCPU
//! represents a virtual processor that executes guest instructions using
//! hardware-assisted virtualization.
//!
//! # VM Exits
//!
//! When the guest performs certain operations, the CPU exits back to the VMM.
//! This VMM only cares about a handful of exit reasons:
//!
//! - **I/O Port Access**: Guest used IN/OUT instructions — dispatched to the
//!   PIO device registry (`crate::devices::pio`).
//! - **HLT**: Guest executed HLT (halt until interrupt).
//! - **Shutdown**: Triple fault or explicit shutdown request.
//!
//! Everything else is surfaced as [`VcpuExit::Unknown`] and treated as a
//! fatal condition by the orchestrator (spec.md §4.2).
//!
//! # I/O Handling
//!
//! When the guest accesses I/O ports, KVM exits to the VMM with the port
//! number, direction, and data. The `IoHandler` trait is the seam the PIO
//! registry plugs into; it uses a fixed-size array (max 4 bytes) to avoid
//! heap allocation on every exit.

use kvm_bindings::{kvm_fpu, kvm_regs, kvm_sregs};
use kvm_ioctls::VcpuExit as KvmVcpuExit;

use super::KvmError;

/// Maximum size for I/O operations (x86 supports 1, 2, or 4 byte I/O).
pub const MAX_IO_SIZE: usize = 4;

/// Fixed-size I/O data buffer to avoid heap allocation.
#[derive(Debug, Clone, Copy)]
pub struct IoData {
    data: [u8; MAX_IO_SIZE],
    len: u8,
}

impl IoData {
    /// Creates a new, zeroed `IoData` of the given length (1, 2, or 4).
    #[inline]
    pub fn new(len: usize) -> Self {
        debug_assert!(len <= MAX_IO_SIZE);
        Self {
            data: [0; MAX_IO_SIZE],
            len: len as u8,
        }
    }

    /// Builds an `IoData` from a slice, truncating to `MAX_IO_SIZE`.
    #[inline]
    pub fn from_slice(slice: &[u8]) -> Self {
        let len = slice.len().min(MAX_IO_SIZE);
        let mut data = [0u8; MAX_IO_SIZE];
        data[..len].copy_from_slice(&slice[..len]);
        Self {
            data,
            len: len as u8,
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn set(&mut self, index: usize, value: u8) {
        if index < self.len as usize {
            self.data[index] = value;
        }
    }
}

impl Default for IoData {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Wrapper around the KVM vCPU file descriptor.
pub struct VcpuFd {
    vcpu: kvm_ioctls::VcpuFd,
}

/// Exit reasons this VMM's run loop distinguishes (spec.md §4.2).
#[derive(Debug)]
pub enum VcpuExit {
    /// I/O port operation was dispatched to the PIO registry; keep running.
    Io,

    /// Guest executed HLT. The CPU is waiting for an interrupt.
    Hlt,

    /// Guest requested shutdown (triple fault or explicit request).
    Shutdown,

    /// KVM internal error occurred.
    InternalError,

    /// Failed to enter guest mode; contains the hardware-specific reason code.
    FailEntry(u64),

    /// System event (e.g. reset); contains the event type code.
    SystemEvent(u32),

    /// Exit reason this VMM does not model. Treated as fatal by the
    /// orchestrator (spec.md §4.2).
    Unknown(&'static str),
}

/// Handles I/O port reads and writes on behalf of the vCPU run loop.
///
/// Implemented by the PIO device registry (`crate::devices::pio::PioBus`).
pub trait IoHandler {
    /// The guest is reading from `port`. Fill `data` with the response.
    fn io_read(&mut self, port: u16, data: &mut IoData);

    /// The guest is writing `data` to `port`.
    fn io_write(&mut self, port: u16, data: &IoData);
}

impl VcpuFd {
    /// Wraps a freshly created KVM vCPU file descriptor.
    pub fn new(vcpu: kvm_ioctls::VcpuFd) -> Self {
        Self { vcpu }
    }

    pub fn get_regs(&self) -> Result<kvm_regs, KvmError> {
        self.vcpu.get_regs().map_err(KvmError::GetRegisters)
    }

    pub fn set_regs(&self, regs: &kvm_regs) -> Result<(), KvmError> {
        self.vcpu.set_regs(regs).map_err(KvmError::SetRegisters)
    }

    pub fn get_sregs(&self) -> Result<kvm_sregs, KvmError> {
        self.vcpu.get_sregs().map_err(KvmError::GetRegisters)
    }

    pub fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), KvmError> {
        self.vcpu.set_sregs(sregs).map_err(KvmError::SetRegisters)
    }

    pub fn set_fpu(&self, fpu: &kvm_fpu) -> Result<(), KvmError> {
        self.vcpu.set_fpu(fpu).map_err(KvmError::SetRegisters)
    }

    /// Runs the vCPU until it exits, dispatching I/O port accesses to
    /// `handler` inline and translating everything else into a
    /// [`VcpuExit`].
    pub fn run_with_io<H: IoHandler>(&mut self, handler: &mut H) -> Result<VcpuExit, KvmError> {
        match self.vcpu.run().map_err(KvmError::Run)? {
            KvmVcpuExit::IoIn(port, data) => {
                let mut io_data = IoData::new(data.len());
                handler.io_read(port, &mut io_data);
                let copy_len = io_data.len().min(data.len());
                data[..copy_len].copy_from_slice(&io_data.as_slice()[..copy_len]);
                Ok(VcpuExit::Io)
            }

            KvmVcpuExit::IoOut(port, data) => {
                let io_data = IoData::from_slice(data);
                handler.io_write(port, &io_data);
                Ok(VcpuExit::Io)
            }

            KvmVcpuExit::Hlt => Ok(VcpuExit::Hlt),
            KvmVcpuExit::Shutdown => Ok(VcpuExit::Shutdown),
            KvmVcpuExit::InternalError => Ok(VcpuExit::InternalError),
            KvmVcpuExit::SystemEvent(event, _) => Ok(VcpuExit::SystemEvent(event)),
            KvmVcpuExit::FailEntry(reason, _) => Ok(VcpuExit::FailEntry(reason)),

            KvmVcpuExit::MmioRead(..) => Ok(VcpuExit::Unknown("MmioRead")),
            KvmVcpuExit::MmioWrite(..) => Ok(VcpuExit::Unknown("MmioWrite")),
            KvmVcpuExit::Hypercall(_) => Ok(VcpuExit::Unknown("Hypercall")),
            KvmVcpuExit::Debug(_) => Ok(VcpuExit::Unknown("Debug")),
            KvmVcpuExit::Exception => Ok(VcpuExit::Unknown("Exception")),
            KvmVcpuExit::IrqWindowOpen => Ok(VcpuExit::Unknown("IrqWindowOpen")),
            KvmVcpuExit::S390Sieic => Ok(VcpuExit::Unknown("S390Sieic")),
            KvmVcpuExit::S390Reset => Ok(VcpuExit::Unknown("S390Reset")),
            KvmVcpuExit::Dcr => Ok(VcpuExit::Unknown("Dcr")),
            KvmVcpuExit::Nmi => Ok(VcpuExit::Unknown("Nmi")),
            KvmVcpuExit::Watchdog => Ok(VcpuExit::Unknown("Watchdog")),
            KvmVcpuExit::Epr => Ok(VcpuExit::Unknown("Epr")),
            _ => Ok(VcpuExit::Unknown("Other")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_data_from_slice_truncates() {
        let data = IoData::from_slice(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(data.len(), MAX_IO_SIZE);
        assert_eq!(data.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn io_data_set_ignores_out_of_range() {
        let mut data = IoData::new(2);
        data.set(0, 0xaa);
        data.set(5, 0xbb);
        assert_eq!(data.as_slice(), &[0xaa, 0x00]);
    }
}
