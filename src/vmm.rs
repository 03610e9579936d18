//! VM orchestrator (C8): brings up KVM, loads the guest, wires the device
//! registry, and runs the vCPU to completion (spec.md §4.1–§4.2).
//!
//! Construction follows the exact step order spec.md mandates — KVM is
//! picky about sequencing (TSS/identity-map before any vCPU exists, CPUID
//! before the first run) — so this module reads top to bottom as that
//! sequence rather than hiding it behind a single opaque constructor.
//!
//! Device registration order also matters: the PIO bus dispatches to the
//! first registered interval containing the port, and the PS/2 controller's
//! `[0x60, 0x64]` interval spans port 0x61, so the NMI-ack stub must be
//! registered first or it would never be reached.

use std::fs;

use kvm_bindings::CpuId;
use thiserror::Error;

use crate::boot::{self, GuestMemory};
use crate::config::VmConfig;
use crate::devices::{HostBridge, NmiAck, PciBus, PioBus, Ps2Controller, Serial, VirtioNet};
use crate::kvm::{self, IoHandler, KvmError, VcpuExit, VcpuFd};
use crate::tty::TtyPump;

const PORT_NMI_ACK: u16 = crate::devices::nmi::NMI_ACK_PORT;
const PCI_CATCHALL_START: u16 = 0x0000;
const PCI_CATCHALL_END: u16 = 0xffff;

/// Errors raised while constructing or running a VM. Aggregated into
/// [`crate::error::VmmError`] alongside config and platform errors.
#[derive(Error, Debug)]
pub enum VmError {
    #[error(transparent)]
    Kvm(#[from] KvmError),

    #[error(transparent)]
    Boot(#[from] boot::BootError),

    #[error("failed to read {path}: {source}")]
    ImageRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start TTY pump: {0}")]
    Tty(#[from] crate::tty::TtyError),

    #[error("vCPU exited with an unmodeled reason: {0}")]
    UnexpectedExit(String),

    #[error("vCPU failed to enter guest mode (reason code {0:#x})")]
    FailEntry(u64),

    #[error("KVM internal error")]
    InternalError,
}

/// The device registry behind the vCPU's I/O-port exits. Owns every
/// emulated device; the PCI bus in turn owns the host bridge and virtio-net.
struct Devices {
    pio: PioBus,
    serial: Serial,
}

impl IoHandler for Devices {
    fn io_read(&mut self, port: u16, data: &mut kvm::IoData) {
        self.pio.io_read(port, data);
    }

    fn io_write(&mut self, port: u16, data: &kvm::IoData) {
        self.pio.io_write(port, data);
    }
}

/// A running VM: the vCPU, the device registry behind it, and (if spawned)
/// the background TTY pump feeding the UART.
pub struct Vmm {
    vcpu: VcpuFd,
    devices: Devices,
    _memory: GuestMemory,
    _tty: Option<TtyPump>,
}

impl Vmm {
    /// Builds the VM per spec.md §4.1's construction contract, loads the
    /// kernel (and optional initrd), and returns a `Vmm` ready to run.
    pub fn new(config: &VmConfig) -> Result<Self, VmError> {
        let (kvm, mut vm) = kvm::open()?;

        vm.reserve_tss_and_identity_map(config.memory_bytes)?;
        vm.create_irq_chip()?;
        vm.create_pit2()?;

        let memory = GuestMemory::new(config.memory_bytes)?;
        let (host_addr, size) = memory.as_raw_parts();
        unsafe {
            vm.set_user_memory_region(0, 0, size, host_addr)?;
        }

        let supported = kvm::supported_cpuid(&kvm)?;
        let shaped: CpuId = kvm::cpuid::shape(supported)?;
        let vcpu = vm.create_vcpu(0, &shaped)?;

        let kernel_bytes = read_image(&config.kernel_path)?;
        let initrd_bytes = config
            .initrd_path
            .as_ref()
            .map(read_image)
            .transpose()?;

        let loaded = boot::load_kernel_and_initrd(
            &memory,
            config.memory_bytes,
            &kernel_bytes,
            initrd_bytes.as_deref(),
            &config.cmdline,
        )?;
        boot::enter_protected_mode(&vcpu, &memory, &loaded)?;

        let serial = Serial::new(vm.irq_injector());
        let mut pio = PioBus::new();
        pio.add(
            crate::devices::SERIAL_COM1_BASE,
            crate::devices::SERIAL_COM1_END - 1,
            Box::new(serial.clone()),
        );
        // Must be registered before the PS/2 controller: the PS/2 interval
        // [0x60, 0x64] spans port 0x61, and the bus dispatches to the first
        // registered match on overlap.
        pio.add(PORT_NMI_ACK, PORT_NMI_ACK, Box::new(NmiAck::new()));
        pio.add(
            crate::devices::PS2_PORT_START,
            crate::devices::PS2_PORT_END,
            Box::new(Ps2Controller::new()),
        );

        let mut pci = PciBus::new();
        pci.add_device(Box::new(HostBridge::new()));
        pci.add_device(Box::new(VirtioNet::new()));
        pio.add(PCI_CATCHALL_START, PCI_CATCHALL_END, Box::new(pci));

        Ok(Self {
            vcpu,
            devices: Devices { pio, serial },
            _memory: memory,
            _tty: None,
        })
    }

    /// Spawns the background TTY pump feeding keystrokes into the UART.
    /// Must be called after [`Self::new`], before [`Self::run`].
    pub fn attach_tty(&mut self) -> Result<(), VmError> {
        self._tty = Some(TtyPump::start(self.devices.serial.clone())?);
        Ok(())
    }

    /// Runs the vCPU to completion, dispatching exits per spec.md §4.2.
    /// Returns once the guest halts or shuts down cleanly.
    pub fn run(&mut self) -> Result<(), VmError> {
        loop {
            match self.vcpu.run_with_io(&mut self.devices)? {
                VcpuExit::Io => continue,
                VcpuExit::Hlt => {
                    tracing::info!("guest halted");
                    return Ok(());
                }
                VcpuExit::Shutdown => {
                    tracing::info!("guest requested shutdown");
                    return Ok(());
                }
                VcpuExit::InternalError => return Err(VmError::InternalError),
                VcpuExit::FailEntry(reason) => return Err(VmError::FailEntry(reason)),
                VcpuExit::SystemEvent(event) => {
                    return Err(VmError::UnexpectedExit(format!("SystemEvent({event:#x})")))
                }
                VcpuExit::Unknown(reason) => return Err(VmError::UnexpectedExit(reason.to_string())),
            }
        }
    }
}

fn read_image(path: impl AsRef<std::path::Path>) -> Result<Vec<u8>, VmError> {
    let path = path.as_ref();
    fs::read(path).map_err(|source| VmError::ImageRead {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devices_dispatch_through_the_pio_bus() {
        let mut pio = PioBus::new();
        pio.add(PORT_NMI_ACK, PORT_NMI_ACK, Box::new(NmiAck::new()));
        let mut data = kvm::IoData::new(1);
        pio.io_read(PORT_NMI_ACK, &mut data);
        assert_eq!(data.as_slice(), &[0x20]);
    }
}
