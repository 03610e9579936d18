//! Virtual Machine creation and memory management.
//!
//! This module handles VM-level KVM operations: reserving the TSS and
//! identity-map addresses Intel VT-x requires, creating the in-kernel IRQ
//! chip and PIT, registering guest memory, and creating the single vCPU this
//! VMM supports.
//!
//! # Construction order
//!
//! KVM is picky about sequencing: the TSS and identity-map addresses must be
//! set before any vCPU exists, and CPUID must be installed on a vCPU before
//! it first runs. Rather than hide that order inside one constructor, each
//! step is its own method and the orchestrator (`crate::vmm`) calls them in
//! sequence, which keeps the ordering invariant visible and lets us return a
//! precise [`super::KvmError::NotReady`] if it's violated.
//!
//! # Memory regions
//!
//! Guest memory is managed through "memory slots". Each slot maps a range of
//! guest physical addresses to host virtual addresses. This VMM uses a single
//! slot (0) covering all of guest RAM starting at guest physical address 0.

use std::sync::Arc;

use kvm_bindings::{kvm_pit_config, kvm_userspace_memory_region, CpuId, KVM_PIT_SPEAKER_DUMMY};

use super::{KvmError, VcpuFd};

/// Number of bytes reserved above guest RAM for the TSS (3 pages) and the
/// identity-map page KVM requires (1 page) — see spec.md §4.1 steps 3–4.
const PAGE_SIZE: u64 = 0x1000;
const TSS_PAGES: u64 = 3;
const RESERVED_ABOVE_MEMORY: u64 = (TSS_PAGES + 1) * PAGE_SIZE;

/// Wrapper around the KVM VM file descriptor.
pub struct VmFd {
    /// The underlying KVM VM file descriptor, shared with devices that need
    /// to inject interrupts (see [`IrqInjector`]).
    vm: Arc<kvm_ioctls::VmFd>,

    /// Whether a vCPU has already been created. Several VM-level ioctls
    /// (TSS/identity-map address) are only legal before this happens.
    vcpu_created: bool,
}

/// A cheap, cloneable handle devices use to raise and lower guest IRQ lines.
///
/// KVM's `set_irq_line` ioctl takes `&self`, so sharing the VM fd behind an
/// `Arc` is sufficient; no locking is needed.
#[derive(Clone)]
pub struct IrqInjector(Arc<kvm_ioctls::VmFd>);

impl IrqInjector {
    /// Raises then lowers `irq`, the edge-triggered pulse pattern the 8250
    /// UART and other legacy devices use to signal "data ready" (spec.md
    /// §4.4).
    pub fn pulse(&self, irq: u32) -> Result<(), KvmError> {
        self.0.set_irq_line(irq, true).map_err(KvmError::SetIrqLine)?;
        self.0
            .set_irq_line(irq, false)
            .map_err(KvmError::SetIrqLine)
    }
}

impl VmFd {
    /// Wraps a freshly created KVM VM file descriptor. No x86 components are
    /// initialized yet; call [`Self::reserve_tss_and_identity_map`],
    /// [`Self::create_irq_chip`], and [`Self::create_pit2`] before creating a
    /// vCPU.
    pub fn new(vm: kvm_ioctls::VmFd) -> Self {
        Self {
            vm: Arc::new(vm),
            vcpu_created: false,
        }
    }

    /// Returns a handle devices can use to inject interrupts.
    pub fn irq_injector(&self) -> IrqInjector {
        IrqInjector(Arc::clone(&self.vm))
    }

    /// Reserves the TSS (3 pages at guest physical address `mem_size`) and
    /// the identity-map page (1 page at `mem_size + 3 * PAGE_SIZE`) Intel
    /// VT-x requires, per spec.md §4.1 steps 3–4.
    ///
    /// Must be called before [`Self::create_vcpu`]. `mem_size` must leave
    /// room for both regions below the 4 GiB boundary.
    pub fn reserve_tss_and_identity_map(&mut self, mem_size: u64) -> Result<(), KvmError> {
        if self.vcpu_created {
            return Err(KvmError::NotReady);
        }
        if mem_size > u32::MAX as u64 - RESERVED_ABOVE_MEMORY {
            return Err(KvmError::GMemNotEnough);
        }

        self.vm
            .set_tss_address(mem_size as usize)
            .map_err(KvmError::SetTssAddress)?;
        self.vm
            .set_identity_map_address(mem_size + TSS_PAGES * PAGE_SIZE)
            .map_err(KvmError::SetTssAddress)?;
        Ok(())
    }

    /// Creates the in-kernel IRQ chip (PIC + IOAPIC).
    pub fn create_irq_chip(&self) -> Result<(), KvmError> {
        self.vm.create_irq_chip().map_err(KvmError::CreateIrqChip)
    }

    /// Creates the in-kernel 8254 PIT with an all-zero configuration
    /// (`KVM_PIT_SPEAKER_DUMMY` disables PC speaker output on port 0x61; we
    /// never enable it).
    pub fn create_pit2(&self) -> Result<(), KvmError> {
        let pit_config = kvm_pit_config {
            flags: KVM_PIT_SPEAKER_DUMMY,
            ..Default::default()
        };
        self.vm.create_pit2(pit_config).map_err(KvmError::CreatePit2)
    }

    /// Registers a guest memory region with KVM.
    ///
    /// # Safety
    ///
    /// The caller must ensure the host memory region at `userspace_addr`
    /// remains valid and mapped for as long as the VM exists, and that it
    /// does not overlap with any other registered slot.
    pub unsafe fn set_user_memory_region(
        &self,
        slot: u32,
        guest_addr: u64,
        memory_size: u64,
        userspace_addr: u64,
    ) -> Result<(), KvmError> {
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: guest_addr,
            memory_size,
            userspace_addr,
            flags: 0,
        };

        unsafe {
            self.vm
                .set_user_memory_region(region)
                .map_err(KvmError::SetMemoryRegion)
        }
    }

    /// Creates vCPU `id` and installs `cpuid` on it. This VMM only ever
    /// creates vCPU 0 (single-vCPU, per spec.md's Non-goals).
    pub fn create_vcpu(&mut self, id: u64, cpuid: &CpuId) -> Result<VcpuFd, KvmError> {
        let vcpu = self.vm.create_vcpu(id).map_err(KvmError::CreateVcpu)?;
        vcpu.set_cpuid2(cpuid).map_err(KvmError::SetCpuid)?;
        self.vcpu_created = true;
        Ok(VcpuFd::new(vcpu))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_above_memory_is_four_pages() {
        assert_eq!(RESERVED_ABOVE_MEMORY, 4 * PAGE_SIZE);
    }
}
