//! CPU register setup for flat 32-bit protected-mode Linux boot.
//!
//! This VMM does not bring the guest up in 64-bit long mode: it hands
//! control to the kernel's decompressor in plain 32-bit protected mode, with
//! paging disabled, and lets the kernel build its own page tables and enter
//! long mode itself. That means no PML4/PDPTE/PDE hierarchy and no
//! EFER.LME/LMA — only a GDT with flat code/data segments and `CR0.PE=1`.
//!
//! # GDT
//!
//! - Null descriptor (index 0), required.
//! - Flat code segment (index 1): base 0, limit 0xFFFFFFFF, granularity 4K,
//!   32-bit default operand size.
//! - Flat data segment (index 2): same, but writable data type.
//!
//! # Register setup
//!
//! - `CR0.PE = 1`, nothing else.
//! - `CS`/`DS`/`ES`/`FS`/`GS`/`SS` all loaded from the flat segments above.
//! - `RIP = KERNEL_BASE`, `RSI = BOOTPARAM`, `RFLAGS = 0x2`.
//!
//! Reference: <https://www.kernel.org/doc/html/latest/x86/boot.html>

use super::layout;
use super::memory::GuestMemory;
use super::BootError;
use crate::kvm::VcpuFd;
use kvm_bindings::{kvm_fpu, kvm_regs, kvm_segment};

/// Where the GDT is written in guest memory. Chosen to sit well below
/// `KERNEL_BASE` and outside anything the kernel's real-mode trampoline
/// touches.
const GDT_START: u64 = 0x500;

/// CR0.PE — Protection Enable.
const X86_CR0_PE: u64 = 0x1;

const GDT_CODE: u16 = 1;
const GDT_DATA: u16 = 2;

/// Flat code and data segments covering the entire 4 GiB address space,
/// with paging off this is the only way the kernel's 32-bit entry point can
/// address all of guest memory.
const GDT_TABLE: [u64; 3] = [
    gdt_entry(0, 0, 0),            // 0x00: null descriptor
    gdt_entry(0xc09b, 0, 0xfffff), // 0x08: flat code, 32-bit, present, execute/read
    gdt_entry(0xc093, 0, 0xfffff), // 0x10: flat data, 32-bit, present, read/write
];

/// Constructs an 8-byte GDT entry from `flags`/`base`/`limit` fields laid out
/// the way the x86 descriptor format requires.
const fn gdt_entry(flags: u16, base: u32, limit: u32) -> u64 {
    ((base as u64 & 0xff00_0000) << 32)
        | ((base as u64 & 0x00ff_ffff) << 16)
        | (limit as u64 & 0x0000_ffff)
        | (((limit as u64 & 0x000f_0000) >> 16) << 48)
        | ((flags as u64) << 40)
}

fn kvm_segment_from_gdt(entry: u64, table_index: u8) -> kvm_segment {
    kvm_segment {
        base: ((entry >> 16) & 0xff_ffff) | (((entry >> 56) & 0xff) << 24),
        limit: ((entry & 0xffff) | (((entry >> 48) & 0xf) << 16)) as u32,
        selector: u16::from(table_index) * 8,
        type_: ((entry >> 40) & 0xf) as u8,
        present: ((entry >> 47) & 0x1) as u8,
        dpl: ((entry >> 45) & 0x3) as u8,
        db: ((entry >> 54) & 0x1) as u8,
        s: ((entry >> 44) & 0x1) as u8,
        l: ((entry >> 53) & 0x1) as u8,
        g: ((entry >> 55) & 0x1) as u8,
        ..Default::default()
    }
}

fn write_gdt(memory: &GuestMemory) -> Result<(), BootError> {
    let gdt_bytes: &[u8] =
        unsafe { std::slice::from_raw_parts(GDT_TABLE.as_ptr() as *const u8, GDT_TABLE.len() * 8) };
    memory.write(GDT_START, gdt_bytes)
}

fn setup_fpu(vcpu: &VcpuFd) -> Result<(), BootError> {
    let fpu = kvm_fpu {
        fcw: 0x37f,
        mxcsr: 0x1f80,
        ..Default::default()
    };
    vcpu.set_fpu(&fpu)?;
    Ok(())
}

/// Switches the vCPU into flat 32-bit protected mode and points it at
/// `entry_point` with `rsi = boot_params_addr`.
pub fn enter_protected_mode(
    vcpu: &VcpuFd,
    memory: &GuestMemory,
    entry_point: u64,
    boot_params_addr: u64,
) -> Result<(), BootError> {
    write_gdt(memory)?;
    setup_fpu(vcpu)?;

    let code_seg = kvm_segment_from_gdt(GDT_TABLE[GDT_CODE as usize], GDT_CODE as u8);
    let data_seg = kvm_segment_from_gdt(GDT_TABLE[GDT_DATA as usize], GDT_DATA as u8);

    let mut sregs = vcpu.get_sregs()?;
    sregs.gdt.base = GDT_START;
    sregs.gdt.limit = (std::mem::size_of_val(&GDT_TABLE) - 1) as u16;
    sregs.idt.base = 0;
    sregs.idt.limit = 0;

    sregs.cs = code_seg;
    sregs.ds = data_seg;
    sregs.es = data_seg;
    sregs.fs = data_seg;
    sregs.gs = data_seg;
    sregs.ss = data_seg;

    sregs.cr0 |= X86_CR0_PE;

    vcpu.set_sregs(&sregs)?;

    tracing::debug!(cr0 = sregs.cr0, "entered flat protected mode");

    let regs = kvm_regs {
        rflags: 0x2,
        rip: entry_point,
        rsi: boot_params_addr,
        ..Default::default()
    };
    vcpu.set_regs(&regs)?;

    tracing::info!(rip = regs.rip, rsi = regs.rsi, "vCPU ready to run");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_code_segment_covers_full_address_space() {
        let seg = kvm_segment_from_gdt(GDT_TABLE[GDT_CODE as usize], GDT_CODE as u8);
        assert_eq!(seg.base, 0);
        assert_eq!(seg.limit, 0xfffff);
        assert_eq!(seg.g, 1, "granularity bit must be set for a 4 GiB limit");
        assert_eq!(seg.db, 1, "default operand size must be 32-bit");
    }

    #[test]
    fn flat_data_segment_is_writable() {
        let seg = kvm_segment_from_gdt(GDT_TABLE[GDT_DATA as usize], GDT_DATA as u8);
        // type_ bit 1 (0x2) is the writable bit for data segments.
        assert_ne!(seg.type_ & 0x2, 0);
    }

    #[test]
    fn null_descriptor_is_all_zero() {
        assert_eq!(GDT_TABLE[0], 0);
    }
}
