//! Boot orchestration for an unmodified Linux kernel on x86.
//!
//! This module implements the pieces of the Linux x86 boot protocol needed to
//! hand a bzImage control of a freshly created vCPU: parsing the setup
//! header, building the zero page, and switching the vCPU into the flat
//! 32-bit protected mode the kernel's decompressor expects at its entry
//! point.
//!
//! Unlike a 64-bit long-mode boot (GDT with a 64-bit code segment, four
//! levels of page tables, EFER.LME/LMA), this VMM hands control to the guest
//! in plain 32-bit protected mode with paging disabled: flat code/data
//! segments covering the full 4 GiB address space and `CR0.PE=1`. The kernel
//! brings up its own page tables and long mode itself.
//!
//! Reference: <https://www.kernel.org/doc/html/latest/x86/boot.html>

mod bzimage;
mod cpu;
mod memory;
mod params;

pub use memory::GuestMemory;
pub use params::{e820_type, BootE820Entry, BootParams, SetupHeader};

use crate::kvm::{KvmError, VcpuFd};
use thiserror::Error;

/// Guest physical memory layout constants (spec.md §4.1).
pub mod layout {
    /// Zero page (`BootParams`) location.
    pub const BOOTPARAM: u64 = 0x0001_0000;

    /// Kernel command line location.
    pub const CMDLINE: u64 = 0x0002_0000;

    /// Where the protected-mode kernel code is loaded (the traditional 1 MiB mark).
    pub const KERNEL_BASE: u64 = 0x0010_0000;

    /// Where an initrd/initramfs image is loaded, if present.
    pub const INITRD: u64 = 0x3000_0000;

    /// Guest page size.
    pub const PAGE_SIZE: u64 = 0x1000;

    /// Maximum kernel command line length this VMM will write (protocol default).
    pub const CMDLINE_MAX_SIZE: usize = 2048;
}

/// Errors that can occur while loading a kernel/initrd or configuring boot state.
#[derive(Error, Debug)]
pub enum BootError {
    #[error("failed to allocate guest memory: {0}")]
    MemoryAllocation(#[source] std::io::Error),

    #[error("KVM error: {0}")]
    Kvm(#[from] KvmError),

    #[error("invalid kernel image: {0}")]
    InvalidKernel(String),

    #[error("command line too long: {len} bytes (max {max})")]
    CmdlineTooLong { len: usize, max: usize },

    #[error("kernel image does not fit in guest memory (needs {needed} bytes, have {available})")]
    KernelTooLarge { needed: u64, available: u64 },

    #[error("initrd does not fit in guest memory (needs {needed} bytes, have {available})")]
    InitrdTooLarge { needed: u64, available: u64 },
}

/// Result of loading a kernel and (optional) initrd into guest memory, per
/// spec.md §4.1's kernel+initrd load contract.
pub struct LoadedImages {
    /// Guest physical address the vCPU should start executing at.
    pub entry_point: u64,
    /// Guest physical address of the populated zero page.
    pub boot_params_addr: u64,
}

/// Loads `kernel_bytes` (and, if present, `initrd_bytes`) into `memory`,
/// builds and writes the zero page, writes the command line, and returns the
/// entry point the vCPU should be pointed at.
///
/// This implements spec.md §4.1's "Kernel+initrd load contract" steps 1–7;
/// step 8 (setting vCPU registers) is performed by [`cpu::enter_protected_mode`],
/// which the orchestrator calls separately once the vCPU exists.
pub fn load_kernel_and_initrd(
    memory: &GuestMemory,
    mem_size: u64,
    kernel_bytes: &[u8],
    initrd_bytes: Option<&[u8]>,
    cmdline: &str,
) -> Result<LoadedImages, BootError> {
    if mem_size < 1024 * 1024 * 1024 {
        return Err(BootError::MemoryAllocation(std::io::Error::other(
            "guest memory must be at least 1 GiB",
        )));
    }

    let loaded = bzimage::load_kernel(kernel_bytes)?;

    let kernel_code_len = loaded.protected_mode_code.len() as u64;
    let available_for_kernel = mem_size - layout::KERNEL_BASE;
    if kernel_code_len > available_for_kernel {
        return Err(BootError::KernelTooLarge {
            needed: kernel_code_len,
            available: available_for_kernel,
        });
    }

    let mut header = loaded.setup_header;
    header.type_of_loader = 0xff;
    header.ext_loader_ver = 0;
    header.loadflags |= params::LOADFLAGS_LOADED_HIGH | params::LOADFLAGS_CAN_USE_HEAP;
    header.heap_end_ptr = (layout::BOOTPARAM - 0x200) as u16;
    header.loadflags |= params::LOADFLAGS_KEEP_SEGMENTS;
    header.cmd_line_ptr = layout::CMDLINE as u32;
    header.vid_mode = 0xffff;
    header.cmdline_size = layout::CMDLINE_MAX_SIZE as u32;

    let ramdisk = match initrd_bytes {
        Some(bytes) if !bytes.is_empty() => {
            let len = bytes.len() as u64;
            let available_for_initrd = mem_size - layout::INITRD;
            if len > available_for_initrd {
                return Err(BootError::InitrdTooLarge {
                    needed: len,
                    available: available_for_initrd,
                });
            }
            if layout::INITRD + len > header.initrd_addr_max as u64 {
                return Err(BootError::InitrdTooLarge {
                    needed: layout::INITRD + len,
                    available: header.initrd_addr_max as u64,
                });
            }
            header.ramdisk_image = layout::INITRD as u32;
            header.ramdisk_size = len as u32;
            Some((layout::INITRD, bytes))
        }
        _ => {
            header.ramdisk_image = 0;
            header.ramdisk_size = 0;
            None
        }
    };

    let mut params = BootParams::zeroed();
    params.hdr = header;
    let e820_entries = [
        BootE820Entry {
            addr: 0,
            size: layout::KERNEL_BASE,
            typ: e820_type::RAM,
        },
        BootE820Entry {
            addr: layout::KERNEL_BASE,
            size: mem_size - layout::KERNEL_BASE,
            typ: e820_type::RAM,
        },
    ];
    params.set_e820_table(&e820_entries);

    if let Some((addr, bytes)) = ramdisk {
        memory.write(addr, bytes)?;
    }

    write_cmdline(memory, cmdline)?;
    memory.write(layout::BOOTPARAM, params.as_bytes())?;
    memory.write(layout::KERNEL_BASE, &loaded.protected_mode_code)?;

    Ok(LoadedImages {
        entry_point: layout::KERNEL_BASE,
        boot_params_addr: layout::BOOTPARAM,
    })
}

fn write_cmdline(memory: &GuestMemory, cmdline: &str) -> Result<(), BootError> {
    if cmdline.len() >= layout::CMDLINE_MAX_SIZE {
        return Err(BootError::CmdlineTooLong {
            len: cmdline.len(),
            max: layout::CMDLINE_MAX_SIZE - 1,
        });
    }
    memory.write(layout::CMDLINE, cmdline.as_bytes())?;
    memory.write_u8(layout::CMDLINE + cmdline.len() as u64, 0)?;
    Ok(())
}

/// Switches vCPU 0 into flat 32-bit protected mode and points it at
/// `images.entry_point` with `rsi` set to the zero page (spec.md §4.1 step
/// 10 and the kernel+initrd load contract's step 8).
pub fn enter_protected_mode(
    vcpu: &VcpuFd,
    memory: &GuestMemory,
    images: &LoadedImages,
) -> Result<(), BootError> {
    cpu::enter_protected_mode(vcpu, memory, images.entry_point, images.boot_params_addr)
}
