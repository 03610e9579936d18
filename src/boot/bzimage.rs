//! Linux bzImage parsing.
//!
//! A bzImage consists of three parts: a legacy boot sector (512 bytes, unused
//! for direct boot), the setup header and real-mode setup code
//! (`setup_sects * 512` bytes), and the protected-mode kernel itself, which
//! this VMM loads at the 1 MiB mark.
//!
//! ```text
//! +------------------+ 0x0000
//! |   Boot sector    | 512 bytes
//! +------------------+ 0x0200
//! |   Setup header   | setup_sects * 512 bytes, header at 0x1f1
//! |   & setup code   |
//! +------------------+
//! | Protected-mode   | loaded at KERNEL_BASE (0x100000)
//! |     kernel       |
//! +------------------+
//! ```
//!
//! Reference: <https://www.kernel.org/doc/html/latest/x86/boot.html>

use super::params::{SetupHeader, BOOT_FLAG_MAGIC, HDR_MAGIC};
use super::BootError;

/// Minimum image size that could plausibly contain a setup header.
const MIN_IMAGE_SIZE: usize = 0x250;

/// A parsed bzImage, ready to be placed into guest memory.
pub struct LoadedKernel {
    pub setup_header: SetupHeader,
    pub protected_mode_code: Vec<u8>,
}

/// Parses `kernel_bytes` as a bzImage and splits it into its setup header and
/// protected-mode kernel code.
///
/// Does not touch guest memory; the caller (`super::load_kernel_and_initrd`)
/// decides where to place the result.
pub fn load_kernel(kernel_bytes: &[u8]) -> Result<LoadedKernel, BootError> {
    if kernel_bytes.len() < MIN_IMAGE_SIZE {
        return Err(BootError::InvalidKernel(
            "image too small to contain a setup header".into(),
        ));
    }

    let header = SetupHeader::parse(kernel_bytes)
        .ok_or_else(|| BootError::InvalidKernel("image too small to contain a setup header".into()))?;

    let magic = header.header;
    if magic != HDR_MAGIC {
        return Err(BootError::InvalidKernel(format!(
            "invalid boot magic: expected {:#x}, got {:#x}",
            HDR_MAGIC, magic
        )));
    }
    let boot_flag = header.boot_flag;
    if boot_flag != BOOT_FLAG_MAGIC {
        return Err(BootError::InvalidKernel(format!(
            "invalid boot flag: expected {:#x}, got {:#x}",
            BOOT_FLAG_MAGIC, boot_flag
        )));
    }

    let setup_sects = if header.setup_sects == 0 {
        4
    } else {
        header.setup_sects
    };
    let setup_size = (setup_sects as usize + 1) * 512;
    if setup_size >= kernel_bytes.len() {
        return Err(BootError::InvalidKernel(
            "setup size exceeds kernel image size".into(),
        ));
    }

    let loadflags = header.loadflags;
    let version = header.version;
    tracing::debug!(setup_sects, loadflags, version, "parsed bzImage setup header");

    Ok(LoadedKernel {
        setup_header: header,
        protected_mode_code: kernel_bytes[setup_size..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_image(setup_sects: u8, extra_code_len: usize) -> Vec<u8> {
        let mut image = vec![0u8; 0x1f1];
        image.resize(0x1f1 + std::mem::size_of::<SetupHeader>(), 0);
        image[0x1f1] = setup_sects;
        image[0x1f1 + 0x0d..0x1f1 + 0x0f].copy_from_slice(&BOOT_FLAG_MAGIC.to_le_bytes());
        image[0x1f1 + 0x11..0x1f1 + 0x15].copy_from_slice(&HDR_MAGIC.to_le_bytes());
        let sects = if setup_sects == 0 { 4 } else { setup_sects };
        let total_setup = (sects as usize + 1) * 512;
        image.resize(total_setup + extra_code_len, 0xaa);
        image
    }

    #[test]
    fn rejects_short_images() {
        let image = vec![0u8; 16];
        assert!(matches!(load_kernel(&image), Err(BootError::InvalidKernel(_))));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut image = valid_image(4, 128);
        image[0x1f1 + 0x11] = 0;
        assert!(matches!(load_kernel(&image), Err(BootError::InvalidKernel(_))));
    }

    #[test]
    fn accepts_valid_image_and_splits_code() {
        let image = valid_image(4, 256);
        let loaded = load_kernel(&image).unwrap();
        assert_eq!(loaded.protected_mode_code.len(), 256);
        assert!(loaded.protected_mode_code.iter().all(|&b| b == 0xaa));
    }

    #[test]
    fn defaults_zero_setup_sects_to_four() {
        let image = valid_image(0, 64);
        let loaded = load_kernel(&image).unwrap();
        assert_eq!(loaded.protected_mode_code.len(), 64);
    }
}
