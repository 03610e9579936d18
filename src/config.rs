//! CLI surface and the `VmConfig` record that is the sole boundary between
//! the command-line layer and the VMM core (spec.md §6).
//!
//! Command-line parsing itself is explicitly out of scope for the core; this
//! module is the thin collaborator the core consumes. It owns exactly one
//! piece of core-relevant logic: the `--memory` size-string parser, because
//! its grammar and edge cases are part of the testable contract (spec.md
//! §8, scenario 7).

use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;

/// Errors raised while turning CLI input into a `VmConfig`.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid memory size {0:?}: expected a number followed by K, M, or G")]
    InvalidMemoryUnit(String),
}

/// `pebble-vmm` — a minimal type-2 hypervisor that boots an unmodified
/// Linux kernel on top of KVM.
#[derive(Parser, Debug)]
#[command(name = "pebble-vmm")]
#[command(about = "Boot a Linux bzImage under KVM with a single vCPU")]
pub struct Args {
    /// Path to a Linux bzImage.
    #[arg(long)]
    pub kernel: PathBuf,

    /// Path to an initrd/initramfs image.
    #[arg(long)]
    pub initrd: Option<PathBuf>,

    /// Guest memory size, e.g. "1G", "512M", "10kb". Defaults to 1 GiB.
    #[arg(long, default_value = "1G")]
    pub memory: String,

    /// Kernel command line.
    #[arg(long, default_value = "console=ttyS0")]
    pub cmdline: String,
}

/// Configuration record the core consumes. This is the entire interface
/// between the CLI collaborator and the orchestrator (spec.md §6).
pub struct VmConfig {
    pub kernel_path: PathBuf,
    pub initrd_path: Option<PathBuf>,
    pub memory_bytes: u64,
    pub cmdline: String,
}

impl VmConfig {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let memory_bytes = parse_memory_size(&args.memory)?;
        Ok(Self {
            kernel_path: args.kernel,
            initrd_path: args.initrd,
            memory_bytes,
            cmdline: args.cmdline,
        })
    }
}

/// Parses a memory size string of the form `<number><unit>[B]`, where `unit`
/// is one of `K`/`k`, `M`/`m`, `G`/`g`, with optional surrounding whitespace
/// and an optional trailing `B`/`b`.
///
/// Examples: `"32GB"` → 32 GiB, `"10kb"` → 10 KiB, `"  1m"` → 1 MiB.
pub fn parse_memory_size(input: &str) -> Result<u64, ConfigError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::InvalidMemoryUnit(input.to_string()));
    }

    let mut chars = trimmed.char_indices().peekable();
    let mut split_at = trimmed.len();
    while let Some(&(idx, c)) = chars.peek() {
        if c.is_ascii_digit() || c == '.' {
            chars.next();
        } else {
            split_at = idx;
            break;
        }
    }

    let (number_part, mut unit_part) = trimmed.split_at(split_at);
    if number_part.is_empty() {
        return Err(ConfigError::InvalidMemoryUnit(input.to_string()));
    }
    let value: f64 = number_part
        .parse()
        .map_err(|_| ConfigError::InvalidMemoryUnit(input.to_string()))?;

    if let Some(stripped) = unit_part.strip_suffix(['B', 'b']) {
        unit_part = stripped;
    }

    let multiplier: u64 = match unit_part {
        "K" | "k" => 1024,
        "M" | "m" => 1024 * 1024,
        "G" | "g" => 1024 * 1024 * 1024,
        _ => return Err(ConfigError::InvalidMemoryUnit(input.to_string())),
    };

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok((value * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gigabytes() {
        assert_eq!(parse_memory_size("32GB").unwrap(), 32 * 1024 * 1024 * 1024);
    }

    #[test]
    fn parses_kilobytes_lowercase() {
        assert_eq!(parse_memory_size("10kb").unwrap(), 10 * 1024);
    }

    #[test]
    fn parses_with_leading_whitespace() {
        assert_eq!(parse_memory_size("  1m").unwrap(), 1024 * 1024);
    }

    #[test]
    fn rejects_missing_unit() {
        assert!(parse_memory_size("1024").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_memory_size("abc").is_err());
    }

    #[test]
    fn rejects_empty() {
        assert!(parse_memory_size("").is_err());
    }
}
