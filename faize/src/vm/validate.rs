//! Pre-start artifact validation.
//!
//! The framework's own errors for a malformed kernel or rootfs are opaque,
//! so the obvious failure modes are caught here with clear messages before
//! `start` is ever issued.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::errors::{FaizeError, FaizeResult};

/// Accept an ELF kernel or an ARM64 Linux `Image`.
///
/// ELF: magic `7F 45 4C 46`. ARM64 `Image`: bytes 56..60 are `A R M \x64`,
/// or the file opens with a plausible first instruction (branch `0x14..`
/// or a NOP-like `0xd5..` in the top byte).
pub fn validate_kernel_image(path: &Path) -> FaizeResult<()> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| FaizeError::Artifact(format!("cannot open kernel: {e}")))?;

    let mut header = [0u8; 64];
    let n = file
        .read(&mut header)
        .map_err(|e| FaizeError::Artifact(format!("cannot read kernel header: {e}")))?;
    if n < 4 {
        return Err(FaizeError::Artifact(format!(
            "cannot read kernel header: file is {n} bytes"
        )));
    }

    if header[..4] == [0x7F, b'E', b'L', b'F'] {
        tracing::debug!("kernel format: ELF");
        return Ok(());
    }

    if n >= 60 && header[56..60] == [b'A', b'R', b'M', 0x64] {
        tracing::debug!("kernel format: ARM64 Image");
        return Ok(());
    }

    // ARM64 Image files start with executable code; the first instruction
    // is typically a branch (0x14xxxxxx) or NOP-like (0xd503201f).
    if header[3] == 0x14 || header[3] == 0xd5 {
        tracing::debug!("kernel format: ARM64 Image (instruction prologue)");
        return Ok(());
    }

    Err(FaizeError::Artifact(format!(
        "kernel is not a valid ELF or ARM64 Image file (header: {:02x?})",
        &header[..8.min(n)]
    )))
}

/// Check for the ext4 superblock magic.
///
/// The superblock sits at offset 1024 and the magic `0xEF53` at offset 56
/// within it, so bytes 1080..1082 must be `53 EF` (little-endian).
pub fn validate_rootfs_ext4(path: &Path) -> FaizeResult<()> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| FaizeError::Artifact(format!("cannot open rootfs: {e}")))?;

    file.seek(SeekFrom::Start(1080))
        .map_err(|e| FaizeError::Artifact(format!("cannot seek to ext4 magic: {e}")))?;

    let mut magic = [0u8; 2];
    file.read_exact(&mut magic)
        .map_err(|e| FaizeError::Artifact(format!("cannot read ext4 magic: {e}")))?;

    if magic != [0x53, 0xEF] {
        return Err(FaizeError::Artifact(format!(
            "rootfs is not valid ext4 (magic: {:02x?})",
            magic
        )));
    }

    Ok(())
}
