//! snapdump integration test harness.
//!
//! Tests run the public engine entry points against real files in a
//! temporary directory. Nothing here needs root or a storage cluster:
//! images are local files read through `FileImageSource`.
//!
//!   cargo test --test integration
//!
//! Sparse-allocation checks depend on the temp filesystem supporting hole
//! punching and skip when it does not.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;

mod diff;
mod dump;
mod failures;
mod throttle;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;

/// A scratch directory that lives as long as the test holds it.
pub struct Scratch {
    dir: TempDir,
}

impl Scratch {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir().context("failed to create temp dir")?,
        })
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write a deterministic image of `len` bytes with no chunk-sized period.
    pub fn image(&self, name: &str, len: u64) -> Result<PathBuf> {
        let path = self.path(name);
        std::fs::write(&path, pattern(len)).with_context(|| format!("writing {name}"))?;
        Ok(path)
    }
}

pub fn pattern(len: u64) -> Vec<u8> {
    (0..len)
        .map(|i| (i.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 56) as u8)
        .collect()
}

/// Bytes actually backed by storage, from `st_blocks`.
pub fn allocated_bytes(path: &Path) -> Result<u64> {
    use std::os::unix::fs::MetadataExt;
    Ok(std::fs::metadata(path)?.blocks() * 512)
}

/// Whether the filesystem holding `dir` can punch holes. Tests that depend
/// on it call this and skip when it returns false.
pub fn punch_supported(dir: &Scratch) -> bool {
    use snapdump_engine::{FileSink, OutputSink, TransferError};

    let probe = dir.path("punch-probe");
    let Ok(mut sink) = FileSink::create(&probe) else {
        return false;
    };
    if sink.write_at(0, &[1u8; 8192]).is_err() {
        return false;
    }
    !matches!(sink.punch_hole(0, 4096), Err(TransferError::Unsupported(_)))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[test]
fn test_pattern_is_not_chunk_periodic() {
    let data = pattern(2 * MIB);
    assert_ne!(&data[..MIB as usize], &data[MIB as usize..]);
}

#[test]
fn test_allocated_bytes_tracks_writes() -> Result<()> {
    let dir = Scratch::new()?;
    let path = dir.image("dense.img", 64 * KIB)?;
    assert!(allocated_bytes(&path)? >= 64 * KIB);
    Ok(())
}
