use std::fs::File;

use anyhow::Result;
use snapdump_core::DiffWriter;
use snapdump_engine::{apply_diff_to_path, CleanupPolicy, Shutdown, TransferError};

use crate::*;

/// magic + s(1024) + w(0, "AAAA") + z(512, 512) + e
#[test]
fn test_small_diff_onto_fresh_file() -> Result<()> {
    let dir = Scratch::new()?;
    if !punch_supported(&dir) {
        eprintln!("SKIP: hole punching not supported on temp filesystem");
        return Ok(());
    }

    let diff = dir.path("small.diff");
    let mut w = DiffWriter::new(File::create(&diff)?)?;
    w.image_size(1024)?;
    w.write(0, b"AAAA")?;
    w.zero(512, 512)?;
    w.finish()?;

    let dest = dir.path("image.raw");
    let summary = apply_diff_to_path(
        &diff,
        &dest,
        CleanupPolicy::RemoveOnFailure,
        &mut Shutdown::never(),
    )?;

    let data = std::fs::read(&dest)?;
    assert_eq!(data.len(), 1024);
    assert_eq!(&data[..4], b"AAAA");
    assert!(data[512..].iter().all(|b| *b == 0));
    assert_eq!(summary.image_size, Some(1024));
    assert_eq!(summary.bytes_changed, 4 + 512);
    Ok(())
}

/// Zeroed ranges are deallocated, not written.
#[test]
fn test_zero_records_leave_holes() -> Result<()> {
    let dir = Scratch::new()?;
    if !punch_supported(&dir) {
        eprintln!("SKIP: hole punching not supported on temp filesystem");
        return Ok(());
    }

    // A fully allocated 8 MiB base image.
    let base = dir.image("base.raw", 8 * MIB)?;
    let before = allocated_bytes(&base)?;
    assert!(before >= 8 * MIB);

    let diff = dir.path("holes.diff");
    let mut w = DiffWriter::new(File::create(&diff)?)?;
    w.from_snap("monday")?;
    w.to_snap("tuesday")?;
    w.image_size(8 * MIB)?;
    w.zero(MIB, 6 * MIB)?;
    w.write(0, b"header")?;
    w.finish()?;

    let summary = apply_diff_to_path(&diff, &base, CleanupPolicy::Keep, &mut Shutdown::never())?;
    assert_eq!(summary.from_snap.as_deref(), Some("monday"));
    assert_eq!(summary.to_snap.as_deref(), Some("tuesday"));

    let data = std::fs::read(&base)?;
    assert_eq!(data.len() as u64, 8 * MIB);
    assert_eq!(&data[..6], b"header");
    assert!(data[MIB as usize..7 * MIB as usize].iter().all(|b| *b == 0));
    assert_eq!(&data[7 * MIB as usize..], &pattern(8 * MIB)[7 * MIB as usize..]);

    let after = allocated_bytes(&base)?;
    assert!(
        after + 5 * MIB <= before,
        "expected ~6 MiB released: before={before} after={after}"
    );
    Ok(())
}

/// Sizes shrink and grow the target, matching the declared image size.
#[test]
fn test_size_record_truncates_existing_image() -> Result<()> {
    let dir = Scratch::new()?;
    let base = dir.image("base.raw", 2 * MIB)?;

    let diff = dir.path("shrink.diff");
    let mut w = DiffWriter::new(File::create(&diff)?)?;
    w.image_size(MIB)?;
    w.finish()?;

    apply_diff_to_path(&diff, &base, CleanupPolicy::Keep, &mut Shutdown::never())?;
    assert_eq!(std::fs::metadata(&base)?.len(), MIB);
    assert_eq!(std::fs::read(&base)?, pattern(MIB));
    Ok(())
}

#[test]
fn test_trailing_bytes_after_end_rejected() -> Result<()> {
    let dir = Scratch::new()?;
    let diff = dir.path("trailing.diff");
    let mut w = DiffWriter::new(File::create(&diff)?)?;
    w.image_size(4096)?;
    let mut file = w.finish()?;
    std::io::Write::write_all(&mut file, b"junk")?;
    drop(file);

    let dest = dir.path("image.raw");
    let err = apply_diff_to_path(
        &diff,
        &dest,
        CleanupPolicy::RemoveOnFailure,
        &mut Shutdown::never(),
    )
    .unwrap_err();
    assert!(err.is_format_error(), "{err}");
    assert!(matches!(err, TransferError::Diff(_)));
    assert!(!dest.exists());
    Ok(())
}
