use std::io;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use snapdump_engine::chunking::ThrottleSettings;
use snapdump_engine::{
    export_to_path, CleanupPolicy, DumpOptions, FileImageSource, ImageSource, NoProgress,
    ReadFlags, Shutdown, TransferError,
};

use crate::*;

/// A file image whose backing objects past `fail_at` have gone missing.
struct DamagedImage {
    inner: FileImageSource,
    fail_at: u64,
}

impl ImageSource for DamagedImage {
    fn size(&self) -> io::Result<u64> {
        self.inner.size()
    }

    fn read(&mut self, offset: u64, len: usize, flags: ReadFlags) -> io::Result<Bytes> {
        if offset >= self.fail_at {
            return Err(io::Error::other("object not found"));
        }
        self.inner.read(offset, len, flags)
    }

    fn object_size(&self) -> u64 {
        self.inner.object_size()
    }
}

fn damaged(dir: &Scratch, len: u64, fail_at: u64) -> Result<DamagedImage> {
    let image = dir.image("image.raw", len)?;
    Ok(DamagedImage {
        inner: FileImageSource::open(image)?,
        fail_at,
    })
}

#[tokio::test]
async fn test_read_failure_keeps_prefix_when_asked() -> Result<()> {
    let dir = Scratch::new()?;
    let dest = dir.path("dump.raw");
    let options = DumpOptions {
        chunk_size: Some(MIB),
        ..DumpOptions::default()
    };

    let err = export_to_path(
        damaged(&dir, 8 * MIB, 3 * MIB)?,
        &dest,
        NoProgress,
        options,
        CleanupPolicy::Keep,
        Shutdown::never(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, TransferError::Io(_)), "{err}");
    // Truncated at the last chunk that was written, never pre-extended.
    assert_eq!(std::fs::metadata(&dest)?.len(), 3 * MIB);
    assert_eq!(std::fs::read(&dest)?, pattern(3 * MIB));
    Ok(())
}

#[tokio::test]
async fn test_read_failure_removes_output_by_default() -> Result<()> {
    let dir = Scratch::new()?;
    let dest = dir.path("dump.raw");

    for pipelined in [true, false] {
        let options = DumpOptions {
            chunk_size: Some(MIB),
            pipelined,
            ..DumpOptions::default()
        };
        let err = export_to_path(
            damaged(&dir, 4 * MIB, 2 * MIB)?,
            &dest,
            NoProgress,
            options,
            CleanupPolicy::RemoveOnFailure,
            Shutdown::never(),
        )
        .await
        .unwrap_err();

        assert!(!err.is_format_error());
        assert!(!dest.exists(), "pipelined={pipelined}");
    }
    Ok(())
}

/// An interrupt while the reader waits for budget stops the dump and
/// cleans up.
#[tokio::test]
async fn test_interrupt_during_throttle_wait() -> Result<()> {
    let dir = Scratch::new()?;
    let image = dir.image("image.raw", 4 * MIB)?;
    let dest = dir.path("dump.raw");

    // One chunk up front, then a rate that would take minutes.
    let options = DumpOptions {
        chunk_size: Some(MIB),
        throttle: Some(ThrottleSettings {
            bytes_per_sec: 1024.0,
            burst_bytes: MIB as f64,
            backoff: Duration::from_millis(10),
        }),
        ..DumpOptions::default()
    };

    let (tx, rx) = tokio::sync::broadcast::channel(1);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = tx.send(());
    });

    let err = tokio::time::timeout(
        Duration::from_secs(10),
        export_to_path(
            FileImageSource::open(&image)?,
            &dest,
            NoProgress,
            options,
            CleanupPolicy::RemoveOnFailure,
            Shutdown::new(rx),
        ),
    )
    .await?
    .unwrap_err();

    assert!(matches!(err, TransferError::Cancelled), "{err}");
    assert!(!dest.exists());
    Ok(())
}

#[tokio::test]
async fn test_missing_source_file() -> Result<()> {
    let dir = Scratch::new()?;
    let err = FileImageSource::open(dir.path("nope.raw")).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::NotFound);
    Ok(())
}
