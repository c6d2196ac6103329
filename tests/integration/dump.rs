use std::sync::{Arc, Mutex};

use anyhow::Result;
use snapdump_engine::{
    export_to_path, CleanupPolicy, DumpOptions, FileImageSource, NoProgress, Shutdown,
};

use crate::*;

fn recorder() -> (Arc<Mutex<Vec<(u64, u64)>>>, impl FnMut(u64, u64) + Send + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let seen = seen.clone();
        move |done: u64, total: u64| seen.lock().unwrap().push((done, total))
    };
    (seen, sink)
}

/// 10 MiB image in 4 MiB chunks: 4 + 4 + 2, three progress reports.
#[tokio::test]
async fn test_dump_ten_mib_in_four_mib_chunks() -> Result<()> {
    let dir = Scratch::new()?;
    let image = dir.image("image.raw", 10 * MIB)?;
    let dest = dir.path("dump.raw");
    let (seen, progress) = recorder();

    let options = DumpOptions {
        chunk_size: Some(4 * MIB),
        ..DumpOptions::default()
    };
    let report = export_to_path(
        FileImageSource::open(&image)?,
        &dest,
        progress,
        options,
        CleanupPolicy::RemoveOnFailure,
        Shutdown::never(),
    )
    .await?;

    assert_eq!(report.chunks, 3);
    assert_eq!(report.bytes, 10 * MIB);
    assert_eq!(std::fs::metadata(&dest)?.len(), 10 * MIB);
    assert_eq!(std::fs::read(&dest)?, std::fs::read(&image)?);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(4 * MIB, 10 * MIB), (8 * MIB, 10 * MIB), (10 * MIB, 10 * MIB)]
    );
    Ok(())
}

#[tokio::test]
async fn test_sequential_and_pipelined_agree() -> Result<()> {
    let dir = Scratch::new()?;
    let image = dir.image("image.raw", 3 * MIB + 17)?;
    let mut digests = Vec::new();

    for pipelined in [true, false] {
        let dest = dir.path(&format!("dump-{pipelined}.raw"));
        let options = DumpOptions {
            chunk_size: Some(256 * KIB),
            pipelined,
            ..DumpOptions::default()
        };
        let report = export_to_path(
            FileImageSource::open(&image)?,
            &dest,
            NoProgress,
            options,
            CleanupPolicy::RemoveOnFailure,
            Shutdown::never(),
        )
        .await?;

        assert_eq!(report.chunks, 13);
        assert_eq!(std::fs::read(&dest)?, std::fs::read(&image)?);
        digests.push(report.digest);
    }

    assert_eq!(digests[0], digests[1]);
    Ok(())
}

/// Chunk size falls back to object size x stripe count.
#[tokio::test]
async fn test_default_chunk_size_follows_geometry() -> Result<()> {
    let dir = Scratch::new()?;
    let image = dir.image("image.raw", MIB)?;
    let dest = dir.path("dump.raw");

    let source = FileImageSource::open(&image)?.with_geometry(16, 2);
    let report = export_to_path(
        source,
        &dest,
        NoProgress,
        DumpOptions::default(),
        CleanupPolicy::Keep,
        Shutdown::never(),
    )
    .await?;

    assert_eq!(report.chunk_size, 128 * KIB);
    assert_eq!(report.chunks, 8);
    Ok(())
}

#[tokio::test]
async fn test_empty_image_dumps_to_empty_file() -> Result<()> {
    let dir = Scratch::new()?;
    let image = dir.image("empty.raw", 0)?;
    let dest = dir.path("dump.raw");
    let (seen, progress) = recorder();

    let report = export_to_path(
        FileImageSource::open(&image)?,
        &dest,
        progress,
        DumpOptions::default(),
        CleanupPolicy::RemoveOnFailure,
        Shutdown::never(),
    )
    .await?;

    assert_eq!(report.bytes, 0);
    assert_eq!(std::fs::metadata(&dest)?.len(), 0);
    assert_eq!(*seen.lock().unwrap(), vec![(0, 0)]);
    Ok(())
}
