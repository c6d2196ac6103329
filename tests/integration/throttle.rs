use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use snapdump_engine::chunking::ThrottleSettings;
use snapdump_engine::{
    export_to_path, CleanupPolicy, DumpOptions, FileImageSource, NoProgress, Shutdown, TokenBucket,
};

use crate::*;

/// capacity 1000, 1000 tokens/sec: drain, fail on one more, then succeed
/// with exactly what has refilled.
#[test]
fn test_bucket_partial_refill() {
    let mut bucket = TokenBucket::new(1000.0, 1000.0);
    assert!(bucket.consume(1000.0));
    assert!(!bucket.consume(1.0));

    let start = Instant::now();
    thread::sleep(Duration::from_millis(5));
    // At most what has refilled since the failed attempt.
    let refilled = (start.elapsed().as_secs_f64() * 1000.0).floor();
    assert!(refilled >= 5.0);
    assert!(bucket.consume(refilled));
}

#[test]
fn test_shared_bucket_across_threads() {
    let bucket = TokenBucket::new(100.0, 0.0001).shared();
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let bucket = bucket.clone();
            thread::spawn(move || (0..50).filter(|_| bucket.lock().unwrap().consume(1.0)).count())
        })
        .collect();

    let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(granted, 100);
}

/// A throttled dump takes about as long as its budget says.
#[tokio::test]
async fn test_throttled_dump_respects_rate() -> Result<()> {
    let dir = Scratch::new()?;
    let image = dir.image("image.raw", 256 * KIB)?;
    let dest = dir.path("dump.raw");

    // 64 KiB burst up front, then 128 KiB/s for the remaining 192 KiB.
    let options = DumpOptions {
        chunk_size: Some(32 * KIB),
        throttle: Some(ThrottleSettings {
            bytes_per_sec: (128 * KIB) as f64,
            burst_bytes: (64 * KIB) as f64,
            backoff: Duration::from_millis(10),
        }),
        ..DumpOptions::default()
    };

    let started = Instant::now();
    export_to_path(
        FileImageSource::open(&image)?,
        &dest,
        NoProgress,
        options,
        CleanupPolicy::RemoveOnFailure,
        Shutdown::never(),
    )
    .await?;
    let elapsed = started.elapsed();

    assert_eq!(std::fs::read(&dest)?, std::fs::read(&image)?);
    assert!(elapsed >= Duration::from_millis(1400), "finished too fast: {elapsed:?}");
    Ok(())
}
