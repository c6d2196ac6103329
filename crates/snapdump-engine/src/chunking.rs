//! Chunk policy shared by both dump modes: how big each read is, where it
//! starts, how the last one is clamped, and how reads wait for budget.

use std::io;
use std::sync::PoisonError;
use std::time::Duration;

use bytes::Bytes;

use crate::pipeline::Shutdown;
use crate::qos::{RateLimitError, SharedBucket, TokenBucket};
use crate::source::{ImageSource, ReadFlags};
use crate::{TransferError, DEFAULT_CHUNK_SIZE};

/// Wait between token attempts when none is configured.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// Natural read size for an image: one object per stripe, across all
/// stripes.
pub fn default_chunk_size<S: ImageSource + ?Sized>(source: &S) -> u64 {
    match source.object_size().saturating_mul(source.stripe_count().max(1)) {
        0 => DEFAULT_CHUNK_SIZE,
        size => size,
    }
}

// ── Plan ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub offset: u64,
    pub len: u64,
}

impl ChunkSpan {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Sequential spans covering `[0, total)`. Every span is `chunk_size` long
/// except possibly the last, which holds the remainder.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    total: u64,
    chunk_size: u64,
    next: u64,
}

impl ChunkPlan {
    /// A zero chunk size falls back to [`DEFAULT_CHUNK_SIZE`].
    pub fn new(total: u64, chunk_size: u64) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Self {
            total,
            chunk_size,
            next: 0,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Number of spans the plan yields in total.
    pub fn chunk_count(&self) -> u64 {
        self.total.div_ceil(self.chunk_size)
    }
}

impl Iterator for ChunkPlan {
    type Item = ChunkSpan;

    fn next(&mut self) -> Option<ChunkSpan> {
        if self.next >= self.total {
            return None;
        }
        let span = ChunkSpan {
            offset: self.next,
            len: self.chunk_size.min(self.total - self.next),
        };
        self.next = span.end();
        Some(span)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.total - self.next).div_ceil(self.chunk_size);
        let left = usize::try_from(left).unwrap_or(usize::MAX);
        (left, Some(left))
    }
}

/// Read one span. A source that refuses the range as running past the end
/// of the image gets exactly one retry, clamped to what the image holds
/// past `span.offset`.
pub fn read_span<S: ImageSource + ?Sized>(
    source: &mut S,
    span: ChunkSpan,
    flags: ReadFlags,
) -> io::Result<Bytes> {
    let len = usize::try_from(span.len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "chunk larger than memory"))?;

    match source.read(span.offset, len, flags) {
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => {
            let remaining = source.size()?.saturating_sub(span.offset);
            if remaining == 0 || remaining >= span.len {
                return Err(e);
            }
            tracing::debug!(
                offset = span.offset,
                requested = span.len,
                remaining,
                "read ran past image end, retrying with remainder"
            );
            // remaining < span.len, which already fit in usize
            source.read(span.offset, remaining as usize, flags)
        }
        other => other,
    }
}

// ── Throttle ──────────────────────────────────────────────────────────────────

/// Rate settings for one transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleSettings {
    /// Sustained read budget in bytes/sec.
    pub bytes_per_sec: f64,
    /// Bucket capacity in bytes. Zero means one second of `bytes_per_sec`.
    pub burst_bytes: f64,
    pub backoff: Duration,
}

impl ThrottleSettings {
    pub fn new(bytes_per_sec: f64) -> Self {
        Self {
            bytes_per_sec,
            burst_bytes: 0.0,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

/// Gate in front of every read. Clones draw from the same bucket.
#[derive(Debug, Clone)]
pub struct Throttle {
    bucket: SharedBucket,
    backoff: Duration,
}

impl Throttle {
    pub fn new(bucket: SharedBucket, backoff: Duration) -> Self {
        Self { bucket, backoff }
    }

    /// Build a fresh bucket able to admit at least one `chunk_size` read.
    pub fn for_chunks(settings: &ThrottleSettings, chunk_size: u64) -> Result<Self, RateLimitError> {
        let mut capacity = if settings.burst_bytes > 0.0 {
            settings.burst_bytes
        } else {
            settings.bytes_per_sec
        };
        let chunk = chunk_size as f64;
        if capacity.is_finite() && capacity > 0.0 && capacity < chunk {
            tracing::warn!(capacity, chunk_size, "burst smaller than one chunk, raising it");
            capacity = chunk;
        }
        let bucket = TokenBucket::try_new(capacity, settings.bytes_per_sec)?;
        Ok(Self::new(bucket.shared(), settings.backoff))
    }

    pub fn bucket(&self) -> &SharedBucket {
        &self.bucket
    }

    /// Take `bytes` tokens, sleeping `backoff` between attempts. Gives up
    /// with [`TransferError::Cancelled`] once `shutdown` fires.
    ///
    /// Blocks the calling thread.
    pub fn acquire(&self, bytes: u64, shutdown: &mut Shutdown) -> Result<(), TransferError> {
        let wanted = bytes as f64;
        loop {
            let (granted, capacity) = {
                let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
                (bucket.consume(wanted), bucket.capacity())
            };
            if granted {
                return Ok(());
            }
            // No amount of waiting fills a bucket past its capacity.
            if wanted > capacity {
                return Err(RateLimitError::Capacity(capacity).into());
            }
            if shutdown.fired() {
                return Err(TransferError::Cancelled);
            }
            tracing::trace!(bytes, backoff_ms = self.backoff.as_millis() as u64, "throttled");
            std::thread::sleep(self.backoff);
        }
    }
}
