//! Streaming copy pipeline. Dumps a whole image into a sink.
//!
//! Pipelined mode runs a reader and a writer on blocking threads joined by
//! a bounded channel: the reader waits when the channel is full, the writer
//! when it is empty, and nothing is ever dropped. At most `queue_depth`
//! chunks are in flight. Sequential mode runs the same reads and writes in
//! one loop.
//!
//! On a read failure the sink holds everything before the failed chunk and
//! nothing after it.

use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::mpsc;

use snapdump_core::config::SnapdumpConfig;

use crate::chunking::{default_chunk_size, read_span, ChunkPlan, Throttle, ThrottleSettings};
use crate::progress::ProgressSink;
use crate::sink::OutputSink;
use crate::source::{ImageSource, ReadFlags};
use crate::TransferError;

// ── Shutdown ──────────────────────────────────────────────────────────────────

/// Stop signal polled between chunks and between throttle attempts.
///
/// Any message on the channel, or the receiver lagging behind, counts as
/// "stop". A closed channel does not.
#[derive(Debug)]
pub struct Shutdown {
    rx: Option<broadcast::Receiver<()>>,
    fired: bool,
}

impl Shutdown {
    pub fn new(rx: broadcast::Receiver<()>) -> Self {
        Self {
            rx: Some(rx),
            fired: false,
        }
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        Self {
            rx: None,
            fired: false,
        }
    }

    pub fn fired(&mut self) -> bool {
        if self.fired {
            return true;
        }
        let Some(rx) = self.rx.as_mut() else {
            return false;
        };
        match rx.try_recv() {
            Ok(()) | Err(TryRecvError::Lagged(_)) => {
                self.fired = true;
                true
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => false,
        }
    }

    /// Resolve once the signal fires. Never resolves for [`Shutdown::never`]
    /// or a closed channel.
    pub async fn wait(&mut self) {
        if self.fired {
            return;
        }
        if let Some(rx) = self.rx.as_mut() {
            loop {
                match rx.recv().await {
                    Ok(()) | Err(RecvError::Lagged(_)) => {
                        self.fired = true;
                        return;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
        std::future::pending::<()>().await;
    }

    /// A second handle on the same signal.
    pub fn resubscribe(&mut self) -> Shutdown {
        let fired = self.fired();
        Shutdown {
            rx: self.rx.as_ref().map(broadcast::Receiver::resubscribe),
            fired,
        }
    }
}

// ── Options / report ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DumpOptions {
    /// Bytes per read. `None` derives it from the image geometry.
    pub chunk_size: Option<u64>,
    /// Chunks buffered between reader and writer.
    pub queue_depth: usize,
    /// Flush the sink every N chunks. 0 flushes only at the end.
    pub flush_every: u32,
    /// Run reader and writer concurrently; see [`dump`].
    pub pipelined: bool,
    pub read_flags: ReadFlags,
    pub throttle: Option<ThrottleSettings>,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            chunk_size: None,
            queue_depth: 6,
            flush_every: 10,
            pipelined: true,
            read_flags: ReadFlags::default(),
            throttle: None,
        }
    }
}

impl DumpOptions {
    pub fn from_config(config: &SnapdumpConfig) -> Self {
        let transfer = &config.transfer;
        let throttle = match config.throttle.bytes_per_sec {
            0 => None,
            rate => Some(ThrottleSettings {
                bytes_per_sec: rate as f64,
                burst_bytes: config.throttle.burst_bytes as f64,
                backoff: Duration::from_millis(config.throttle.backoff_ms),
            }),
        };
        Self {
            chunk_size: (transfer.chunk_size > 0).then_some(transfer.chunk_size),
            queue_depth: transfer.queue_depth.max(1),
            flush_every: transfer.flush_every,
            pipelined: transfer.pipelined,
            read_flags: ReadFlags::default(),
            throttle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpReport {
    pub bytes: u64,
    pub chunks: u64,
    pub chunk_size: u64,
    /// BLAKE3 of everything written, hex encoded.
    pub digest: String,
    pub elapsed: Duration,
}

/// One read's worth of image data, handed from reader to writer.
#[derive(Debug, Clone)]
pub struct TransferChunk {
    pub offset: u64,
    pub data: Bytes,
}

enum QueueItem {
    Chunk(TransferChunk),
    End,
}

// ── Shared policy ─────────────────────────────────────────────────────────────

fn prepare<S: ImageSource + ?Sized>(
    source: &S,
    options: &DumpOptions,
) -> Result<(ChunkPlan, Option<Throttle>), TransferError> {
    let total = source.size()?;
    let chunk_size = options
        .chunk_size
        .filter(|size| *size > 0)
        .unwrap_or_else(|| default_chunk_size(source));
    let plan = ChunkPlan::new(total, chunk_size);
    let throttle = options
        .throttle
        .as_ref()
        .map(|settings| Throttle::for_chunks(settings, plan.chunk_size()))
        .transpose()?;

    tracing::info!(
        total,
        chunk_size = plan.chunk_size(),
        chunks = plan.chunk_count(),
        features = %source.features().describe(),
        throttled = throttle.is_some(),
        "dump starting"
    );
    Ok((plan, throttle))
}

fn close_source<S: ImageSource + ?Sized>(source: &mut S) {
    if let Err(e) = source.close() {
        tracing::warn!(error = %e, "closing image source failed");
    }
}

/// Write side bookkeeping: digest, flush cadence, progress.
struct ChunkWriter<'a, K: ?Sized, P: ?Sized> {
    sink: &'a mut K,
    progress: &'a mut P,
    hasher: blake3::Hasher,
    total: u64,
    written: u64,
    chunks: u64,
    flush_every: u32,
}

impl<'a, K, P> ChunkWriter<'a, K, P>
where
    K: OutputSink + ?Sized,
    P: ProgressSink + ?Sized,
{
    fn new(sink: &'a mut K, progress: &'a mut P, total: u64, flush_every: u32) -> Self {
        Self {
            sink,
            progress,
            hasher: blake3::Hasher::new(),
            total,
            written: 0,
            chunks: 0,
            flush_every,
        }
    }

    fn write(&mut self, chunk: &TransferChunk) -> Result<(), TransferError> {
        debug_assert_eq!(chunk.offset, self.written, "chunks out of order");
        self.sink.write_at(chunk.offset, &chunk.data)?;
        self.hasher.update(&chunk.data);
        self.written = chunk.offset + chunk.data.len() as u64;
        self.chunks += 1;

        if self.flush_every > 0 && self.chunks % u64::from(self.flush_every) == 0 {
            self.sink.flush()?;
        }
        self.progress.update(self.written, self.total);
        tracing::debug!(offset = chunk.offset, len = chunk.data.len(), "chunk written");
        Ok(())
    }

    fn complete(&mut self) {
        // An empty image reports once so the caller still sees 100%.
        if self.chunks == 0 {
            self.progress.update(0, self.total);
        }
    }

    /// Flush regardless of how the transfer ended; the first error wins.
    fn close(self, outcome: Result<(), TransferError>) -> Result<(u64, u64, String), TransferError> {
        let flushed = self.sink.flush();
        outcome?;
        flushed?;
        Ok((
            self.written,
            self.chunks,
            hex::encode(self.hasher.finalize().as_bytes()),
        ))
    }
}

fn report(
    (bytes, chunks, digest): (u64, u64, String),
    chunk_size: u64,
    started: Instant,
) -> DumpReport {
    let report = DumpReport {
        bytes,
        chunks,
        chunk_size,
        digest,
        elapsed: started.elapsed(),
    };
    tracing::info!(
        bytes = report.bytes,
        chunks = report.chunks,
        elapsed_ms = report.elapsed.as_millis() as u64,
        digest = %report.digest,
        "dump complete"
    );
    report
}

// ── Sequential ────────────────────────────────────────────────────────────────

/// Read, wait for budget, write, repeat, on the calling thread.
pub fn dump_sequential<S, K, P>(
    source: &mut S,
    sink: &mut K,
    progress: &mut P,
    options: &DumpOptions,
    shutdown: &mut Shutdown,
) -> Result<DumpReport, TransferError>
where
    S: ImageSource + ?Sized,
    K: OutputSink + ?Sized,
    P: ProgressSink + ?Sized,
{
    let started = Instant::now();
    let (plan, throttle) = match prepare(source, options) {
        Ok(prepared) => prepared,
        Err(e) => {
            close_source(source);
            return Err(e);
        }
    };
    let chunk_size = plan.chunk_size();
    let mut writer = ChunkWriter::new(sink, progress, plan.total(), options.flush_every);

    let outcome = copy_sequential(
        source,
        plan,
        options.read_flags,
        throttle.as_ref(),
        &mut writer,
        shutdown,
    );

    close_source(source);
    let totals = writer.close(outcome)?;
    Ok(report(totals, chunk_size, started))
}

fn copy_sequential<S, K, P>(
    source: &mut S,
    plan: ChunkPlan,
    flags: ReadFlags,
    throttle: Option<&Throttle>,
    writer: &mut ChunkWriter<'_, K, P>,
    shutdown: &mut Shutdown,
) -> Result<(), TransferError>
where
    S: ImageSource + ?Sized,
    K: OutputSink + ?Sized,
    P: ProgressSink + ?Sized,
{
    for span in plan {
        if shutdown.fired() {
            return Err(TransferError::Cancelled);
        }
        if let Some(throttle) = throttle {
            throttle.acquire(span.len, shutdown)?;
        }
        let data = read_span(source, span, flags)?;
        writer.write(&TransferChunk {
            offset: span.offset,
            data,
        })?;
    }
    writer.complete();
    Ok(())
}

// ── Pipelined ─────────────────────────────────────────────────────────────────

fn produce<S: ImageSource + ?Sized>(
    source: &mut S,
    plan: ChunkPlan,
    flags: ReadFlags,
    throttle: Option<&Throttle>,
    tx: &mpsc::Sender<QueueItem>,
    shutdown: &mut Shutdown,
) -> Result<(), TransferError> {
    for span in plan {
        if shutdown.fired() {
            return Err(TransferError::Cancelled);
        }
        if let Some(throttle) = throttle {
            throttle.acquire(span.len, shutdown)?;
        }
        let data = read_span(source, span, flags)?;
        let chunk = TransferChunk {
            offset: span.offset,
            data,
        };
        if tx.blocking_send(QueueItem::Chunk(chunk)).is_err() {
            // The writer stopped; its result says why.
            return Ok(());
        }
    }
    // Same as above if the writer is already gone.
    let _ = tx.blocking_send(QueueItem::End);
    Ok(())
}

fn drain<K, P>(
    rx: &mut mpsc::Receiver<QueueItem>,
    writer: &mut ChunkWriter<'_, K, P>,
    shutdown: &mut Shutdown,
) -> Result<(), TransferError>
where
    K: OutputSink + ?Sized,
    P: ProgressSink + ?Sized,
{
    loop {
        if shutdown.fired() {
            return Err(TransferError::Cancelled);
        }
        match rx.blocking_recv() {
            Some(QueueItem::Chunk(chunk)) => writer.write(&chunk)?,
            Some(QueueItem::End) => {
                writer.complete();
                return Ok(());
            }
            // Reader bailed out; its error is reported instead of this one.
            None if shutdown.fired() => return Err(TransferError::Cancelled),
            None => return Err(TransferError::Task("reader stopped before end of image".into())),
        }
    }
}

/// Dump `source` into `sink` with reader and writer running concurrently.
///
/// Both sides run on tokio's blocking pool. The source is closed and the
/// sink flushed and dropped before this returns, on success or failure.
pub async fn dump_pipelined<S, K, P>(
    mut source: S,
    mut sink: K,
    mut progress: P,
    options: DumpOptions,
    mut shutdown: Shutdown,
) -> Result<DumpReport, TransferError>
where
    S: ImageSource + 'static,
    K: OutputSink + 'static,
    P: ProgressSink + 'static,
{
    let started = Instant::now();
    let (plan, throttle) = match prepare(&source, &options) {
        Ok(prepared) => prepared,
        Err(e) => {
            close_source(&mut source);
            return Err(e);
        }
    };
    let chunk_size = plan.chunk_size();
    let total = plan.total();

    let (tx, mut rx) = mpsc::channel(options.queue_depth.max(1));
    let mut reader_shutdown = shutdown.resubscribe();
    let flags = options.read_flags;

    let reader = tokio::task::spawn_blocking(move || {
        let result = produce(
            &mut source,
            plan,
            flags,
            throttle.as_ref(),
            &tx,
            &mut reader_shutdown,
        );
        drop(tx);
        close_source(&mut source);
        result
    });

    let flush_every = options.flush_every;
    let writer = tokio::task::spawn_blocking(move || {
        let mut writer = ChunkWriter::new(&mut sink, &mut progress, total, flush_every);
        let outcome = drain(&mut rx, &mut writer, &mut shutdown);
        drop(rx);
        writer.close(outcome)
    });

    let (read_result, write_result) = tokio::join!(reader, writer);
    match (read_result?, write_result?) {
        (Err(e), _) => Err(e),
        (Ok(()), Err(e)) => Err(e),
        (Ok(()), Ok(totals)) => Ok(report(totals, chunk_size, started)),
    }
}

/// Run whichever mode `options.pipelined` selects.
pub async fn dump<S, K, P>(
    source: S,
    sink: K,
    progress: P,
    options: DumpOptions,
    shutdown: Shutdown,
) -> Result<DumpReport, TransferError>
where
    S: ImageSource + 'static,
    K: OutputSink + 'static,
    P: ProgressSink + 'static,
{
    if options.pipelined {
        return dump_pipelined(source, sink, progress, options, shutdown).await;
    }
    tokio::task::spawn_blocking(move || {
        let (mut source, mut sink, mut progress, mut shutdown) = (source, sink, progress, shutdown);
        dump_sequential(&mut source, &mut sink, &mut progress, &options, &mut shutdown)
    })
    .await?
}
