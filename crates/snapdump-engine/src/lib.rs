//! snapdump-engine — moves image bytes onto local files.
//!
//! Two paths: a chunked dump of a whole image (pipelined reader/writer or a
//! single sequential loop, sharing one chunk and throttle policy), and
//! replay of a diff-v1 stream onto a sparse file.

pub mod chunking;
pub mod diff_apply;
pub mod export;
pub mod pipeline;
pub mod progress;
pub mod qos;
pub mod sink;
pub mod source;

use std::io;

use snapdump_core::DiffError;

pub use chunking::{default_chunk_size, ChunkPlan, ChunkSpan, Throttle, ThrottleSettings};
pub use diff_apply::{apply_diff, DiffSummary};
pub use export::{apply_diff_to_path, clean_up, export_to_path, CleanupPolicy};
pub use pipeline::{
    dump, dump_pipelined, dump_sequential, DumpOptions, DumpReport, Shutdown, TransferChunk,
};
pub use progress::{format_size, ConsoleProgress, NoProgress, ProgressSink};
pub use qos::{RateLimitError, SharedBucket, TokenBucket};
pub use sink::{FileSink, OutputSink};
pub use source::{FileImageSource, ImageSource, MemoryImageSource, ReadFlags};

/// Chunk size used when an image reports no geometry.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error(transparent)]
    Diff(#[from] DiffError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0} not supported by this sink")]
    Unsupported(&'static str),

    #[error("rate limit misconfigured: {0}")]
    RateLimit(#[from] RateLimitError),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("transfer task failed: {0}")]
    Task(String),
}

impl TransferError {
    /// True when the input stream itself was malformed.
    pub fn is_format_error(&self) -> bool {
        matches!(self, TransferError::Diff(e) if e.is_format_error())
    }
}

impl From<tokio::task::JoinError> for TransferError {
    fn from(e: tokio::task::JoinError) -> Self {
        TransferError::Task(e.to_string())
    }
}
