//! Replays a diff-v1 stream onto a sink.
//!
//! Single forward pass: each record is applied as soon as it is decoded and
//! write payloads move through a fixed-size buffer. Any error aborts the
//! apply and leaves the sink partially updated; callers re-apply from
//! scratch or discard the sink. The stop signal is polled before every
//! record and every payload block.

use std::io::Read;

use snapdump_core::{DiffReader, DiffRecord};

use crate::pipeline::Shutdown;
use crate::sink::OutputSink;
use crate::TransferError;

/// Payload copy block.
pub const BLOCKSIZE: usize = 256 << 10;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSummary {
    /// Size declared by the last 's' record, if any.
    pub image_size: Option<u64>,
    /// Bytes written plus bytes zeroed.
    pub bytes_changed: u64,
    /// Records applied, including the end marker.
    pub records: u64,
    pub from_snap: Option<String>,
    pub to_snap: Option<String>,
}

/// Apply the diff stream read from `input` to `sink`.
///
/// Returns [`TransferError::Cancelled`] once `shutdown` fires.
pub fn apply_diff<R, K>(
    input: R,
    sink: &mut K,
    shutdown: &mut Shutdown,
) -> Result<DiffSummary, TransferError>
where
    R: Read,
    K: OutputSink + ?Sized,
{
    let mut reader = DiffReader::new(input)?;
    let mut summary = DiffSummary::default();
    let mut buf = vec![0u8; BLOCKSIZE];

    loop {
        if shutdown.fired() {
            tracing::info!(records = summary.records, "diff apply cancelled");
            return Err(TransferError::Cancelled);
        }
        let Some(record) = reader.next_record()? else {
            break;
        };
        summary.records += 1;
        match record {
            DiffRecord::FromSnap(name) => {
                tracing::debug!(%name, "diff from snapshot");
                summary.from_snap = Some(name);
            }
            DiffRecord::ToSnap(name) => {
                tracing::debug!(%name, "diff to snapshot");
                summary.to_snap = Some(name);
            }
            DiffRecord::ImageSize(size) => {
                sink.set_len(size)?;
                summary.image_size = Some(size);
            }
            DiffRecord::Write { offset, length } => {
                tracing::debug!(offset, length, "write");
                let mut pos = offset;
                loop {
                    if shutdown.fired() {
                        tracing::info!(offset = pos, "diff apply cancelled mid-write");
                        return Err(TransferError::Cancelled);
                    }
                    let n = reader.read_payload(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    sink.write_at(pos, &buf[..n])?;
                    pos += n as u64;
                }
                summary.bytes_changed += length;
            }
            DiffRecord::Zero { offset, length } => {
                tracing::debug!(offset, length, "zero");
                sink.punch_hole(offset, length)?;
                summary.bytes_changed += length;
            }
            DiffRecord::End => {}
        }
    }

    sink.flush()?;

    tracing::info!(
        bytes_changed = summary.bytes_changed,
        image_size = summary.image_size.unwrap_or(0),
        "{} bytes written, {} total",
        summary.bytes_changed,
        summary.image_size.unwrap_or(0),
    );
    Ok(summary)
}
