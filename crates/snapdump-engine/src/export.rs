//! Path-level entry points: open the destination, run the transfer, and
//! clean up after a failure or cancellation.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

use snapdump_core::config::OutputConfig;

use crate::diff_apply::{apply_diff, DiffSummary};
use crate::pipeline::{dump, DumpOptions, DumpReport, Shutdown};
use crate::progress::ProgressSink;
use crate::sink::FileSink;
use crate::source::ImageSource;
use crate::TransferError;

/// What to do with a destination file when its transfer does not finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanupPolicy {
    /// Leave partial output in place.
    Keep,
    /// Delete the destination if this transfer created it.
    #[default]
    RemoveOnFailure,
}

impl CleanupPolicy {
    pub fn from_config(output: &OutputConfig) -> Self {
        if output.remove_on_failure {
            CleanupPolicy::RemoveOnFailure
        } else {
            CleanupPolicy::Keep
        }
    }
}

/// Remove (or keep, per `policy`) the output of a transfer that failed
/// with `err`.
pub fn clean_up(dest: &Path, policy: CleanupPolicy, err: &TransferError) {
    if policy == CleanupPolicy::Keep {
        tracing::warn!(dest = %dest.display(), error = %err, "transfer failed, keeping partial output");
        return;
    }
    match std::fs::remove_file(dest) {
        Ok(()) => tracing::info!(dest = %dest.display(), error = %err, "removed partial output"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(dest = %dest.display(), error = %e, "failed to remove partial output"),
    }
}

/// Dump `source` into a file at `dest`, replacing whatever is there.
///
/// The file is truncated up front, so on failure it is removed under
/// [`CleanupPolicy::RemoveOnFailure`] whether or not it existed before.
pub async fn export_to_path<S, P>(
    source: S,
    dest: &Path,
    progress: P,
    options: DumpOptions,
    cleanup: CleanupPolicy,
    shutdown: Shutdown,
) -> Result<DumpReport, TransferError>
where
    S: ImageSource + 'static,
    P: ProgressSink + 'static,
{
    tracing::info!(dest = %dest.display(), pipelined = options.pipelined, "exporting image");
    let sink = FileSink::create(dest)?;
    let result = dump(source, sink, progress, options, shutdown).await;
    if let Err(e) = &result {
        clean_up(dest, cleanup, e);
    }
    result
}

/// Apply the diff file at `diff` onto `dest` in place.
///
/// A missing `dest` is created empty first. Only a file created here is
/// ever removed on failure or cancellation; an existing base image is left
/// as the failed apply left it.
pub fn apply_diff_to_path(
    diff: &Path,
    dest: &Path,
    cleanup: CleanupPolicy,
    shutdown: &mut Shutdown,
) -> Result<DiffSummary, TransferError> {
    let input = BufReader::new(File::open(diff)?);
    let created = !dest.exists();
    tracing::info!(diff = %diff.display(), dest = %dest.display(), created, "applying diff");

    let mut sink = FileSink::open(dest)?;
    let result = apply_diff(input, &mut sink, shutdown);
    drop(sink);

    if let Err(e) = &result {
        if created {
            clean_up(dest, cleanup, e);
        } else {
            tracing::warn!(dest = %dest.display(), error = %e, "diff apply failed, base image is partially updated");
        }
    }
    result
}
