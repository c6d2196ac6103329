//! Progress reporting for long transfers.
//!
//! Reporters receive `(done, total)` with `done` never decreasing. Any
//! `FnMut(u64, u64)` closure is a reporter.

use std::io::{self, Write};

const UNITS: [&str; 8] = ["", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "Zi"];

pub trait ProgressSink: Send {
    fn update(&mut self, done: u64, total: u64);
}

impl<F> ProgressSink for F
where
    F: FnMut(u64, u64) + Send,
{
    fn update(&mut self, done: u64, total: u64) {
        self(done, total)
    }
}

/// Discards every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn update(&mut self, _done: u64, _total: u64) {}
}

/// Human-readable size with base-1024 prefixes: `10.0MiB`, `512.0B`.
pub fn format_size(bytes: u64) -> String {
    let mut num = bytes as f64;
    for unit in UNITS {
        if num.abs() < 1024.0 {
            return format!("{num:3.1}{unit}B");
        }
        num /= 1024.0;
    }
    format!("{num:.1}YiB")
}

/// Whole percent complete. An empty transfer is complete.
pub fn percent(done: u64, total: u64) -> u64 {
    if total == 0 {
        return 100;
    }
    (u128::from(done.min(total)) * 100 / u128::from(total)) as u64
}

/// Rewrites a single console line, finishing it with a newline once the
/// transfer is complete.
pub struct ConsoleProgress<W = io::Stdout> {
    out: W,
}

impl ConsoleProgress<io::Stdout> {
    pub fn stdout() -> Self {
        Self { out: io::stdout() }
    }
}

impl<W: Write> ConsoleProgress<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn render(&mut self, done: u64, total: u64) -> io::Result<()> {
        if done < total {
            write!(
                self.out,
                "\rProgress: {}%({}/{})...",
                percent(done, total),
                format_size(done),
                format_size(total)
            )?;
        } else {
            write!(self.out, "\r{:50}\rProgress: 100%...done.\n", "")?;
        }
        self.out.flush()
    }
}

impl<W: Write + Send> ProgressSink for ConsoleProgress<W> {
    fn update(&mut self, done: u64, total: u64) {
        // The console is best effort; a closed stdout must not fail a dump.
        if let Err(e) = self.render(done, total) {
            tracing::trace!(error = %e, "progress line not written");
        }
    }
}
