//! Output sinks: seekable, truncatable byte stores that dumps and diffs
//! land in.
//!
//! Deallocating a range never degrades to writing zeros: a sink that cannot
//! punch holes says so with [`TransferError::Unsupported`].

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::TransferError;

pub trait OutputSink: Send {
    /// Write all of `buf` at `offset`, extending the sink if needed.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;

    /// Truncate or extend to exactly `len` bytes.
    fn set_len(&mut self, len: u64) -> io::Result<()>;

    /// Deallocate `len` bytes at `offset`. The range reads back as zeros
    /// and the sink's length is unchanged.
    fn punch_hole(&mut self, _offset: u64, _len: u64) -> Result<(), TransferError> {
        Err(TransferError::Unsupported("hole punching"))
    }

    /// Push written data to stable storage.
    fn flush(&mut self) -> io::Result<()>;
}

/// A local file.
pub struct FileSink {
    file: File,
    path: PathBuf,
}

impl FileSink {
    /// Create `path`, truncating anything already there.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self { file, path })
    }

    /// Open `path` for in-place updates, creating it empty if missing.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl OutputSink for FileSink {
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    #[cfg(target_os = "linux")]
    fn punch_hole(&mut self, offset: u64, len: u64) -> Result<(), TransferError> {
        use std::os::unix::io::AsRawFd;

        if len == 0 {
            return Ok(());
        }
        let too_large =
            || io::Error::new(io::ErrorKind::InvalidInput, "hole range exceeds off_t");
        let off = libc::off_t::try_from(offset).map_err(|_| too_large())?;
        let len = libc::off_t::try_from(len).map_err(|_| too_large())?;

        // SAFETY: the descriptor belongs to self.file, which outlives the call.
        let rc = unsafe {
            libc::fallocate(
                self.file.as_raw_fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                off,
                len,
            )
        };
        if rc == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EOPNOTSUPP) | Some(libc::ENOSYS) => {
                Err(TransferError::Unsupported("hole punching"))
            }
            _ => Err(TransferError::Io(err)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }
}
