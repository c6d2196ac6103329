//! Image sources: where dump bytes come from.
//!
//! The cluster client itself lives outside this crate; anything that can
//! report a size and serve positional reads plugs in through
//! [`ImageSource`]. Two implementations ship here: a local file or mapped
//! block device, and an in-memory buffer.

use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::ops::BitOr;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use snapdump_core::FeatureSet;

/// Default object size: order 22.
pub const DEFAULT_OBJECT_SIZE: u64 = 1 << 22;

/// Access-pattern hints passed along with every read. They never change
/// what is returned, only how the storage layer caches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadFlags(u32);

impl ReadFlags {
    pub const NONE: ReadFlags = ReadFlags(0);
    pub const FADVISE_SEQUENTIAL: ReadFlags = ReadFlags(0x8);
    pub const FADVISE_NOCACHE: ReadFlags = ReadFlags(0x40);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: ReadFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for ReadFlags {
    /// A dump touches every byte once, front to back.
    fn default() -> Self {
        ReadFlags::FADVISE_SEQUENTIAL | ReadFlags::FADVISE_NOCACHE
    }
}

impl BitOr for ReadFlags {
    type Output = ReadFlags;

    fn bitor(self, rhs: Self) -> ReadFlags {
        ReadFlags(self.0 | rhs.0)
    }
}

/// A readable image snapshot.
pub trait ImageSource: Send {
    /// Total image size in bytes.
    fn size(&self) -> io::Result<u64>;

    /// Read exactly `len` bytes at `offset`. A range reaching past the end
    /// of the image fails with [`io::ErrorKind::InvalidInput`].
    fn read(&mut self, offset: u64, len: usize, flags: ReadFlags) -> io::Result<Bytes>;

    /// Bytes per backing object (`1 << order`).
    fn object_size(&self) -> u64;

    fn stripe_count(&self) -> u64 {
        1
    }

    fn features(&self) -> FeatureSet {
        FeatureSet::empty()
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn out_of_range(offset: u64, len: usize, size: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("read of {len} bytes at {offset} exceeds image size {size}"),
    )
}

fn check_range(offset: u64, len: usize, size: u64) -> io::Result<()> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= size => Ok(()),
        _ => Err(out_of_range(offset, len, size)),
    }
}

// ── File-backed ───────────────────────────────────────────────────────────────

/// A local file or mapped block device read as an image.
#[derive(Debug)]
pub struct FileImageSource {
    file: File,
    path: PathBuf,
    size: u64,
    object_size: u64,
    stripe_count: u64,
    sequential_advised: bool,
}

impl FileImageSource {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        // Block devices report a zero length in their metadata.
        let size = file.seek(SeekFrom::End(0))?;
        Ok(Self {
            file,
            path,
            size,
            object_size: DEFAULT_OBJECT_SIZE,
            stripe_count: 1,
            sequential_advised: false,
        })
    }

    /// Override the geometry used to derive the default chunk size.
    pub fn with_geometry(mut self, order: u8, stripe_count: u64) -> Self {
        self.object_size = 1u64.checked_shl(order.into()).unwrap_or(DEFAULT_OBJECT_SIZE);
        self.stripe_count = stripe_count.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)
    }

    #[cfg(not(unix))]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        use std::io::Read;
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    #[cfg(target_os = "linux")]
    fn advise(&mut self, offset: u64, len: usize, flags: ReadFlags, after_read: bool) {
        use std::os::unix::io::AsRawFd;

        let fd = self.file.as_raw_fd();
        if !after_read && flags.contains(ReadFlags::FADVISE_SEQUENTIAL) && !self.sequential_advised {
            // SAFETY: fd is owned by self.file and open for the duration of the call.
            let rc = unsafe { libc::posix_fadvise(fd, 0, 0, libc::POSIX_FADV_SEQUENTIAL) };
            if rc != 0 {
                tracing::trace!(errno = rc, "posix_fadvise(SEQUENTIAL) ignored");
            }
            self.sequential_advised = true;
        }
        if after_read && flags.contains(ReadFlags::FADVISE_NOCACHE) {
            let (Ok(off), Ok(len)) = (libc::off_t::try_from(offset), libc::off_t::try_from(len))
            else {
                return;
            };
            // SAFETY: as above.
            let rc = unsafe { libc::posix_fadvise(fd, off, len, libc::POSIX_FADV_DONTNEED) };
            if rc != 0 {
                tracing::trace!(errno = rc, "posix_fadvise(DONTNEED) ignored");
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn advise(&mut self, _offset: u64, _len: usize, _flags: ReadFlags, _after_read: bool) {
        self.sequential_advised = true;
    }
}

impl ImageSource for FileImageSource {
    fn size(&self) -> io::Result<u64> {
        Ok(self.size)
    }

    fn read(&mut self, offset: u64, len: usize, flags: ReadFlags) -> io::Result<Bytes> {
        check_range(offset, len, self.size)?;
        self.advise(offset, len, flags, false);

        let mut buf = vec![0u8; len];
        self.read_at(&mut buf, offset)?;

        self.advise(offset, len, flags, true);
        Ok(Bytes::from(buf))
    }

    fn object_size(&self) -> u64 {
        self.object_size
    }

    fn stripe_count(&self) -> u64 {
        self.stripe_count
    }
}

// ── In-memory ─────────────────────────────────────────────────────────────────

/// An image held entirely in memory. Reads are zero-copy slices.
#[derive(Debug, Clone)]
pub struct MemoryImageSource {
    data: Bytes,
    object_size: u64,
    stripe_count: u64,
    features: FeatureSet,
    closed: bool,
}

impl MemoryImageSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            object_size: DEFAULT_OBJECT_SIZE,
            stripe_count: 1,
            features: FeatureSet::empty(),
            closed: false,
        }
    }

    pub fn with_geometry(mut self, object_size: u64, stripe_count: u64) -> Self {
        self.object_size = object_size;
        self.stripe_count = stripe_count;
        self
    }

    pub fn with_features(mut self, features: FeatureSet) -> Self {
        self.features = features;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl ImageSource for MemoryImageSource {
    fn size(&self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn read(&mut self, offset: u64, len: usize, _flags: ReadFlags) -> io::Result<Bytes> {
        let size = self.data.len() as u64;
        check_range(offset, len, size)?;
        let start = offset as usize;
        Ok(self.data.slice(start..start + len))
    }

    fn object_size(&self) -> u64 {
        self.object_size
    }

    fn stripe_count(&self) -> u64 {
        self.stripe_count
    }

    fn features(&self) -> FeatureSet {
        self.features
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }
}
