//! Diff stream format: the "rbd diff v1" change stream.
//!
//! A stream is the 12-byte magic followed by tagged records, strictly in
//! file order. All multi-byte integers are little-endian. The layout is
//! owned by the storage backend that emits it; nothing here may change it.
//!
//!   'f'  u32 len, name bytes        from-snapshot name (informational)
//!   't'  u32 len, name bytes        to-snapshot name (informational)
//!   's'  u64 size                   declared image size
//!   'w'  u64 offset, u64 length     data; `length` payload bytes follow
//!   'z'  u64 offset, u64 length     zeroed range
//!   'e'                             end of stream; no bytes may follow
//!
//! Decoding is streaming: `DiffReader` hands out one record at a time and
//! write payloads are pulled through the reader in caller-sized blocks, so
//! memory use does not depend on record or stream size.

use std::io::{self, Read, Write};

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Stream header. Exactly 12 bytes, including the trailing newline.
pub const DIFF_MAGIC: &[u8; 12] = b"rbd diff v1\n";

pub const TAG_FROM_SNAP: u8 = b'f';
pub const TAG_TO_SNAP: u8 = b't';
pub const TAG_IMAGE_SIZE: u8 = b's';
pub const TAG_WRITE: u8 = b'w';
pub const TAG_ZERO: u8 = b'z';
pub const TAG_END: u8 = b'e';

/// Longest snapshot name prefix a reader keeps; the remainder is skipped.
pub const MAX_NAME_KEPT: u64 = 4096;

// ── On-wire fields ────────────────────────────────────────────────────────────

/// Offset/length pair carried by 'w' and 'z' records.
///
/// Wire size: 16 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct Extent {
    pub offset: U64<LittleEndian>,
    pub length: U64<LittleEndian>,
}

assert_eq_size!(Extent, [u8; 16]);

impl Extent {
    pub fn new(offset: u64, length: u64) -> Self {
        Self {
            offset: U64::new(offset),
            length: U64::new(length),
        }
    }
}

// ── Records ───────────────────────────────────────────────────────────────────

/// One decoded record. Write payloads are not part of the record; they are
/// read through [`DiffReader::read_payload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffRecord {
    FromSnap(String),
    ToSnap(String),
    ImageSize(u64),
    Write { offset: u64, length: u64 },
    Zero { offset: u64, length: u64 },
    End,
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    #[error("missing diff magic string")]
    BadMagic,

    #[error("unknown record type: 0x{0:02x}")]
    UnknownRecord(u8),

    #[error("trailing data after end marker")]
    TrailingData,

    #[error("diff stream truncated while reading {0}")]
    Truncated(&'static str),

    #[error("I/O error on diff stream: {0}")]
    Io(#[from] io::Error),
}

impl DiffError {
    /// True for malformed input, false for failures of the underlying stream.
    pub fn is_format_error(&self) -> bool {
        !matches!(self, DiffError::Io(_))
    }
}

fn read_field<R: Read>(r: &mut R, buf: &mut [u8], what: &'static str) -> Result<(), DiffError> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => DiffError::Truncated(what),
        _ => DiffError::Io(e),
    })
}

// ── Decoder ───────────────────────────────────────────────────────────────────

/// Forward-only decoder over a diff stream.
pub struct DiffReader<R> {
    inner: R,
    /// Payload bytes of the last 'w' record not yet handed out.
    pending: u64,
    finished: bool,
}

impl<R: Read> DiffReader<R> {
    /// Consume and verify the header.
    pub fn new(mut inner: R) -> Result<Self, DiffError> {
        let mut magic = [0u8; DIFF_MAGIC.len()];
        match inner.read_exact(&mut magic) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(DiffError::BadMagic),
            Err(e) => return Err(DiffError::Io(e)),
        }
        if &magic != DIFF_MAGIC {
            return Err(DiffError::BadMagic);
        }
        Ok(Self {
            inner,
            pending: 0,
            finished: false,
        })
    }

    /// Decode the next record. Returns `None` once the end marker has been
    /// returned. Any payload left unread from a previous 'w' record is
    /// skipped first.
    pub fn next_record(&mut self) -> Result<Option<DiffRecord>, DiffError> {
        if self.finished {
            return Ok(None);
        }
        self.skip_payload()?;

        let mut tag = [0u8; 1];
        read_field(&mut self.inner, &mut tag, "record tag")?;

        let record = match tag[0] {
            TAG_FROM_SNAP => DiffRecord::FromSnap(self.read_name()?),
            TAG_TO_SNAP => DiffRecord::ToSnap(self.read_name()?),
            TAG_IMAGE_SIZE => {
                let mut size = U64::<LittleEndian>::new_zeroed();
                read_field(&mut self.inner, size.as_bytes_mut(), "image size")?;
                DiffRecord::ImageSize(size.get())
            }
            TAG_WRITE => {
                let extent = self.read_extent("write extent")?;
                self.pending = extent.length.get();
                DiffRecord::Write {
                    offset: extent.offset.get(),
                    length: extent.length.get(),
                }
            }
            TAG_ZERO => {
                let extent = self.read_extent("zero extent")?;
                DiffRecord::Zero {
                    offset: extent.offset.get(),
                    length: extent.length.get(),
                }
            }
            TAG_END => {
                self.expect_eof()?;
                self.finished = true;
                DiffRecord::End
            }
            other => return Err(DiffError::UnknownRecord(other)),
        };

        Ok(Some(record))
    }

    /// Read the next block of the current write payload into `buf`.
    ///
    /// Fills `min(buf.len(), remaining)` bytes and returns that count;
    /// 0 means the payload is exhausted.
    pub fn read_payload(&mut self, buf: &mut [u8]) -> Result<usize, DiffError> {
        let n = buf.len().min(usize::try_from(self.pending).unwrap_or(usize::MAX));
        if n == 0 {
            return Ok(0);
        }
        read_field(&mut self.inner, &mut buf[..n], "write payload")?;
        self.pending -= n as u64;
        Ok(n)
    }

    /// Unread payload bytes of the current write record.
    pub fn payload_remaining(&self) -> u64 {
        self.pending
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn skip_payload(&mut self) -> Result<(), DiffError> {
        if self.pending == 0 {
            return Ok(());
        }
        let expected = self.pending;
        let skipped = io::copy(&mut (&mut self.inner).take(expected), &mut io::sink())?;
        self.pending = 0;
        if skipped != expected {
            return Err(DiffError::Truncated("write payload"));
        }
        Ok(())
    }

    fn read_extent(&mut self, what: &'static str) -> Result<Extent, DiffError> {
        let mut extent = Extent::new_zeroed();
        read_field(&mut self.inner, extent.as_bytes_mut(), what)?;
        Ok(extent)
    }

    fn read_name(&mut self) -> Result<String, DiffError> {
        let mut len = U32::<LittleEndian>::new_zeroed();
        read_field(&mut self.inner, len.as_bytes_mut(), "snapshot name length")?;
        let len = u64::from(len.get());

        // Names are informational: keep a prefix, discard the rest.
        let mut name = Vec::new();
        let kept = (&mut self.inner).take(len.min(MAX_NAME_KEPT)).read_to_end(&mut name)?;
        let skipped = io::copy(&mut (&mut self.inner).take(len - kept as u64), &mut io::sink())?;
        if kept as u64 + skipped != len {
            return Err(DiffError::Truncated("snapshot name"));
        }
        Ok(String::from_utf8_lossy(&name).into_owned())
    }

    fn expect_eof(&mut self) -> Result<(), DiffError> {
        let mut probe = [0u8; 1];
        loop {
            match self.inner.read(&mut probe) {
                Ok(0) => return Ok(()),
                Ok(_) => return Err(DiffError::TrailingData),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(DiffError::Io(e)),
            }
        }
    }
}

// ── Encoder ───────────────────────────────────────────────────────────────────

/// Emits a diff stream. The header is written on construction and the end
/// marker by [`DiffWriter::finish`].
pub struct DiffWriter<W: Write> {
    inner: W,
}

impl<W: Write> DiffWriter<W> {
    pub fn new(mut inner: W) -> io::Result<Self> {
        inner.write_all(DIFF_MAGIC)?;
        Ok(Self { inner })
    }

    pub fn from_snap(&mut self, name: &str) -> io::Result<()> {
        self.name(TAG_FROM_SNAP, name)
    }

    pub fn to_snap(&mut self, name: &str) -> io::Result<()> {
        self.name(TAG_TO_SNAP, name)
    }

    pub fn image_size(&mut self, size: u64) -> io::Result<()> {
        self.inner.write_all(&[TAG_IMAGE_SIZE])?;
        self.inner.write_all(U64::<LittleEndian>::new(size).as_bytes())
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(&[TAG_WRITE])?;
        self.inner
            .write_all(Extent::new(offset, data.len() as u64).as_bytes())?;
        self.inner.write_all(data)
    }

    pub fn zero(&mut self, offset: u64, length: u64) -> io::Result<()> {
        self.inner.write_all(&[TAG_ZERO])?;
        self.inner.write_all(Extent::new(offset, length).as_bytes())
    }

    /// Write the end marker and hand back the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.inner.write_all(&[TAG_END])?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn name(&mut self, tag: u8, name: &str) -> io::Result<()> {
        let len = u32::try_from(name.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "snapshot name longer than u32::MAX")
        })?;
        self.inner.write_all(&[tag])?;
        self.inner.write_all(U32::<LittleEndian>::new(len).as_bytes())?;
        self.inner.write_all(name.as_bytes())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
