//! Entry Codec
//!
//! On-disk layout of one cache entry (integers little-endian):
//!
//! ```text
//! ┌──────────────┬──────────┬────────────┬────────────┬──────────┐
//! │ expires  u32 │ status   │ url_len    │ header_len │ body_len │  meta (22 bytes)
//! │              │ u16      │ u32        │ u32        │ u64      │
//! ├──────────────┴──────────┴────────────┴────────────┴──────────┤
//! │ url bytes │ header bytes │ body bytes │ trailer "EDGE"        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The trailer is written last. A file without it is a torn write.

use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

// =============================================================================
// Constants
// =============================================================================

/// Size of the fixed meta block
pub const META_SIZE: usize = 22;

/// Sentinel closing every complete entry
pub const TRAILER: [u8; 4] = *b"EDGE";

/// Size of the trailer
pub const TRAILER_SIZE: usize = TRAILER.len();

/// File extension of committed entries
pub const ENTRY_EXT: &str = "cache";

/// Suffix of in-progress full writes
pub const TMP_SUFFIX: &str = ".tmp";

/// Suffix of partial-entry range sidecars
pub const RANGES_SUFFIX: &str = ".ranges";

/// Default streaming chunk size
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// A lazily produced sequence of body or header chunks
pub type ChunkIter<'a> = Box<dyn Iterator<Item = Result<Bytes>> + Send + 'a>;

// =============================================================================
// Entry Meta
// =============================================================================

/// Fixed meta block at the head of every entry file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryMeta {
    pub expires_at: u32,
    pub status: u16,
    pub url_len: u32,
    pub header_len: u32,
    pub body_len: u64,
}

impl EntryMeta {
    /// Encode to the on-disk representation
    pub fn encode(&self) -> [u8; META_SIZE] {
        let mut buf = [0u8; META_SIZE];
        buf[0..4].copy_from_slice(&self.expires_at.to_le_bytes());
        buf[4..6].copy_from_slice(&self.status.to_le_bytes());
        buf[6..10].copy_from_slice(&self.url_len.to_le_bytes());
        buf[10..14].copy_from_slice(&self.header_len.to_le_bytes());
        buf[14..22].copy_from_slice(&self.body_len.to_le_bytes());
        buf
    }

    /// Decode from the on-disk representation
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < META_SIZE {
            return None;
        }
        Some(Self {
            expires_at: u32::from_le_bytes(buf[0..4].try_into().ok()?),
            status: u16::from_le_bytes(buf[4..6].try_into().ok()?),
            url_len: u32::from_le_bytes(buf[6..10].try_into().ok()?),
            header_len: u32::from_le_bytes(buf[10..14].try_into().ok()?),
            body_len: u64::from_le_bytes(buf[14..22].try_into().ok()?),
        })
    }

    #[inline]
    pub fn url_offset(&self) -> u64 {
        META_SIZE as u64
    }

    #[inline]
    pub fn header_offset(&self) -> u64 {
        self.url_offset() + self.url_len as u64
    }

    #[inline]
    pub fn body_offset(&self) -> u64 {
        self.header_offset() + self.header_len as u64
    }

    /// `None` when the declared lengths do not fit a file offset
    #[inline]
    pub fn trailer_offset(&self) -> Option<u64> {
        self.body_offset().checked_add(self.body_len)
    }

    /// Exact length of a complete file with this meta
    #[inline]
    pub fn file_len(&self) -> Option<u64> {
        self.trailer_offset()?.checked_add(TRAILER_SIZE as u64)
    }

    /// Bytes of layout overhead around header and body
    #[inline]
    pub fn overhead(&self) -> u64 {
        (META_SIZE + TRAILER_SIZE) as u64 + self.url_len as u64
    }
}

/// Clamp a unix timestamp into the u32 meta field
pub fn expires_to_u32(ts: i64) -> u32 {
    ts.clamp(0, u32::MAX as i64) as u32
}

// =============================================================================
// Entry Loading
// =============================================================================

/// Meta, url and header of a verified entry file
#[derive(Debug, Clone)]
pub struct LoadedEntry {
    pub meta: EntryMeta,
    pub url: Bytes,
    pub header: Bytes,
}

/// Read and verify an entry file from its start
///
/// Fails with `Corrupted` when the file is shorter or longer than its meta
/// implies or the trailer does not match.
pub fn load_entry<R: Read + Seek>(file: &mut R, path: &Path) -> Result<LoadedEntry> {
    let len = file.seek(SeekFrom::End(0))?;
    if len < (META_SIZE + TRAILER_SIZE) as u64 {
        return Err(Error::corrupted(path, format!("file too short ({} bytes)", len)));
    }

    file.seek(SeekFrom::Start(0))?;
    let mut raw = [0u8; META_SIZE];
    read_exact_or_corrupt(file, &mut raw, path)?;
    let meta = EntryMeta::decode(&raw).ok_or_else(|| Error::corrupted(path, "bad meta block"))?;

    let expected = meta
        .file_len()
        .ok_or_else(|| Error::corrupted(path, "layout overflows file offsets"))?;
    if expected != len {
        return Err(Error::corrupted(
            path,
            format!("length {} does not match layout {}", len, expected),
        ));
    }

    let mut head = BytesMut::zeroed(meta.url_len as usize + meta.header_len as usize);
    read_exact_or_corrupt(file, &mut head, path)?;

    file.seek(SeekFrom::Start(expected - TRAILER_SIZE as u64))?;
    let mut trailer = [0u8; TRAILER_SIZE];
    read_exact_or_corrupt(file, &mut trailer, path)?;
    if trailer != TRAILER {
        return Err(Error::corrupted(path, "missing trailer"));
    }

    let mut head = head.freeze();
    let header = head.split_off(meta.url_len as usize);
    Ok(LoadedEntry {
        meta,
        url: head,
        header,
    })
}

fn read_exact_or_corrupt<R: Read>(file: &mut R, buf: &mut [u8], path: &Path) -> Result<()> {
    file.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::corrupted(path, "unexpected end of file"),
        _ => Error::Io(e),
    })
}

// =============================================================================
// Paths
// =============================================================================

/// `root/ab/cd/<hash>.cache`
pub fn entry_path(root: &Path, hash: &str) -> PathBuf {
    let (a, b) = match (hash.get(0..2), hash.get(2..4)) {
        (Some(a), Some(b)) => (a, b),
        _ => ("00", "00"),
    };
    root.join(a).join(b).join(format!("{}.{}", hash, ENTRY_EXT))
}

/// Temporary path used while a full writer is open
pub fn tmp_path(entry: &Path) -> PathBuf {
    append_suffix(entry, TMP_SUFFIX)
}

/// Sidecar path of a partial entry
pub fn ranges_path(entry: &Path) -> PathBuf {
    append_suffix(entry, RANGES_SUFFIX)
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

// =============================================================================
// Ranges
// =============================================================================

/// Resolve a request range against a body length into inclusive offsets
///
/// A negative `start` selects the last `-start` bytes. A negative `end` is
/// relative to the end of the body, so `-1` is the last byte.
pub fn resolve_range(start: i64, end: i64, size: u64) -> Result<(u64, u64)> {
    let invalid = || Error::InvalidRange { start, end, size };
    if size == 0 {
        return Err(invalid());
    }
    let last = size - 1;

    let first = if start < 0 {
        size.saturating_sub(start.unsigned_abs())
    } else {
        start as u64
    };
    let stop = if start < 0 {
        last
    } else if end < 0 {
        size.checked_sub(end.unsigned_abs()).ok_or_else(invalid)?
    } else {
        (end as u64).min(last)
    };

    if first > stop || first > last {
        return Err(invalid());
    }
    Ok((first, stop))
}

// =============================================================================
// Chunk Iterators
// =============================================================================

/// Streams `remaining` bytes from a seekable source in fixed-size chunks
///
/// The first I/O error is yielded once, after which the iterator ends and
/// `on_error` runs.
pub struct FileChunks<'a, R: Read + Seek + Send> {
    reader: &'a mut R,
    offset: u64,
    remaining: u64,
    chunk_size: usize,
    positioned: bool,
    on_error: Option<Box<dyn FnOnce() + Send + 'a>>,
}

impl<'a, R: Read + Seek + Send> FileChunks<'a, R> {
    pub fn new(reader: &'a mut R, offset: u64, len: u64, chunk_size: usize) -> Self {
        Self {
            reader,
            offset,
            remaining: len,
            chunk_size: chunk_size.max(1),
            positioned: false,
            on_error: None,
        }
    }

    /// Run `f` if reading fails
    pub fn on_error(mut self, f: impl FnOnce() + Send + 'a) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    fn fail(&mut self, err: Error) -> Option<Result<Bytes>> {
        self.remaining = 0;
        if let Some(f) = self.on_error.take() {
            f();
        }
        Some(Err(err))
    }
}

impl<'a, R: Read + Seek + Send> Iterator for FileChunks<'a, R> {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        if !self.positioned {
            if let Err(e) = self.reader.seek(SeekFrom::Start(self.offset)) {
                return self.fail(e.into());
            }
            self.positioned = true;
        }

        let want = self.remaining.min(self.chunk_size as u64) as usize;
        let mut buf = BytesMut::zeroed(want);
        match self.reader.read_exact(&mut buf) {
            Ok(()) => {
                self.remaining -= want as u64;
                Some(Ok(buf.freeze()))
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                self.fail(Error::Corrupted {
                    path: String::from("<entry>"),
                    reason: "body shorter than declared".into(),
                })
            }
            Err(e) => self.fail(e.into()),
        }
    }
}

/// Zero-copy chunks of an in-memory buffer
pub struct BytesChunks {
    data: Bytes,
    chunk_size: usize,
}

impl BytesChunks {
    pub fn new(data: Bytes, chunk_size: usize) -> Self {
        Self {
            data,
            chunk_size: chunk_size.max(1),
        }
    }
}

impl Iterator for BytesChunks {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        let take = self.chunk_size.min(self.data.len());
        Some(Ok(self.data.split_to(take)))
    }
}

/// Concatenate every chunk of an iterator
pub fn collect_chunks(chunks: ChunkIter<'_>) -> Result<Bytes> {
    let mut out = BytesMut::new();
    for chunk in chunks {
        out.extend_from_slice(&chunk?);
    }
    Ok(out.freeze())
}
