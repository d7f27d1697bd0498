//! Disk entry reader
//!
//! Verifies the entry through the open-file pool and streams header and
//! body spans. A read failure discards the entry. Partial entries are
//! served only for spans their range sidecar covers.

use super::DiskInner;
use crate::cache::codec::{
    load_entry, ranges_path, resolve_range, BytesChunks, ChunkIter, EntryMeta, FileChunks,
};
use crate::cache::entry::{CacheKey, ReadOptions};
use crate::cache::index::Item;
use crate::cache::pool::{FilePreload, PooledFile};
use crate::cache::ranges::RangeSet;
use crate::cache::storage::Reader;
use crate::error::{Error, Result};
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tracing::{debug, warn};

/// Reader over one committed disk entry
pub struct DiskReader {
    inner: Arc<DiskInner>,
    key: CacheKey,
    item: Item,
    meta: EntryMeta,
    header: Bytes,
    /// Covered spans of a partial entry, `None` when complete
    ranges: Option<RangeSet>,
    file: PooledFile,
    chunk_size: usize,
}

impl DiskReader {
    pub(crate) fn open(
        inner: Arc<DiskInner>,
        key: &CacheKey,
        item: Item,
        options: ReadOptions,
    ) -> Result<Self> {
        let path = inner.path_of(&key.hash);
        let acquired = inner.files.acquire(&path, |file| {
            let entry = load_entry(file, &path)?;
            if &entry.url[..] != key.key.as_bytes() {
                return Err(Error::corrupted(&path, "stored key does not match"));
            }
            Ok(FilePreload {
                meta_bytes: Bytes::copy_from_slice(&entry.meta.encode()),
                header_bytes: entry.header,
                body_size: entry.meta.body_len,
            })
        });

        let file = match acquired {
            Ok(file) => file,
            Err(e) => {
                match &e {
                    Error::Io(io) if io.kind() == io::ErrorKind::NotFound => {
                        debug!(key = %key, "Indexed entry has no file")
                    }
                    _ => warn!(key = %key, error = %e, "Discarding unreadable disk entry"),
                }
                inner.discard_entry(&key.hash);
                return Err(Error::not_found(key.key.as_str()));
            }
        };

        let meta = match EntryMeta::decode(&file.preload.meta_bytes) {
            Some(meta) => meta,
            None => {
                file.discard();
                inner.discard_entry(&key.hash);
                return Err(Error::not_found(key.key.as_str()));
            }
        };

        let ranges = match RangeSet::load(&ranges_path(&path)) {
            Ok(set) => Some(set),
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding entry with unreadable range sidecar");
                file.discard();
                inner.discard_entry(&key.hash);
                return Err(Error::not_found(key.key.as_str()));
            }
        };
        if let Some(set) = &ranges {
            if !options.partial && !set.is_completed() {
                return Err(Error::not_found(key.key.as_str()));
            }
        }

        inner.index.increase_hit(&key.hash);
        let header = file.preload.header_bytes.clone();
        let chunk_size = inner.config.chunk_size.max(1);
        Ok(Self {
            inner,
            key: key.clone(),
            item,
            meta,
            header,
            ranges,
            file,
            chunk_size,
        })
    }

    /// Covered spans, when the entry is partial
    pub fn ranges(&self) -> Option<&RangeSet> {
        self.ranges.as_ref()
    }

    /// The index record this reader was opened against
    pub fn item(&self) -> &Item {
        &self.item
    }

    fn require(&self, first: u64, last: u64) -> Result<()> {
        match &self.ranges {
            Some(set) if !set.contains(first, last) => Err(Error::NotFound(format!(
                "{} bytes {}-{}",
                self.key, first, last
            ))),
            _ => Ok(()),
        }
    }

    fn stream(&mut self, offset: u64, len: u64) -> ChunkIter<'_> {
        let inner = self.inner.clone();
        let hash = self.key.hash.clone();
        let start = self.meta.body_offset() + offset;
        Box::new(
            FileChunks::new(&mut self.file.file, start, len, self.chunk_size).on_error(move || {
                warn!(hash = %hash, "Disk read failed, discarding entry");
                inner.discard_entry(&hash);
            }),
        )
    }
}

impl Reader for DiskReader {
    fn status(&self) -> u16 {
        self.meta.status
    }

    fn expires_at(&self) -> i64 {
        self.item.expires_at
    }

    fn header_size(&self) -> u64 {
        self.meta.header_len as u64
    }

    fn body_size(&self) -> u64 {
        self.meta.body_len
    }

    fn header_chunks(&mut self) -> Result<ChunkIter<'_>> {
        Ok(Box::new(BytesChunks::new(self.header.clone(), self.chunk_size)))
    }

    fn body_chunks(&mut self) -> Result<ChunkIter<'_>> {
        let size = self.meta.body_len;
        if size == 0 {
            return Ok(Box::new(std::iter::empty()));
        }
        self.require(0, size - 1)?;
        Ok(self.stream(0, size))
    }

    fn body_range_chunks(&mut self, start: i64, end: i64) -> Result<ChunkIter<'_>> {
        let (first, last) = resolve_range(start, end, self.meta.body_len)?;
        self.require(first, last)?;
        Ok(self.stream(first, last - first + 1))
    }
}
