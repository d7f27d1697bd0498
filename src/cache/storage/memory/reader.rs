//! Memory entry reader
//!
//! Streams zero-copy slices of a completed entry. The reader shares the
//! entry, so its buffers are not recycled while it is alive.

use super::MemEntry;
use crate::cache::codec::{resolve_range, BytesChunks, ChunkIter};
use crate::cache::storage::Reader;
use crate::error::Result;
use std::sync::Arc;

pub struct MemoryReader {
    entry: Arc<MemEntry>,
    expires_at: i64,
    chunk_size: usize,
}

impl MemoryReader {
    pub(crate) fn new(entry: Arc<MemEntry>, expires_at: i64, chunk_size: usize) -> Self {
        Self {
            entry,
            expires_at,
            chunk_size: chunk_size.max(1),
        }
    }
}

impl Reader for MemoryReader {
    fn status(&self) -> u16 {
        self.entry.status
    }

    fn expires_at(&self) -> i64 {
        self.expires_at
    }

    fn header_size(&self) -> u64 {
        self.entry.header.len() as u64
    }

    fn body_size(&self) -> u64 {
        self.entry.body.len() as u64
    }

    fn header_chunks(&mut self) -> Result<ChunkIter<'_>> {
        Ok(Box::new(BytesChunks::new(self.entry.header.clone(), self.chunk_size)))
    }

    fn body_chunks(&mut self) -> Result<ChunkIter<'_>> {
        Ok(Box::new(BytesChunks::new(self.entry.body.clone(), self.chunk_size)))
    }

    fn body_range_chunks(&mut self, start: i64, end: i64) -> Result<ChunkIter<'_>> {
        let (first, last) = resolve_range(start, end, self.entry.body.len() as u64)?;
        let span = self.entry.body.slice(first as usize..=last as usize);
        Ok(Box::new(BytesChunks::new(span, self.chunk_size)))
    }
}
