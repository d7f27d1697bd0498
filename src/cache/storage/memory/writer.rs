//! Memory entry writer
//!
//! Accumulates header and body in a pooled buffer against a reservation
//! taken at open. Growing past the reservation reserves more or fails with
//! a capacity error. Dropping the writer releases the reservation.

use super::{MemEntry, MemInner};
use crate::cache::entry::{now_secs, CacheKey, WriteOptions};
use crate::cache::storage::Writer;
use crate::error::{Error, Result};
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

pub struct MemoryWriter {
    inner: Arc<MemInner>,
    key: CacheKey,
    options: WriteOptions,
    header: Vec<u8>,
    body: Vec<u8>,
    /// Bytes held against the capacity budget
    reserved: u64,
    limit: u64,
    header_written: bool,
    body_started: bool,
    done: bool,
}

impl MemoryWriter {
    pub(crate) fn new(
        inner: Arc<MemInner>,
        key: &CacheKey,
        options: WriteOptions,
        reserved: u64,
        limit: u64,
    ) -> Self {
        let body = inner.buffers.get(options.body_size as usize);
        let mut writer = Self {
            inner,
            key: key.clone(),
            options,
            header: Vec::with_capacity(options.header_size as usize),
            body,
            reserved,
            limit,
            header_written: false,
            body_started: false,
            done: false,
        };
        writer.body.clear();
        writer
    }

    fn ensure_open(&self) -> Result<()> {
        if self.done {
            return Err(Error::InvalidState("writer is closed".into()));
        }
        Ok(())
    }

    /// Make room for `extra` more bytes within the budget
    fn grow(&mut self, extra: usize) -> Result<()> {
        let needed = (self.header.len() + self.body.len() + extra) as u64;
        if needed > self.reserved {
            let more = needed - self.reserved;
            self.inner.reserve_more(more)?;
            self.reserved += more;
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.done = true;
        self.inner.release(&self.key.hash, self.reserved);
        self.reserved = 0;
        self.inner.buffers.put(std::mem::take(&mut self.body));
    }

    fn fail(&mut self, err: Error) -> Error {
        debug!(key = %self.key, error = %err, "Memory writer failed");
        self.abort();
        err
    }
}

impl Writer for MemoryWriter {
    fn write_header(&mut self, header: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if self.header_written || self.body_started {
            return Err(Error::InvalidState("header must be written once before the body".into()));
        }
        if let Err(e) = self.grow(header.len()) {
            return Err(self.fail(e));
        }
        self.header.extend_from_slice(header);
        self.header_written = true;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.body_started = true;

        let size = (self.body.len() + data.len()) as u64;
        if self.limit > 0 && size > self.limit {
            let limit = self.limit;
            self.inner.ignore(&self.key, limit);
            return Err(self.fail(Error::TooLarge { size, limit }));
        }
        if let Err(e) = self.grow(data.len()) {
            return Err(self.fail(e));
        }
        self.body.extend_from_slice(data);
        Ok(())
    }

    fn header_size(&self) -> u64 {
        self.header.len() as u64
    }

    fn body_size(&self) -> u64 {
        self.body.len() as u64
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.ensure_open()?;
        let expected = self.options.body_size;
        let written = self.body.len() as u64;
        if expected > 0 && written != expected {
            return Err(self.fail(Error::Truncated { expected, written }));
        }

        self.done = true;
        let entry = Arc::new(MemEntry {
            header: Bytes::from(std::mem::take(&mut self.header)),
            body: Bytes::from(std::mem::take(&mut self.body)),
            status: self.options.status,
            expires_at: self.options.expires_at,
            stale_at: self.options.effective_stale_at(),
            server_id: self.options.server_id,
            modified_at: now_secs(),
        });
        let reserved = std::mem::take(&mut self.reserved);
        self.inner.commit(&self.key, entry, reserved)
    }

    fn discard(mut self: Box<Self>) {
        if !self.done {
            self.abort();
            debug!(key = %self.key, "Discarded memory writer");
        }
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        if !self.done {
            self.abort();
        }
    }
}
