//! Full entry writer
//!
//! Streams into `<hash>.cache.tmp` under an exclusive advisory lock. The
//! meta block is a placeholder until `close`, which appends the trailer,
//! rewrites the meta, renames the file into place and records the item.

use super::{lock_exclusive, DiskInner, WriterSlot};
use crate::cache::codec::{expires_to_u32, ranges_path, tmp_path, EntryMeta, META_SIZE, TRAILER};
use crate::cache::entry::{CacheKey, WriteOptions};
use crate::cache::index::{Item, ItemKind};
use crate::cache::storage::Writer;
use crate::error::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Index item describing a committed entry
pub(super) fn entry_item(key: &CacheKey, options: &WriteOptions, meta: &EntryMeta) -> Item {
    let mut item = Item::new(key, ItemKind::File);
    item.expires_at = options.expires_at;
    item.stale_at = options.effective_stale_at();
    item.header_size = meta.header_len as u64;
    item.body_size = meta.body_len;
    item.meta_size = meta.overhead();
    item.server_id = options.server_id;
    item
}

/// A length that must fit a u32 meta field
pub(super) fn len_u32(len: u64) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::TooLarge {
        size: len,
        limit: u32::MAX as u64,
    })
}

/// Writer of one complete entry
pub struct DiskWriter {
    inner: Arc<DiskInner>,
    key: CacheKey,
    options: WriteOptions,
    path: PathBuf,
    tmp: PathBuf,
    file: Option<BufWriter<File>>,
    header_len: u64,
    body_len: u64,
    header_written: bool,
    body_started: bool,
    limit: u64,
    /// Committed, discarded or failed
    done: bool,
    _slot: WriterSlot,
}

impl DiskWriter {
    pub(crate) fn open(inner: Arc<DiskInner>, key: &CacheKey, options: WriteOptions) -> Result<Self> {
        let slot = inner.claim_writer(&key.hash)?;
        let path = inner.path_of(&key.hash);
        let tmp = tmp_path(&path);
        if let Some(parent) = tmp.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().write(true).create(true).open(&tmp)?;
        lock_exclusive(&file, &tmp)?;

        let limit = super::effective_limit(options.max_size, inner.config.max_item_size);
        let chunk_size = inner.config.chunk_size.max(META_SIZE);
        let mut writer = Self {
            inner,
            key: key.clone(),
            options,
            path,
            tmp,
            file: Some(BufWriter::with_capacity(chunk_size, file)),
            header_len: 0,
            body_len: 0,
            header_written: false,
            body_started: false,
            limit,
            done: false,
            _slot: slot,
        };

        if let Err(e) = writer.start() {
            return Err(writer.fail(e));
        }
        debug!(key = %writer.key, "Opened disk writer");
        Ok(writer)
    }

    /// Truncate and lay down the placeholder meta and the url
    fn start(&mut self) -> Result<()> {
        len_u32(self.key.key.len() as u64)?;
        let url = self.key.key.clone();
        let file = self.file_mut()?;
        file.get_ref().set_len(0)?;
        file.write_all(&[0u8; META_SIZE])?;
        file.write_all(url.as_bytes())?;
        Ok(())
    }

    fn file_mut(&mut self) -> Result<&mut BufWriter<File>> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::InvalidState("writer is closed".into()))
    }

    /// Remove the temporary file and mark the writer finished
    fn abort(&mut self) {
        self.done = true;
        self.file.take();
        if let Err(e) = fs::remove_file(&self.tmp) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.tmp.display(), error = %e, "Failed to remove temporary file");
            }
        }
    }

    fn fail(&mut self, err: Error) -> Error {
        debug!(key = %self.key, error = %err, "Disk writer failed");
        self.abort();
        err
    }

    fn meta(&self) -> EntryMeta {
        EntryMeta {
            expires_at: expires_to_u32(self.options.expires_at),
            status: self.options.status,
            url_len: self.key.key.len() as u32,
            header_len: self.header_len as u32,
            body_len: self.body_len,
        }
    }

    /// Append the trailer and the final meta block
    fn finish(&mut self, meta: &EntryMeta) -> Result<File> {
        let mut buffered = self
            .file
            .take()
            .ok_or_else(|| Error::InvalidState("writer is closed".into()))?;
        buffered.write_all(&TRAILER)?;
        let mut file = buffered.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&meta.encode())?;
        if self.inner.config.sync_writes {
            file.sync_all()?;
        }
        Ok(file)
    }
}

impl Writer for DiskWriter {
    fn write_header(&mut self, header: &[u8]) -> Result<()> {
        if self.done {
            return Err(Error::InvalidState("writer is closed".into()));
        }
        if self.header_written || self.body_started {
            return Err(Error::InvalidState("header must be written once before the body".into()));
        }
        if let Err(e) = len_u32(header.len() as u64) {
            return Err(self.fail(e));
        }
        if let Err(e) = self.file_mut().and_then(|f| Ok(f.write_all(header)?)) {
            return Err(self.fail(e));
        }
        self.header_written = true;
        self.header_len = header.len() as u64;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.done {
            return Err(Error::InvalidState("writer is closed".into()));
        }
        self.body_started = true;

        let size = self.body_len + data.len() as u64;
        if self.limit > 0 && size > self.limit {
            let limit = self.limit;
            return Err(self.fail(Error::TooLarge { size, limit }));
        }
        // Undeclared sizes skipped admission
        if self.options.body_size == 0 {
            if let Err(e) = self.inner.check_capacity(self.header_len.saturating_add(size)) {
                self.inner.metrics.record_rejection();
                return Err(self.fail(e));
            }
        }
        if let Err(e) = self.file_mut().and_then(|f| Ok(f.write_all(data)?)) {
            return Err(self.fail(e));
        }
        self.body_len = size;
        Ok(())
    }

    fn header_size(&self) -> u64 {
        self.header_len
    }

    fn body_size(&self) -> u64 {
        self.body_len
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        if self.done {
            return Err(Error::InvalidState("writer is closed".into()));
        }

        let expected = self.options.body_size;
        if expected > 0 && self.body_len != expected {
            let written = self.body_len;
            return Err(self.fail(Error::Truncated { expected, written }));
        }

        let meta = self.meta();
        let file = match self.finish(&meta) {
            Ok(file) => file,
            Err(e) => return Err(self.fail(e)),
        };
        if let Err(e) = fs::rename(&self.tmp, &self.path) {
            return Err(self.fail(e.into()));
        }
        drop(file);
        self.done = true;

        // A full write supersedes any partial entry under the same key
        if let Err(e) = fs::remove_file(ranges_path(&self.path)) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove range sidecar");
            }
        }

        let item = entry_item(&self.key, &self.options, &meta);
        self.inner.commit(item, &self.path)?;
        debug!(
            key = %self.key,
            header = self.header_len,
            body = self.body_len,
            "Committed disk entry"
        );
        Ok(())
    }

    fn discard(mut self: Box<Self>) {
        if !self.done {
            self.abort();
            debug!(key = %self.key, "Discarded disk writer");
        }
    }
}

impl Drop for DiskWriter {
    fn drop(&mut self) {
        if !self.done {
            self.abort();
        }
    }
}
