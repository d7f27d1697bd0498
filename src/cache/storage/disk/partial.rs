//! Partial entry writer
//!
//! Assembles a body from byte ranges over several sessions. The entry file
//! is written in place, pre-sized to the declared layout with the trailer
//! already at its end, and locked for the lifetime of the writer. Covered
//! spans are recorded in the `.ranges` sidecar; a span is recorded only
//! after its bytes were written.

use super::writer::{entry_item, len_u32};
use super::{lock_exclusive, DiskInner, WriterSlot};
use crate::cache::codec::{expires_to_u32, load_entry, ranges_path, EntryMeta, TRAILER};
use crate::cache::entry::{CacheKey, WriteOptions};
use crate::cache::ranges::RangeSet;
use crate::cache::storage::Writer;
use crate::error::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Writer of a range-assembled entry
pub struct PartialWriter {
    inner: Arc<DiskInner>,
    key: CacheKey,
    options: WriteOptions,
    path: PathBuf,
    file: Option<File>,
    /// Layout once the header is fixed
    layout: Option<EntryMeta>,
    ranges: RangeSet,
    /// Continues an existing entry
    reopened: bool,
    /// Offset of the next sequential `write`
    cursor: u64,
    done: bool,
    _slot: WriterSlot,
}

impl PartialWriter {
    pub(crate) fn open(inner: Arc<DiskInner>, key: &CacheKey, options: WriteOptions) -> Result<Self> {
        let body_size = options.body_size;
        if body_size == 0 {
            return Err(Error::InvalidState(
                "partial entry requires a declared body size".into(),
            ));
        }

        let slot = inner.claim_writer(&key.hash)?;
        let path = inner.path_of(&key.hash);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = open_locked(&path)?;

        let existing = file.metadata()?.len() > 0;
        let mut layout = None;
        if existing {
            match load_entry(&mut file, &path) {
                Ok(entry) if &entry.url[..] == key.key.as_bytes() && entry.meta.body_len == body_size => {
                    layout = Some(entry.meta);
                }
                Ok(_) => debug!(key = %key, "Existing entry has another layout, rewriting"),
                Err(Error::Corrupted { reason, .. }) => {
                    debug!(key = %key, reason = %reason, "Existing entry unusable, rewriting")
                }
                Err(e) => return Err(e),
            }
        }

        let sidecar = ranges_path(&path);
        let ranges = match layout {
            Some(_) => match RangeSet::load(&sidecar) {
                Ok(set) if set.body_size() == body_size => Some(set),
                // Complete entries carry no sidecar
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    let mut set = RangeSet::new(body_size);
                    set.add(0, body_size - 1);
                    Some(set)
                }
                _ => None,
            },
            None => None,
        };

        let (ranges, reopened) = match ranges {
            Some(set) => (set, true),
            None => {
                layout = None;
                if existing {
                    // Unlinked, not truncated: open readers keep the old inode
                    inner.index.remove(&key.hash)?;
                    inner.remove_files(&path);
                    file = open_locked(&path)?;
                } else if let Err(e) = fs::remove_file(&sidecar) {
                    if e.kind() != io::ErrorKind::NotFound {
                        return Err(e.into());
                    }
                }
                (RangeSet::new(body_size), false)
            }
        };

        debug!(key = %key, reopened = reopened, ranges = ranges.len(), "Opened partial writer");
        Ok(Self {
            inner,
            key: key.clone(),
            options,
            path,
            file: Some(file),
            layout,
            ranges,
            reopened,
            cursor: 0,
            done: false,
            _slot: slot,
        })
    }

    /// Spans written so far, including earlier sessions
    pub fn ranges(&self) -> &RangeSet {
        &self.ranges
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::InvalidState("writer is closed".into()))
    }

    /// Pre-size the file and write meta, url, header and trailer
    fn lay_out(&mut self, header: &[u8]) -> Result<()> {
        let meta = EntryMeta {
            expires_at: expires_to_u32(self.options.expires_at),
            status: self.options.status,
            url_len: len_u32(self.key.key.len() as u64)?,
            header_len: len_u32(header.len() as u64)?,
            body_len: self.options.body_size,
        };
        let file_len = meta.file_len().ok_or(Error::TooLarge {
            size: meta.body_len,
            limit: u64::MAX,
        })?;
        let url = self.key.key.clone();
        let file = self.file_mut()?;
        file.set_len(file_len)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&meta.encode())?;
        file.write_all(url.as_bytes())?;
        file.write_all(header)?;
        file.seek(SeekFrom::Start(file_len - TRAILER.len() as u64))?;
        file.write_all(&TRAILER)?;
        self.layout = Some(meta);
        Ok(())
    }

    fn ensure_layout(&mut self) -> Result<EntryMeta> {
        if self.layout.is_none() {
            self.lay_out(&[])?;
        }
        self.layout
            .ok_or_else(|| Error::Internal("partial layout missing".into()))
    }

    fn abort(&mut self) {
        self.done = true;
        self.file.take();
        if !self.reopened {
            self.inner.remove_files(&self.path);
        }
    }

    fn fail(&mut self, err: Error) -> Error {
        debug!(key = %self.key, error = %err, "Partial writer failed");
        self.abort();
        err
    }

    fn finish(&mut self) -> Result<EntryMeta> {
        let mut meta = self.ensure_layout()?;
        meta.expires_at = expires_to_u32(self.options.expires_at);
        meta.status = self.options.status;

        let sync = self.inner.config.sync_writes;
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&meta.encode())?;
        if sync {
            file.sync_all()?;
        }

        let sidecar = ranges_path(&self.path);
        if self.ranges.is_completed() {
            if let Err(e) = fs::remove_file(&sidecar) {
                if e.kind() != io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        } else {
            self.ranges.save(&sidecar)?;
        }
        Ok(meta)
    }
}

fn open_locked(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    lock_exclusive(&file, path)?;
    Ok(file)
}

impl Writer for PartialWriter {
    fn write_header(&mut self, header: &[u8]) -> Result<()> {
        if self.done {
            return Err(Error::InvalidState("writer is closed".into()));
        }
        match self.layout {
            // The header of a continued entry stays as first written
            Some(_) if self.reopened => Ok(()),
            Some(_) => Err(Error::InvalidState("header already written".into())),
            None => match self.lay_out(header) {
                Ok(()) => Ok(()),
                Err(e) => Err(self.fail(e)),
            },
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.write_at(self.cursor, data)?;
        self.cursor += data.len() as u64;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.done {
            return Err(Error::InvalidState("writer is closed".into()));
        }
        if data.is_empty() {
            return Ok(());
        }
        let size = self.options.body_size;
        let last = offset.saturating_add(data.len() as u64 - 1);
        if last >= size {
            return Err(Error::InvalidRange {
                start: offset as i64,
                end: last as i64,
                size,
            });
        }

        let written = self.ensure_layout().and_then(|meta| {
            let file = self.file_mut()?;
            file.seek(SeekFrom::Start(meta.body_offset() + offset))?;
            file.write_all(data)?;
            Ok(())
        });
        if let Err(e) = written {
            return Err(self.fail(e));
        }
        self.ranges.add(offset, last);
        Ok(())
    }

    fn header_size(&self) -> u64 {
        self.layout.map_or(0, |meta| meta.header_len as u64)
    }

    fn body_size(&self) -> u64 {
        self.ranges.ranges().iter().map(|(s, e)| e - s + 1).sum()
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        if self.done {
            return Err(Error::InvalidState("writer is closed".into()));
        }
        let meta = match self.finish() {
            Ok(meta) => meta,
            Err(e) => return Err(self.fail(e)),
        };
        self.file.take();
        self.done = true;

        let item = entry_item(&self.key, &self.options, &meta);
        self.inner.commit(item, &self.path)?;
        debug!(
            key = %self.key,
            ranges = self.ranges.len(),
            completed = self.ranges.is_completed(),
            "Committed partial entry"
        );
        Ok(())
    }

    fn discard(mut self: Box<Self>) {
        if !self.done {
            self.abort();
            debug!(key = %self.key, "Discarded partial writer");
        }
    }
}

impl Drop for PartialWriter {
    fn drop(&mut self) {
        if !self.done {
            if self.reopened {
                warn!(key = %self.key, "Partial writer dropped, keeping earlier ranges");
            }
            self.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::codec::{collect_chunks, entry_path, ranges_path};
    use crate::cache::entry::{now_secs, CacheKey, ReadOptions, WriteOptions};
    use crate::cache::storage::disk::tests::storage;
    use crate::cache::storage::testutil::{body, put};
    use crate::cache::storage::Storage;
    use crate::error::Error;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    const KEY: &str = "https://video.example.com/seg/1.ts";

    fn opts(size: u64) -> WriteOptions {
        WriteOptions::new(now_secs() + 3600, 200)
            .with_body_size(size)
            .partial()
    }

    fn write_range(storage: &dyn Storage, data: &[u8], first: usize, last: usize) {
        let mut writer = storage
            .open_writer(&CacheKey::new(KEY), opts(data.len() as u64))
            .unwrap();
        writer.write_header(b"x-range: yes\r\n").unwrap();
        writer.write_at(first as u64, &data[first..=last]).unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_ranges_assemble_across_sessions() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, |_| {});
        let data = body(200);
        let key = CacheKey::new(KEY);
        let partial = ReadOptions::fresh().partial();

        write_range(&storage, &data, 0, 99);
        write_range(&storage, &data, 150, 199);
        {
            let mut reader = storage.open_reader(&key, partial).unwrap();
            assert_eq!(&reader.read_header().unwrap()[..], b"x-range: yes\r\n");
            let head = collect_chunks(reader.body_range_chunks(0, 99).unwrap()).unwrap();
            assert_eq!(&head[..], &data[..100]);
            let tail = collect_chunks(reader.body_range_chunks(-50, -1).unwrap()).unwrap();
            assert_eq!(&tail[..], &data[150..]);
            assert_matches!(reader.body_range_chunks(0, 199).err(), Some(Error::NotFound(_)));
            assert_matches!(reader.body_chunks().err(), Some(Error::NotFound(_)));
        }
        assert_matches!(storage.open_reader(&key, ReadOptions::fresh()), Err(Error::NotFound(_)));

        write_range(&storage, &data, 100, 149);
        let path = entry_path(dir.path(), &key.hash);
        assert!(!ranges_path(&path).exists());

        let mut reader = storage.open_reader(&key, ReadOptions::fresh()).unwrap();
        assert_eq!(reader.body_size(), 200);
        assert_eq!(&reader.read_body().unwrap()[..], &data[..]);
        assert_eq!(storage.stat().unwrap().count, 1);
    }

    #[test]
    fn test_sidecar_tracks_spans() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, |_| {});
        let data = body(1000);
        write_range(&storage, &data, 0, 99);
        write_range(&storage, &data, 500, 599);

        let key = CacheKey::new(KEY);
        let sidecar = ranges_path(&entry_path(dir.path(), &key.hash));
        let set = crate::cache::ranges::RangeSet::load(&sidecar).unwrap();
        assert_eq!(set.ranges(), vec![(0, 99), (500, 599)]);
        assert_eq!(set.body_size(), 1000);
        assert_eq!(set.max(), 599);
    }

    #[test]
    fn test_sequential_writes_and_bounds() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, |_| {});
        let key = CacheKey::new(KEY);
        let mut writer = storage.open_writer(&key, opts(10)).unwrap();
        writer.write(b"01234").unwrap();
        writer.write(b"567").unwrap();
        assert_eq!(writer.body_size(), 8);
        assert_matches!(writer.write_at(8, b"890"), Err(Error::InvalidRange { .. }));
        writer.write(b"89").unwrap();
        writer.close().unwrap();

        let (_, read) = crate::cache::storage::testutil::get(&storage, KEY).unwrap();
        assert_eq!(&read[..], b"0123456789");
    }

    #[test]
    fn test_partial_requires_declared_size() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, |_| {});
        let opts = WriteOptions::new(now_secs() + 60, 200).partial();
        assert_matches!(
            storage.open_writer(&CacheKey::new(KEY), opts),
            Err(Error::InvalidState(_))
        );
        assert_eq!(storage.active_writers(), 0);
    }

    #[test]
    fn test_discarded_new_entry_is_removed() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, |_| {});
        let key = CacheKey::new(KEY);
        let mut writer = storage.open_writer(&key, opts(100)).unwrap();
        writer.write_at(0, &body(10)).unwrap();
        writer.discard();
        assert!(!entry_path(dir.path(), &key.hash).exists());
        assert!(!storage.exist(&key));
    }

    #[test]
    fn test_discarded_reopen_keeps_earlier_ranges() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, |_| {});
        let data = body(300);
        write_range(&storage, &data, 0, 99);

        let key = CacheKey::new(KEY);
        let mut writer = storage.open_writer(&key, opts(300)).unwrap();
        writer.write_at(100, &data[100..200]).unwrap();
        drop(writer);

        let mut reader = storage.open_reader(&key, ReadOptions::fresh().partial()).unwrap();
        let head = collect_chunks(reader.body_range_chunks(0, 99).unwrap()).unwrap();
        assert_eq!(&head[..], &data[..100]);
        assert_matches!(reader.body_range_chunks(100, 199).err(), Some(Error::NotFound(_)));
    }

    #[test]
    fn test_reopen_keeps_header() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, |_| {});
        let data = body(100);
        write_range(&storage, &data, 0, 9);

        let key = CacheKey::new(KEY);
        let mut writer = storage.open_writer(&key, opts(100)).unwrap();
        writer.write_header(b"ignored: later\r\n").unwrap();
        assert_eq!(writer.header_size(), b"x-range: yes\r\n".len() as u64);
        writer.write_at(10, &data[10..]).unwrap();
        writer.close().unwrap();

        let mut reader = storage.open_reader(&key, ReadOptions::fresh()).unwrap();
        assert_eq!(&reader.read_header().unwrap()[..], b"x-range: yes\r\n");
        assert_eq!(&reader.read_body().unwrap()[..], &data[..]);
    }

    #[test]
    fn test_changed_size_starts_over() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, |_| {});
        write_range(&storage, &body(100), 0, 49);

        let key = CacheKey::new(KEY);
        let writer = storage.open_writer(&key, opts(400)).unwrap();
        assert_eq!(writer.body_size(), 0);
        writer.discard();
        assert!(!entry_path(dir.path(), &key.hash).exists());
    }

    #[test]
    fn test_changed_size_leaves_open_reader_intact() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, |_| {});
        let old = body(100);
        put(&storage, KEY, &old, 3600).unwrap();

        let key = CacheKey::new(KEY);
        let mut before = storage.open_reader(&key, ReadOptions::fresh()).unwrap();

        let data: Vec<u8> = body(300).into_iter().rev().collect();
        let mut writer = storage.open_writer(&key, opts(300)).unwrap();
        assert!(storage.index().get(&key.hash).unwrap().is_none());
        assert_eq!(storage.metrics().entry_count, 0);
        writer.write_header(b"x-range: yes\r\n").unwrap();
        writer.write(&data).unwrap();

        assert_eq!(before.body_size(), 100);
        assert_eq!(&before.read_body().unwrap()[..], &old[..]);
        drop(before);

        writer.close().unwrap();
        let mut after = storage.open_reader(&key, ReadOptions::fresh()).unwrap();
        assert_eq!(after.body_size(), 300);
        assert_eq!(&after.read_body().unwrap()[..], &data[..]);
        assert_eq!(storage.stat().unwrap().count, 1);
    }

    #[test]
    fn test_full_write_replaces_partial() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, |_| {});
        write_range(&storage, &body(100), 0, 49);
        let key = CacheKey::new(KEY);
        let sidecar = ranges_path(&entry_path(dir.path(), &key.hash));
        assert!(sidecar.exists());

        put(&storage, KEY, b"whole body", 3600).unwrap();
        assert!(!sidecar.exists());
        let (_, read) = crate::cache::storage::testutil::get(&storage, KEY).unwrap();
        assert_eq!(&read[..], b"whole body");
        assert_eq!(storage.stat().unwrap().count, 1);
    }
}
