//! Memory Storage
//!
//! In-process tier bounded by a byte budget. Entries live in one map under
//! a single lock that only ever guards O(1) bookkeeping; expiry and LFU
//! order live in an in-memory key index.
//!
//! ```text
//! open_writer ──► ignore set ──► queue full? ──► reserve budget
//!                                                    │ close
//!                                                    ▼
//!                          entries map + index ──► flush queue ──► workers ──► parent
//! ```
//!
//! Buffers come from the buffer pool and go back to it when an entry is
//! removed and no reader still shares them.

mod flush;
mod reader;
mod writer;

pub use flush::FlushStat;
pub use reader::MemoryReader;
pub use writer::MemoryWriter;

use crate::cache::codec::DEFAULT_CHUNK_SIZE;
use crate::cache::entry::{now_secs, CacheKey, ReadOptions, WriteOptions};
use crate::cache::index::{Item, ItemKind, KeyIndex, MemoryShard, ShardedKeyIndex, Stat};
use crate::cache::metrics::{MetricsSnapshot, StorageMetrics};
use crate::cache::pool::BufferPool;
use crate::cache::storage::disk::effective_limit;
use crate::cache::storage::{
    invalidate_targets, PurgeKind, Reader, SharedStorage, Storage, StorageKind, Writer,
};
use crate::cache::task::BackgroundTask;
use crate::error::{Error, Result};
use bytes::Bytes;
use flush::{FlushJob, FlushPipeline};
use indexmap::IndexSet;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// LFU batches per maintenance pass
const MAX_LFU_PASSES: usize = 16;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for memory storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStorageConfig {
    /// Byte budget for header and body bytes
    pub capacity_bytes: u64,
    /// Largest share of system memory the budget may claim
    pub system_memory_fraction: f64,
    /// Maximum body size of one entry (0 = unbounded)
    pub max_item_size: u64,
    /// Maintenance interval in seconds (0 = no maintenance task)
    pub purge_interval_secs: u64,
    /// Entries removed per purge batch
    pub purge_count: usize,
    /// Percent of capacity kept free by LFU eviction
    pub lfu_free_percent: u64,
    /// Streaming chunk size
    pub chunk_size: usize,
    /// Pending flushes before writers are refused
    pub flush_queue_size: usize,
    /// Flush worker threads (0 = one per CPU)
    pub flush_workers: usize,
    /// Remembered oversize keys
    pub ignore_set_size: usize,
    /// Shards of the in-memory key index
    pub index_shards: usize,
}

impl Default for MemoryStorageConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 512 * 1024 * 1024, // 512 MB
            system_memory_fraction: 1.0 / 3.0,
            max_item_size: 16 * 1024 * 1024, // 16 MB
            purge_interval_secs: 5,
            purge_count: 1000,
            lfu_free_percent: 10,
            chunk_size: DEFAULT_CHUNK_SIZE,
            flush_queue_size: 1024,
            flush_workers: 0,
            ignore_set_size: 10_000,
            index_shards: 8,
        }
    }
}

impl MemoryStorageConfig {
    /// Budget after clamping to the share of system memory
    pub fn effective_capacity(&self) -> u64 {
        match total_memory() {
            Some(total) if self.system_memory_fraction > 0.0 => {
                let ceiling = (total as f64 * self.system_memory_fraction.min(1.0)) as u64;
                self.capacity_bytes.min(ceiling)
            }
            _ => self.capacity_bytes,
        }
    }
}

/// Total system memory from /proc/meminfo
fn total_memory() -> Option<u64> {
    let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
    meminfo
        .lines()
        .find(|line| line.starts_with("MemTotal:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

// =============================================================================
// Entries
// =============================================================================

/// One completed memory entry
#[derive(Debug)]
pub struct MemEntry {
    pub header: Bytes,
    pub body: Bytes,
    pub status: u16,
    pub expires_at: i64,
    pub stale_at: i64,
    pub server_id: u32,
    pub modified_at: i64,
}

impl MemEntry {
    /// Bytes charged against the budget
    pub fn size(&self) -> u64 {
        (self.header.len() + self.body.len()) as u64
    }
}

#[derive(Debug, Default)]
struct MemState {
    entries: HashMap<String, Arc<MemEntry>>,
    /// Hashes with an open writer
    writing: HashSet<String>,
    used: u64,
    reserved: u64,
}

impl MemState {
    fn take(&mut self, hash: &str) -> Option<Arc<MemEntry>> {
        let entry = self.entries.remove(hash)?;
        self.used = self.used.saturating_sub(entry.size());
        Some(entry)
    }
}

// =============================================================================
// Shared State
// =============================================================================

pub(crate) struct MemInner {
    config: MemoryStorageConfig,
    capacity: u64,
    state: RwLock<MemState>,
    index: ShardedKeyIndex<MemoryShard>,
    buffers: Arc<BufferPool>,
    parent: Option<SharedStorage>,
    flush: RwLock<Option<FlushPipeline>>,
    /// `key$limit` of entries known to exceed their size limit
    ignored: Mutex<IndexSet<String>>,
    metrics: Arc<StorageMetrics>,
}

fn ignore_key(key: &CacheKey, limit: u64) -> String {
    format!("{}${}", key.key, limit)
}

impl MemInner {
    fn high_water(&self) -> u64 {
        let keep = 100u64.saturating_sub(self.config.lfu_free_percent.min(100));
        (self.capacity as u128 * keep as u128 / 100) as u64
    }

    pub(crate) fn ignore(&self, key: &CacheKey, limit: u64) {
        let mut ignored = self.ignored.lock();
        if ignored.len() >= self.config.ignore_set_size.max(1) {
            ignored.shift_remove_index(0);
        }
        ignored.insert(ignore_key(key, limit));
    }

    fn is_ignored(&self, key: &CacheKey, limit: u64) -> bool {
        self.ignored.lock().contains(&ignore_key(key, limit))
    }

    fn open_writer(self: &Arc<Self>, key: &CacheKey, options: WriteOptions) -> Result<MemoryWriter> {
        if options.partial {
            return Err(Error::Unsupported("partial entries in memory storage".into()));
        }

        let limit = effective_limit(options.max_size, self.config.max_item_size);
        if limit > 0 {
            if self.is_ignored(key, limit) {
                return Err(Error::TooLarge {
                    size: options.body_size,
                    limit,
                });
            }
            if options.body_size > limit {
                self.ignore(key, limit);
                return Err(Error::TooLarge {
                    size: options.body_size,
                    limit,
                });
            }
        }

        let flush_full = self.flush.read().as_ref().map_or(false, |f| f.is_full());
        if flush_full {
            return Err(Error::QueueFull);
        }

        let incoming = options.header_size.saturating_add(options.body_size);
        {
            let mut state = self.state.write();
            if state.writing.contains(&key.hash) {
                return Err(Error::Busy(key.hash.clone()));
            }
            let committed = state.used + state.reserved;
            if committed.saturating_add(incoming) > self.capacity {
                return Err(Error::Capacity {
                    requested: incoming,
                    available: self.capacity.saturating_sub(committed),
                });
            }
            state.writing.insert(key.hash.clone());
            state.reserved += incoming;
        }

        Ok(MemoryWriter::new(self.clone(), key, options, incoming, limit))
    }

    pub(crate) fn reserve_more(&self, extra: u64) -> Result<()> {
        let mut state = self.state.write();
        let committed = state.used + state.reserved;
        if committed.saturating_add(extra) > self.capacity {
            return Err(Error::Capacity {
                requested: extra,
                available: self.capacity.saturating_sub(committed),
            });
        }
        state.reserved += extra;
        Ok(())
    }

    pub(crate) fn release(&self, hash: &str, reserved: u64) {
        let mut state = self.state.write();
        state.writing.remove(hash);
        state.reserved = state.reserved.saturating_sub(reserved);
    }

    /// Publish a completed entry, record it and queue its flush
    pub(crate) fn commit(&self, key: &CacheKey, entry: Arc<MemEntry>, reserved: u64) -> Result<()> {
        let replaced = {
            let mut state = self.state.write();
            state.writing.remove(&key.hash);
            state.reserved = state.reserved.saturating_sub(reserved);
            let replaced = state.take(&key.hash);
            state.used += entry.size();
            state.entries.insert(key.hash.clone(), entry.clone());
            replaced
        };
        if let Some(old) = replaced {
            self.recycle(old);
        }

        let mut item = Item::new(key, ItemKind::Memory);
        item.expires_at = entry.expires_at;
        item.stale_at = entry.stale_at;
        item.header_size = entry.header.len() as u64;
        item.body_size = entry.body.len() as u64;
        item.server_id = entry.server_id;
        if let Err(e) = self.index.add(item) {
            if let Some(orphan) = self.state.write().take(&key.hash) {
                self.recycle(orphan);
            }
            return Err(e);
        }

        if let Some(flush) = self.flush.read().as_ref() {
            let job = FlushJob {
                key: key.clone(),
                entry,
            };
            if flush.enqueue(job).is_err() {
                debug!(key = %key, "Flush queue full, entry stays in memory");
            }
        }
        debug!(key = %key, "Committed memory entry");
        Ok(())
    }

    /// Return an entry's buffers to the pool when nothing else shares them
    fn recycle(&self, entry: Arc<MemEntry>) {
        let entry = match Arc::try_unwrap(entry) {
            Ok(entry) => entry,
            Err(_) => return,
        };
        if let Ok(body) = entry.body.try_into_mut() {
            self.buffers.put(Vec::from(body));
        }
    }

    fn remove_items(&self, items: &[Item]) {
        let removed: Vec<Arc<MemEntry>> = {
            let mut state = self.state.write();
            items.iter().filter_map(|item| state.take(&item.hash)).collect()
        };
        for entry in removed {
            self.recycle(entry);
        }
    }

    fn read(&self, key: &CacheKey, options: ReadOptions) -> Result<MemoryReader> {
        if !self.index.exist(&key.hash) && !options.allow_stale {
            return Err(Error::not_found(key.key.as_str()));
        }
        let item = self
            .index
            .get(&key.hash)?
            .ok_or_else(|| Error::not_found(key.key.as_str()))?;
        let now = now_secs();
        if !(item.is_fresh(now) || (options.allow_stale && item.is_servable_stale(now))) {
            return Err(Error::not_found(key.key.as_str()));
        }

        let entry = self
            .state
            .read()
            .entries
            .get(&key.hash)
            .cloned()
            .ok_or_else(|| Error::not_found(key.key.as_str()))?;
        self.index.increase_hit(&key.hash);
        Ok(MemoryReader::new(entry, item.expires_at, self.config.chunk_size))
    }

    fn purge_expired(&self, count: usize) -> Result<usize> {
        let removed = self.index.purge(count)?;
        self.remove_items(&removed);
        self.metrics.record_expirations(removed.len() as u64);
        Ok(removed.len())
    }

    fn purge_lfu(&self, count: usize) -> Result<usize> {
        let removed = self.index.purge_lfu(count)?;
        self.remove_items(&removed);
        self.metrics.record_evictions(removed.len() as u64);
        Ok(removed.len())
    }

    fn used(&self) -> u64 {
        self.state.read().used
    }

    fn maintain(&self) {
        match self.purge_expired(self.config.purge_count) {
            Ok(n) if n > 0 => debug!(removed = n, "Purged expired memory entries"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Memory TTL purge failed"),
        }

        let high_water = self.high_water();
        for _ in 0..MAX_LFU_PASSES {
            if self.used() <= high_water {
                break;
            }
            match self.purge_lfu(self.config.purge_count) {
                Ok(0) => break,
                Ok(n) => debug!(removed = n, used = self.used(), "Evicted least used memory entries"),
                Err(e) => {
                    error!(error = %e, "Memory LFU eviction failed");
                    break;
                }
            }
        }
    }
}

// =============================================================================
// Memory Storage
// =============================================================================

/// Memory tier with optional spill to a parent storage
pub struct MemoryStorage {
    inner: Arc<MemInner>,
    tasks: Mutex<Vec<BackgroundTask>>,
    initialized: AtomicBool,
}

impl MemoryStorage {
    pub fn new(
        config: MemoryStorageConfig,
        buffers: Arc<BufferPool>,
        parent: Option<SharedStorage>,
    ) -> Self {
        let capacity = config.effective_capacity();
        let index = ShardedKeyIndex::in_memory(config.index_shards);
        Self {
            inner: Arc::new(MemInner {
                config,
                capacity,
                state: RwLock::new(MemState::default()),
                index,
                buffers,
                parent,
                flush: RwLock::new(None),
                ignored: Mutex::new(IndexSet::new()),
                metrics: Arc::new(StorageMetrics::new()),
            }),
            tasks: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Byte budget after clamping
    pub fn capacity(&self) -> u64 {
        self.inner.capacity
    }

    /// Header and body bytes of stored entries
    pub fn used(&self) -> u64 {
        self.inner.used()
    }

    /// Bytes reserved by open writers
    pub fn reserved(&self) -> u64 {
        self.inner.state.read().reserved
    }

    /// Flush counters, when a parent is attached
    pub fn flush_stat(&self) -> Option<FlushStat> {
        self.inner.flush.read().as_ref().map(|f| f.stat())
    }

    /// Run one maintenance pass now
    pub fn maintain(&self) {
        self.inner.maintain();
    }
}

impl Storage for MemoryStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Memory
    }

    fn init(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let inner = &self.inner;
        inner.index.init()?;

        let on_add = inner.metrics.clone();
        inner
            .index
            .on_add(Arc::new(move |item: &Item| on_add.record_put(item.total_size())));
        let on_remove = inner.metrics.clone();
        inner
            .index
            .on_remove(Arc::new(move |item: &Item| on_remove.record_remove(item.total_size())));

        if let Some(parent) = &inner.parent {
            let workers = match inner.config.flush_workers {
                0 => num_cpus::get(),
                n => n,
            };
            *inner.flush.write() = Some(FlushPipeline::start(
                parent.clone(),
                workers,
                inner.config.flush_queue_size,
                inner.config.chunk_size,
            )?);
        }

        if inner.config.purge_interval_secs > 0 {
            let weak = Arc::downgrade(inner);
            self.tasks.lock().push(BackgroundTask::spawn_periodic(
                "edge-cache-mem-purge",
                Duration::from_secs(inner.config.purge_interval_secs),
                move || match weak.upgrade() {
                    Some(inner) => {
                        inner.maintain();
                        true
                    }
                    None => false,
                },
            )?);
        }

        info!(
            capacity = inner.capacity,
            flush = inner.parent.is_some(),
            "Memory storage initialized"
        );
        Ok(())
    }

    fn open_reader(&self, key: &CacheKey, options: ReadOptions) -> Result<Box<dyn Reader>> {
        match self.inner.read(key, options) {
            Ok(reader) => {
                self.inner.metrics.record_hit();
                Ok(Box::new(reader))
            }
            Err(e) => {
                if e.is_not_found() {
                    self.inner.metrics.record_miss();
                }
                Err(e)
            }
        }
    }

    fn open_writer(&self, key: &CacheKey, options: WriteOptions) -> Result<Box<dyn Writer>> {
        match self.inner.open_writer(key, options) {
            Ok(writer) => Ok(Box::new(writer)),
            Err(e) => {
                if e.is_ignorable() {
                    self.inner.metrics.record_rejection();
                    debug!(key = %key, error = %e, "Memory write refused");
                }
                Err(e)
            }
        }
    }

    fn exist(&self, key: &CacheKey) -> bool {
        self.inner.index.exist(&key.hash)
    }

    fn delete(&self, key: &CacheKey) -> Result<bool> {
        let removed = self.inner.index.remove(&key.hash)?;
        let entry = self.inner.state.write().take(&key.hash);
        let existed = removed.is_some() || entry.is_some();
        if let Some(entry) = entry {
            self.inner.recycle(entry);
        }
        Ok(existed)
    }

    fn purge(&self, targets: &[String], kind: PurgeKind) -> Result<usize> {
        match kind {
            PurgeKind::File => {
                let mut removed = 0;
                for target in targets {
                    if self.delete(&CacheKey::new(target.as_str()))? {
                        removed += 1;
                    }
                }
                Ok(removed)
            }
            PurgeKind::Dir => invalidate_targets(&self.inner.index, targets),
        }
    }

    fn purge_expired(&self, count: usize) -> Result<usize> {
        self.inner.purge_expired(count)
    }

    fn purge_lfu(&self, count: usize) -> Result<usize> {
        self.inner.purge_lfu(count)
    }

    fn stat(&self) -> Result<Stat> {
        self.inner.index.stat()
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    fn clean_all(&self) -> Result<()> {
        self.inner.index.clean_all()?;
        let entries: Vec<Arc<MemEntry>> = {
            let mut state = self.inner.state.write();
            state.used = 0;
            state.entries.drain().map(|(_, e)| e).collect()
        };
        for entry in entries {
            self.inner.recycle(entry);
        }
        self.inner.metrics.reset_storage();
        info!("Cleaned memory storage");
        Ok(())
    }

    fn stop(&self) {
        let tasks: Vec<BackgroundTask> = self.tasks.lock().drain(..).collect();
        for mut task in tasks {
            task.stop();
        }
        if let Some(flush) = self.inner.flush.write().take() {
            flush.stop();
        }
        if let Err(e) = self.inner.index.close() {
            warn!(error = %e, "Failed to close memory index");
        }
        info!("Memory storage stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::pool::{BufferPoolConfig, FilePoolConfig, OpenFilePool};
    use crate::cache::storage::disk::{DiskStorage, DiskStorageConfig};
    use crate::cache::storage::testutil::{body, get, put, HEADER};
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn storage(tweak: impl FnOnce(&mut MemoryStorageConfig)) -> MemoryStorage {
        storage_with_parent(tweak, None)
    }

    fn storage_with_parent(
        tweak: impl FnOnce(&mut MemoryStorageConfig),
        parent: Option<SharedStorage>,
    ) -> MemoryStorage {
        let mut config = MemoryStorageConfig {
            purge_interval_secs: 0,
            flush_workers: 2,
            index_shards: 2,
            ..Default::default()
        };
        tweak(&mut config);
        let storage = MemoryStorage::new(config, BufferPool::new(BufferPoolConfig::default()), parent);
        storage.init().unwrap();
        storage
    }

    fn open(storage: &MemoryStorage, key: &str, size: u64) -> Result<Box<dyn Writer>> {
        storage.open_writer(
            &CacheKey::new(key),
            WriteOptions::new(now_secs() + 60, 200).with_body_size(size),
        )
    }

    #[test]
    fn test_write_then_read() {
        let storage = storage(|_| {});
        let data = body(5000);
        put(&storage, "https://example.com/m", &data, 60).unwrap();

        let (header, read) = get(&storage, "https://example.com/m").unwrap();
        assert_eq!(&header[..], HEADER);
        assert_eq!(&read[..], &data[..]);
        assert_eq!(storage.used(), (HEADER.len() + data.len()) as u64);
        assert_eq!(storage.reserved(), 0);

        let mut reader = storage
            .open_reader(&CacheKey::new("https://example.com/m"), ReadOptions::fresh())
            .unwrap();
        let span = crate::cache::codec::collect_chunks(reader.body_range_chunks(-10, -1).unwrap()).unwrap();
        assert_eq!(&span[..], &data[4990..]);
    }

    #[test]
    fn test_entries_visible_only_after_close() {
        let storage = storage(|_| {});
        let mut writer = open(&storage, "k", 3).unwrap();
        writer.write(b"abc").unwrap();
        assert!(get(&storage, "k").is_err());
        writer.close().unwrap();
        assert_eq!(&get(&storage, "k").unwrap().1[..], b"abc");
    }

    #[test]
    fn test_capacity_rejects_then_recovers() {
        let storage = storage(|c| c.capacity_bytes = 10_000);
        assert_eq!(storage.capacity(), 10_000);

        put(&storage, "a", &body(6_000), 60).unwrap();
        let used = storage.used();
        let err = open(&storage, "b", 10_000 - used + 1).err().unwrap();
        assert_matches!(err, Error::Capacity { .. });
        assert!(err.is_ignorable());

        assert!(open(&storage, "b", 10_000 - used).is_ok());

        storage.delete(&CacheKey::new("a")).unwrap();
        assert_eq!(storage.used(), 0);
        put(&storage, "b", &body(6_000), 60).unwrap();
    }

    #[test]
    fn test_reservation_counts_open_writers() {
        let storage = storage(|c| c.capacity_bytes = 10_000);
        let first = open(&storage, "a", 6_000).unwrap();
        assert_eq!(storage.reserved(), 6_000);
        assert_matches!(open(&storage, "b", 6_000), Err(Error::Capacity { .. }));

        first.discard();
        assert_eq!(storage.reserved(), 0);
        assert!(open(&storage, "b", 6_000).is_ok());
    }

    #[test]
    fn test_undeclared_growth_is_bounded() {
        let storage = storage(|c| {
            c.capacity_bytes = 1_000;
            c.max_item_size = 0;
        });
        let mut writer = open(&storage, "grow", 0).unwrap();
        writer.write(&body(900)).unwrap();
        assert_matches!(writer.write(&body(200)), Err(Error::Capacity { .. }));
        drop(writer);
        assert_eq!(storage.reserved(), 0);
    }

    #[test]
    fn test_concurrent_writer_is_busy() {
        let storage = storage(|_| {});
        let _first = open(&storage, "k", 10).unwrap();
        assert_matches!(open(&storage, "k", 10), Err(Error::Busy(_)));
        assert_eq!(storage.metrics().rejections, 1);
    }

    #[test]
    fn test_oversize_keys_are_ignored() {
        let storage = storage(|c| c.max_item_size = 100);
        assert_matches!(open(&storage, "big", 200), Err(Error::TooLarge { .. }));
        // remembered even when the next attempt declares nothing
        assert_matches!(open(&storage, "big", 0), Err(Error::TooLarge { .. }));

        let mut writer = open(&storage, "sneaky", 0).unwrap();
        assert_matches!(writer.write(&body(150)), Err(Error::TooLarge { .. }));
        assert_matches!(open(&storage, "sneaky", 0), Err(Error::TooLarge { .. }));
        assert!(open(&storage, "fine", 50).is_ok());
    }

    #[test]
    fn test_ignore_set_is_bounded() {
        let storage = storage(|c| {
            c.max_item_size = 10;
            c.ignore_set_size = 2;
        });
        for key in ["a", "b", "c"] {
            assert!(open(&storage, key, 20).is_err());
        }
        assert_eq!(storage.inner.ignored.lock().len(), 2);
        assert!(open(&storage, "a", 5).is_ok());
    }

    #[test]
    fn test_partial_unsupported() {
        let storage = storage(|_| {});
        let opts = WriteOptions::new(now_secs() + 60, 200).with_body_size(10).partial();
        assert_matches!(
            storage.open_writer(&CacheKey::new("p"), opts),
            Err(Error::Unsupported(_))
        );
    }

    #[test]
    fn test_purge_and_lfu() {
        let storage = storage(|c| {
            c.capacity_bytes = 20_000;
            c.lfu_free_percent = 50;
            c.purge_count = 1;
        });
        put(&storage, "old", &body(1_000), -100).unwrap();
        assert_eq!(storage.purge_expired(10).unwrap(), 1);
        assert_eq!(storage.metrics().expirations, 1);

        for i in 0..4 {
            put(&storage, &format!("k{}", i), &body(4_000), 60).unwrap();
        }
        assert!(storage.used() > 10_000);
        storage.maintain();
        assert!(storage.used() <= 10_000);
        assert_eq!(storage.stat().unwrap().count, 2);
        assert_eq!(storage.metrics().evictions, 2);
    }

    #[test]
    fn test_buffers_recycled_when_unshared() {
        let pool = BufferPool::new(BufferPoolConfig::default());
        let storage = MemoryStorage::new(
            MemoryStorageConfig {
                purge_interval_secs: 0,
                ..Default::default()
            },
            pool.clone(),
            None,
        );
        storage.init().unwrap();

        put(&storage, "shared", &body(4096), 60).unwrap();
        let mut reader = storage
            .open_reader(&CacheKey::new("shared"), ReadOptions::fresh())
            .unwrap();
        storage.delete(&CacheKey::new("shared")).unwrap();
        assert_eq!(pool.stat().items, 0);
        assert_eq!(reader.read_body().unwrap().len(), 4096);
        drop(reader);

        put(&storage, "alone", &body(4096), 60).unwrap();
        storage.delete(&CacheKey::new("alone")).unwrap();
        assert_eq!(pool.stat().items, 1);
    }

    #[test]
    fn test_invalidation_serves_stale() {
        let storage = storage(|_| {});
        put(&storage, "https://a.example.com/x/1", b"one", 60).unwrap();
        put(&storage, "https://b.example.com/x/2", b"two", 60).unwrap();
        let n = storage
            .purge(&["https://*.example.com/x".to_string()], PurgeKind::Dir)
            .unwrap();
        assert_eq!(n, 2);

        let key = CacheKey::new("https://a.example.com/x/1");
        assert!(!storage.exist(&key));
        let reader = storage.open_reader(&key, ReadOptions::fresh().allow_stale()).unwrap();
        assert_eq!(reader.expires_at(), 0);
    }

    #[test]
    fn test_clean_all() {
        let storage = storage(|_| {});
        for i in 0..10 {
            put(&storage, &format!("k{}", i), &body(100), 60).unwrap();
        }
        storage.clean_all().unwrap();
        assert_eq!(storage.used(), 0);
        assert_eq!(storage.stat().unwrap().count, 0);
        assert_eq!(storage.metrics().entry_count, 0);
        assert!(get(&storage, "k1").is_err());
    }

    #[test]
    fn test_flush_lands_in_parent() {
        let dir = TempDir::new().unwrap();
        let mut disk_config = DiskStorageConfig::with_dir(dir.path());
        disk_config.purge_interval_secs = 0;
        let disk = Arc::new(
            DiskStorage::new(disk_config, OpenFilePool::new(FilePoolConfig::default())).unwrap(),
        );
        disk.init().unwrap();
        let parent: SharedStorage = disk.clone();

        let storage = storage_with_parent(|_| {}, Some(parent));
        let data = body(20_000);
        for i in 0..8 {
            put(&storage, &format!("https://example.com/{}", i), &data, 600).unwrap();
        }
        let before = storage.flush_stat().unwrap();
        assert_eq!(before.failed, 0);
        storage.stop();

        assert!(storage.flush_stat().is_none());
        assert_eq!(disk.stat().unwrap().count, 8);
        let (header, read) = get(disk.as_ref(), "https://example.com/3").unwrap();
        assert_eq!(&header[..], HEADER);
        assert_eq!(&read[..], &data[..]);
    }
}
