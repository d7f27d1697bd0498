//! Disk Storage
//!
//! Capacity-bounded disk tier. Each entry is one file under
//! `dir/ab/cd/<hash>.cache`; metadata lives in a sharded key index under
//! `dir/index`.
//!
//! ```text
//! open_writer ──► admission ──► writer map ──► <hash>.cache.tmp (locked)
//!                                                   │ close
//!                                                   ▼
//!                                   rename ──► <hash>.cache ──► index.add
//!
//! open_reader ──► index.exist ──► index.get ──► file pool ──► verify trailer
//! ```
//!
//! Used bytes and the entry count follow the index hooks. A maintenance
//! task flushes buffered hits, purges expired entries and evicts LFU
//! batches above the high-water mark.

mod partial;
mod reader;
mod writer;

pub use partial::PartialWriter;
pub use reader::DiskReader;
pub use writer::DiskWriter;

use crate::cache::codec::{entry_path, ranges_path, DEFAULT_CHUNK_SIZE, TMP_SUFFIX};
use crate::cache::entry::{CacheKey, ReadOptions, WriteOptions};
use crate::cache::index::{open_index, IndexConfig, Item, KeyIndex, Stat};
use crate::cache::metrics::{MetricsSnapshot, StorageMetrics};
use crate::cache::pool::OpenFilePool;
use crate::cache::storage::{invalidate_targets, PurgeKind, Reader, Storage, StorageKind, Writer};
use crate::cache::task::BackgroundTask;
use crate::error::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for disk storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskStorageConfig {
    /// Root directory for entry files and the index
    pub dir: PathBuf,
    /// Maximum accounted bytes (0 = unbounded)
    pub capacity_bytes: u64,
    /// Maximum number of entries (0 = unbounded)
    pub max_keys: u64,
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
    /// fsync entry files before commit
    pub sync_writes: bool,
    pub index: IndexConfig,
}

impl Default for DiskStorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/cache/edge-cache"),
            capacity_bytes: 10 * 1024 * 1024 * 1024, // 10 GB
            max_keys: 0,
            max_item_size: 1024 * 1024 * 1024, // 1 GB
            purge_interval_secs: 30,
            purge_count: 1000,
            lfu_free_percent: 10,
            chunk_size: DEFAULT_CHUNK_SIZE,
            sync_writes: false,
            index: IndexConfig::default(),
        }
    }
}

impl DiskStorageConfig {
    /// Config rooted at `dir` with defaults otherwise
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Used bytes above which LFU eviction runs (0 = never)
    pub fn high_water(&self) -> u64 {
        if self.capacity_bytes == 0 {
            return 0;
        }
        let keep = 100u64.saturating_sub(self.lfu_free_percent.min(100));
        self.capacity_bytes / 100 * keep + self.capacity_bytes % 100 * keep / 100
    }
}

/// Smallest non-zero limit
pub(crate) fn effective_limit(a: u64, b: u64) -> u64 {
    match (a, b) {
        (0, b) => b,
        (a, 0) => a,
        (a, b) => a.min(b),
    }
}

// =============================================================================
// Shared State
// =============================================================================

pub(crate) struct DiskInner {
    config: DiskStorageConfig,
    index: Arc<dyn KeyIndex>,
    files: Arc<OpenFilePool>,
    /// Hashes with an open writer
    writers: DashMap<String, ()>,
    metrics: Arc<StorageMetrics>,
}

/// Exclusive claim on a key's writer slot, released on drop
pub(crate) struct WriterSlot {
    inner: Arc<DiskInner>,
    hash: String,
}

impl Drop for WriterSlot {
    fn drop(&mut self) {
        self.inner.writers.remove(&self.hash);
    }
}

impl DiskInner {
    fn claim_writer(self: &Arc<Self>, hash: &str) -> Result<WriterSlot> {
        match self.writers.entry(hash.to_string()) {
            Entry::Occupied(_) => Err(Error::Busy(hash.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(WriterSlot {
                    inner: self.clone(),
                    hash: hash.to_string(),
                })
            }
        }
    }

    fn path_of(&self, hash: &str) -> PathBuf {
        entry_path(&self.config.dir, hash)
    }

    fn admit(&self, options: &WriteOptions) -> Result<()> {
        let limit = effective_limit(options.max_size, self.config.max_item_size);
        if limit > 0 && options.body_size > limit {
            return Err(Error::TooLarge {
                size: options.body_size,
                limit,
            });
        }

        if self.config.max_keys > 0 && self.metrics.get_entry_count() >= self.config.max_keys {
            return Err(Error::KeyLimit {
                limit: self.config.max_keys,
            });
        }

        self.check_capacity(options.header_size.saturating_add(options.body_size))
    }

    /// Refuse `requested` bytes that would push the tier over capacity
    fn check_capacity(&self, requested: u64) -> Result<()> {
        if self.config.capacity_bytes == 0 {
            return Ok(());
        }
        let used = self.metrics.get_bytes_stored();
        if used.saturating_add(requested) > self.config.capacity_bytes {
            return Err(Error::Capacity {
                requested,
                available: self.config.capacity_bytes.saturating_sub(used),
            });
        }
        Ok(())
    }

    /// Record a committed entry, removing its file if the index refuses it
    fn commit(&self, item: Item, path: &Path) -> Result<()> {
        self.files.invalidate(path);
        if let Err(e) = self.index.add(item) {
            error!(path = %path.display(), error = %e, "Failed to record entry in index");
            self.remove_files(path);
            return Err(e);
        }
        Ok(())
    }

    /// Remove an entry's file and sidecar, logging failures
    fn remove_files(&self, path: &Path) {
        self.files.invalidate(path);
        for target in [path.to_path_buf(), ranges_path(path)] {
            if let Err(e) = fs::remove_file(&target) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %target.display(), error = %e, "Failed to remove cache file");
                }
            }
        }
    }

    /// Drop an unusable entry from the index and the disk
    fn discard_entry(&self, hash: &str) {
        if let Err(e) = self.index.remove(hash) {
            error!(hash = %hash, error = %e, "Failed to remove index row");
        }
        self.remove_files(&self.path_of(hash));
    }

    fn remove_items(&self, items: &[Item]) {
        for item in items {
            self.remove_files(&self.path_of(&item.hash));
        }
    }

    fn purge_expired(&self, count: usize) -> Result<usize> {
        let removed = self.index.purge(count)?;
        self.remove_items(&removed);
        self.metrics.record_expirations(removed.len() as u64);
        if !removed.is_empty() {
            debug!(removed = removed.len(), "Purged expired disk entries");
        }
        Ok(removed.len())
    }

    fn purge_lfu(&self, count: usize) -> Result<usize> {
        let removed = self.index.purge_lfu(count)?;
        self.remove_items(&removed);
        self.metrics.record_evictions(removed.len() as u64);
        if !removed.is_empty() {
            debug!(removed = removed.len(), "Evicted least used disk entries");
        }
        Ok(removed.len())
    }

    /// One maintenance pass
    fn maintain(&self) {
        if let Err(e) = self.index.flush_hits() {
            warn!(error = %e, "Failed to flush hit counters");
        }
        if let Err(e) = self.purge_expired(self.config.purge_count) {
            error!(error = %e, "TTL purge failed");
        }

        let high_water = self.config.high_water();
        if high_water > 0 && self.metrics.get_bytes_stored() > high_water {
            if let Err(e) = self.purge_lfu(self.config.purge_count) {
                error!(error = %e, "LFU eviction failed");
            }
        }
    }

    /// Remove temporary files left by interrupted writers
    fn clean_orphans(&self) -> usize {
        let root = glob::Pattern::escape(&self.config.dir.to_string_lossy());
        let pattern = format!("{}/*/*/*{}", root, TMP_SUFFIX);
        let paths = match glob::glob(&pattern) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Invalid orphan pattern");
                return 0;
            }
        };

        let mut removed = 0;
        for path in paths.flatten() {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove orphaned file"),
            }
        }
        removed
    }
}

/// Take the non-blocking exclusive lock on an open file
pub(crate) fn lock_exclusive(file: &File, path: &Path) -> Result<()> {
    file.try_lock_exclusive().map_err(|e| {
        let contended = e.kind() == io::ErrorKind::WouldBlock
            || e.raw_os_error() == fs2::lock_contended_error().raw_os_error();
        if contended {
            Error::Busy(path.display().to_string())
        } else {
            Error::Io(e)
        }
    })
}

// =============================================================================
// Disk Storage
// =============================================================================

/// Disk tier over entry files and a sharded key index
pub struct DiskStorage {
    inner: Arc<DiskInner>,
    tasks: Mutex<Vec<BackgroundTask>>,
    initialized: AtomicBool,
}

impl DiskStorage {
    /// Open the index under `config.dir/index`
    pub fn new(config: DiskStorageConfig, files: Arc<OpenFilePool>) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let index = open_index(&config.index, &config.dir.join("index"))?;
        Ok(Self::with_index(config, index, files))
    }

    /// Build over an already opened index
    pub fn with_index(
        config: DiskStorageConfig,
        index: Arc<dyn KeyIndex>,
        files: Arc<OpenFilePool>,
    ) -> Self {
        Self {
            inner: Arc::new(DiskInner {
                config,
                index,
                files,
                writers: DashMap::new(),
                metrics: Arc::new(StorageMetrics::new()),
            }),
            tasks: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &DiskStorageConfig {
        &self.inner.config
    }

    pub fn index(&self) -> &Arc<dyn KeyIndex> {
        &self.inner.index
    }

    /// Number of writers currently open
    pub fn active_writers(&self) -> usize {
        self.inner.writers.len()
    }

    /// Run one maintenance pass now
    pub fn maintain(&self) {
        self.inner.maintain();
    }

    fn start_tasks(&self) -> Result<()> {
        let mut tasks = self.tasks.lock();

        let index = self.inner.index.clone();
        let batch = self.inner.config.index.warm_batch.max(1);
        tasks.push(BackgroundTask::spawn_periodic(
            "edge-cache-index-warm",
            Duration::from_millis(1),
            move || match index.warm_up(batch) {
                Ok(done) => {
                    if done {
                        info!("Key index warm-up complete");
                    }
                    !done
                }
                Err(e) => {
                    error!(error = %e, "Key index warm-up failed");
                    false
                }
            },
        )?);

        if self.inner.config.purge_interval_secs > 0 {
            let weak = Arc::downgrade(&self.inner);
            tasks.push(BackgroundTask::spawn_periodic(
                "edge-cache-disk-purge",
                Duration::from_secs(self.inner.config.purge_interval_secs),
                move || match weak.upgrade() {
                    Some(inner) => {
                        inner.maintain();
                        true
                    }
                    None => false,
                },
            )?);
        }
        Ok(())
    }

    fn read(&self, key: &CacheKey, options: ReadOptions) -> Result<DiskReader> {
        let inner = &self.inner;
        if !inner.index.exist(&key.hash) && !options.allow_stale {
            return Err(Error::not_found(key.key.as_str()));
        }

        let item = inner
            .index
            .get(&key.hash)?
            .ok_or_else(|| Error::not_found(key.key.as_str()))?;
        let now = crate::cache::entry::now_secs();
        let usable = item.is_fresh(now) || (options.allow_stale && item.is_servable_stale(now));
        if !usable {
            return Err(Error::not_found(key.key.as_str()));
        }

        DiskReader::open(inner.clone(), key, item, options)
    }
}

impl Storage for DiskStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Disk
    }

    fn init(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let inner = &self.inner;
        fs::create_dir_all(&inner.config.dir)?;
        let orphans = inner.clean_orphans();

        inner.index.init()?;
        let stat = inner.index.stat()?;
        inner.metrics.set_storage(stat.count, stat.total_size);

        let on_add = inner.metrics.clone();
        inner
            .index
            .on_add(Arc::new(move |item: &Item| on_add.record_put(item.total_size())));
        let on_remove = inner.metrics.clone();
        inner
            .index
            .on_remove(Arc::new(move |item: &Item| on_remove.record_remove(item.total_size())));

        self.start_tasks()?;

        info!(
            dir = %inner.config.dir.display(),
            entries = stat.count,
            bytes = stat.total_size,
            orphans = orphans,
            "Disk storage initialized"
        );
        Ok(())
    }

    fn open_reader(&self, key: &CacheKey, options: ReadOptions) -> Result<Box<dyn Reader>> {
        match self.read(key, options) {
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
        let opened: Result<Box<dyn Writer>> = self.inner.admit(&options).and_then(|()| {
            if options.partial {
                Ok(Box::new(PartialWriter::open(self.inner.clone(), key, options)?) as Box<dyn Writer>)
            } else {
                Ok(Box::new(DiskWriter::open(self.inner.clone(), key, options)?) as Box<dyn Writer>)
            }
        });
        if let Err(e) = &opened {
            if e.is_ignorable() {
                self.inner.metrics.record_rejection();
                debug!(key = %key, error = %e, "Disk write refused");
            }
        }
        opened
    }

    fn exist(&self, key: &CacheKey) -> bool {
        self.inner.index.exist(&key.hash)
    }

    fn delete(&self, key: &CacheKey) -> Result<bool> {
        let path = self.inner.path_of(&key.hash);
        let removed = self.inner.index.remove(&key.hash)?;
        let had_file = path.exists();
        self.inner.remove_files(&path);
        Ok(removed.is_some() || had_file)
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
            PurgeKind::Dir => invalidate_targets(self.inner.index.as_ref(), targets),
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
        let inner = &self.inner;
        inner.index.clean_all()?;

        for entry in fs::read_dir(&inner.config.dir)?.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let is_shard_dir = name.len() == 2 && name.chars().all(|c| c.is_ascii_hexdigit());
            if !is_shard_dir {
                continue;
            }
            if let Err(e) = fs::remove_dir_all(entry.path()) {
                warn!(path = %entry.path().display(), error = %e, "Failed to remove cache directory");
            }
        }

        inner.metrics.reset_storage();
        info!(dir = %inner.config.dir.display(), "Cleaned disk storage");
        Ok(())
    }

    fn stop(&self) {
        let tasks: Vec<BackgroundTask> = self.tasks.lock().drain(..).collect();
        for mut task in tasks {
            task.stop();
        }
        if let Err(e) = self.inner.index.close() {
            error!(error = %e, "Failed to close key index");
        }
        info!(dir = %self.inner.config.dir.display(), "Disk storage stopped");
    }
}
