//! Cache Stack
//!
//! Builds the configured tiers over shared pools and owns their lifecycle.
//! Writes go to the front tier; reads fall back from memory to disk.

use crate::cache::entry::{CacheKey, ReadOptions, WriteOptions};
use crate::cache::index::Stat;
use crate::cache::metrics::MetricsSnapshot;
use crate::cache::pool::{BufferPool, BufferPoolStat, FilePoolStat, OpenFilePool};
use crate::cache::storage::{
    DiskStorage, FlushStat, MemoryStorage, PurgeKind, Reader, SharedStorage, Storage, StorageKind,
    Writer,
};
use crate::config::CacheConfig;
use crate::error::Result;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Statistics
// =============================================================================

/// Index totals and counters of one tier
#[derive(Debug, Clone, Serialize)]
pub struct TierStat {
    pub kind: StorageKind,
    pub index: Stat,
    pub metrics: MetricsSnapshot,
}

impl TierStat {
    fn of(storage: &dyn Storage) -> Result<Self> {
        Ok(Self {
            kind: storage.kind(),
            index: storage.stat()?,
            metrics: storage.metrics(),
        })
    }
}

/// Snapshot of the whole stack
#[derive(Debug, Clone, Serialize)]
pub struct StackStat {
    pub front: StorageKind,
    pub tiers: Vec<TierStat>,
    pub flush: Option<FlushStat>,
    pub buffers: BufferPoolStat,
    pub files: FilePoolStat,
}

// =============================================================================
// Cache Stack
// =============================================================================

/// Disk tier with an optional memory tier in front
pub struct CacheStack {
    config: CacheConfig,
    buffers: Arc<BufferPool>,
    files: Arc<OpenFilePool>,
    disk: Arc<DiskStorage>,
    memory: Option<Arc<MemoryStorage>>,
    started: AtomicBool,
}

impl CacheStack {
    /// Build the tiers without starting them
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let buffers = BufferPool::new(config.buffer_pool.clone());
        let files = OpenFilePool::new(config.file_pool.clone());
        let disk = Arc::new(DiskStorage::new(config.disk.clone(), files.clone())?);

        let memory = match config.kind {
            StorageKind::Disk => None,
            StorageKind::Memory => {
                let parent: SharedStorage = disk.clone();
                Some(Arc::new(MemoryStorage::new(
                    config.memory.clone(),
                    buffers.clone(),
                    Some(parent),
                )))
            }
        };

        Ok(Self {
            config,
            buffers,
            files,
            disk,
            memory,
            started: AtomicBool::new(false),
        })
    }

    /// Start the pools and initialise every tier, disk first
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.buffers.start()?;
        self.files.start()?;
        self.disk.init()?;
        if let Some(memory) = &self.memory {
            memory.init()?;
        }
        info!(
            front = %self.config.kind,
            dir = %self.config.disk.dir.display(),
            "Cache stack started"
        );
        Ok(())
    }

    /// Tier that receives writes
    pub fn front(&self) -> SharedStorage {
        match &self.memory {
            Some(memory) => memory.clone(),
            None => self.disk.clone(),
        }
    }

    pub fn disk(&self) -> &Arc<DiskStorage> {
        &self.disk
    }

    pub fn memory(&self) -> Option<&Arc<MemoryStorage>> {
        self.memory.as_ref()
    }

    /// Tiers front to back
    fn tiers(&self) -> Vec<&dyn Storage> {
        let mut tiers: Vec<&dyn Storage> = Vec::with_capacity(2);
        if let Some(memory) = &self.memory {
            tiers.push(memory.as_ref());
        }
        tiers.push(self.disk.as_ref());
        tiers
    }

    /// Open a reader from the first tier holding the key
    pub fn open_reader(&self, key: &CacheKey, options: ReadOptions) -> Result<Box<dyn Reader>> {
        if let Some(memory) = &self.memory {
            match memory.open_reader(key, options) {
                Ok(reader) => return Ok(reader),
                Err(e) if e.is_not_found() => {
                    debug!(key = %key, "Memory miss, trying disk");
                }
                Err(e) => return Err(e),
            }
        }
        self.disk.open_reader(key, options)
    }

    /// Open a writer on the front tier; partial entries always go to disk
    pub fn open_writer(&self, key: &CacheKey, options: WriteOptions) -> Result<Box<dyn Writer>> {
        match &self.memory {
            Some(memory) if !options.partial => memory.open_writer(key, options),
            _ => self.disk.open_writer(key, options),
        }
    }

    /// Remove a key from every tier
    pub fn delete(&self, key: &CacheKey) -> Result<bool> {
        let mut found = false;
        for tier in self.tiers() {
            found |= tier.delete(key)?;
        }
        Ok(found)
    }

    /// Apply a purge to every tier, returning the total affected
    pub fn purge(&self, targets: &[String], kind: PurgeKind) -> Result<usize> {
        let mut total = 0;
        for tier in self.tiers() {
            total += tier.purge(targets, kind)?;
        }
        info!(targets = targets.len(), kind = ?kind, affected = total, "Purged cache");
        Ok(total)
    }

    /// Run one maintenance pass on every tier
    pub fn maintain(&self) {
        if let Some(memory) = &self.memory {
            memory.maintain();
        }
        self.disk.maintain();
    }

    pub fn stat(&self) -> Result<StackStat> {
        let tiers = self
            .tiers()
            .into_iter()
            .map(TierStat::of)
            .collect::<Result<Vec<_>>>()?;
        Ok(StackStat {
            front: self.config.kind,
            tiers,
            flush: self.memory.as_ref().and_then(|m| m.flush_stat()),
            buffers: self.buffers.stat(),
            files: self.files.stat(),
        })
    }

    /// Drop every entry in every tier
    pub fn clean_all(&self) -> Result<()> {
        for tier in self.tiers() {
            tier.clean_all()?;
        }
        self.buffers.clear();
        Ok(())
    }

    /// Stop front to back so pending flushes land before the disk closes
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        for tier in self.tiers() {
            tier.stop();
        }
        self.files.stop();
        self.buffers.stop();
        info!("Cache stack stopped");
    }
}

impl Drop for CacheStack {
    fn drop(&mut self) {
        self.stop();
    }
}
