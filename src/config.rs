//! Cache Configuration
//!
//! One YAML document describes the whole stack. Every section has
//! defaults, so an empty document yields a disk-only cache under
//! `/var/cache/edge-cache`.
//!
//! ```yaml
//! kind: memory
//! disk:
//!   dir: /srv/cache
//!   capacity_bytes: 107374182400
//!   index:
//!     backend: sqlite
//!     shards: 16
//! memory:
//!   capacity_bytes: 1073741824
//! ```

use crate::cache::pool::{BufferPoolConfig, FilePoolConfig};
use crate::cache::storage::{DiskStorageConfig, MemoryStorageConfig, StorageKind};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Front tier: `disk` alone, or `memory` spilling into disk
    pub kind: StorageKind,
    pub disk: DiskStorageConfig,
    pub memory: MemoryStorageConfig,
    pub buffer_pool: BufferPoolConfig,
    pub file_pool: FilePoolConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::Disk,
            disk: DiskStorageConfig::default(),
            memory: MemoryStorageConfig::default(),
            buffer_pool: BufferPoolConfig::default(),
            file_pool: FilePoolConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Load and validate a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: CacheConfig = if contents.trim().is_empty() {
            CacheConfig::default()
        } else {
            serde_yaml::from_str(contents)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let disk = &self.disk;
        if disk.dir.as_os_str().is_empty() {
            return Err(Error::Configuration("disk.dir must be set".into()));
        }
        if disk.index.shards == 0 {
            return Err(Error::Configuration("disk.index.shards must be >= 1".into()));
        }
        if disk.index.warm_batch == 0 {
            return Err(Error::Configuration("disk.index.warm_batch must be >= 1".into()));
        }
        if disk.purge_count == 0 {
            return Err(Error::Configuration("disk.purge_count must be >= 1".into()));
        }
        if disk.lfu_free_percent > 100 {
            return Err(Error::Configuration(format!(
                "disk.lfu_free_percent ({}) must be <= 100",
                disk.lfu_free_percent
            )));
        }
        if disk.chunk_size == 0 {
            return Err(Error::Configuration("disk.chunk_size must be > 0".into()));
        }

        if self.kind == StorageKind::Memory {
            let memory = &self.memory;
            if memory.capacity_bytes == 0 {
                return Err(Error::Configuration("memory.capacity_bytes must be > 0".into()));
            }
            if !(0.0..=1.0).contains(&memory.system_memory_fraction) {
                return Err(Error::Configuration(format!(
                    "memory.system_memory_fraction ({}) must be within 0..=1",
                    memory.system_memory_fraction
                )));
            }
            if memory.index_shards == 0 {
                return Err(Error::Configuration("memory.index_shards must be >= 1".into()));
            }
            if memory.flush_queue_size == 0 {
                return Err(Error::Configuration("memory.flush_queue_size must be >= 1".into()));
            }
            if memory.purge_count == 0 {
                return Err(Error::Configuration("memory.purge_count must be >= 1".into()));
            }
            if memory.lfu_free_percent > 100 {
                return Err(Error::Configuration(format!(
                    "memory.lfu_free_percent ({}) must be <= 100",
                    memory.lfu_free_percent
                )));
            }
            if memory.chunk_size == 0 {
                return Err(Error::Configuration("memory.chunk_size must be > 0".into()));
            }
        }

        if self.file_pool.max_per_path == 0 {
            return Err(Error::Configuration("file_pool.max_per_path must be >= 1".into()));
        }
        Ok(())
    }
}
