//! Cache Storage Backends
//!
//! The contract shared by the disk and memory tiers. A storage hands out
//! streaming readers and writers for entries addressed by [`CacheKey`];
//! every admission refusal is an ignorable error and every corrupt entry is
//! discarded instead of served.

pub mod disk;
pub mod memory;

pub use disk::{DiskStorage, DiskStorageConfig};
pub use memory::{FlushStat, MemoryStorage, MemoryStorageConfig};

use crate::cache::codec::{collect_chunks, ChunkIter};
use crate::cache::entry::{CacheKey, ReadOptions, WriteOptions};
use crate::cache::index::Stat;
use crate::cache::metrics::MetricsSnapshot;
use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Kinds
// =============================================================================

/// Storage tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Disk,
    Memory,
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageKind::Disk => write!(f, "disk"),
            StorageKind::Memory => write!(f, "memory"),
        }
    }
}

/// How purge targets are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurgeKind {
    /// Each target is an exact key, removed outright
    File,
    /// Each target is a key prefix or host wildcard, soft-invalidated
    Dir,
}

// =============================================================================
// Reader
// =============================================================================

/// Streaming access to one stored entry
pub trait Reader: Send {
    fn status(&self) -> u16;

    /// Unix seconds, 0 once invalidated
    fn expires_at(&self) -> i64;

    fn header_size(&self) -> u64;

    fn body_size(&self) -> u64;

    fn header_chunks(&mut self) -> Result<ChunkIter<'_>>;

    fn body_chunks(&mut self) -> Result<ChunkIter<'_>>;

    /// Chunks of the inclusive body span `start..=end`
    ///
    /// Negative offsets count from the end of the body. A span a partial
    /// entry does not hold yet is reported as `NotFound`.
    fn body_range_chunks(&mut self, start: i64, end: i64) -> Result<ChunkIter<'_>>;

    fn read_header(&mut self) -> Result<Bytes> {
        collect_chunks(self.header_chunks()?)
    }

    fn read_body(&mut self) -> Result<Bytes> {
        collect_chunks(self.body_chunks()?)
    }
}

impl std::fmt::Debug for dyn Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("status", &self.status())
            .field("expires_at", &self.expires_at())
            .field("header_size", &self.header_size())
            .field("body_size", &self.body_size())
            .finish()
    }
}

// =============================================================================
// Writer
// =============================================================================

/// Streaming construction of one entry
///
/// Dropping a writer without `close` discards it.
pub trait Writer: Send {
    /// Write the response header, before any body bytes
    fn write_header(&mut self, header: &[u8]) -> Result<()>;

    /// Append body bytes
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Write body bytes at `offset` (partial entries only)
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let _ = (offset, data);
        Err(Error::Unsupported("write_at on a full entry writer".into()))
    }

    fn header_size(&self) -> u64;

    /// Body bytes written so far
    fn body_size(&self) -> u64;

    /// Commit the entry and make it visible to readers
    fn close(self: Box<Self>) -> Result<()>;

    /// Drop everything written
    fn discard(self: Box<Self>);
}

impl std::fmt::Debug for dyn Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("header_size", &self.header_size())
            .field("body_size", &self.body_size())
            .finish()
    }
}

// =============================================================================
// Storage
// =============================================================================

/// A cache tier
pub trait Storage: Send + Sync {
    fn kind(&self) -> StorageKind;

    /// Prepare directories and indexes and start background maintenance
    fn init(&self) -> Result<()>;

    fn open_reader(&self, key: &CacheKey, options: ReadOptions) -> Result<Box<dyn Reader>>;

    fn open_writer(&self, key: &CacheKey, options: WriteOptions) -> Result<Box<dyn Writer>>;

    /// Fresh entry present (or possibly present while the index warms up)
    fn exist(&self, key: &CacheKey) -> bool;

    /// Remove one entry, returning whether it existed
    fn delete(&self, key: &CacheKey) -> Result<bool>;

    /// Remove or invalidate entries, returning how many were affected
    fn purge(&self, targets: &[String], kind: PurgeKind) -> Result<usize>;

    /// Remove up to `count` entries past their stale window
    fn purge_expired(&self, count: usize) -> Result<usize>;

    /// Remove up to `count` least used entries
    fn purge_lfu(&self, count: usize) -> Result<usize>;

    fn stat(&self) -> Result<Stat>;

    fn metrics(&self) -> MetricsSnapshot;

    /// Remove every entry
    fn clean_all(&self) -> Result<()>;

    /// Stop background work and release resources
    fn stop(&self);
}

/// Shared handle to a storage
pub type SharedStorage = Arc<dyn Storage>;

/// Map each purge target to the index invalidation it denotes
pub(crate) fn invalidate_targets(
    index: &dyn crate::cache::index::KeyIndex,
    targets: &[String],
) -> Result<usize> {
    let mut total = 0;
    for target in targets {
        total += if target.contains('*') {
            index.clean_match_prefix(target)?
        } else {
            index.clean_prefix(target)?
        };
    }
    Ok(total)
}
