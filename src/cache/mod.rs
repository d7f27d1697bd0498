//! Edge Cache Storage Engine
//!
//! Stores HTTP response bodies keyed by request URL across a memory tier
//! and a capacity-bounded disk tier.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              Cache Stack                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────┐   flush    ┌──────────────────────────────┐   │
//! │  │   Memory Storage     │ ─────────► │        Disk Storage          │   │
//! │  │  (byte budget, LFU)  │  workers   │  (entry files, partial       │   │
//! │  │                      │            │   ranges, admission)         │   │
//! │  └──────────┬───────────┘            └───────┬──────────────┬───────┘   │
//! │             │                                │              │           │
//! │     ┌───────┴────────┐              ┌────────┴──────┐ ┌─────┴───────┐   │
//! │     │  Buffer Pool   │              │   Key Index   │ │  File Pool  │   │
//! │     │ (size buckets) │              │ (SQLite/mem,  │ │ (per path,  │   │
//! │     └────────────────┘              │  N shards)    │ │  LRU)       │   │
//! │                                     └───────────────┘ └─────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use edge_cache::cache::{CacheKey, CacheStack, ReadOptions, WriteOptions};
//! use edge_cache::config::CacheConfig;
//!
//! let stack = CacheStack::new(CacheConfig::default())?;
//! stack.start()?;
//!
//! let key = CacheKey::new("https://example.com/video/seg-1.ts");
//! let mut writer = stack.open_writer(&key, WriteOptions::new(expires, 200).with_body_size(len))?;
//! writer.write_header(&header)?;
//! writer.write(&body)?;
//! writer.close()?;
//!
//! let mut reader = stack.open_reader(&key, ReadOptions::fresh())?;
//! for chunk in reader.body_range_chunks(0, 1023)? {
//!     send(chunk?);
//! }
//! ```

pub mod codec;
pub mod entry;
pub mod index;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod ranges;
pub mod storage;
pub mod task;

// Re-export main types
pub use codec::{collect_chunks, resolve_range, ChunkIter, EntryMeta};
pub use entry::{hash_key, CacheKey, ReadOptions, WriteOptions};
pub use index::{open_index, IndexBackend, IndexConfig, Item, ItemKind, KeyIndex, ShardedKeyIndex, Stat};
pub use manager::{CacheStack, StackStat, TierStat};
pub use metrics::{MetricsSnapshot, StorageMetrics};
pub use pool::{BufferPool, BufferPoolConfig, FilePoolConfig, OpenFilePool};
pub use ranges::RangeSet;
pub use storage::{
    DiskStorage, DiskStorageConfig, MemoryStorage, MemoryStorageConfig, PurgeKind, Reader,
    SharedStorage, Storage, StorageKind, Writer,
};
