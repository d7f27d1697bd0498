//! Key Index
//!
//! Metadata for every cached entry: existence, expiry, sizes, host and
//! usage. The index is split into independent shards selected by the key
//! fingerprint, so writes to one shard never serialize the others.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                    ShardedKeyIndex<S>                      │
//! │   hash ──► fingerprint % N ──► shard                       │
//! ├──────────────┬──────────────┬──────────────┬──────────────┤
//! │  shard 0     │  shard 1     │     ...      │  shard N-1   │
//! │  table       │  table       │              │  table       │
//! │  existence   │  existence   │              │  existence   │
//! └──────────────┴──────────────┴──────────────┴──────────────┘
//! ```
//!
//! Backends implement [`IndexShard`]; [`SqliteShard`] persists each shard
//! in its own database file and [`MemoryShard`] keeps ordered in-process
//! tables. Both answer every query identically.

pub mod memory;
pub mod pattern;
pub mod sqlite;

pub use memory::MemoryShard;
pub use pattern::{KeyFilter, WildcardKey};
pub use sqlite::SqliteShard;

use crate::cache::entry::{epoch_of, host_of, now_secs, shard_of, CacheKey};
use crate::error::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

// =============================================================================
// Constants
// =============================================================================

/// Default number of index shards
pub const DEFAULT_SHARD_COUNT: usize = 8;

/// Seconds an invalidated entry stays servable as stale
pub const INVALIDATION_GRACE_SECS: i64 = 60;

/// Rows loaded per existence warm-up step
pub const DEFAULT_WARM_BATCH: usize = 10_000;

// =============================================================================
// Item
// =============================================================================

/// Where the entry bytes live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    File,
    Memory,
}

impl ItemKind {
    pub fn as_i64(self) -> i64 {
        match self {
            ItemKind::File => 0,
            ItemKind::Memory => 1,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => ItemKind::Memory,
            _ => ItemKind::File,
        }
    }
}

/// Index record of one cached entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub key: String,
    pub hash: String,
    pub kind: ItemKind,
    /// Unix seconds, 0 once invalidated
    pub expires_at: i64,
    /// Unix seconds, never below `expires_at`
    pub stale_at: i64,
    pub header_size: u64,
    pub body_size: u64,
    /// Layout overhead of the stored entry
    pub meta_size: u64,
    pub host: String,
    pub server_id: u32,
    pub created_at: i64,
    /// Day number of the last recorded hit
    pub access_epoch: i64,
    pub hits: u64,
    /// Assigned by the shard on every insert; identifies this exact row
    #[serde(default)]
    pub version: u64,
}

impl Item {
    /// New item for `key`, created now
    pub fn new(key: &CacheKey, kind: ItemKind) -> Self {
        let now = now_secs();
        Self {
            key: key.key.clone(),
            hash: key.hash.clone(),
            kind,
            expires_at: 0,
            stale_at: 0,
            header_size: 0,
            body_size: 0,
            meta_size: 0,
            host: host_of(&key.key).to_string(),
            server_id: 0,
            created_at: now,
            access_epoch: epoch_of(now),
            hits: 0,
            version: 0,
        }
    }

    /// Bytes accounted for this entry
    pub fn total_size(&self) -> u64 {
        self.header_size
            + self.body_size
            + self.meta_size
            + self.key.len() as u64
            + self.host.len() as u64
    }

    /// Header plus body bytes
    pub fn value_size(&self) -> u64 {
        self.header_size + self.body_size
    }

    /// Fresh at `now`
    pub fn is_fresh(&self, now: i64) -> bool {
        self.expires_at != 0 && self.expires_at >= now
    }

    /// Servable as stale at `now`
    pub fn is_servable_stale(&self, now: i64) -> bool {
        self.stale_at >= now
    }

    /// Raise `stale_at` to `expires_at`
    pub fn normalize(&mut self) {
        if self.stale_at < self.expires_at {
            self.stale_at = self.expires_at;
        }
    }
}

// =============================================================================
// Stat
// =============================================================================

/// Aggregate size of an index or storage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stat {
    pub count: u64,
    pub total_size: u64,
    pub value_size: u64,
}

impl Stat {
    pub fn merge(&mut self, other: Stat) {
        self.count += other.count;
        self.total_size += other.total_size;
        self.value_size += other.value_size;
    }
}

/// Observer called with the affected item
pub type IndexHook = Arc<dyn Fn(&Item) + Send + Sync>;

// =============================================================================
// Shard Backend
// =============================================================================

/// One independent partition of the key index
pub trait IndexShard: Send + Sync + 'static {
    fn id(&self) -> usize;

    /// Prepare persistent state
    fn init(&self) -> Result<()>;

    /// Load the next batch of the existence set; true once complete
    fn warm(&self, batch: usize) -> Result<bool>;

    /// Existence answers are authoritative
    fn is_ready(&self) -> bool;

    /// Insert or replace, returning the replaced item
    fn insert(&self, item: &Item) -> Result<Option<Item>>;

    /// Fresh entry present; true while not ready
    fn exist(&self, hash: &str, now: i64) -> bool;

    fn get(&self, hash: &str) -> Result<Option<Item>>;

    fn remove(&self, hash: &str) -> Result<Option<Item>>;

    /// Record a hit in access epoch `epoch`
    fn record_hit(&self, hash: &str, epoch: i64);

    /// Apply buffered hits, returning how many rows were updated
    fn flush_hits(&self) -> Result<usize>;

    /// Remove up to `limit` rows with `stale_at < now`
    fn purge_expired(&self, now: i64, limit: usize) -> Result<Vec<Item>>;

    /// Up to `limit` rows by ascending `(access_epoch, created_at)`
    fn least_used(&self, limit: usize) -> Result<Vec<Item>>;

    /// Remove candidates whose row was not replaced since selection
    fn evict(&self, candidates: &[Item]) -> Result<Vec<Item>>;

    /// Zero `expires_at` and cap `stale_at` for matching rows
    fn invalidate(&self, filter: &KeyFilter, stale_until: i64) -> Result<usize>;

    fn clear(&self) -> Result<()>;

    fn stat(&self) -> Result<Stat>;

    fn count(&self) -> Result<u64>;

    fn close(&self) -> Result<()>;
}

// =============================================================================
// Key Index Contract
// =============================================================================

/// Capability set every index exposes to storages
pub trait KeyIndex: Send + Sync {
    fn init(&self) -> Result<()>;

    /// Advance the existence warm-up by one batch per shard
    fn warm_up(&self, batch: usize) -> Result<bool>;

    fn is_ready(&self) -> bool;

    fn add(&self, item: Item) -> Result<()>;

    /// Fresh entry present, or "may exist" until warm-up completes
    fn exist(&self, hash: &str) -> bool;

    fn get(&self, hash: &str) -> Result<Option<Item>>;

    fn remove(&self, hash: &str) -> Result<Option<Item>>;

    fn increase_hit(&self, hash: &str);

    fn flush_hits(&self) -> Result<usize>;

    /// Remove up to `count` entries past their stale window
    fn purge(&self, count: usize) -> Result<Vec<Item>>;

    /// Remove up to `count` least used entries
    fn purge_lfu(&self, count: usize) -> Result<Vec<Item>>;

    /// Remove every row without firing remove hooks
    fn clean_all(&self) -> Result<()>;

    fn clean_prefix(&self, prefix: &str) -> Result<usize>;

    fn clean_match_key(&self, key: &str) -> Result<usize>;

    fn clean_match_prefix(&self, prefix: &str) -> Result<usize>;

    fn stat(&self) -> Result<Stat>;

    fn count(&self) -> Result<u64>;

    fn on_add(&self, hook: IndexHook);

    fn on_remove(&self, hook: IndexHook);

    fn close(&self) -> Result<()>;
}

// =============================================================================
// Backend Selection
// =============================================================================

/// Index backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    #[default]
    Sqlite,
    Memory,
}

/// Index configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub backend: IndexBackend,
    pub shards: usize,
    pub warm_batch: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: IndexBackend::Sqlite,
            shards: DEFAULT_SHARD_COUNT,
            warm_batch: DEFAULT_WARM_BATCH,
        }
    }
}

/// Open the configured index under `dir`
pub fn open_index(config: &IndexConfig, dir: &Path) -> Result<Arc<dyn KeyIndex>> {
    Ok(match config.backend {
        IndexBackend::Sqlite => Arc::new(ShardedKeyIndex::open_sqlite(dir, config.shards)?),
        IndexBackend::Memory => Arc::new(ShardedKeyIndex::in_memory(config.shards)),
    })
}

// =============================================================================
// Sharded Key Index
// =============================================================================

/// Key index over `N` independent shards
pub struct ShardedKeyIndex<S: IndexShard> {
    shards: Vec<S>,
    purge_cursor: AtomicUsize,
    add_hooks: RwLock<Vec<IndexHook>>,
    remove_hooks: RwLock<Vec<IndexHook>>,
}

impl ShardedKeyIndex<SqliteShard> {
    /// One SQLite database per shard under `dir`
    pub fn open_sqlite(dir: &Path, shards: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let shards = (0..shards.max(1))
            .map(|id| SqliteShard::open(id, &dir.join(format!("shard-{}.db", id))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_shards(shards))
    }
}

impl ShardedKeyIndex<MemoryShard> {
    pub fn in_memory(shards: usize) -> Self {
        Self::from_shards((0..shards.max(1)).map(MemoryShard::new).collect())
    }
}

impl<S: IndexShard> ShardedKeyIndex<S> {
    pub fn from_shards(shards: Vec<S>) -> Self {
        Self {
            shards,
            purge_cursor: AtomicUsize::new(0),
            add_hooks: RwLock::new(Vec::new()),
            remove_hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    fn shard(&self, hash: &str) -> &S {
        &self.shards[shard_of(hash, self.shards.len())]
    }

    fn fire_add(&self, item: &Item) {
        for hook in self.add_hooks.read().iter() {
            hook(item);
        }
    }

    fn fire_remove(&self, item: &Item) {
        for hook in self.remove_hooks.read().iter() {
            hook(item);
        }
    }

    fn invalidate(&self, filter: KeyFilter) -> Result<usize> {
        let stale_until = now_secs() + INVALIDATION_GRACE_SECS;
        let mut total = 0;
        for shard in &self.shards {
            total += shard.invalidate(&filter, stale_until)?;
        }
        debug!(filter = ?filter, invalidated = total, "Invalidated index rows");
        Ok(total)
    }
}

impl<S: IndexShard> KeyIndex for ShardedKeyIndex<S> {
    fn init(&self) -> Result<()> {
        for shard in &self.shards {
            shard.init()?;
        }
        Ok(())
    }

    fn warm_up(&self, batch: usize) -> Result<bool> {
        let mut done = true;
        for shard in &self.shards {
            if !shard.warm(batch)? {
                done = false;
            }
        }
        Ok(done)
    }

    fn is_ready(&self) -> bool {
        self.shards.iter().all(|s| s.is_ready())
    }

    fn add(&self, mut item: Item) -> Result<()> {
        item.normalize();
        let replaced = self.shard(&item.hash).insert(&item)?;
        if let Some(old) = replaced {
            self.fire_remove(&old);
        }
        self.fire_add(&item);
        Ok(())
    }

    fn exist(&self, hash: &str) -> bool {
        self.shard(hash).exist(hash, now_secs())
    }

    fn get(&self, hash: &str) -> Result<Option<Item>> {
        self.shard(hash).get(hash)
    }

    fn remove(&self, hash: &str) -> Result<Option<Item>> {
        let removed = self.shard(hash).remove(hash)?;
        if let Some(item) = &removed {
            self.fire_remove(item);
        }
        Ok(removed)
    }

    fn increase_hit(&self, hash: &str) {
        self.shard(hash).record_hit(hash, epoch_of(now_secs()));
    }

    fn flush_hits(&self) -> Result<usize> {
        let mut total = 0;
        for shard in &self.shards {
            match shard.flush_hits() {
                Ok(n) => total += n,
                Err(e) => warn!(shard = shard.id(), error = %e, "Failed to flush hit counters"),
            }
        }
        Ok(total)
    }

    fn purge(&self, count: usize) -> Result<Vec<Item>> {
        let now = now_secs();
        let n = self.shards.len();
        let start = self.purge_cursor.fetch_add(1, Ordering::Relaxed) % n;
        let mut removed = Vec::new();

        for offset in 0..n {
            if removed.len() >= count {
                break;
            }
            let shard = &self.shards[(start + offset) % n];
            let batch = shard.purge_expired(now, count - removed.len())?;
            removed.extend(batch);
        }

        for item in &removed {
            self.fire_remove(item);
        }
        Ok(removed)
    }

    fn purge_lfu(&self, count: usize) -> Result<Vec<Item>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut candidates = Vec::new();
        for shard in &self.shards {
            candidates.extend(shard.least_used(count)?);
        }
        candidates.sort_by(|a, b| {
            (a.access_epoch, a.created_at).cmp(&(b.access_epoch, b.created_at))
        });
        candidates.truncate(count);

        let mut per_shard: Vec<Vec<Item>> = vec![Vec::new(); self.shards.len()];
        for item in candidates {
            per_shard[shard_of(&item.hash, self.shards.len())].push(item);
        }

        let mut removed = Vec::new();
        for (shard, batch) in self.shards.iter().zip(per_shard) {
            if !batch.is_empty() {
                removed.extend(shard.evict(&batch)?);
            }
        }

        for item in &removed {
            self.fire_remove(item);
        }
        Ok(removed)
    }

    fn clean_all(&self) -> Result<()> {
        for shard in &self.shards {
            shard.clear()?;
        }
        Ok(())
    }

    fn clean_prefix(&self, prefix: &str) -> Result<usize> {
        self.invalidate(KeyFilter::prefix(prefix))
    }

    fn clean_match_key(&self, key: &str) -> Result<usize> {
        self.invalidate(KeyFilter::match_key(key)?)
    }

    fn clean_match_prefix(&self, prefix: &str) -> Result<usize> {
        self.invalidate(KeyFilter::match_prefix(prefix)?)
    }

    fn stat(&self) -> Result<Stat> {
        let mut stat = Stat::default();
        for shard in &self.shards {
            stat.merge(shard.stat()?);
        }
        Ok(stat)
    }

    fn count(&self) -> Result<u64> {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.count()?;
        }
        Ok(total)
    }

    fn on_add(&self, hook: IndexHook) {
        self.add_hooks.write().push(hook);
    }

    fn on_remove(&self, hook: IndexHook) {
        self.remove_hooks.write().push(hook);
    }

    fn close(&self) -> Result<()> {
        self.flush_hits()?;
        for shard in &self.shards {
            shard.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod conformance {
    //! Contract shared by every backend

    use super::*;
    use std::sync::atomic::AtomicU64;

    pub fn item(key: &str, expires_in: i64, created_at: i64) -> Item {
        let now = now_secs();
        let mut item = Item::new(&CacheKey::new(key), ItemKind::File);
        item.expires_at = now + expires_in;
        item.stale_at = now + expires_in;
        item.created_at = created_at;
        item.access_epoch = epoch_of(created_at);
        item.header_size = 10;
        item.body_size = 100;
        item.meta_size = 26;
        item
    }

    fn hash(key: &str) -> String {
        CacheKey::new(key).hash
    }

    fn ready<I: KeyIndex>(index: &I) {
        index.init().unwrap();
        while !index.warm_up(1000).unwrap() {}
        assert!(index.is_ready());
    }

    pub fn add_remove<I: KeyIndex>(index: I) {
        ready(&index);
        let now = now_secs();
        index.add(item("https://a.com/1", 3600, now)).unwrap();
        index.add(item("https://a.com/2", 3600, now)).unwrap();
        assert!(index.exist(&hash("https://a.com/1")));
        assert_eq!(index.count().unwrap(), 2);
        let before = index.stat().unwrap();
        assert_eq!(before.count, 2);

        let removed = index.remove(&hash("https://a.com/1")).unwrap().unwrap();
        assert_eq!(removed.key, "https://a.com/1");
        assert!(!index.exist(&hash("https://a.com/1")));
        assert_eq!(index.stat().unwrap().count, before.count - 1);
        assert!(index.remove(&hash("https://a.com/1")).unwrap().is_none());
    }

    pub fn replace_keeps_count<I: KeyIndex>(index: I) {
        ready(&index);
        let now = now_secs();
        index.add(item("https://a.com/x", 3600, now)).unwrap();
        let mut updated = item("https://a.com/x", 7200, now);
        updated.body_size = 500;
        index.add(updated).unwrap();
        assert_eq!(index.count().unwrap(), 1);
        let got = index.get(&hash("https://a.com/x")).unwrap().unwrap();
        assert_eq!(got.body_size, 500);
        assert_eq!(index.stat().unwrap().value_size, 510);
    }

    pub fn stale_floor<I: KeyIndex>(index: I) {
        ready(&index);
        let now = now_secs();
        let mut it = item("https://a.com/s", 3600, now);
        it.stale_at = now;
        index.add(it.clone()).unwrap();
        let got = index.get(&it.hash).unwrap().unwrap();
        assert_eq!(got.stale_at, got.expires_at);
    }

    pub fn total_size<I: KeyIndex>(index: I) {
        ready(&index);
        let it = item("https://a.com/t", 3600, now_secs());
        let expected = it.total_size();
        index.add(it).unwrap();
        let stat = index.stat().unwrap();
        assert_eq!(stat.total_size, expected);
        assert_eq!(stat.value_size, 110);
    }

    pub fn purge_ttl<I: KeyIndex>(index: I) {
        ready(&index);
        let now = now_secs();
        for i in 0..5 {
            index.add(item(&format!("https://a.com/old/{}", i), -100, now)).unwrap();
        }
        for i in 0..5 {
            index.add(item(&format!("https://a.com/new/{}", i), 3600, now)).unwrap();
        }
        let mut stale_window = item("https://a.com/stale", -100, now);
        stale_window.stale_at = now + 3600;
        index.add(stale_window).unwrap();

        let first = index.purge(3).unwrap();
        assert_eq!(first.len(), 3);
        let rest = index.purge(100).unwrap();
        assert_eq!(rest.len(), 2);
        for removed in first.iter().chain(rest.iter()) {
            assert!(removed.key.contains("/old/"));
        }
        assert!(index.purge(100).unwrap().is_empty());
        assert_eq!(index.count().unwrap(), 6);
        assert!(index.get(&hash("https://a.com/stale")).unwrap().is_some());
    }

    pub fn purge_lfu<I: KeyIndex>(index: I) {
        ready(&index);
        let now = now_secs();
        for i in 0..10 {
            index
                .add(item(&format!("https://a.com/{}", i), 3600, now - 1000 + i))
                .unwrap();
        }
        let removed = index.purge_lfu(4).unwrap();
        assert_eq!(removed.len(), 4);
        let mut keys: Vec<_> = removed.iter().map(|i| i.key.clone()).collect();
        keys.sort();
        assert_eq!(keys, vec!["https://a.com/0", "https://a.com/1", "https://a.com/2", "https://a.com/3"]);
        assert_eq!(index.count().unwrap(), 6);
    }

    pub fn purge_lfu_prefers_old_epochs<I: KeyIndex>(index: I) {
        ready(&index);
        let now = now_secs();
        let mut hot = item("https://a.com/hot", 3600, now - 10 * 86_400);
        hot.access_epoch = epoch_of(now);
        index.add(hot).unwrap();
        index.add(item("https://a.com/cold", 3600, now - 86_400)).unwrap();

        let removed = index.purge_lfu(1).unwrap();
        assert_eq!(removed[0].key, "https://a.com/cold");
    }

    /// A row replaced between selection and eviction survives
    pub fn evict_skips_replaced<S: IndexShard>(shard: S) {
        shard.init().unwrap();
        while !shard.warm(1000).unwrap() {}
        let now = now_secs();
        shard.insert(&item("https://a.com/r", 3600, now - 500)).unwrap();
        shard.insert(&item("https://a.com/s", 3600, now - 400)).unwrap();

        let candidates = shard.least_used(10).unwrap();
        assert_eq!(candidates.len(), 2);

        shard.insert(&item("https://a.com/r", 3600, now)).unwrap();
        let removed = shard.evict(&candidates).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].key, "https://a.com/s");
        assert_eq!(shard.count().unwrap(), 1);
        assert_eq!(shard.get(&hash("https://a.com/r")).unwrap().unwrap().created_at, now);
    }

    /// Same as above with identical creation seconds
    pub fn evict_skips_same_second_replacement<S: IndexShard>(shard: S) {
        shard.init().unwrap();
        while !shard.warm(1000).unwrap() {}
        let now = now_secs();
        shard.insert(&item("https://a.com/r", 3600, now)).unwrap();

        let candidates = shard.least_used(10).unwrap();
        assert_eq!(candidates.len(), 1);

        let mut replacement = item("https://a.com/r", 3600, now);
        replacement.body_size = 555;
        shard.insert(&replacement).unwrap();
        assert!(shard.evict(&candidates).unwrap().is_empty());
        assert_eq!(shard.get(&hash("https://a.com/r")).unwrap().unwrap().body_size, 555);

        let current = shard.least_used(10).unwrap();
        assert_eq!(shard.evict(&current).unwrap().len(), 1);
        assert_eq!(shard.count().unwrap(), 0);
    }

    pub fn soft_invalidation<I: KeyIndex>(index: I) {
        ready(&index);
        let now = now_secs();
        index.add(item("https://a.com/p/1", 3600, now)).unwrap();
        index.add(item("https://a.com/p/2", 3600, now)).unwrap();
        index.add(item("https://a.com/q/1", 3600, now)).unwrap();

        assert_eq!(index.clean_prefix("https://a.com/p/").unwrap(), 2);
        assert!(!index.exist(&hash("https://a.com/p/1")));
        assert!(index.exist(&hash("https://a.com/q/1")));

        let got = index.get(&hash("https://a.com/p/1")).unwrap().unwrap();
        assert_eq!(got.expires_at, 0);
        assert!(got.stale_at <= now_secs() + INVALIDATION_GRACE_SECS);
        assert!(got.is_servable_stale(now));
        assert_eq!(index.count().unwrap(), 3);

        assert_eq!(index.clean_match_key("https://a.com/q/1").unwrap(), 1);
        assert!(!index.exist(&hash("https://a.com/q/1")));
    }

    pub fn wildcard_host<I: KeyIndex>(index: I) {
        ready(&index);
        let now = now_secs();
        index.add(item("https://www.example.com/a/1", 3600, now)).unwrap();
        index.add(item("https://img.example.com/a/2", 3600, now)).unwrap();
        index.add(item("https://img.example.com/b/3", 3600, now)).unwrap();
        index.add(item("https://www.example.org/a/4", 3600, now)).unwrap();
        index.add(item("https://user@cdn.example.com/a/5", 3600, now)).unwrap();

        let n = index.clean_match_prefix("https://*.example.com/a").unwrap();
        assert_eq!(n, 3);
        assert!(!index.exist(&hash("https://www.example.com/a/1")));
        assert!(!index.exist(&hash("https://img.example.com/a/2")));
        assert!(!index.exist(&hash("https://user@cdn.example.com/a/5")));
        assert!(index.exist(&hash("https://img.example.com/b/3")));
        assert!(index.exist(&hash("https://www.example.org/a/4")));

        let n = index.clean_match_key("https://*.example.com/b/3").unwrap();
        assert_eq!(n, 1);
    }

    pub fn hooks_track_totals<I: KeyIndex>(index: I) {
        ready(&index);
        let total = Arc::new(AtomicU64::new(0));
        let on_add = total.clone();
        let on_remove = total.clone();
        index.on_add(Arc::new(move |item| {
            on_add.fetch_add(item.total_size(), Ordering::SeqCst);
        }));
        index.on_remove(Arc::new(move |item| {
            on_remove.fetch_sub(item.total_size(), Ordering::SeqCst);
        }));

        let now = now_secs();
        index.add(item("https://a.com/h1", 3600, now)).unwrap();
        index.add(item("https://a.com/h2", -10, now)).unwrap();
        index.add(item("https://a.com/h1", 3600, now)).unwrap();
        assert_eq!(total.load(Ordering::SeqCst), index.stat().unwrap().total_size);

        index.purge(10).unwrap();
        assert_eq!(total.load(Ordering::SeqCst), index.stat().unwrap().total_size);
        index.remove(&hash("https://a.com/h1")).unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 0);
    }

    pub fn hits_update_epoch<I: KeyIndex>(index: I) {
        ready(&index);
        let now = now_secs();
        index.add(item("https://a.com/hit", 3600, now - 5 * 86_400)).unwrap();
        let h = hash("https://a.com/hit");
        index.increase_hit(&h);
        index.increase_hit(&h);
        index.flush_hits().unwrap();
        let got = index.get(&h).unwrap().unwrap();
        assert_eq!(got.hits, 2);
        assert_eq!(got.access_epoch, epoch_of(now_secs()));
    }

    pub fn clean_all<I: KeyIndex>(index: I) {
        ready(&index);
        let now = now_secs();
        for i in 0..20 {
            index.add(item(&format!("https://a.com/{}", i), 3600, now)).unwrap();
        }
        index.clean_all().unwrap();
        assert_eq!(index.count().unwrap(), 0);
        assert_eq!(index.stat().unwrap(), Stat::default());
        assert!(!index.exist(&hash("https://a.com/3")));
    }

    /// Run the whole contract against a fresh index per case
    pub fn run_all<I: KeyIndex, F: Fn() -> I>(make: F) {
        add_remove(make());
        replace_keeps_count(make());
        stale_floor(make());
        total_size(make());
        purge_ttl(make());
        purge_lfu(make());
        purge_lfu_prefers_old_epochs(make());
        soft_invalidation(make());
        wildcard_host(make());
        hooks_track_totals(make());
        hits_update_epoch(make());
        clean_all(make());
    }
}
