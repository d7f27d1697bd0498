//! In-Memory Index Shard
//!
//! Keeps items in an insertion-ordered map plus two ordered secondary sets:
//! one by `stale_at` for TTL purges and one by `(access_epoch, created_at)`
//! for LFU eviction. Always ready; nothing to warm.

use super::{IndexShard, Item, KeyFilter, Stat};
use crate::error::Result;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::BTreeSet;

type UsageKey = (i64, i64, String);

// =============================================================================
// Shard State
// =============================================================================

#[derive(Debug, Default)]
struct ShardTable {
    /// Items in creation order (front = oldest)
    entries: IndexMap<String, Item>,
    by_stale: BTreeSet<(i64, String)>,
    by_usage: BTreeSet<UsageKey>,
    total_size: u64,
    value_size: u64,
    /// Last row version handed out
    version: u64,
}

impl ShardTable {
    fn usage_key(item: &Item) -> UsageKey {
        (item.access_epoch, item.created_at, item.hash.clone())
    }

    fn insert(&mut self, mut item: Item) -> Option<Item> {
        let old = self.remove(&item.hash);
        self.version += 1;
        item.version = self.version;
        self.by_stale.insert((item.stale_at, item.hash.clone()));
        self.by_usage.insert(Self::usage_key(&item));
        self.total_size += item.total_size();
        self.value_size += item.value_size();
        self.entries.insert(item.hash.clone(), item);
        old
    }

    fn remove(&mut self, hash: &str) -> Option<Item> {
        let item = self.entries.shift_remove(hash)?;
        self.by_stale.remove(&(item.stale_at, item.hash.clone()));
        self.by_usage.remove(&Self::usage_key(&item));
        self.total_size = self.total_size.saturating_sub(item.total_size());
        self.value_size = self.value_size.saturating_sub(item.value_size());
        Some(item)
    }

    fn touch(&mut self, hash: &str, epoch: i64) {
        let item = match self.entries.get_mut(hash) {
            Some(item) => item,
            None => return,
        };
        let old_key = (item.access_epoch, item.created_at, item.hash.clone());
        item.access_epoch = epoch;
        item.hits += 1;
        let new_key = (item.access_epoch, item.created_at, item.hash.clone());
        self.by_usage.remove(&old_key);
        self.by_usage.insert(new_key);
    }

    fn set_stale(&mut self, hash: &str, stale_until: i64) -> bool {
        let item = match self.entries.get_mut(hash) {
            Some(item) => item,
            None => return false,
        };
        let old = (item.stale_at, item.hash.clone());
        item.expires_at = 0;
        item.stale_at = item.stale_at.min(stale_until);
        let new = (item.stale_at, item.hash.clone());
        self.by_stale.remove(&old);
        self.by_stale.insert(new);
        true
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.by_stale.clear();
        self.by_usage.clear();
        self.total_size = 0;
        self.value_size = 0;
    }
}

// =============================================================================
// Memory Shard
// =============================================================================

/// One in-process partition of the key index
#[derive(Debug)]
pub struct MemoryShard {
    id: usize,
    table: RwLock<ShardTable>,
}

impl MemoryShard {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            table: RwLock::new(ShardTable::default()),
        }
    }
}

impl IndexShard for MemoryShard {
    fn id(&self) -> usize {
        self.id
    }

    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn warm(&self, _batch: usize) -> Result<bool> {
        Ok(true)
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn insert(&self, item: &Item) -> Result<Option<Item>> {
        Ok(self.table.write().insert(item.clone()))
    }

    fn exist(&self, hash: &str, now: i64) -> bool {
        self.table
            .read()
            .entries
            .get(hash)
            .map_or(false, |item| item.is_fresh(now))
    }

    fn get(&self, hash: &str) -> Result<Option<Item>> {
        Ok(self.table.read().entries.get(hash).cloned())
    }

    fn remove(&self, hash: &str) -> Result<Option<Item>> {
        Ok(self.table.write().remove(hash))
    }

    fn record_hit(&self, hash: &str, epoch: i64) {
        self.table.write().touch(hash, epoch);
    }

    fn flush_hits(&self) -> Result<usize> {
        Ok(0)
    }

    fn purge_expired(&self, now: i64, limit: usize) -> Result<Vec<Item>> {
        let mut table = self.table.write();
        let expired: Vec<String> = table
            .by_stale
            .iter()
            .take_while(|(stale_at, _)| *stale_at < now)
            .take(limit)
            .map(|(_, hash)| hash.clone())
            .collect();
        Ok(expired.iter().filter_map(|h| table.remove(h)).collect())
    }

    fn least_used(&self, limit: usize) -> Result<Vec<Item>> {
        let table = self.table.read();
        Ok(table
            .by_usage
            .iter()
            .take(limit)
            .filter_map(|(_, _, hash)| table.entries.get(hash).cloned())
            .collect())
    }

    fn evict(&self, candidates: &[Item]) -> Result<Vec<Item>> {
        let mut table = self.table.write();
        let mut removed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let unchanged = table
                .entries
                .get(&candidate.hash)
                .map_or(false, |item| item.version == candidate.version);
            if unchanged {
                if let Some(item) = table.remove(&candidate.hash) {
                    removed.push(item);
                }
            }
        }
        Ok(removed)
    }

    fn invalidate(&self, filter: &KeyFilter, stale_until: i64) -> Result<usize> {
        let mut table = self.table.write();
        let matched: Vec<String> = table
            .entries
            .values()
            .filter(|item| filter.matches(&item.key))
            .map(|item| item.hash.clone())
            .collect();
        Ok(matched
            .iter()
            .filter(|hash| table.set_stale(hash, stale_until))
            .count())
    }

    fn clear(&self) -> Result<()> {
        self.table.write().clear();
        Ok(())
    }

    fn stat(&self) -> Result<Stat> {
        let table = self.table.read();
        Ok(Stat {
            count: table.entries.len() as u64,
            total_size: table.total_size,
            value_size: table.value_size,
        })
    }

    fn count(&self) -> Result<u64> {
        Ok(self.table.read().entries.len() as u64)
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
