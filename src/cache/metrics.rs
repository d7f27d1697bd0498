//! Storage Metrics
//!
//! Cache-line aligned counters shared between a storage, its index hooks
//! and its background tasks.

use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Cache Line Size
// =============================================================================

/// Cache line size for alignment (64 bytes on most modern CPUs)
pub const CACHE_LINE_SIZE: usize = 64;

// =============================================================================
// Storage Metrics (Cache-Line Aligned)
// =============================================================================

/// Counters for one storage, aligned to prevent false sharing
#[repr(C, align(64))]
#[derive(Debug)]
pub struct StorageMetrics {
    /// Reads served
    pub hits: AtomicU64,
    /// Reads that found nothing usable
    pub misses: AtomicU64,
    /// Bytes accounted to stored entries
    pub bytes_stored: AtomicU64,
    /// Entries currently stored
    pub entry_count: AtomicU64,
    /// Entries removed by LFU eviction
    pub evictions: AtomicU64,
    /// Entries removed by TTL purge
    pub expirations: AtomicU64,
    /// Writers refused by admission control
    pub rejections: AtomicU64,
    /// Last update timestamp (Unix millis)
    pub last_update_ms: AtomicU64,
}

// Verify size at compile time
const _: () = assert!(std::mem::size_of::<StorageMetrics>() <= CACHE_LINE_SIZE);

impl Default for StorageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageMetrics {
    /// Create new zeroed metrics
    pub fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            bytes_stored: AtomicU64::new(0),
            entry_count: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            last_update_ms: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_rejection(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an entry being added
    #[inline]
    pub fn record_put(&self, size_bytes: u64) {
        self.entry_count.fetch_add(1, Ordering::Relaxed);
        self.bytes_stored.fetch_add(size_bytes, Ordering::Relaxed);
        self.touch();
    }

    /// Record an entry being removed
    #[inline]
    pub fn record_remove(&self, size_bytes: u64) {
        saturating_sub(&self.entry_count, 1);
        saturating_sub(&self.bytes_stored, size_bytes);
        self.touch();
    }

    #[inline]
    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_expirations(&self, count: u64) {
        self.expirations.fetch_add(count, Ordering::Relaxed);
    }

    /// Overwrite storage totals, used after loading an existing index
    pub fn set_storage(&self, entry_count: u64, bytes_stored: u64) {
        self.entry_count.store(entry_count, Ordering::Relaxed);
        self.bytes_stored.store(bytes_stored, Ordering::Relaxed);
        self.touch();
    }

    /// Reset storage metrics (entry_count and bytes_stored) to zero
    #[inline]
    pub fn reset_storage(&self) {
        self.set_storage(0, 0);
    }

    #[inline]
    fn touch(&self) {
        self.last_update_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Release);
    }

    #[inline]
    pub fn get_bytes_stored(&self) -> u64 {
        self.bytes_stored.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn get_entry_count(&self) -> u64 {
        self.entry_count.load(Ordering::Relaxed)
    }

    /// Create a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bytes_stored: self.bytes_stored.load(Ordering::Relaxed),
            entry_count: self.entry_count.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }
}

fn saturating_sub(counter: &AtomicU64, delta: u64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(delta))
    });
}

// =============================================================================
// Metrics Snapshot
// =============================================================================

/// Point-in-time snapshot of storage metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub bytes_stored: u64,
    pub entry_count: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub rejections: u64,
}

impl MetricsSnapshot {
    /// Calculate hit ratio
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
