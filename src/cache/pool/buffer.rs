//! Buffer Pool
//!
//! Recycles byte buffers for cached bodies. Buffers are filed into
//! power-of-two buckets by capacity (1 KiB .. 64 MiB). A slot is handed out
//! by whoever wins its `claimed` flag, so a concurrent sweep and a `get`
//! can never both take the same buffer.

use crate::cache::task::BackgroundTask;
use crate::error::Result;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

// =============================================================================
// Constants
// =============================================================================

/// log2 of the smallest bucket size
pub const MIN_BUCKET_SHIFT: u32 = 10;

/// log2 of the largest bucket size
pub const MAX_BUCKET_SHIFT: u32 = 26;

const BUCKET_COUNT: usize = (MAX_BUCKET_SHIFT - MIN_BUCKET_SHIFT + 1) as usize;

/// Buckets scanned above the request's own bucket
const SCAN_DEPTH: usize = 2;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the buffer pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    /// Maximum bytes held idle in the pool
    pub capacity_bytes: u64,
    /// Maximum idle buffers per bucket
    pub max_items_per_bucket: usize,
    /// Idle time after which a buffer is dropped
    pub ttl_secs: u64,
    /// Interval between bucket sweeps
    pub sweep_interval_ms: u64,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 256 * 1024 * 1024, // 256 MB
            max_items_per_bucket: 1024,
            ttl_secs: 30,
            sweep_interval_ms: 1000,
        }
    }
}

// =============================================================================
// Slots and Buckets
// =============================================================================

#[derive(Debug)]
struct Slot {
    claimed: AtomicBool,
    capacity: usize,
    returned_at: Instant,
    buf: Mutex<Option<Vec<u8>>>,
}

impl Slot {
    #[inline]
    fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[derive(Debug, Default)]
struct Bucket {
    slots: RwLock<Vec<Arc<Slot>>>,
}

impl Bucket {
    fn detach(&self, slot: &Arc<Slot>) {
        self.slots.write().retain(|s| !Arc::ptr_eq(s, slot));
    }
}

/// Bucket whose size class is the largest power of two not above `size`
#[inline]
fn bucket_index(size: usize) -> usize {
    let shift = usize::BITS - 1 - size.max(1).leading_zeros();
    (shift.clamp(MIN_BUCKET_SHIFT, MAX_BUCKET_SHIFT) - MIN_BUCKET_SHIFT) as usize
}

// =============================================================================
// Buffer Pool
// =============================================================================

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferPoolStat {
    pub items: u64,
    pub bytes: u64,
    pub hits: u64,
    pub misses: u64,
}

/// Size-bucketed recycler for byte buffers
pub struct BufferPool {
    config: BufferPoolConfig,
    buckets: Vec<Bucket>,
    items: AtomicU64,
    bytes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    sweep_cursor: AtomicUsize,
    sweeper: Mutex<Option<BackgroundTask>>,
}

impl BufferPool {
    pub fn new(config: BufferPoolConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            buckets: (0..BUCKET_COUNT).map(|_| Bucket::default()).collect(),
            items: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sweep_cursor: AtomicUsize::new(0),
            sweeper: Mutex::new(None),
        })
    }

    /// Start the background sweep
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return Ok(());
        }
        let weak = Arc::downgrade(self);
        let interval = Duration::from_millis(self.config.sweep_interval_ms.max(1));
        *sweeper = Some(BackgroundTask::spawn_periodic(
            "edge-cache-buffer-sweep",
            interval,
            move || match weak.upgrade() {
                Some(pool) => {
                    pool.sweep_once();
                    true
                }
                None => false,
            },
        )?);
        Ok(())
    }

    /// Stop the background sweep
    pub fn stop(&self) {
        if let Some(mut task) = self.sweeper.lock().take() {
            task.stop();
        }
    }

    /// A buffer of length `size`, reused when a large enough one is idle
    pub fn get(&self, size: usize) -> Vec<u8> {
        if size > 1 << MAX_BUCKET_SHIFT {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return vec![0u8; size];
        }

        let first = bucket_index(size);
        let last = (first + SCAN_DEPTH).min(BUCKET_COUNT - 1);
        for idx in first..=last {
            if let Some(mut buf) = self.take_from(idx, size) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                buf.clear();
                buf.resize(size, 0);
                return buf;
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let capacity = size.max(1 << MIN_BUCKET_SHIFT).next_power_of_two();
        let mut buf = Vec::with_capacity(capacity);
        buf.resize(size, 0);
        buf
    }

    fn take_from(&self, idx: usize, size: usize) -> Option<Vec<u8>> {
        let bucket = &self.buckets[idx];
        let claimed = {
            let slots = bucket.slots.read();
            slots
                .iter()
                .find(|s| s.capacity >= size && s.try_claim())
                .cloned()
        }?;
        bucket.detach(&claimed);
        let buf = claimed.buf.lock().take()?;
        self.release_accounting(claimed.capacity);
        Some(buf)
    }

    /// Return a buffer for reuse; dropped when limits would be exceeded
    pub fn put(&self, buf: Vec<u8>) {
        let capacity = buf.capacity();
        if capacity < 1 << MIN_BUCKET_SHIFT || capacity > 1 << MAX_BUCKET_SHIFT {
            return;
        }
        if self.bytes.load(Ordering::Relaxed) + capacity as u64 > self.config.capacity_bytes {
            return;
        }

        let bucket = &self.buckets[bucket_index(capacity)];
        let mut slots = bucket.slots.write();
        if slots.len() >= self.config.max_items_per_bucket {
            return;
        }
        slots.push(Arc::new(Slot {
            claimed: AtomicBool::new(false),
            capacity,
            returned_at: Instant::now(),
            buf: Mutex::new(Some(buf)),
        }));
        self.items.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(capacity as u64, Ordering::Relaxed);
    }

    fn release_accounting(&self, capacity: usize) {
        self.items.fetch_sub(1, Ordering::Relaxed);
        self.bytes.fetch_sub(capacity as u64, Ordering::Relaxed);
    }

    /// Sweep the next bucket, dropping buffers idle past the TTL
    pub fn sweep_once(&self) -> usize {
        let idx = self.sweep_cursor.fetch_add(1, Ordering::Relaxed) % BUCKET_COUNT;
        self.sweep_bucket(idx, Duration::from_secs(self.config.ttl_secs))
    }

    fn sweep_bucket(&self, idx: usize, ttl: Duration) -> usize {
        let bucket = &self.buckets[idx];
        let expired: Vec<Arc<Slot>> = bucket
            .slots
            .read()
            .iter()
            .filter(|s| s.returned_at.elapsed() >= ttl)
            .cloned()
            .collect();

        let mut evicted = 0;
        for slot in expired {
            if !slot.try_claim() {
                continue;
            }
            bucket.detach(&slot);
            if slot.buf.lock().take().is_some() {
                self.release_accounting(slot.capacity);
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(bucket = idx, evicted, "Swept idle buffers");
        }
        evicted
    }

    /// Drop every idle buffer
    pub fn clear(&self) -> usize {
        (0..BUCKET_COUNT)
            .map(|idx| self.sweep_bucket(idx, Duration::ZERO))
            .sum()
    }

    pub fn stat(&self) -> BufferPoolStat {
        BufferPoolStat {
            items: self.items.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.stop();
    }
}
