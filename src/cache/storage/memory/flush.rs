//! Flush pipeline
//!
//! Completed memory entries are copied into the parent storage by a fixed
//! pool of worker threads fed from a bounded queue. Admission observes a
//! full queue synchronously; the disk writes happen off the caller's path.

use super::MemEntry;
use crate::cache::entry::{CacheKey, WriteOptions};
use crate::cache::storage::SharedStorage;
use crate::error::{Error, Result};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// One entry waiting to be persisted
pub(crate) struct FlushJob {
    pub key: CacheKey,
    pub entry: Arc<MemEntry>,
}

/// Flush counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushStat {
    pub queued: u64,
    pub flushed: u64,
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    flushed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

pub(crate) struct FlushPipeline {
    tx: RwLock<Option<Sender<FlushJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl FlushPipeline {
    /// Spawn `workers` threads copying into `parent`
    pub fn start(
        parent: SharedStorage,
        workers: usize,
        queue_size: usize,
        chunk_size: usize,
    ) -> Result<Self> {
        let (tx, rx) = channel::bounded::<FlushJob>(queue_size.max(1));
        let counters = Arc::new(Counters::default());
        let workers = workers.max(1);

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let rx = rx.clone();
            let parent = parent.clone();
            let counters = counters.clone();
            let handle = thread::Builder::new()
                .name(format!("edge-cache-flush-{}", id))
                .spawn(move || run_worker(rx, parent, counters, chunk_size))?;
            handles.push(handle);
        }

        info!(workers = workers, queue = queue_size, "Flush pipeline started");
        Ok(Self {
            tx: RwLock::new(Some(tx)),
            workers: Mutex::new(handles),
            counters,
        })
    }

    /// Queue at capacity, or already stopped
    pub fn is_full(&self) -> bool {
        self.tx.read().as_ref().map_or(true, |tx| tx.is_full())
    }

    pub fn enqueue(&self, job: FlushJob) -> Result<()> {
        let tx = self.tx.read();
        let tx = tx.as_ref().ok_or(Error::QueueFull)?;
        tx.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) | TrySendError::Disconnected(_) => Error::QueueFull,
        })
    }

    /// Close the queue, let workers drain it and join them
    pub fn stop(&self) {
        self.tx.write().take();
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("Flush worker panicked");
            }
        }
        let stat = self.stat();
        debug!(flushed = stat.flushed, failed = stat.failed, "Flush pipeline stopped");
    }

    pub fn stat(&self) -> FlushStat {
        FlushStat {
            queued: self.tx.read().as_ref().map_or(0, |tx| tx.len() as u64),
            flushed: self.counters.flushed.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

impl Drop for FlushPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(rx: Receiver<FlushJob>, parent: SharedStorage, counters: Arc<Counters>, chunk_size: usize) {
    for job in rx.iter() {
        match flush_one(&parent, &job, chunk_size) {
            Ok(()) => {
                counters.flushed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_ignorable() => {
                counters.skipped.fetch_add(1, Ordering::Relaxed);
                debug!(key = %job.key, error = %e, "Flush skipped");
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(key = %job.key, error = %e, "Flush to parent storage failed");
            }
        }
    }
}

fn flush_one(parent: &SharedStorage, job: &FlushJob, chunk_size: usize) -> Result<()> {
    let entry = &job.entry;
    let options = WriteOptions::new(entry.expires_at, entry.status)
        .with_stale_at(entry.stale_at)
        .with_header_size(entry.header.len() as u64)
        .with_body_size(entry.body.len() as u64)
        .with_server_id(entry.server_id);

    let mut writer = parent.open_writer(&job.key, options)?;
    writer.write_header(&entry.header)?;
    for chunk in entry.body.chunks(chunk_size.max(1)) {
        writer.write(chunk)?;
    }
    writer.close()
}
