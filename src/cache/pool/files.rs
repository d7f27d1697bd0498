//! Open-File Pool
//!
//! Keeps a few opened, seek-reset handles per entry path together with the
//! small bytes read when the file was opened (meta block and header). Path
//! pools sit in a global LRU; when the number of idle handles exceeds the
//! ceiling, the least recently used paths are closed.
//!
//! Every path pool carries a version. Invalidating a path bumps it and
//! closes its handles; a handle stamped with an older version is closed
//! instead of reused. A watcher polls pooled paths and invalidates those
//! whose length or modification time changed.

use crate::cache::task::BackgroundTask;
use crate::error::Result;
use bytes::Bytes;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Seek, SeekFrom};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::debug;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the open-file pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilePoolConfig {
    /// Idle handles kept per path
    pub max_per_path: usize,
    /// Idle handles kept across all paths
    pub max_handles: usize,
    /// Change polling interval
    pub watch_interval_ms: u64,
}

impl Default for FilePoolConfig {
    fn default() -> Self {
        Self {
            max_per_path: 16,
            max_handles: 4096,
            watch_interval_ms: 1000,
        }
    }
}

// =============================================================================
// Handles
// =============================================================================

/// Bytes cached alongside an opened file
#[derive(Debug, Clone, Default)]
pub struct FilePreload {
    pub meta_bytes: Bytes,
    pub header_bytes: Bytes,
    pub body_size: u64,
}

/// An opened file with its cached preload
#[derive(Debug)]
pub struct FileHandle {
    pub file: File,
    pub preload: FilePreload,
    pub modified: Option<SystemTime>,
    version: u64,
}

impl FileHandle {
    pub fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

impl FileStamp {
    fn of(meta: &fs::Metadata) -> Self {
        Self {
            len: meta.len(),
            modified: meta.modified().ok(),
        }
    }
}

#[derive(Debug)]
struct PathPool {
    version: AtomicU64,
    handles: Mutex<Vec<FileHandle>>,
    stamp: Mutex<Option<FileStamp>>,
}

impl PathPool {
    fn new() -> Self {
        Self {
            version: AtomicU64::new(0),
            handles: Mutex::new(Vec::new()),
            stamp: Mutex::new(None),
        }
    }

    #[inline]
    fn current(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Bump the version and close idle handles, returning how many closed
    fn invalidate(&self) -> usize {
        self.version.fetch_add(1, Ordering::AcqRel);
        *self.stamp.lock() = None;
        let closed = std::mem::take(&mut *self.handles.lock());
        closed.len()
    }
}

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FilePoolStat {
    pub paths: u64,
    pub handles: u64,
    pub hits: u64,
    pub misses: u64,
}

// =============================================================================
// Open-File Pool
// =============================================================================

/// Recycler for opened entry files
pub struct OpenFilePool {
    config: FilePoolConfig,
    /// Path pools in LRU order (front = least recently used)
    paths: Mutex<IndexMap<PathBuf, Arc<PathPool>>>,
    idle: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    watcher: Mutex<Option<BackgroundTask>>,
}

impl OpenFilePool {
    pub fn new(config: FilePoolConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            paths: Mutex::new(IndexMap::new()),
            idle: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            watcher: Mutex::new(None),
        })
    }

    /// Start the change watcher
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut watcher = self.watcher.lock();
        if watcher.is_some() {
            return Ok(());
        }
        let weak = Arc::downgrade(self);
        let interval = Duration::from_millis(self.config.watch_interval_ms.max(1));
        *watcher = Some(BackgroundTask::spawn_periodic(
            "edge-cache-file-watch",
            interval,
            move || match weak.upgrade() {
                Some(pool) => {
                    pool.check_changes();
                    true
                }
                None => false,
            },
        )?);
        Ok(())
    }

    /// Stop the watcher and close every handle
    pub fn stop(&self) {
        if let Some(mut task) = self.watcher.lock().take() {
            task.stop();
        }
        let pools: Vec<Arc<PathPool>> = self.paths.lock().drain(..).map(|(_, p)| p).collect();
        for pool in pools {
            self.forget_idle(pool.invalidate());
        }
    }

    /// An opened handle for `path`, reusing an idle one when current
    ///
    /// `load` runs on freshly opened files and produces the cached preload.
    pub fn acquire<F>(self: &Arc<Self>, path: &Path, load: F) -> Result<PooledFile>
    where
        F: FnOnce(&mut File) -> Result<FilePreload>,
    {
        let pool = self.path_pool(path);
        let version = pool.current();

        loop {
            let candidate = pool.handles.lock().pop();
            let mut handle = match candidate {
                Some(h) => h,
                None => break,
            };
            self.forget_idle(1);
            if handle.version != version {
                continue;
            }
            if handle.file.seek(SeekFrom::Start(0)).is_err() {
                continue;
            }
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(PooledFile {
                owner: self.clone(),
                path: path.to_path_buf(),
                pool,
                handle: Some(handle),
            });
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let mut file = File::open(path)?;
        let meta = file.metadata()?;
        let preload = load(&mut file)?;
        file.seek(SeekFrom::Start(0))?;

        {
            let mut stamp = pool.stamp.lock();
            if stamp.is_none() {
                *stamp = Some(FileStamp::of(&meta));
            }
        }

        Ok(PooledFile {
            owner: self.clone(),
            path: path.to_path_buf(),
            pool,
            handle: Some(FileHandle {
                file,
                preload,
                modified: meta.modified().ok(),
                version,
            }),
        })
    }

    fn path_pool(&self, path: &Path) -> Arc<PathPool> {
        let mut paths = self.paths.lock();
        let pool = match paths.shift_remove(path) {
            Some(pool) => pool,
            None => Arc::new(PathPool::new()),
        };
        paths.insert(path.to_path_buf(), pool.clone());
        pool
    }

    /// Close all handles of `path` and retire their version
    pub fn invalidate(&self, path: &Path) {
        let pool = self.paths.lock().shift_remove(path);
        if let Some(pool) = pool {
            let closed = pool.invalidate();
            self.forget_idle(closed);
            debug!(path = %path.display(), closed, "Invalidated pooled file handles");
        }
    }

    /// Invalidate pooled paths whose file changed or disappeared
    pub fn check_changes(&self) -> usize {
        let snapshot: Vec<(PathBuf, Arc<PathPool>)> = self
            .paths
            .lock()
            .iter()
            .map(|(p, pool)| (p.clone(), pool.clone()))
            .collect();

        let mut invalidated = 0;
        for (path, pool) in snapshot {
            let known = *pool.stamp.lock();
            let changed = match fs::metadata(&path) {
                Ok(meta) => known.map_or(false, |stamp| stamp != FileStamp::of(&meta)),
                Err(_) => true,
            };
            if changed {
                self.invalidate(&path);
                invalidated += 1;
            }
        }
        invalidated
    }

    fn release(&self, path: &Path, pool: &Arc<PathPool>, handle: FileHandle) {
        if handle.version != pool.current() {
            return;
        }
        // The path may have been evicted or invalidated while checked out
        let registered = self
            .paths
            .lock()
            .get(path)
            .map_or(false, |p| Arc::ptr_eq(p, pool));
        if !registered {
            return;
        }
        {
            let mut handles = pool.handles.lock();
            if handles.len() >= self.config.max_per_path {
                return;
            }
            handles.push(handle);
        }
        let idle = self.idle.fetch_add(1, Ordering::AcqRel) + 1;
        if idle > self.config.max_handles {
            self.evict_lru();
        }
    }

    fn evict_lru(&self) {
        while self.idle.load(Ordering::Acquire) > self.config.max_handles {
            let oldest = self.paths.lock().shift_remove_index(0);
            match oldest {
                Some((path, pool)) => {
                    let closed = pool.invalidate();
                    self.forget_idle(closed);
                    debug!(path = %path.display(), closed, "Evicted file pool");
                }
                None => break,
            }
        }
    }

    fn forget_idle(&self, n: usize) {
        if n > 0 {
            let _ = self
                .idle
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(n)));
        }
    }

    pub fn stat(&self) -> FilePoolStat {
        FilePoolStat {
            paths: self.paths.lock().len() as u64,
            handles: self.idle.load(Ordering::Relaxed) as u64,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl Drop for OpenFilePool {
    fn drop(&mut self) {
        if let Some(mut task) = self.watcher.lock().take() {
            task.stop();
        }
    }
}

// =============================================================================
// Pooled File
// =============================================================================

/// A checked-out handle, returned to its pool on drop
pub struct PooledFile {
    owner: Arc<OpenFilePool>,
    path: PathBuf,
    pool: Arc<PathPool>,
    handle: Option<FileHandle>,
}

impl PooledFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the handle instead of returning it
    pub fn discard(mut self) {
        self.handle.take();
    }
}

impl Deref for PooledFile {
    type Target = FileHandle;

    fn deref(&self) -> &FileHandle {
        self.handle
            .as_ref()
            .unwrap_or_else(|| unreachable!("handle present until drop"))
    }
}

impl DerefMut for PooledFile {
    fn deref_mut(&mut self) -> &mut FileHandle {
        self.handle
            .as_mut()
            .unwrap_or_else(|| unreachable!("handle present until drop"))
    }
}

impl Drop for PooledFile {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.owner.release(&self.path, &self.pool, handle);
        }
    }
}

impl std::fmt::Debug for PooledFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledFile")
            .field("path", &self.path)
            .field("handle", &self.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use tempfile::TempDir;

    fn write_file(path: &Path, data: &[u8]) {
        let mut f = File::create(path).unwrap();
        f.write_all(data).unwrap();
    }

    fn preload(file: &mut File) -> Result<FilePreload> {
        let mut head = [0u8; 4];
        file.read_exact(&mut head)?;
        Ok(FilePreload {
            meta_bytes: Bytes::copy_from_slice(&head),
            header_bytes: Bytes::new(),
            body_size: file.metadata()?.len() - 4,
        })
    }

    #[test]
    fn test_handle_reuse() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.cache");
        write_file(&path, b"METAbody");

        let pool = OpenFilePool::new(FilePoolConfig::default());
        {
            let f = pool.acquire(&path, preload).unwrap();
            assert_eq!(&f.preload.meta_bytes[..], b"META");
            assert_eq!(f.preload.body_size, 4);
        }
        assert_eq!(pool.stat().handles, 1);

        let mut f = pool.acquire(&path, |_| panic!("must reuse")).unwrap();
        let mut all = Vec::new();
        f.file.read_to_end(&mut all).unwrap();
        assert_eq!(all, b"METAbody");
        drop(f);

        let stat = pool.stat();
        assert_eq!(stat.hits, 1);
        assert_eq!(stat.misses, 1);
    }

    #[test]
    fn test_invalidate_retires_checked_out_handles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("b.cache");
        write_file(&path, b"METAold");

        let pool = OpenFilePool::new(FilePoolConfig::default());
        let held = pool.acquire(&path, preload).unwrap();
        pool.invalidate(&path);
        drop(held);
        assert_eq!(pool.stat().handles, 0);

        write_file(&path, b"METAnewer");
        let f = pool.acquire(&path, preload).unwrap();
        assert_eq!(f.preload.body_size, 5);
    }

    #[test]
    fn test_per_path_limit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.cache");
        write_file(&path, b"METAx");

        let pool = OpenFilePool::new(FilePoolConfig {
            max_per_path: 2,
            ..Default::default()
        });
        let handles: Vec<_> = (0..4).map(|_| pool.acquire(&path, preload).unwrap()).collect();
        drop(handles);
        assert_eq!(pool.stat().handles, 2);
    }

    #[test]
    fn test_global_lru_eviction() {
        let dir = TempDir::new().unwrap();
        let pool = OpenFilePool::new(FilePoolConfig {
            max_per_path: 4,
            max_handles: 3,
            ..Default::default()
        });
        for i in 0..5 {
            let path = dir.path().join(format!("{}.cache", i));
            write_file(&path, b"METAx");
            drop(pool.acquire(&path, preload).unwrap());
        }
        let stat = pool.stat();
        assert_eq!(stat.handles, 3);
        assert_eq!(stat.paths, 3);

        // the oldest paths were closed
        let oldest = dir.path().join("0.cache");
        assert!(!pool.paths.lock().contains_key(&oldest));
    }

    #[test]
    fn test_watcher_detects_changes() {
        let dir = TempDir::new().unwrap();
        let kept = dir.path().join("kept.cache");
        let changed = dir.path().join("changed.cache");
        let removed = dir.path().join("removed.cache");
        for p in [&kept, &changed, &removed] {
            write_file(p, b"METAx");
        }

        let pool = OpenFilePool::new(FilePoolConfig::default());
        for p in [&kept, &changed, &removed] {
            drop(pool.acquire(p, preload).unwrap());
        }

        write_file(&changed, b"METAlonger");
        fs::remove_file(&removed).unwrap();

        assert_eq!(pool.check_changes(), 2);
        let stat = pool.stat();
        assert_eq!(stat.paths, 1);
        assert_eq!(stat.handles, 1);
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let pool = OpenFilePool::new(FilePoolConfig::default());
        let err = pool.acquire(&dir.path().join("nope"), preload).unwrap_err();
        assert!(matches!(err, crate::error::Error::Io(_)));
    }
}
