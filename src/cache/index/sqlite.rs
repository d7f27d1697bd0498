//! SQLite Index Shard
//!
//! One database file per shard holding the `cache_items` table. Each shard
//! also keeps an in-memory existence map (fingerprint -> expires_at) that a
//! background warm-up fills in rowid order. Until the scan reaches the end
//! of the table, existence checks answer "may exist".
//!
//! All writes, and every update of the existence map, happen while holding
//! the connection lock so the warm-up never resurrects a removed row.

use super::pattern::glob_escape;
use super::{IndexShard, Item, ItemKind, KeyFilter, Stat};
use crate::cache::entry::fingerprint;
use crate::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cache_items (
    hash         TEXT PRIMARY KEY,
    key          TEXT NOT NULL,
    kind         INTEGER NOT NULL,
    expires_at   INTEGER NOT NULL,
    stale_at     INTEGER NOT NULL,
    header_size  INTEGER NOT NULL,
    body_size    INTEGER NOT NULL,
    meta_size    INTEGER NOT NULL,
    host         TEXT NOT NULL,
    server_id    INTEGER NOT NULL,
    created_at   INTEGER NOT NULL,
    access_epoch INTEGER NOT NULL,
    hits         INTEGER NOT NULL DEFAULT 0,
    version      INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_cache_items_stale ON cache_items(stale_at);
CREATE INDEX IF NOT EXISTS idx_cache_items_usage ON cache_items(access_epoch, created_at);
CREATE INDEX IF NOT EXISTS idx_cache_items_host ON cache_items(host);
CREATE INDEX IF NOT EXISTS idx_cache_items_key ON cache_items(key);
";

const COLUMNS: &str = "hash, key, kind, expires_at, stale_at, header_size, body_size, \
                       meta_size, host, server_id, created_at, access_epoch, hits, version";

#[derive(Debug, Clone, Copy)]
struct PendingHit {
    epoch: i64,
    hits: u64,
}

/// Persistent partition of the key index
pub struct SqliteShard {
    id: usize,
    path: PathBuf,
    conn: Mutex<Connection>,
    existence: RwLock<HashMap<u64, i64>>,
    ready: AtomicBool,
    warm_cursor: AtomicI64,
    /// Last row version handed out
    version: AtomicU64,
    pending_hits: Mutex<HashMap<String, PendingHit>>,
}

impl SqliteShard {
    /// Open or create the shard database at `path`
    pub fn open(id: usize, path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::index(id, e))?;
        Self::configure(id, &conn)?;
        Ok(Self::with_connection(id, path.to_path_buf(), conn))
    }

    /// In-memory database, for tests and benchmarks
    pub fn open_in_memory(id: usize) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::index(id, e))?;
        Ok(Self::with_connection(id, PathBuf::from(":memory:"), conn))
    }

    fn with_connection(id: usize, path: PathBuf, conn: Connection) -> Self {
        Self {
            id,
            path,
            conn: Mutex::new(conn),
            existence: RwLock::new(HashMap::new()),
            ready: AtomicBool::new(false),
            warm_cursor: AtomicI64::new(0),
            version: AtomicU64::new(0),
            pending_hits: Mutex::new(HashMap::new()),
        }
    }

    fn configure(id: usize, conn: &Connection) -> Result<()> {
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| Error::index(id, e))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(|e| Error::index(id, e))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| Error::index(id, e))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    fn err(&self, e: rusqlite::Error) -> Error {
        Error::index(self.id, e)
    }

    fn row_to_item(row: &Row<'_>) -> rusqlite::Result<Item> {
        Ok(Item {
            hash: row.get(0)?,
            key: row.get(1)?,
            kind: ItemKind::from_i64(row.get(2)?),
            expires_at: row.get(3)?,
            stale_at: row.get(4)?,
            header_size: row.get::<_, i64>(5)? as u64,
            body_size: row.get::<_, i64>(6)? as u64,
            meta_size: row.get::<_, i64>(7)? as u64,
            host: row.get(8)?,
            server_id: row.get::<_, i64>(9)? as u32,
            created_at: row.get(10)?,
            access_epoch: row.get(11)?,
            hits: row.get::<_, i64>(12)? as u64,
            version: row.get::<_, i64>(13)? as u64,
        })
    }

    fn forget(&self, hash: &str) {
        self.existence.write().remove(&fingerprint(hash));
    }

    fn collect_items(
        &self,
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Item>> {
        let mut stmt = conn.prepare_cached(sql).map_err(|e| self.err(e))?;
        let rows = stmt
            .query_map(params, Self::row_to_item)
            .map_err(|e| self.err(e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| self.err(e))
    }

    /// Hashes of rows matching `filter`
    fn matching_hashes(&self, conn: &Connection, filter: &KeyFilter) -> Result<Vec<String>> {
        let mut out = Vec::new();
        match filter {
            KeyFilter::Exact(key) => {
                let mut stmt = conn
                    .prepare_cached("SELECT hash FROM cache_items WHERE key = ?1")
                    .map_err(|e| self.err(e))?;
                let rows = stmt
                    .query_map(params![key], |row| row.get::<_, String>(0))
                    .map_err(|e| self.err(e))?;
                for row in rows {
                    out.push(row.map_err(|e| self.err(e))?);
                }
            }
            KeyFilter::Prefix(prefix) => {
                let mut stmt = conn
                    .prepare_cached("SELECT hash FROM cache_items WHERE key GLOB ?1")
                    .map_err(|e| self.err(e))?;
                let pattern = format!("{}*", glob_escape(prefix));
                let rows = stmt
                    .query_map(params![pattern], |row| row.get::<_, String>(0))
                    .map_err(|e| self.err(e))?;
                for row in rows {
                    out.push(row.map_err(|e| self.err(e))?);
                }
            }
            KeyFilter::Wildcard(wildcard) => {
                let mut stmt = conn
                    .prepare_cached("SELECT hash, key FROM cache_items WHERE lower(host) GLOB ?1")
                    .map_err(|e| self.err(e))?;
                let host = wildcard.host_glob().to_ascii_lowercase();
                let rows = stmt
                    .query_map(params![host], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })
                    .map_err(|e| self.err(e))?;
                for row in rows {
                    let (hash, key) = row.map_err(|e| self.err(e))?;
                    if wildcard.matches(&key) {
                        out.push(hash);
                    }
                }
            }
        }
        Ok(out)
    }
}

impl IndexShard for SqliteShard {
    fn id(&self) -> usize {
        self.id
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(SCHEMA).map_err(|e| self.err(e))?;
        let version: i64 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM cache_items", [], |row| row.get(0))
            .map_err(|e| self.err(e))?;
        self.version.store(version as u64, Ordering::Release);
        self.warm_cursor.store(0, Ordering::Release);
        self.ready.store(false, Ordering::Release);
        self.existence.write().clear();
        debug!(shard = self.id, path = %self.path.display(), "Index shard initialized");
        Ok(())
    }

    fn warm(&self, batch: usize) -> Result<bool> {
        if self.ready.load(Ordering::Acquire) {
            return Ok(true);
        }

        let conn = self.conn.lock();
        let cursor = self.warm_cursor.load(Ordering::Acquire);
        let mut stmt = conn
            .prepare_cached(
                "SELECT rowid, hash, expires_at FROM cache_items \
                 WHERE rowid > ?1 ORDER BY rowid LIMIT ?2",
            )
            .map_err(|e| self.err(e))?;
        let rows = stmt
            .query_map(params![cursor, batch.max(1) as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .map_err(|e| self.err(e))?;

        let mut seen = 0usize;
        let mut last = cursor;
        {
            let mut existence = self.existence.write();
            for row in rows {
                let (rowid, hash, expires_at) = row.map_err(|e| self.err(e))?;
                existence.insert(fingerprint(&hash), expires_at);
                last = rowid;
                seen += 1;
            }
        }
        self.warm_cursor.store(last, Ordering::Release);

        if seen < batch.max(1) {
            self.ready.store(true, Ordering::Release);
            info!(
                shard = self.id,
                keys = self.existence.read().len(),
                "Index shard existence set ready"
            );
            return Ok(true);
        }
        Ok(false)
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn insert(&self, item: &Item) -> Result<Option<Item>> {
        let mut conn = self.conn.lock();
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        let tx = conn.transaction().map_err(|e| self.err(e))?;
        let old = tx
            .query_row(
                &format!("SELECT {} FROM cache_items WHERE hash = ?1", COLUMNS),
                params![item.hash],
                Self::row_to_item,
            )
            .optional()
            .map_err(|e| self.err(e))?;
        tx.execute(
            &format!(
                "INSERT OR REPLACE INTO cache_items ({}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                COLUMNS
            ),
            params![
                item.hash,
                item.key,
                item.kind.as_i64(),
                item.expires_at,
                item.stale_at,
                item.header_size as i64,
                item.body_size as i64,
                item.meta_size as i64,
                item.host,
                item.server_id as i64,
                item.created_at,
                item.access_epoch,
                item.hits as i64,
                version as i64,
            ],
        )
        .map_err(|e| self.err(e))?;
        tx.commit().map_err(|e| self.err(e))?;

        self.existence
            .write()
            .insert(fingerprint(&item.hash), item.expires_at);
        Ok(old)
    }

    fn exist(&self, hash: &str, now: i64) -> bool {
        if !self.ready.load(Ordering::Acquire) {
            return true;
        }
        self.existence
            .read()
            .get(&fingerprint(hash))
            .map_or(false, |&expires_at| expires_at != 0 && expires_at >= now)
    }

    fn get(&self, hash: &str) -> Result<Option<Item>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM cache_items WHERE hash = ?1", COLUMNS),
            params![hash],
            Self::row_to_item,
        )
        .optional()
        .map_err(|e| self.err(e))
    }

    fn remove(&self, hash: &str) -> Result<Option<Item>> {
        let conn = self.conn.lock();
        let removed = conn
            .query_row(
                &format!("DELETE FROM cache_items WHERE hash = ?1 RETURNING {}", COLUMNS),
                params![hash],
                Self::row_to_item,
            )
            .optional()
            .map_err(|e| self.err(e))?;
        self.forget(hash);
        self.pending_hits.lock().remove(hash);
        Ok(removed)
    }

    fn record_hit(&self, hash: &str, epoch: i64) {
        let mut pending = self.pending_hits.lock();
        let entry = pending
            .entry(hash.to_string())
            .or_insert(PendingHit { epoch, hits: 0 });
        entry.epoch = entry.epoch.max(epoch);
        entry.hits += 1;
    }

    fn flush_hits(&self) -> Result<usize> {
        let pending = std::mem::take(&mut *self.pending_hits.lock());
        if pending.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(|e| self.err(e))?;
        let mut updated = 0;
        {
            let mut stmt = tx
                .prepare_cached(
                    "UPDATE cache_items SET access_epoch = MAX(access_epoch, ?2), \
                     hits = hits + ?3 WHERE hash = ?1",
                )
                .map_err(|e| self.err(e))?;
            for (hash, hit) in &pending {
                updated += stmt
                    .execute(params![hash, hit.epoch, hit.hits as i64])
                    .map_err(|e| self.err(e))?;
            }
        }
        tx.commit().map_err(|e| self.err(e))?;
        debug!(shard = self.id, rows = updated, "Flushed hit counters");
        Ok(updated)
    }

    fn purge_expired(&self, now: i64, limit: usize) -> Result<Vec<Item>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let removed = self.collect_items(
            &conn,
            &format!(
                "DELETE FROM cache_items WHERE hash IN \
                 (SELECT hash FROM cache_items WHERE stale_at < ?1 ORDER BY stale_at LIMIT ?2) \
                 RETURNING {}",
                COLUMNS
            ),
            params![now, limit as i64],
        )?;
        for item in &removed {
            self.forget(&item.hash);
        }
        Ok(removed)
    }

    fn least_used(&self, limit: usize) -> Result<Vec<Item>> {
        let conn = self.conn.lock();
        self.collect_items(
            &conn,
            &format!(
                "SELECT {} FROM cache_items ORDER BY access_epoch, created_at LIMIT ?1",
                COLUMNS
            ),
            params![limit as i64],
        )
    }

    fn evict(&self, candidates: &[Item]) -> Result<Vec<Item>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(|e| self.err(e))?;
        let mut removed = Vec::with_capacity(candidates.len());
        {
            let mut stmt = tx
                .prepare_cached(&format!(
                    "DELETE FROM cache_items WHERE hash = ?1 AND version = ?2 RETURNING {}",
                    COLUMNS
                ))
                .map_err(|e| self.err(e))?;
            for candidate in candidates {
                let item = stmt
                    .query_row(params![candidate.hash, candidate.version as i64], Self::row_to_item)
                    .optional()
                    .map_err(|e| self.err(e))?;
                if let Some(item) = item {
                    removed.push(item);
                }
            }
        }
        tx.commit().map_err(|e| self.err(e))?;
        for item in &removed {
            self.forget(&item.hash);
        }
        Ok(removed)
    }

    fn invalidate(&self, filter: &KeyFilter, stale_until: i64) -> Result<usize> {
        let mut conn = self.conn.lock();
        let hashes = self.matching_hashes(&conn, filter)?;
        if hashes.is_empty() {
            return Ok(0);
        }

        let tx = conn.transaction().map_err(|e| self.err(e))?;
        let mut touched = Vec::with_capacity(hashes.len());
        {
            let mut stmt = tx
                .prepare_cached(
                    "UPDATE cache_items SET expires_at = 0, stale_at = MIN(stale_at, ?2) \
                     WHERE hash = ?1 RETURNING hash",
                )
                .map_err(|e| self.err(e))?;
            for hash in &hashes {
                let updated = stmt
                    .query_row(params![hash, stale_until], |row| row.get::<_, String>(0))
                    .optional()
                    .map_err(|e| self.err(e))?;
                if let Some(hash) = updated {
                    touched.push(hash);
                }
            }
        }
        tx.commit().map_err(|e| self.err(e))?;

        let mut existence = self.existence.write();
        for hash in &touched {
            if let Some(expires_at) = existence.get_mut(&fingerprint(hash)) {
                *expires_at = 0;
            }
        }
        Ok(touched.len())
    }

    fn clear(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM cache_items", [])
            .map_err(|e| self.err(e))?;
        self.existence.write().clear();
        self.pending_hits.lock().clear();
        Ok(())
    }

    fn stat(&self) -> Result<Stat> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*), \
             COALESCE(SUM(header_size + body_size + meta_size \
                 + length(CAST(key AS BLOB)) + length(CAST(host AS BLOB))), 0), \
             COALESCE(SUM(header_size + body_size), 0) \
             FROM cache_items",
            [],
            |row| {
                Ok(Stat {
                    count: row.get::<_, i64>(0)? as u64,
                    total_size: row.get::<_, i64>(1)? as u64,
                    value_size: row.get::<_, i64>(2)? as u64,
                })
            },
        )
        .map_err(|e| self.err(e))
    }

    fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM cache_items", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|n| n as u64)
        .map_err(|e| self.err(e))
    }

    fn close(&self) -> Result<()> {
        self.flush_hits()?;
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA optimize;")
            .map_err(|e| self.err(e))?;
        Ok(())
    }
}
