//! Cache Entry Types
//!
//! Request keys, their fingerprints, and the options a caller passes when
//! opening readers and writers.

use crate::cache::index::pattern::split_url;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Seconds in one access epoch (LFU aging granularity)
pub const EPOCH_SECS: i64 = 86_400;

// =============================================================================
// Cache Key
// =============================================================================

/// Request identity plus its content hash
///
/// The hash is the lowercase hex SHA-256 of the key and addresses both the
/// entry file and the index row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Normalized request identity, usually a URL
    pub key: String,
    /// Hex-encoded SHA-256 of `key`
    pub hash: String,
}

impl CacheKey {
    /// Create a new cache key
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        let hash = hash_key(&key);
        Self { key, hash }
    }

    /// Authority part of the key when it is a URL
    pub fn host(&self) -> &str {
        host_of(&self.key)
    }

    /// 64-bit fingerprint of the hash
    #[inline]
    pub fn fingerprint(&self) -> u64 {
        fingerprint(&self.hash)
    }

    /// Get the shard index for this key
    #[inline]
    pub fn shard_index(&self, shards: usize) -> usize {
        shard_of(&self.hash, shards)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)
    }
}

/// Hex SHA-256 of a key
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Fold the first 16 hex characters of a hash into a u64
///
/// Hashes that are not hex fall back to FNV-1a over the bytes.
pub fn fingerprint(hash: &str) -> u64 {
    hash.get(..16)
        .and_then(|prefix| u64::from_str_radix(prefix, 16).ok())
        .unwrap_or_else(|| {
            hash.bytes().fold(0xcbf2_9ce4_8422_2325u64, |acc, b| {
                (acc ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3)
            })
        })
}

/// Shard selected by a hash
#[inline]
pub fn shard_of(hash: &str, shards: usize) -> usize {
    (fingerprint(hash) % shards.max(1) as u64) as usize
}

/// Authority of a URL-shaped key, or an empty string
pub fn host_of(key: &str) -> &str {
    split_url(key).map_or("", |(_, host, _)| host)
}

// =============================================================================
// Time Helpers
// =============================================================================

/// Current unix time in seconds
#[inline]
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// Access epoch (day number) of a unix timestamp
#[inline]
pub fn epoch_of(ts: i64) -> i64 {
    ts.div_euclid(EPOCH_SECS)
}

// =============================================================================
// Reader / Writer Options
// =============================================================================

/// Options for opening a reader
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Serve entries past `expires_at` but within `stale_at`
    pub allow_stale: bool,
    /// Read the entry as a partial (range-assembled) entry
    pub partial: bool,
}

impl ReadOptions {
    /// Options for a fresh full read
    pub fn fresh() -> Self {
        Self::default()
    }

    /// Allow stale serving
    pub fn allow_stale(mut self) -> Self {
        self.allow_stale = true;
        self
    }

    /// Read as a partial entry
    pub fn partial(mut self) -> Self {
        self.partial = true;
        self
    }
}

/// Options for opening a writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Unix seconds after which the entry is no longer fresh
    pub expires_at: i64,
    /// Unix seconds until which the entry may be served stale
    pub stale_at: i64,
    /// HTTP status of the cached response
    pub status: u16,
    /// Declared header length (0 = unknown)
    pub header_size: u64,
    /// Declared body length (0 = unknown, required for partial entries)
    pub body_size: u64,
    /// Per-entry size limit (0 = storage default)
    pub max_size: u64,
    /// Assemble the body from ranges with `write_at`
    pub partial: bool,
    /// Opaque origin tag recorded in the index
    pub server_id: u32,
}

impl WriteOptions {
    /// Options for a full entry expiring at `expires_at`
    pub fn new(expires_at: i64, status: u16) -> Self {
        Self {
            expires_at,
            stale_at: expires_at,
            status,
            header_size: 0,
            body_size: 0,
            max_size: 0,
            partial: false,
            server_id: 0,
        }
    }

    /// Extend the usable lifetime past expiry
    pub fn with_stale_at(mut self, stale_at: i64) -> Self {
        self.stale_at = stale_at;
        self
    }

    /// Declare the body length
    pub fn with_body_size(mut self, body_size: u64) -> Self {
        self.body_size = body_size;
        self
    }

    /// Declare the header length
    pub fn with_header_size(mut self, header_size: u64) -> Self {
        self.header_size = header_size;
        self
    }

    /// Limit the entry size
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    /// Open as a partial entry
    pub fn partial(mut self) -> Self {
        self.partial = true;
        self
    }

    /// Tag with an origin server id
    pub fn with_server_id(mut self, server_id: u32) -> Self {
        self.server_id = server_id;
        self
    }

    /// `stale_at`, raised to `expires_at` when it lags behind
    #[inline]
    pub fn effective_stale_at(&self) -> i64 {
        self.stale_at.max(self.expires_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_hash() {
        let key = CacheKey::new("https://www.example.com/a/b?c=1");
        assert_eq!(key.hash.len(), 64);
        assert!(key.hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(key.hash, hash_key("https://www.example.com/a/b?c=1"));
        assert_ne!(key.hash, hash_key("https://www.example.com/a/b?c=2"));
    }

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            hash_key("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(fingerprint(&hash_key("abc")), 0xba78_16bf_8f01_cfea);
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("https://www.example.com/a/b"), "www.example.com");
        assert_eq!(host_of("http://cdn.example.com:8080?x=1"), "cdn.example.com:8080");
        assert_eq!(host_of("https://user@img.example.com/"), "img.example.com");
        assert_eq!(host_of("https://example.com"), "example.com");
        assert_eq!(host_of("/relative/path"), "");
    }

    #[test]
    fn test_shard_index_stable() {
        let key = CacheKey::new("https://example.com/x");
        let shard = key.shard_index(8);
        assert!(shard < 8);
        assert_eq!(shard, key.shard_index(8));
        assert_eq!(key.shard_index(0), 0);
    }

    #[test]
    fn test_epoch_of() {
        assert_eq!(epoch_of(0), 0);
        assert_eq!(epoch_of(EPOCH_SECS - 1), 0);
        assert_eq!(epoch_of(EPOCH_SECS), 1);
    }

    #[test]
    fn test_write_options_stale_floor() {
        let opts = WriteOptions::new(1_000, 200).with_stale_at(500);
        assert_eq!(opts.effective_stale_at(), 1_000);
        let opts = WriteOptions::new(1_000, 200).with_stale_at(2_000);
        assert_eq!(opts.effective_stale_at(), 2_000);
    }
}
