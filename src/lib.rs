//! Edge Cache - CDN edge cache storage engine
//!
//! Persists and serves HTTP response bodies keyed by request URL across an
//! in-memory tier and a capacity-bounded disk tier, with byte-range
//! assembled entries, fast existence checks and online eviction.
//!
//! # Modules
//!
//! - [`cache`]: Storage tiers, key index, pools and the entry codec
//! - [`config`]: YAML configuration
//! - [`error`]: Error types and classification

pub mod cache;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use cache::{
    CacheKey, CacheStack, DiskStorage, DiskStorageConfig, MemoryStorage, MemoryStorageConfig,
    PurgeKind, ReadOptions, Reader, Storage, StorageKind, WriteOptions, Writer,
};

pub use config::CacheConfig;

pub use error::{Error, ErrorClass, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
