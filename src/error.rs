//! Error types for the edge cache
//!
//! Every storage operation reports one of three classes of failure:
//! a miss, an ignorable admission refusal, or a fault that is fatal to the
//! entry being read or written (never to the process).

use thiserror::Error;

/// Unified error type for the cache engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Lookup Errors
    // =========================================================================
    #[error("Entry not found: {0}")]
    NotFound(String),

    // =========================================================================
    // Admission Errors
    // =========================================================================
    #[error("Entry is busy: {0}")]
    Busy(String),

    #[error("Insufficient capacity: requested {requested} bytes, available {available} bytes")]
    Capacity { requested: u64, available: u64 },

    #[error("Key limit reached: {limit} keys")]
    KeyLimit { limit: u64 },

    #[error("Entry too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("Flush queue full")]
    QueueFull,

    // =========================================================================
    // Entry Errors
    // =========================================================================
    #[error("Corrupted entry {path}: {reason}")]
    Corrupted { path: String, reason: String },

    #[error("Truncated body: expected {expected} bytes, written {written} bytes")]
    Truncated { expected: u64, written: u64 },

    #[error("Invalid range {start}-{end} for body of {size} bytes")]
    InvalidRange { start: i64, end: i64, size: u64 },

    #[error("Invalid writer state: {0}")]
    InvalidState(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    // =========================================================================
    // Index Errors
    // =========================================================================
    #[error("Index shard {shard} error: {source}")]
    Index {
        shard: usize,
        #[source]
        source: rusqlite::Error,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the serving layer should treat an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Key absent or expired, serve as a miss
    NotFound,
    /// Admission refused, fall back to an uncached response without logging
    Ignorable,
    /// The entry is unusable and has been discarded
    Fatal,
}

impl Error {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::NotFound(_) => ErrorClass::NotFound,

            Error::Busy(_)
            | Error::Capacity { .. }
            | Error::KeyLimit { .. }
            | Error::TooLarge { .. }
            | Error::QueueFull => ErrorClass::Ignorable,

            _ => ErrorClass::Fatal,
        }
    }

    /// Check if the caller may silently bypass the cache
    pub fn is_ignorable(&self) -> bool {
        self.class() == ErrorClass::Ignorable
    }

    /// Check if this error is a cache miss
    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub(crate) fn corrupted(path: &std::path::Path, reason: impl Into<String>) -> Self {
        Error::Corrupted {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn index(shard: usize, source: rusqlite::Error) -> Self {
        Error::Index { shard, source }
    }
}

/// Result type alias for the cache engine
pub type Result<T> = std::result::Result<T, Error>;
