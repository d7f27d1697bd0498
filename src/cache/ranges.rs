//! Range Tracker
//!
//! Records which byte spans of a partial entry are persisted. Intervals are
//! inclusive, sorted by start, and merged eagerly so that no two stored
//! intervals overlap or touch.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Sidecar format version
pub const RANGES_VERSION: u32 = 1;

/// Disjoint inclusive byte intervals of one partial entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSet {
    version: u32,
    ranges: Vec<[u64; 2]>,
    body_size: u64,
}

impl RangeSet {
    /// Empty set for a body of `body_size` bytes (0 = unknown)
    pub fn new(body_size: u64) -> Self {
        Self {
            version: RANGES_VERSION,
            ranges: Vec::new(),
            body_size,
        }
    }

    /// Insert `[begin, end]` and merge overlapping or adjacent neighbours
    pub fn add(&mut self, begin: u64, end: u64) {
        let (begin, end) = if begin <= end { (begin, end) } else { (end, begin) };

        // First interval that ends at or after begin - 1
        let first = self
            .ranges
            .partition_point(|r| r[1].saturating_add(1) < begin);

        let mut merged = [begin, end];
        let mut last = first;
        while last < self.ranges.len() && self.ranges[last][0] <= merged[1].saturating_add(1) {
            merged[0] = merged[0].min(self.ranges[last][0]);
            merged[1] = merged[1].max(self.ranges[last][1]);
            last += 1;
        }

        self.ranges.splice(first..last, [merged]);
    }

    /// True only if a single stored interval covers `[begin, end]`
    pub fn contains(&self, begin: u64, end: u64) -> bool {
        let (begin, end) = if begin <= end { (begin, end) } else { (end, begin) };
        let idx = self.ranges.partition_point(|r| r[0] <= begin);
        idx > 0 && self.ranges[idx - 1][1] >= end
    }

    /// Highest covered offset, 0 when empty
    pub fn max(&self) -> u64 {
        self.ranges.last().map_or(0, |r| r[1])
    }

    /// Stored intervals in ascending order
    pub fn ranges(&self) -> Vec<(u64, u64)> {
        self.ranges.iter().map(|r| (r[0], r[1])).collect()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Declared body length
    pub fn body_size(&self) -> u64 {
        self.body_size
    }

    pub fn set_body_size(&mut self, body_size: u64) {
        self.body_size = body_size;
    }

    /// Whether the whole declared body is covered
    pub fn is_completed(&self) -> bool {
        self.body_size > 0 && self.contains(0, self.body_size - 1)
    }

    /// Serialize to the sidecar format
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse the sidecar format
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let set: RangeSet = serde_json::from_slice(bytes)?;
        if set.version != RANGES_VERSION {
            return Err(Error::Unsupported(format!(
                "range sidecar version {}",
                set.version
            )));
        }
        let sorted = set
            .ranges
            .windows(2)
            .all(|w| w[0][1].saturating_add(1) < w[1][0]);
        if !sorted || set.ranges.iter().any(|r| r[0] > r[1]) {
            return Err(Error::Corrupted {
                path: String::from("<ranges>"),
                reason: "intervals not sorted and disjoint".into(),
            });
        }
        Ok(set)
    }

    /// Load a sidecar file
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::decode(&bytes).map_err(|e| match e {
            Error::Corrupted { reason, .. } => Error::corrupted(path, reason),
            other => other,
        })
    }

    /// Persist to a sidecar file, replacing it atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("ranges.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&self.encode()?)?;
            file.flush()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
