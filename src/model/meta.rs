//! Chunk descriptors: per-column append offsets, millisecond time ranges,
//! and the in-memory meta that the registry tracks per chunk.

use super::value::Column;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Records per chunk before it seals.
pub const MAX_LOGS_IN_CHUNK: usize = 2000;
/// Metas per registry block.
pub const BLOCK_MAX_SIZE: usize = 100;

pub const DIR_STORAGES: &str = "storages";
pub const DIR_TRANSACTIONS: &str = "transactions";
pub const DIR_DELETE_TASKS: &str = "delete_tasks";

/// Stable chunk descriptor file.
pub const META_FILE: &str = "meta";
/// Staged descriptor, promoted to `meta` on commit.
pub const META_NEW_FILE: &str = "meta.new";
/// Sentinel marking a storage directory for asynchronous removal.
pub const DELETED_SENTINEL: &str = "_deleted_";

/// Inclusive millisecond range; 0 on either side means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> TimeRange {
        TimeRange { start, end }
    }

    pub fn point(ts: i64) -> TimeRange {
        TimeRange { start: ts, end: ts }
    }

    pub fn is_unbounded(&self) -> bool {
        self.start == 0 && self.end == 0
    }

    /// Whether two ranges share any instant, honoring 0-as-unbounded.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        !((self.end != 0 && other.start != 0 && self.end < other.start)
            || (other.end != 0 && self.start != 0 && other.end < self.start))
    }

    /// Whether `inner` lies entirely within `self`, honoring 0-as-unbounded.
    pub fn contains(&self, inner: &TimeRange) -> bool {
        !((self.start != 0 && inner.start != 0 && inner.start < self.start)
            || (self.end != 0 && inner.end != 0 && self.end < inner.end))
    }

    /// Grow the range to cover `ts`.
    pub fn expand(&mut self, ts: i64) {
        if ts < self.start {
            self.start = ts;
        } else if self.end < ts {
            self.end = ts;
        }
    }
}

/// Byte offsets of the append frontier in each column file of a raw chunk.
/// Present iff the chunk is raw; a sealed chunk has no offsets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnOffsets([u64; Column::COUNT]);

impl ColumnOffsets {
    pub fn get(&self, column: Column) -> u64 {
        self.0[column.index()]
    }

    pub fn advance(&mut self, column: Column, bytes: u64) {
        self.0[column.index()] += bytes;
    }

    /// A freshly created chunk has written nothing yet.
    pub fn is_zero(&self) -> bool {
        self.0[Column::Timestamp.index()] == 0
    }
}

/// In-memory chunk descriptor. Copies are cheap and share the per-chunk
/// lock, so a copy taken from the registry can serialize rewrites against
/// every other holder of the same chunk id.
#[derive(Debug, Clone)]
pub struct ChunkMeta {
    pub id: u64,
    pub version: u64,
    pub time_range: TimeRange,
    pub logs_len: usize,
    pub offsets: Option<ColumnOffsets>,
    pub is_deleted: bool,
    pub lock: Arc<Mutex<()>>,
}

impl ChunkMeta {
    /// A fresh raw chunk seeded with the first record's timestamp.
    pub fn new(id: u64, timestamp: i64) -> ChunkMeta {
        ChunkMeta {
            id,
            version: 1,
            time_range: TimeRange::point(timestamp),
            logs_len: 0,
            offsets: Some(ColumnOffsets::default()),
            is_deleted: false,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Parse a `<id>_<version>` chunk directory name.
    pub fn parse_dir_name(name: &str) -> Option<(u64, u64)> {
        let (id, version) = name.split_once('_')?;
        Some((id.parse().ok()?, version.parse().ok()?))
    }

    /// Directory name of this chunk: `<id>_<version>`.
    pub fn dir_name(&self) -> String {
        format!("{}_{}", self.id, self.version)
    }

    /// A chunk is raw while its offsets are still tracked.
    pub fn is_raw(&self) -> bool {
        self.offsets.is_some()
    }

    pub fn from_parts(id: u64, version: u64, file: MetaFile) -> ChunkMeta {
        ChunkMeta {
            id,
            version,
            time_range: file.time_range,
            logs_len: file.logs_len as usize,
            offsets: file.offsets,
            is_deleted: file.is_deleted,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn to_file(&self) -> MetaFile {
        MetaFile {
            time_range: self.time_range,
            logs_len: self.logs_len as u64,
            offsets: self.offsets,
            is_deleted: self.is_deleted,
        }
    }
}

/// On-disk form of a chunk descriptor. Id and version live in the directory
/// name, not in the file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetaFile {
    pub time_range: TimeRange,
    pub logs_len: u64,
    pub offsets: Option<ColumnOffsets>,
    pub is_deleted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_name_round_trips() {
        let meta = ChunkMeta::new(17, 1000);
        assert_eq!(meta.dir_name(), "17_1");
        assert_eq!(ChunkMeta::parse_dir_name("17_1"), Some((17, 1)));
        assert_eq!(ChunkMeta::parse_dir_name("17"), None);
        assert_eq!(ChunkMeta::parse_dir_name("a_1"), None);
        assert_eq!(ChunkMeta::parse_dir_name("1_b"), None);
    }

    #[test]
    fn overlaps_honors_unbounded_sides() {
        let a = TimeRange::new(5, 10);
        assert!(a.overlaps(&TimeRange::new(10, 20)));
        assert!(a.overlaps(&TimeRange::new(1, 5)));
        assert!(!a.overlaps(&TimeRange::new(11, 20)));
        assert!(a.overlaps(&TimeRange::new(0, 0)));
        assert!(a.overlaps(&TimeRange::new(8, 0)));
        assert!(!a.overlaps(&TimeRange::new(11, 0)));
        assert!(!a.overlaps(&TimeRange::new(0, 4)));
    }

    #[test]
    fn contains_honors_unbounded_sides() {
        let outer = TimeRange::new(5, 10);
        assert!(outer.contains(&TimeRange::new(5, 10)));
        assert!(outer.contains(&TimeRange::new(6, 9)));
        assert!(!outer.contains(&TimeRange::new(4, 9)));
        assert!(!outer.contains(&TimeRange::new(6, 11)));
        assert!(TimeRange::new(0, 10).contains(&TimeRange::new(1, 10)));
        assert!(TimeRange::new(0, 0).contains(&TimeRange::new(1, 100)));
    }

    #[test]
    fn copies_share_the_chunk_lock() {
        let meta = ChunkMeta::new(1, 1);
        let copy = meta.clone();
        assert!(Arc::ptr_eq(&meta.lock, &copy.lock));
    }
}
