//! The index access method: one LSM index over one heap
//!
//! Ties the pieces together: the dictionary names the structures, the
//! MemTable + WAL form the mutable top, a segment forms the immutable
//! base, and the merge worker folds sealed tops into new bases.

mod engine;
mod lsm;

pub use engine::IndexEngine;
pub use lsm::{IndexStats, LsmIndex};

use crate::merge::MergeConfig;
use crate::segment::SegmentConfig;
use crate::wal::{SyncPolicy, WalConfig};
use std::path::PathBuf;

/// Configuration for one index
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Directory holding the dictionary record, segments and logs
    pub data_dir: PathBuf,
    /// WAL sync policy for top-structure inserts
    pub sync_policy: SyncPolicy,
    /// Base segment layout
    pub segment: SegmentConfig,
    /// Merge trigger thresholds
    pub merge: MergeConfig,
    /// Reject inserts whose key is already present
    pub unique: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("lsmidx-data"),
            sync_policy: SyncPolicy::default(),
            segment: SegmentConfig::default(),
            merge: MergeConfig::default(),
            unique: false,
        }
    }
}

impl IndexConfig {
    /// Config with defaults rooted at `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub(crate) fn wal_config(&self) -> WalConfig {
        WalConfig {
            dir: self.data_dir.clone(),
            sync_policy: self.sync_policy,
        }
    }
}
