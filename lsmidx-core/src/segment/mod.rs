//! Segment: immutable sorted run holding the "base" structure
//!
//! Bulk-built from a sorted entry stream with:
//! - Block-based format with compression
//! - Block index for point lookups
//! - Bloom filter for existence checks

mod block;
mod bloom;
mod builder;
mod reader;

pub use block::{BlockBuilder, EntryBlock};
pub use bloom::BloomFilter;
pub use builder::SegmentBuilder;
pub use reader::SegmentReader;

use crate::IndexKey;
use std::path::PathBuf;

/// Segment file format version
pub const FORMAT_VERSION: u32 = 1;

/// Segment metadata
#[derive(Debug, Clone)]
pub struct SegmentMeta {
    /// File path
    pub path: PathBuf,
    /// Structure id recorded in the dictionary
    pub id: u64,
    /// Number of entries
    pub entry_count: usize,
    /// File size in bytes
    pub file_size: u64,
    /// Smallest key (None for an empty segment)
    pub min_key: Option<IndexKey>,
    /// Largest key (None for an empty segment)
    pub max_key: Option<IndexKey>,
}

impl SegmentMeta {
    /// Check if the segment may contain a key
    pub fn key_in_range(&self, key: &IndexKey) -> bool {
        match (&self.min_key, &self.max_key) {
            (Some(min), Some(max)) => key >= min && key <= max,
            _ => false,
        }
    }
}

/// Segment configuration
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    /// Block size in bytes
    pub block_size: usize,
    /// Enable compression
    pub compression: bool,
    /// Bloom filter bits per key
    pub bloom_bits_per_key: usize,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            block_size: crate::config::BLOCK_SIZE,
            compression: true,
            bloom_bits_per_key: crate::config::BLOOM_BITS_PER_KEY,
        }
    }
}

/// File name of a segment
pub(crate) fn segment_file_name(id: u64) -> String {
    format!("seg_{:020}.lsmx", id)
}

/// Parse a segment id out of a file name
pub(crate) fn parse_segment_id(name: &str) -> Option<u64> {
    name.strip_prefix("seg_")
        .and_then(|s| s.strip_suffix(".lsmx"))
        .and_then(|s| s.parse().ok())
}
