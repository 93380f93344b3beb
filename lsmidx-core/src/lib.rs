//! lsmidx core - log-structured merge index access method
//!
//! An embeddable index engine that absorbs point inserts into a small
//! mutable layer and keeps the bulk of the index in immutable, ordered,
//! bulk-built layers:
//!
//! - **MemTable**: concurrent in-memory ordered layer (the "top" structure)
//! - **WAL (Write-Ahead Log)**: durability for top-structure inserts
//! - **Segment**: immutable sorted run on disk (the "base" structure)
//! - **Dictionary**: persisted record mapping a logical index to its current
//!   physical structures and insert counter
//! - **Merge**: background folding of the top structure into a new base

pub mod dict;
pub mod index;
pub mod memtable;
pub mod merge;
pub mod segment;
pub mod wal;

mod error;
mod types;

pub use error::{LsmError, Result};
pub use types::*;

/// lsmidx version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Inserts accepted into the top structure before a merge is triggered
    pub const MERGE_INSERT_THRESHOLD: u64 = 8192;

    /// Top structure size in bytes before a merge is triggered (4MB)
    pub const TOP_SIZE_LIMIT: usize = 4 * 1024 * 1024;

    /// Segment block size (4KB)
    pub const BLOCK_SIZE: usize = 4 * 1024;

    /// Bloom filter bits per key
    pub const BLOOM_BITS_PER_KEY: usize = 10;
}
