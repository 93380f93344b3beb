//! Write-Ahead Log (WAL) for top structures
//!
//! Every insert accepted into a top structure is appended to that
//! structure's log before it becomes visible in the MemTable. On open,
//! replaying the log rebuilds the top structure and the insert counter.
//! A top structure's log is removed once a merge has folded it into a
//! new base segment.

mod entry;
mod reader;
mod writer;

pub use entry::{WalEntry, WalEntryType};
pub use reader::WalReader;
pub use writer::WalWriter;

use std::path::PathBuf;

/// WAL sync policy
#[derive(Debug, Clone, Copy)]
pub enum SyncPolicy {
    /// Sync after every write (safest, slowest)
    Immediate,
    /// Sync after N writes
    EveryN(usize),
    /// Sync on interval (trades durability for performance)
    Interval { millis: u64 },
    /// Never sync (OS decides, fastest, least safe)
    None,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::Immediate
    }
}

/// WAL configuration
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory for WAL files
    pub dir: PathBuf,
    /// Sync policy
    pub sync_policy: SyncPolicy,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/wal"),
            sync_policy: SyncPolicy::default(),
        }
    }
}

/// File name of the log backing one top structure
pub(crate) fn log_file_name(top_id: u64) -> String {
    format!("top_{:020}.log", top_id)
}

/// Parse a top structure id out of a log file name
pub(crate) fn parse_log_id(name: &str) -> Option<u64> {
    name.strip_prefix("top_")
        .and_then(|s| s.strip_suffix(".log"))
        .and_then(|s| s.parse().ok())
}
