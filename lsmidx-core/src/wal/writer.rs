//! WAL writer implementation

use super::{log_file_name, SyncPolicy, WalConfig, WalEntry};
use crate::Result;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// WAL writer appending to one top structure's log
pub struct WalWriter {
    config: WalConfig,
    top_id: u64,
    inner: Mutex<WalWriterInner>,
}

struct WalWriterInner {
    file: BufWriter<File>,
    bytes_written: u64,
    writes_since_sync: usize,
    last_sync: Instant,
}

impl WalWriter {
    /// Create or reopen the log for a top structure
    pub fn open(config: WalConfig, top_id: u64) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;

        let path = Self::log_path(&config.dir, top_id);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let bytes_written = file.metadata()?.len();

        let inner = WalWriterInner {
            file: BufWriter::new(file),
            bytes_written,
            writes_since_sync: 0,
            last_sync: Instant::now(),
        };

        Ok(Self {
            config,
            top_id,
            inner: Mutex::new(inner),
        })
    }

    /// Top structure id this log belongs to
    pub fn top_id(&self) -> u64 {
        self.top_id
    }

    /// Append an entry to the log; returns the offset it was written at
    pub fn append(&self, entry: &WalEntry) -> Result<u64> {
        let serialized = entry.serialize_with_checksum();
        let mut inner = self.inner.lock();

        let offset = inner.bytes_written;
        inner.file.write_all(&serialized)?;
        inner.bytes_written += serialized.len() as u64;
        inner.writes_since_sync += 1;

        if self.should_sync(&inner) {
            inner.file.flush()?;
            inner.file.get_ref().sync_all()?;
            inner.writes_since_sync = 0;
            inner.last_sync = Instant::now();
        }

        Ok(offset)
    }

    /// Force sync to disk
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.flush()?;
        inner.file.get_ref().sync_all()?;
        inner.writes_since_sync = 0;
        inner.last_sync = Instant::now();
        Ok(())
    }

    /// Delete the log backing a merged (or dropped) top structure
    pub fn remove(dir: &Path, top_id: u64) -> Result<()> {
        let path = Self::log_path(dir, top_id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn should_sync(&self, inner: &WalWriterInner) -> bool {
        match self.config.sync_policy {
            SyncPolicy::Immediate => true,
            SyncPolicy::EveryN(n) => inner.writes_since_sync >= n,
            SyncPolicy::Interval { millis } => {
                inner.last_sync.elapsed().as_millis() >= millis as u128
            }
            SyncPolicy::None => false,
        }
    }

    fn log_path(dir: &Path, top_id: u64) -> PathBuf {
        dir.join(log_file_name(top_id))
    }
}
