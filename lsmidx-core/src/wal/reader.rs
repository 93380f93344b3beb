//! WAL reader for recovery

use super::{log_file_name, parse_log_id, WalConfig, WalEntry, WalEntryType};
use crate::{IndexEntry, LsmError, Result};
use std::fs::{self, File};
use std::io::Read;
use std::path::PathBuf;
use tracing::{info, warn};

/// WAL reader for rebuilding top structures after a restart
pub struct WalReader {
    config: WalConfig,
}

impl WalReader {
    /// Create a new WAL reader
    pub fn new(config: WalConfig) -> Self {
        Self { config }
    }

    /// Replay one top structure's log into its index entries
    ///
    /// A torn or checksum-failing record truncates the replay at that
    /// point: everything before it was durably written and is recovered.
    pub fn replay(&self, top_id: u64) -> Result<Vec<IndexEntry>> {
        let path = self.config.dir.join(log_file_name(top_id));
        if !path.exists() {
            return Ok(Vec::new());
        }

        let mut file = File::open(&path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let mut entries = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            match WalEntry::deserialize_with_checksum(&data[offset..]) {
                Ok((entry, bytes_read)) => {
                    if entry.entry_type == WalEntryType::Insert {
                        entries.push(entry.index_entry()?);
                    }
                    offset += bytes_read;
                }
                Err(LsmError::ChecksumMismatch { .. }) => {
                    // Corrupted record, skip rest of log
                    warn!(
                        "Checksum mismatch at offset {} in {:?}, truncating",
                        offset, path
                    );
                    break;
                }
                Err(LsmError::InvalidFormat(msg)) if msg == "Entry too short" => {
                    // Incomplete record at end (crash during write)
                    break;
                }
                Err(LsmError::InvalidFormat(msg)) if msg == "Incomplete entry" => {
                    // Incomplete record at end (crash during write)
                    break;
                }
                Err(e) => {
                    return Err(e);
                }
            }
        }

        info!("Replayed {} entries from {:?}", entries.len(), path);
        Ok(entries)
    }

    /// List the top structure ids that have a log on disk
    pub fn existing_logs(&self) -> Result<Vec<u64>> {
        let mut ids = Vec::new();

        if !self.config.dir.exists() {
            return Ok(ids);
        }

        for entry in fs::read_dir(&self.config.dir)? {
            let entry = entry?;
            let path: PathBuf = entry.path();
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if let Some(id) = parse_log_id(name) {
                    ids.push(id);
                }
            }
        }

        ids.sort_unstable();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::{SyncPolicy, WalWriter};
    use crate::RowRef;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> WalConfig {
        WalConfig {
            dir: dir.path().to_path_buf(),
            sync_policy: SyncPolicy::Immediate,
        }
    }

    #[test]
    fn test_wal_replay() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);

        {
            let writer = WalWriter::open(config.clone(), 3).unwrap();
            for i in 0..10u64 {
                let entry = IndexEntry::new(i, "", RowRef::new(0, i as u16));
                writer.append(&WalEntry::insert(3, &entry).unwrap()).unwrap();
            }
            writer.sync().unwrap();
        }

        let reader = WalReader::new(config);
        let entries = reader.replay(3).unwrap();
        assert_eq!(entries.len(), 10);
        assert_eq!(entries[9].row, RowRef::new(0, 9));

        // Missing logs replay to nothing
        assert!(reader.replay(99).unwrap().is_empty());
    }

    #[test]
    fn test_wal_replay_truncates_torn_tail() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);

        {
            let writer = WalWriter::open(config.clone(), 1).unwrap();
            for i in 0..5u64 {
                let entry = IndexEntry::new(i, "", RowRef::new(0, i as u16));
                writer.append(&WalEntry::insert(1, &entry).unwrap()).unwrap();
            }
            writer.sync().unwrap();
        }

        // Simulate a crash mid-write: append half a record
        let path = temp_dir.path().join(log_file_name(1));
        let mut data = std::fs::read(&path).unwrap();
        data.extend_from_slice(&[42u8; 7]);
        std::fs::write(&path, data).unwrap();

        let reader = WalReader::new(config);
        let entries = reader.replay(1).unwrap();
        assert_eq!(entries.len(), 5);
    }

    #[test]
    fn test_existing_logs() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);

        for id in [7u64, 2, 5] {
            let writer = WalWriter::open(config.clone(), id).unwrap();
            writer
                .append(&WalEntry::checkpoint(id))
                .unwrap();
        }

        let reader = WalReader::new(config);
        assert_eq!(reader.existing_logs().unwrap(), vec![2, 5, 7]);
    }
}
