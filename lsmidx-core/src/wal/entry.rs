//! WAL entry types and serialization

use crate::{IndexEntry, LsmError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// WAL entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WalEntryType {
    /// Insert one index entry
    Insert = 1,
    /// Marker written when the log is cleanly closed
    Checkpoint = 2,
}

impl TryFrom<u8> for WalEntryType {
    type Error = LsmError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(WalEntryType::Insert),
            2 => Ok(WalEntryType::Checkpoint),
            _ => Err(LsmError::InvalidFormat(format!(
                "Invalid WAL entry type: {}",
                value
            ))),
        }
    }
}

/// A single WAL entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Entry type
    pub entry_type: WalEntryType,
    /// Top structure this entry belongs to
    pub top_id: u64,
    /// Entry payload (serialized)
    pub payload: Vec<u8>,
}

impl WalEntry {
    /// Create an insert entry
    pub fn insert(top_id: u64, entry: &IndexEntry) -> Result<Self> {
        let payload = bincode::serialize(entry)
            .map_err(|e| LsmError::InvalidFormat(e.to_string()))?;
        Ok(Self {
            entry_type: WalEntryType::Insert,
            top_id,
            payload,
        })
    }

    /// Create a checkpoint entry
    pub fn checkpoint(top_id: u64) -> Self {
        Self {
            entry_type: WalEntryType::Checkpoint,
            top_id,
            payload: vec![],
        }
    }

    /// Serialize the entry with length prefix and CRC checksum
    ///
    /// Format:
    /// - 4 bytes: entry length (excluding this field)
    /// - 1 byte: entry type
    /// - 8 bytes: top structure id
    /// - 4 bytes: payload length
    /// - N bytes: payload
    /// - 4 bytes: CRC32 checksum
    pub fn serialize_with_checksum(&self) -> Bytes {
        let mut buf = BytesMut::new();

        // Reserve space for length prefix
        buf.put_u32_le(0);

        buf.put_u8(self.entry_type as u8);
        buf.put_u64_le(self.top_id);

        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);

        // Calculate and write checksum (excluding length prefix)
        let checksum = crc32fast::hash(&buf[4..]);
        buf.put_u32_le(checksum);

        // Write actual length
        let len = (buf.len() - 4) as u32;
        buf[0..4].copy_from_slice(&len.to_le_bytes());

        buf.freeze()
    }

    /// Deserialize entry from bytes, validating checksum
    pub fn deserialize_with_checksum(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 4 {
            return Err(LsmError::InvalidFormat("Entry too short".into()));
        }

        let mut cursor = std::io::Cursor::new(data);

        let len = cursor.get_u32_le() as usize;
        if data.len() < 4 + len {
            return Err(LsmError::InvalidFormat("Incomplete entry".into()));
        }

        let entry_data = &data[4..4 + len];
        if entry_data.len() < 17 {
            return Err(LsmError::InvalidFormat("Entry too short".into()));
        }

        // Validate checksum
        let expected_checksum = {
            let mut c = std::io::Cursor::new(&entry_data[entry_data.len() - 4..]);
            c.get_u32_le()
        };
        let actual_checksum = crc32fast::hash(&entry_data[..entry_data.len() - 4]);

        if expected_checksum != actual_checksum {
            return Err(LsmError::ChecksumMismatch {
                expected: expected_checksum,
                actual: actual_checksum,
            });
        }

        let mut cursor = std::io::Cursor::new(entry_data);

        let entry_type = WalEntryType::try_from(cursor.get_u8())?;
        let top_id = cursor.get_u64_le();

        let payload_len = cursor.get_u32_le() as usize;
        let pos = cursor.position() as usize;
        let payload = entry_data[pos..pos + payload_len].to_vec();

        let entry = WalEntry {
            entry_type,
            top_id,
            payload,
        };

        Ok((entry, 4 + len))
    }

    /// Get the index entry from an insert record
    pub fn index_entry(&self) -> Result<IndexEntry> {
        if self.entry_type != WalEntryType::Insert {
            return Err(LsmError::InvalidFormat("Not an insert entry".into()));
        }
        bincode::deserialize(&self.payload).map_err(|e| LsmError::InvalidFormat(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RowRef;

    #[test]
    fn test_entry_serialization() {
        let index_entry = IndexEntry::new("order-42", "payload", RowRef::new(7, 3));
        let entry = WalEntry::insert(5, &index_entry).unwrap();

        let serialized = entry.serialize_with_checksum();
        let (deserialized, len) = WalEntry::deserialize_with_checksum(&serialized).unwrap();

        assert_eq!(len, serialized.len());
        assert_eq!(deserialized.entry_type, WalEntryType::Insert);
        assert_eq!(deserialized.top_id, 5);
        assert_eq!(deserialized.index_entry().unwrap(), index_entry);
    }

    #[test]
    fn test_checksum_validation() {
        let entry = WalEntry::checkpoint(1);
        let mut serialized = entry.serialize_with_checksum().to_vec();

        // Corrupt the data
        serialized[6] ^= 0xFF;

        let result = WalEntry::deserialize_with_checksum(&serialized);
        assert!(matches!(result, Err(LsmError::ChecksumMismatch { .. })));
    }
}
