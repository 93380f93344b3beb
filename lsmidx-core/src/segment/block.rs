//! Entry blocks: the unit of segment I/O

use crate::{IndexEntry, IndexKey, LsmError, Result, RowRef};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// A decoded block of index entries
#[derive(Debug, Clone)]
pub struct EntryBlock {
    /// Encoded entry data (uncompressed)
    pub data: Bytes,
    /// Number of entries
    pub count: u32,
}

impl EntryBlock {
    /// Decode all entries in the block
    pub fn decode(&self) -> Result<Vec<IndexEntry>> {
        let mut entries = Vec::with_capacity(self.count as usize);
        let mut cursor = std::io::Cursor::new(self.data.as_ref());

        for _ in 0..self.count {
            if cursor.remaining() < 2 {
                return Err(LsmError::Corruption("Truncated block entry".into()));
            }
            let key_len = cursor.get_u16_le() as usize;
            let pos = cursor.position() as usize;
            if self.data.len() < pos + key_len {
                return Err(LsmError::Corruption("Truncated block key".into()));
            }
            let key = IndexKey::new(&self.data[pos..pos + key_len]);
            cursor.set_position((pos + key_len) as u64);

            if cursor.remaining() < 4 {
                return Err(LsmError::Corruption("Truncated block entry".into()));
            }
            let value_len = cursor.get_u32_le() as usize;
            let pos = cursor.position() as usize;
            if self.data.len() < pos + value_len {
                return Err(LsmError::Corruption("Truncated block value".into()));
            }
            let value = self.data[pos..pos + value_len].to_vec();
            cursor.set_position((pos + value_len) as u64);

            if cursor.remaining() < 6 {
                return Err(LsmError::Corruption("Truncated block row ref".into()));
            }
            let page = cursor.get_u32_le();
            let slot = cursor.get_u16_le();

            entries.push(IndexEntry {
                key,
                value,
                row: RowRef::new(page, slot),
            });
        }

        Ok(entries)
    }

    /// Serialize the block for disk
    ///
    /// Format:
    /// - 1 byte: compression flag
    /// - 4 bytes: entry count
    /// - 4 bytes: uncompressed data length
    /// - 4 bytes: stored data length
    /// - N bytes: data (compressed when flagged)
    /// - 4 bytes: CRC32 over everything above
    pub fn to_bytes(&self, compress: bool) -> Bytes {
        let mut buf = BytesMut::new();

        let stored: Vec<u8>;
        let (flag, payload): (u8, &[u8]) = if compress {
            stored = lz4_flex::compress(&self.data);
            if stored.len() < self.data.len() {
                (1, &stored)
            } else {
                (0, &self.data)
            }
        } else {
            (0, &self.data)
        };

        buf.put_u8(flag);
        buf.put_u32_le(self.count);
        buf.put_u32_le(self.data.len() as u32);
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(payload);

        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);

        buf.freeze()
    }

    /// Deserialize a block, validating the checksum
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 17 {
            return Err(LsmError::Corruption("Block too short".into()));
        }

        let body = &data[..data.len() - 4];
        let expected = {
            let mut c = std::io::Cursor::new(&data[data.len() - 4..]);
            c.get_u32_le()
        };
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(LsmError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = std::io::Cursor::new(body);
        let flag = cursor.get_u8();
        let count = cursor.get_u32_le();
        let uncompressed_len = cursor.get_u32_le() as usize;
        let stored_len = cursor.get_u32_le() as usize;

        let pos = cursor.position() as usize;
        if body.len() < pos + stored_len {
            return Err(LsmError::Corruption("Block payload truncated".into()));
        }
        let payload = &body[pos..pos + stored_len];

        let data = match flag {
            0 => Bytes::copy_from_slice(payload),
            1 => {
                let decompressed = lz4_flex::decompress(payload, uncompressed_len)
                    .map_err(|e| LsmError::Corruption(format!("lz4: {}", e)))?;
                Bytes::from(decompressed)
            }
            other => {
                return Err(LsmError::InvalidFormat(format!(
                    "Unknown block compression flag: {}",
                    other
                )))
            }
        };

        if data.len() != uncompressed_len {
            return Err(LsmError::Corruption("Block length mismatch".into()));
        }

        Ok(Self { data, count })
    }
}

/// Accumulates entries into one block
pub struct BlockBuilder {
    data: BytesMut,
    count: u32,
    first_key: Option<IndexKey>,
    last_key: Option<IndexKey>,
}

impl BlockBuilder {
    /// Create an empty block builder
    pub fn new() -> Self {
        Self {
            data: BytesMut::new(),
            count: 0,
            first_key: None,
            last_key: None,
        }
    }

    /// Append an entry
    pub fn add(&mut self, entry: &IndexEntry) {
        self.data.put_u16_le(entry.key.len() as u16);
        self.data.put_slice(entry.key.as_bytes());
        self.data.put_u32_le(entry.value.len() as u32);
        self.data.put_slice(&entry.value);
        self.data.put_u32_le(entry.row.page);
        self.data.put_u16_le(entry.row.slot);

        if self.first_key.is_none() {
            self.first_key = Some(entry.key.clone());
        }
        self.last_key = Some(entry.key.clone());
        self.count += 1;
    }

    /// Encoded size so far
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Finish the block; returns the block and its key range
    pub fn finish(self) -> (EntryBlock, IndexKey, IndexKey) {
        let first = self.first_key.expect("finish() on empty block");
        let last = self.last_key.expect("finish() on empty block");
        (
            EntryBlock {
                data: self.data.freeze(),
                count: self.count,
            },
            first,
            last,
        )
    }
}

impl Default for BlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}
