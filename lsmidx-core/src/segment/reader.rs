//! Segment reader: point lookups and ordered scans over an immutable run

use super::block::EntryBlock;
use super::{BloomFilter, SegmentMeta, FORMAT_VERSION};
use crate::{IndexEntry, IndexKey, LsmError, Result, RowRef};
use bytes::Buf;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

const FOOTER_SIZE: usize = 36;

#[derive(Debug, Clone)]
struct BlockHandle {
    first_key: IndexKey,
    last_key: IndexKey,
    offset: u64,
    size: u32,
}

/// Reader over one segment file
///
/// Cheap to share behind an `Arc`; lookups lock only around file reads.
/// When the segment is superseded by a merge it is marked obsolete and
/// the file is removed once the last reference drops.
pub struct SegmentReader {
    meta: SegmentMeta,
    file: Mutex<File>,
    index: Vec<BlockHandle>,
    bloom: BloomFilter,
    obsolete: AtomicBool,
}

impl SegmentReader {
    /// Open a segment file, validating its header and footer
    pub fn open(path: PathBuf, id: u64) -> Result<Self> {
        let mut file = File::open(&path)?;
        let file_size = file.metadata()?.len();

        if file_size < (16 + FOOTER_SIZE) as u64 {
            return Err(LsmError::Corruption(format!(
                "Segment file too small: {:?}",
                path
            )));
        }

        // Header
        let mut header = [0u8; 16];
        file.read_exact(&mut header)?;
        if &header[0..4] != b"LSMX" {
            return Err(LsmError::InvalidFormat(format!(
                "Bad segment magic in {:?}",
                path
            )));
        }
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if version != FORMAT_VERSION {
            return Err(LsmError::InvalidFormat(format!(
                "Unsupported segment version: {}",
                version
            )));
        }
        let entry_count = u64::from_le_bytes(header[8..16].try_into().map_err(|_| {
            LsmError::Corruption("Bad segment header".into())
        })?) as usize;

        // Footer
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer = [0u8; FOOTER_SIZE];
        file.read_exact(&mut footer)?;
        if &footer[32..36] != b"LSMX" {
            return Err(LsmError::Corruption(format!(
                "Bad segment footer in {:?}",
                path
            )));
        }
        let mut cursor = std::io::Cursor::new(&footer[..32]);
        let index_offset = cursor.get_u64_le();
        let index_size = cursor.get_u64_le();
        let bloom_offset = cursor.get_u64_le();
        let bloom_size = cursor.get_u64_le();

        let index = Self::read_index(&mut file, index_offset, index_size)?;
        let bloom = Self::read_bloom(&mut file, bloom_offset, bloom_size)?;

        let min_key = index.first().map(|h| h.first_key.clone());
        let max_key = index.last().map(|h| h.last_key.clone());

        let meta = SegmentMeta {
            path,
            id,
            entry_count,
            file_size,
            min_key,
            max_key,
        };

        Ok(Self {
            meta,
            file: Mutex::new(file),
            index,
            bloom,
            obsolete: AtomicBool::new(false),
        })
    }

    fn read_index(file: &mut File, offset: u64, size: u64) -> Result<Vec<BlockHandle>> {
        file.seek(SeekFrom::Start(offset))?;
        let mut data = vec![0u8; size as usize];
        file.read_exact(&mut data)?;

        if data.len() < 8 {
            return Err(LsmError::Corruption("Block index too short".into()));
        }

        let body = &data[..data.len() - 4];
        let expected = u32::from_le_bytes(
            data[data.len() - 4..]
                .try_into()
                .map_err(|_| LsmError::Corruption("Bad block index".into()))?,
        );
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(LsmError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = std::io::Cursor::new(body);
        let count = cursor.get_u32_le() as usize;
        let mut handles = Vec::with_capacity(count);

        for _ in 0..count {
            if cursor.remaining() < 2 {
                return Err(LsmError::Corruption("Truncated block index".into()));
            }
            let first_len = cursor.get_u16_le() as usize;
            if cursor.remaining() < first_len {
                return Err(LsmError::Corruption("Truncated block index".into()));
            }
            let pos = cursor.position() as usize;
            let first_key = IndexKey::new(&body[pos..pos + first_len]);
            cursor.set_position((pos + first_len) as u64);

            if cursor.remaining() < 2 {
                return Err(LsmError::Corruption("Truncated block index".into()));
            }
            let last_len = cursor.get_u16_le() as usize;
            if cursor.remaining() < last_len {
                return Err(LsmError::Corruption("Truncated block index".into()));
            }
            let pos = cursor.position() as usize;
            let last_key = IndexKey::new(&body[pos..pos + last_len]);
            cursor.set_position((pos + last_len) as u64);

            if cursor.remaining() < 16 {
                return Err(LsmError::Corruption("Truncated block index".into()));
            }
            let offset = cursor.get_u64_le();
            let size = cursor.get_u32_le();
            let _count = cursor.get_u32_le();

            handles.push(BlockHandle {
                first_key,
                last_key,
                offset,
                size,
            });
        }

        Ok(handles)
    }

    fn read_bloom(file: &mut File, offset: u64, size: u64) -> Result<BloomFilter> {
        file.seek(SeekFrom::Start(offset))?;
        let mut data = vec![0u8; size as usize];
        file.read_exact(&mut data)?;

        if data.len() < 5 {
            return Err(LsmError::Corruption("Bloom section too short".into()));
        }

        let mut cursor = std::io::Cursor::new(data.as_slice());
        let bloom_len = cursor.get_u32_le() as usize;
        let num_hashes = cursor.get_u8() as usize;

        let pos = cursor.position() as usize;
        if data.len() < pos + bloom_len {
            return Err(LsmError::Corruption("Bloom section truncated".into()));
        }
        let bits = data[pos..pos + bloom_len].to_vec();

        Ok(BloomFilter::from_bytes(bits, num_hashes))
    }

    /// Segment metadata
    pub fn meta(&self) -> &SegmentMeta {
        &self.meta
    }

    /// Fast negative check: false means the key is definitely absent
    pub fn may_contain(&self, key: &IndexKey) -> bool {
        self.meta.key_in_range(key) && self.bloom.may_contain(key)
    }

    /// Check if a key exists
    pub fn contains(&self, key: &IndexKey) -> Result<bool> {
        Ok(!self.get(key)?.is_empty())
    }

    /// Look up all entries for a key
    pub fn get(&self, key: &IndexKey) -> Result<Vec<(RowRef, Vec<u8>)>> {
        if !self.may_contain(key) {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();

        // First block whose last_key could cover the key; duplicates of
        // one key may spill across consecutive blocks.
        let start = self.index.partition_point(|h| &h.last_key < key);
        for handle in &self.index[start..] {
            if &handle.first_key > key {
                break;
            }
            let block = self.read_block(handle)?;
            for entry in block.decode()? {
                if &entry.key == key {
                    results.push((entry.row, entry.value));
                }
            }
        }

        Ok(results)
    }

    /// Ordered scan over the whole segment
    pub fn iter(self: &std::sync::Arc<Self>) -> SegmentIterator {
        SegmentIterator {
            reader: std::sync::Arc::clone(self),
            next_block: 0,
            current: Vec::new(),
            pos: 0,
            failed: false,
        }
    }

    /// Mark the backing file for deletion once the last reference drops
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    fn read_block(&self, handle: &BlockHandle) -> Result<EntryBlock> {
        let mut buf = vec![0u8; handle.size as usize];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(handle.offset))?;
            file.read_exact(&mut buf)?;
        }
        EntryBlock::from_bytes(&buf)
    }

    fn read_block_at(&self, block_idx: usize) -> Option<Result<EntryBlock>> {
        self.index.get(block_idx).map(|h| self.read_block(h))
    }
}

impl Drop for SegmentReader {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::Acquire) {
            if let Err(e) = fs::remove_file(&self.meta.path) {
                warn!("Failed to remove obsolete segment {:?}: {}", self.meta.path, e);
            }
        }
    }
}

/// Streaming iterator over a segment's entries in key order
pub struct SegmentIterator {
    reader: std::sync::Arc<SegmentReader>,
    next_block: usize,
    current: Vec<IndexEntry>,
    pos: usize,
    failed: bool,
}

impl Iterator for SegmentIterator {
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        while self.pos >= self.current.len() {
            match self.reader.read_block_at(self.next_block)? {
                Ok(block) => match block.decode() {
                    Ok(entries) => {
                        self.next_block += 1;
                        self.current = entries;
                        self.pos = 0;
                    }
                    Err(e) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                },
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }

        let entry = self.current[self.pos].clone();
        self.pos += 1;
        Some(Ok(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{SegmentBuilder, SegmentConfig};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn build_segment(dir: &TempDir, entries: &[IndexEntry]) -> PathBuf {
        let path = dir.path().join("seg.lsmx");
        let mut builder = SegmentBuilder::new(path.clone(), 1, SegmentConfig::default()).unwrap();
        for entry in entries {
            builder.add(entry).unwrap();
        }
        builder.finish().unwrap();
        path
    }

    fn sorted_entries(n: u64) -> Vec<IndexEntry> {
        (0..n)
            .map(|i| IndexEntry::new(i, format!("v{}", i), RowRef::new((i / 100) as u32, (i % 100) as u16)))
            .collect()
    }

    #[test]
    fn test_reader_point_lookup() {
        let temp_dir = TempDir::new().unwrap();
        let entries = sorted_entries(500);
        let path = build_segment(&temp_dir, &entries);

        let reader = SegmentReader::open(path, 1).unwrap();
        assert_eq!(reader.meta().entry_count, 500);

        let hits = reader.get(&IndexKey::from(123u64)).unwrap();
        assert_eq!(hits, vec![(RowRef::new(1, 23), b"v123".to_vec())]);

        assert!(reader.get(&IndexKey::from(9999u64)).unwrap().is_empty());
    }

    #[test]
    fn test_reader_duplicate_keys() {
        let temp_dir = TempDir::new().unwrap();
        let entries = vec![
            IndexEntry::new(7u64, "a", RowRef::new(0, 1)),
            IndexEntry::new(7u64, "b", RowRef::new(0, 2)),
            IndexEntry::new(8u64, "c", RowRef::new(0, 3)),
        ];
        let path = build_segment(&temp_dir, &entries);

        let reader = SegmentReader::open(path, 1).unwrap();
        let hits = reader.get(&IndexKey::from(7u64)).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, RowRef::new(0, 1));
        assert_eq!(hits[1].0, RowRef::new(0, 2));
    }

    #[test]
    fn test_reader_full_scan_order() {
        let temp_dir = TempDir::new().unwrap();
        let entries = sorted_entries(1000);
        let path = build_segment(&temp_dir, &entries);

        let reader = Arc::new(SegmentReader::open(path, 1).unwrap());
        let scanned: Vec<_> = reader.iter().collect::<Result<_>>().unwrap();
        assert_eq!(scanned, entries);
    }

    #[test]
    fn test_empty_segment_reader() {
        let temp_dir = TempDir::new().unwrap();
        let path = build_segment(&temp_dir, &[]);

        let reader = Arc::new(SegmentReader::open(path, 1).unwrap());
        assert_eq!(reader.meta().entry_count, 0);
        assert!(!reader.may_contain(&IndexKey::from(1u64)));
        assert!(reader.get(&IndexKey::from(1u64)).unwrap().is_empty());
        assert_eq!(reader.iter().count(), 0);
    }

    #[test]
    fn test_obsolete_segment_removed_on_drop() {
        let temp_dir = TempDir::new().unwrap();
        let path = build_segment(&temp_dir, &sorted_entries(10));

        let reader = Arc::new(SegmentReader::open(path.clone(), 1).unwrap());
        reader.mark_obsolete();
        assert!(path.exists());

        drop(reader);
        assert!(!path.exists());
    }
}
