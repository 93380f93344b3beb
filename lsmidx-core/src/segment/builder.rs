//! Segment builder for bulk-building sorted runs

use super::block::BlockBuilder;
use super::{BloomFilter, SegmentConfig, SegmentMeta, FORMAT_VERSION};
use crate::{IndexEntry, IndexKey, LsmError, Result, RowRef};
use bytes::{BufMut, BytesMut};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// Streaming builder writing a segment from an ordered entry stream
pub struct SegmentBuilder {
    config: SegmentConfig,
    path: PathBuf,
    id: u64,

    // Current state
    file: BufWriter<File>,
    offset: u64,
    current_block: BlockBuilder,
    last_added: Option<(IndexKey, RowRef)>,

    // Index data
    index_entries: Vec<IndexRecord>,
    key_hashes: Vec<(u64, u64)>,

    // Stats
    entry_count: usize,
    min_key: Option<IndexKey>,
    max_key: Option<IndexKey>,
}

#[derive(Debug, Clone)]
pub(super) struct IndexRecord {
    pub first_key: IndexKey,
    pub last_key: IndexKey,
    pub offset: u64,
    pub size: u32,
    pub count: u32,
}

impl SegmentBuilder {
    /// Create a new segment builder writing to `path`
    pub fn new(path: PathBuf, id: u64, config: SegmentConfig) -> Result<Self> {
        let mut file = BufWriter::new(File::create(&path)?);

        // Header: magic, version, placeholder entry count (fixed up in finish)
        let mut header = BytesMut::new();
        header.put_slice(b"LSMX");
        header.put_u32_le(FORMAT_VERSION);
        header.put_u64_le(0);
        file.write_all(&header)?;

        Ok(Self {
            config,
            path,
            id,
            file,
            offset: 16,
            current_block: BlockBuilder::new(),
            last_added: None,
            index_entries: Vec::new(),
            key_hashes: Vec::new(),
            entry_count: 0,
            min_key: None,
            max_key: None,
        })
    }

    /// Add the next entry; (key, row) pairs must arrive strictly increasing
    pub fn add(&mut self, entry: &IndexEntry) -> Result<()> {
        if let Some((last_key, last_row)) = &self.last_added {
            if (&entry.key, &entry.row) <= (last_key, last_row) {
                return Err(LsmError::Build(format!(
                    "Out-of-order entry: {} {} after {} {}",
                    entry.key, entry.row, last_key, last_row
                )));
            }
        }

        // Bloom tracks distinct keys only
        let is_new_key = self.max_key.as_ref() != Some(&entry.key);
        if is_new_key {
            self.key_hashes.push(BloomFilter::hash_key(&entry.key));
        }

        if self.min_key.is_none() {
            self.min_key = Some(entry.key.clone());
        }
        self.max_key = Some(entry.key.clone());
        self.last_added = Some((entry.key.clone(), entry.row));
        self.entry_count += 1;

        self.current_block.add(entry);
        if self.current_block.size() >= self.config.block_size {
            self.flush_block()?;
        }

        Ok(())
    }

    /// Bulk build from an already-sorted entry stream
    pub fn build_from_sorted<I>(
        path: PathBuf,
        id: u64,
        entries: I,
        config: SegmentConfig,
    ) -> Result<SegmentMeta>
    where
        I: IntoIterator<Item = Result<IndexEntry>>,
    {
        let mut builder = Self::new(path, id, config)?;
        for entry in entries {
            builder.add(&entry?)?;
        }
        builder.finish()
    }

    /// Finish building: write index, bloom filter and footer
    pub fn finish(mut self) -> Result<SegmentMeta> {
        self.flush_block()?;

        let index_offset = self.offset;
        let index_size = self.write_index()?;
        self.offset += index_size as u64;

        let bloom_offset = self.offset;
        let bloom_size = self.write_bloom()?;
        self.offset += bloom_size as u64;

        self.write_footer(index_offset, index_size as u64, bloom_offset, bloom_size as u64)?;

        self.file.flush()?;
        let file = self.file.into_inner().map_err(|e| LsmError::Build(e.to_string()))?;

        // Fix up the entry count in the header, then make the file durable
        use std::io::Seek;
        let mut file = file;
        file.seek(std::io::SeekFrom::Start(8))?;
        file.write_all(&(self.entry_count as u64).to_le_bytes())?;
        file.sync_all()?;

        let file_size = file.metadata()?.len();

        Ok(SegmentMeta {
            path: self.path,
            id: self.id,
            entry_count: self.entry_count,
            file_size,
            min_key: self.min_key,
            max_key: self.max_key,
        })
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.current_block.is_empty() {
            return Ok(());
        }

        let builder = std::mem::take(&mut self.current_block);
        let (block, first_key, last_key) = builder.finish();
        let count = block.count;
        let bytes = block.to_bytes(self.config.compression);

        self.index_entries.push(IndexRecord {
            first_key,
            last_key,
            offset: self.offset,
            size: bytes.len() as u32,
            count,
        });

        self.file.write_all(&bytes)?;
        self.offset += bytes.len() as u64;

        Ok(())
    }

    fn write_index(&mut self) -> Result<usize> {
        let mut buf = BytesMut::new();

        buf.put_u32_le(self.index_entries.len() as u32);

        for record in &self.index_entries {
            buf.put_u16_le(record.first_key.len() as u16);
            buf.put_slice(record.first_key.as_bytes());

            buf.put_u16_le(record.last_key.len() as u16);
            buf.put_slice(record.last_key.as_bytes());

            buf.put_u64_le(record.offset);
            buf.put_u32_le(record.size);
            buf.put_u32_le(record.count);
        }

        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);

        self.file.write_all(&buf)?;
        Ok(buf.len())
    }

    fn write_bloom(&mut self) -> Result<usize> {
        let mut bloom = BloomFilter::new(self.key_hashes.len(), self.config.bloom_bits_per_key);
        for &(h1, h2) in &self.key_hashes {
            bloom.add_hash(h1, h2);
        }

        let mut buf = BytesMut::new();
        let bloom_data = bloom.as_bytes();

        buf.put_u32_le(bloom_data.len() as u32);
        buf.put_u8(bloom.num_hashes() as u8);
        buf.put_slice(bloom_data);

        self.file.write_all(&buf)?;
        Ok(buf.len())
    }

    fn write_footer(
        &mut self,
        index_offset: u64,
        index_size: u64,
        bloom_offset: u64,
        bloom_size: u64,
    ) -> Result<()> {
        let mut buf = BytesMut::new();

        buf.put_u64_le(index_offset);
        buf.put_u64_le(index_size);
        buf.put_u64_le(bloom_offset);
        buf.put_u64_le(bloom_size);

        // Magic number at end for validation
        buf.put_slice(b"LSMX");

        self.file.write_all(&buf)?;
        Ok(())
    }
}
