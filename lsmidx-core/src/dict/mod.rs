//! Index dictionary: the persistent record naming an index's structures
//!
//! One record per index holds the base structure id, the heap reference,
//! the current top id, an optional sealed top id while a merge is in
//! flight, and the insert counter. Every structural mutation rewrites the
//! whole record atomically (write to a temp file, fsync, rename), so a
//! reader never observes a half-updated mapping.

use crate::{HeapRef, LsmError, Result};
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Dictionary file name inside an index directory
pub const DICT_FILE_NAME: &str = "dict.lsmx";

/// Dictionary record format version
pub const DICT_VERSION: u32 = 1;

/// The persisted dictionary record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictEntry {
    /// Structure id of the immutable base segment
    pub base: u64,
    /// Reference to the indexed table
    pub heap: String,
    /// Structure id of the mutable top
    pub top: u64,
    /// Previous top sealed for merging, if a merge is in flight
    pub sealed_top: Option<u64>,
    /// Insert count at the last structural write: the tuple count seeded
    /// by a build, zero after a rotation. The live counter adds the
    /// current top's log entries on top of this baseline.
    pub insert_count: u64,
    /// Bumped on every persisted mutation
    pub epoch: u64,
}

impl DictEntry {
    /// Fresh record as written by a bulk build
    pub fn new(base: u64, heap: HeapRef, top: u64, insert_count: u64) -> Self {
        Self {
            base,
            heap: heap.as_str().to_string(),
            top,
            sealed_top: None,
            insert_count,
            epoch: 0,
        }
    }
}

/// Handle to one index's dictionary record
pub struct Dictionary {
    path: PathBuf,
    state: Mutex<DictEntry>,
}

impl Dictionary {
    /// Create the dictionary record for a freshly built index
    ///
    /// Fails with `IndexAlreadyExists` if a record is already present;
    /// the caller must not have touched any other on-disk state that
    /// this record would now orphan.
    pub fn create(dir: &Path, entry: DictEntry) -> Result<Self> {
        let path = dir.join(DICT_FILE_NAME);
        if path.exists() {
            return Err(LsmError::IndexAlreadyExists(
                dir.display().to_string(),
            ));
        }

        let dict = Self {
            path,
            state: Mutex::new(entry),
        };
        dict.write_record(&dict.state.lock())?;
        info!("Created dictionary record at {:?}", dict.path);
        Ok(dict)
    }

    /// Open an existing dictionary record
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(DICT_FILE_NAME);
        if !path.exists() {
            return Err(LsmError::IndexNotFound(dir.display().to_string()));
        }

        let entry = Self::read_record(&path)?;
        debug!("Opened dictionary record: {:?}", entry);
        Ok(Self {
            path,
            state: Mutex::new(entry),
        })
    }

    /// Copy of the current record
    pub fn snapshot(&self) -> DictEntry {
        self.state.lock().clone()
    }

    /// Seal the current top and install a fresh one
    ///
    /// Returns the (base, sealed top) pair the merge must consume. The
    /// counter baseline restarts at zero for the new top. Idempotent: if a
    /// previous merge is still in flight the existing pair is returned
    /// and `new_top` is not installed.
    pub fn begin_merge(&self, new_top: u64) -> Result<(u64, u64)> {
        let mut state = self.state.lock();

        if let Some(sealed) = state.sealed_top {
            return Ok((state.base, sealed));
        }

        let sealed = state.top;
        state.sealed_top = Some(sealed);
        state.top = new_top;
        state.insert_count = 0;
        state.epoch += 1;
        self.write_record(&state)?;

        Ok((state.base, sealed))
    }

    /// Point the record at the merged base and retire the sealed top
    ///
    /// The single point where the index's truth changes: one atomic
    /// record write replaces both mappings. Returns the retired
    /// (old base, old sealed top) pair for file cleanup.
    pub fn swap_on_merge(&self, new_base: u64) -> Result<(u64, u64)> {
        let mut state = self.state.lock();

        let sealed = state.sealed_top.ok_or_else(|| {
            LsmError::Swap("No merge in flight".into())
        })?;
        let old_base = state.base;

        let saved = state.clone();
        state.base = new_base;
        state.sealed_top = None;
        state.epoch += 1;

        if let Err(e) = self.write_record(&state) {
            // Failed swap leaves the old mapping authoritative
            *state = saved;
            return Err(LsmError::Swap(e.to_string()));
        }

        Ok((old_base, sealed))
    }

    fn write_record(&self, entry: &DictEntry) -> Result<()> {
        let payload = bincode::serialize(entry)
            .map_err(|e| LsmError::InvalidFormat(format!("dict encode: {}", e)))?;

        let mut buf = BytesMut::new();
        buf.put_slice(b"LSMD");
        buf.put_u32_le(DICT_VERSION);
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);
        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        // Make the rename itself durable
        if let Some(parent) = self.path.parent() {
            File::open(parent)?.sync_all()?;
        }

        Ok(())
    }

    fn read_record(path: &Path) -> Result<DictEntry> {
        let mut file = File::open(path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        if data.len() < 16 {
            return Err(LsmError::Corruption("Dictionary record too short".into()));
        }

        let body = &data[..data.len() - 4];
        let expected = u32::from_le_bytes(
            data[data.len() - 4..]
                .try_into()
                .map_err(|_| LsmError::Corruption("Bad dictionary record".into()))?,
        );
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(LsmError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = std::io::Cursor::new(body);
        let mut magic = [0u8; 4];
        cursor.copy_to_slice(&mut magic);
        if &magic != b"LSMD" {
            return Err(LsmError::InvalidFormat("Bad dictionary magic".into()));
        }

        let version = cursor.get_u32_le();
        if version != DICT_VERSION {
            return Err(LsmError::InvalidFormat(format!(
                "Unsupported dictionary version: {}",
                version
            )));
        }

        let payload_len = cursor.get_u32_le() as usize;
        let pos = cursor.position() as usize;
        if body.len() < pos + payload_len {
            return Err(LsmError::Corruption("Dictionary record truncated".into()));
        }

        bincode::deserialize(&body[pos..pos + payload_len])
            .map_err(|e| LsmError::InvalidFormat(format!("dict decode: {}", e)))
    }
}
