//! LsmIndex: build, insert, lookup and merge for one index

use super::IndexConfig;
use crate::dict::{DictEntry, Dictionary, DICT_FILE_NAME};
use crate::memtable::MemTable;
use crate::merge::{MergeIterator, MergePhase, MergeState, MergeWorker};
use crate::segment::{parse_segment_id, segment_file_name, SegmentBuilder, SegmentReader};
use crate::wal::{parse_log_id, WalEntry, WalReader, WalWriter};
use crate::{HeapSource, IndexEntry, IndexKey, LsmError, Result, RowRef, UniqueCheck};
use parking_lot::RwLock;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One mutable top structure: a MemTable backed by its own log
struct TopStructure {
    id: u64,
    memtable: MemTable,
    wal: WalWriter,
}

/// The current top plus, while a merge is in flight, the sealed one
///
/// Inserts hold the read lock across the WAL append and MemTable insert,
/// so a rotation (write lock) never sees a straggler land in a top it
/// has already sealed.
struct TopSlots {
    current: Arc<TopStructure>,
    sealed: Option<Arc<TopStructure>>,
}

struct IndexInner {
    config: IndexConfig,
    dict: Dictionary,
    base: RwLock<Arc<SegmentReader>>,
    tops: RwLock<TopSlots>,
    next_structure_id: AtomicU64,
    /// Inserts into the current top: dictionary baseline plus increments
    insert_count: AtomicU64,
    merge_state: MergeState,
}

/// An LSM index over one heap
///
/// Point inserts go to the mutable top; lookups see the union of base,
/// top and (during a merge) the sealed top. A background worker folds
/// the top into a new base once insert or size thresholds fire.
pub struct LsmIndex {
    inner: Arc<IndexInner>,
    worker: MergeWorker,
}

/// Point-in-time view of the index structures
#[derive(Debug, Clone)]
pub struct IndexStats {
    /// Indexed heap reference
    pub heap: String,
    /// Base structure id
    pub base_id: u64,
    /// Current top structure id
    pub top_id: u64,
    /// Sealed top id, if a merge is in flight
    pub sealed_top_id: Option<u64>,
    /// Inserts absorbed by the current top
    pub insert_count: u64,
    /// Dictionary epoch
    pub epoch: u64,
    /// Entries in the base segment
    pub base_entries: usize,
    /// Entries in the current top
    pub top_entries: usize,
    /// Entries in the sealed top
    pub sealed_entries: usize,
    /// Current merge phase
    pub merge_phase: MergePhase,
}

const BUILD_BASE_ID: u64 = 1;
const BUILD_TOP_ID: u64 = 2;

impl LsmIndex {
    /// Bulk-build an index from a full heap scan
    ///
    /// All-or-nothing: the dictionary record is written last, so a failed
    /// build leaves no visible index, and every file written before the
    /// failure is removed.
    pub fn build(config: IndexConfig, heap: &dyn HeapSource) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        if config.data_dir.join(DICT_FILE_NAME).exists() {
            return Err(LsmError::IndexAlreadyExists(
                config.data_dir.display().to_string(),
            ));
        }

        let mut entries: Vec<IndexEntry> = heap
            .scan()?
            .collect::<Result<_>>()
            .map_err(|e| LsmError::Build(format!("Heap scan failed: {}", e)))?;
        entries.sort_unstable_by(|a, b| (&a.key, &a.row).cmp(&(&b.key, &b.row)));
        entries.dedup_by(|a, b| a.key == b.key && a.row == b.row);

        if config.unique {
            if let Some(w) = entries.windows(2).find(|w| w[0].key == w[1].key) {
                return Err(LsmError::Build(format!(
                    "Duplicate key in unique index: {}",
                    w[0].key
                )));
            }
        }
        let tuple_count = entries.len() as u64;

        let seg_path = config.data_dir.join(segment_file_name(BUILD_BASE_ID));
        let built = (|| {
            let mut builder =
                SegmentBuilder::new(seg_path.clone(), BUILD_BASE_ID, config.segment.clone())?;
            for entry in &entries {
                builder.add(entry)?;
            }
            builder.finish()
        })();
        if let Err(e) = built {
            let _ = fs::remove_file(&seg_path);
            return Err(LsmError::Build(e.to_string()));
        }

        let wal = match WalWriter::open(config.wal_config(), BUILD_TOP_ID) {
            Ok(wal) => wal,
            Err(e) => {
                let _ = fs::remove_file(&seg_path);
                return Err(LsmError::Build(e.to_string()));
            }
        };

        // The record that makes the index exist, written last
        let record = DictEntry::new(BUILD_BASE_ID, heap.heap_ref(), BUILD_TOP_ID, tuple_count);
        let dict = match Dictionary::create(&config.data_dir, record) {
            Ok(dict) => dict,
            Err(e) => {
                let _ = fs::remove_file(&seg_path);
                let _ = WalWriter::remove(&config.data_dir, BUILD_TOP_ID);
                return Err(match e {
                    LsmError::IndexAlreadyExists(_) => e,
                    other => LsmError::Build(other.to_string()),
                });
            }
        };

        info!(
            "Built index over {} rows at {:?}",
            tuple_count, config.data_dir
        );

        let base = Arc::new(SegmentReader::open(seg_path, BUILD_BASE_ID)?);
        let current = Arc::new(TopStructure {
            id: BUILD_TOP_ID,
            memtable: MemTable::new(BUILD_TOP_ID),
            wal,
        });
        Self::assemble(config, dict, base, current, None, tuple_count, BUILD_TOP_ID + 1)
    }

    /// Open an existing index, replaying logs and resuming any merge
    pub fn open(config: IndexConfig) -> Result<Self> {
        let dict = Dictionary::open(&config.data_dir)?;
        let snap = dict.snapshot();

        Self::remove_orphans(&config, &snap)?;

        let base_path = config.data_dir.join(segment_file_name(snap.base));
        let base = Arc::new(SegmentReader::open(base_path, snap.base)?);

        let wal_reader = WalReader::new(config.wal_config());

        let memtable = MemTable::new(snap.top);
        let replayed = wal_reader.replay(snap.top)?;
        for entry in &replayed {
            memtable.insert(entry);
        }
        // Count what the replay actually landed: a rejected duplicate
        // leaves a log record but no entry, and must not inflate the
        // counter of accepted inserts.
        let accepted_count = memtable.len() as u64;
        let wal = WalWriter::open(config.wal_config(), snap.top)?;
        let current = Arc::new(TopStructure {
            id: snap.top,
            memtable,
            wal,
        });

        let sealed = match snap.sealed_top {
            Some(id) => {
                let memtable = MemTable::new(id);
                for entry in &wal_reader.replay(id)? {
                    memtable.insert(entry);
                }
                let wal = WalWriter::open(config.wal_config(), id)?;
                Some(Arc::new(TopStructure { id, memtable, wal }))
            }
            None => None,
        };

        let live_count = snap.insert_count + accepted_count;
        let next_id = snap
            .base
            .max(snap.top)
            .max(snap.sealed_top.unwrap_or(0))
            + 1;

        info!(
            "Opened index at {:?}: base {}, top {} ({} of {} log records live), sealed {:?}",
            config.data_dir,
            snap.base,
            snap.top,
            accepted_count,
            replayed.len(),
            snap.sealed_top
        );

        let resume = sealed.is_some();
        let index = Self::assemble(config, dict, base, current, sealed, live_count, next_id)?;
        if resume {
            index.inner.merge_state.set(MergePhase::Triggered);
            index.worker.trigger();
        }
        Ok(index)
    }

    fn assemble(
        config: IndexConfig,
        dict: Dictionary,
        base: Arc<SegmentReader>,
        current: Arc<TopStructure>,
        sealed: Option<Arc<TopStructure>>,
        live_count: u64,
        next_id: u64,
    ) -> Result<Self> {
        let name = config
            .data_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("index")
            .to_string();

        let inner = Arc::new(IndexInner {
            config,
            dict,
            base: RwLock::new(base),
            tops: RwLock::new(TopSlots { current, sealed }),
            next_structure_id: AtomicU64::new(next_id),
            insert_count: AtomicU64::new(live_count),
            merge_state: MergeState::new(),
        });

        let worker_inner = Arc::clone(&inner);
        let worker = MergeWorker::spawn(&name, move || {
            if let Err(e) = run_merge(&worker_inner) {
                warn!("Merge failed, old structures remain authoritative: {}", e);
            }
        })?;

        Ok(Self { inner, worker })
    }

    /// Delete files a crashed merge left behind: segments the dictionary
    /// does not name and logs of retired tops
    fn remove_orphans(config: &IndexConfig, snap: &DictEntry) -> Result<()> {
        for dir_entry in fs::read_dir(&config.data_dir)? {
            let path = dir_entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };

            let orphan = if let Some(id) = parse_segment_id(name) {
                id != snap.base
            } else if let Some(id) = parse_log_id(name) {
                id != snap.top && Some(id) != snap.sealed_top
            } else {
                false
            };

            if orphan {
                warn!("Removing orphaned file {:?}", path);
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Insert one entry
    ///
    /// Returns `Ok(false)` when the exact (key, row) pair is already in
    /// the top layers (idempotent re-insert, not counted). With
    /// `UniqueCheck::Enforce`, a different row under the same key is an
    /// `Insert` error and nothing is written.
    ///
    /// The uniqueness probe and the write are not atomic with respect to
    /// other writers: two concurrent `Enforce` inserts of the same new
    /// key can both pass the probe and both land. It is a policy check
    /// for callers that serialize writes per key, not an engine
    /// guarantee.
    pub fn insert(
        &self,
        key: impl Into<IndexKey>,
        value: impl Into<Vec<u8>>,
        row: RowRef,
        unique_check: UniqueCheck,
    ) -> Result<bool> {
        let entry = IndexEntry::new(key, value.into(), row);
        let inner = &self.inner;

        let tops = inner.tops.read();
        let top = &tops.current;

        if unique_check == UniqueCheck::Enforce {
            let has_row = |rows: &[(RowRef, Vec<u8>)]| rows.iter().any(|(r, _)| *r == entry.row);

            let current_rows = top.memtable.get(&entry.key);
            let sealed_rows = tops
                .sealed
                .as_ref()
                .map(|t| t.memtable.get(&entry.key))
                .unwrap_or_default();
            let base = Arc::clone(&inner.base.read());
            let base_rows = if base.may_contain(&entry.key) {
                base.get(&entry.key)?
            } else {
                Vec::new()
            };

            if has_row(&current_rows) || has_row(&sealed_rows) || has_row(&base_rows) {
                return Ok(false);
            }
            if !current_rows.is_empty() || !sealed_rows.is_empty() || !base_rows.is_empty() {
                return Err(LsmError::Insert(format!("Duplicate key: {}", entry.key)));
            }
        }

        // Probe before logging so a rejected re-insert leaves no log
        // record behind
        if top
            .memtable
            .get(&entry.key)
            .iter()
            .any(|(r, _)| *r == entry.row)
        {
            return Ok(false);
        }

        // Log first; the MemTable insert makes it visible
        top.wal.append(&WalEntry::insert(top.id, &entry)?)?;
        if !top.memtable.insert(&entry) {
            return Ok(false);
        }

        let count = inner.insert_count.fetch_add(1, Ordering::SeqCst) + 1;
        let should_merge = count >= inner.config.merge.insert_threshold
            || top.memtable.should_merge(inner.config.merge.top_size_limit);
        drop(tops);

        if should_merge && inner.merge_state.transition(MergePhase::Idle, MergePhase::Triggered) {
            debug!("Merge triggered after {} inserts", count);
            self.worker.trigger();
        }

        Ok(true)
    }

    /// All (row, payload) pairs under a key, across every layer
    pub fn lookup(&self, key: &IndexKey) -> Result<Vec<(RowRef, Vec<u8>)>> {
        let inner = &self.inner;
        let (current, sealed) = {
            let tops = inner.tops.read();
            (Arc::clone(&tops.current), tops.sealed.clone())
        };
        let base = Arc::clone(&inner.base.read());

        let mut rows = current.memtable.get(key);
        if let Some(sealed) = sealed {
            rows.extend(sealed.memtable.get(key));
        }
        if base.may_contain(key) {
            rows.extend(base.get(key)?);
        }

        rows.sort_unstable_by_key(|(row, _)| *row);
        rows.dedup_by_key(|(row, _)| *row);
        Ok(rows)
    }

    /// Check whether any entry with this key exists
    pub fn contains(&self, key: &IndexKey) -> Result<bool> {
        Ok(!self.lookup(key)?.is_empty())
    }

    /// Ordered scan over the union of all layers
    pub fn scan_all(&self) -> Result<Vec<IndexEntry>> {
        let inner = &self.inner;
        let (current, sealed) = {
            let tops = inner.tops.read();
            (Arc::clone(&tops.current), tops.sealed.clone())
        };
        let base = Arc::clone(&inner.base.read());

        let current_entries = current.memtable.iter();
        let sealed_entries = sealed.map(|s| s.memtable.iter()).unwrap_or_default();

        let tops_iter = MergeIterator::new(
            current_entries.into_iter().map(Ok),
            sealed_entries.into_iter().map(Ok),
        );
        MergeIterator::new(tops_iter, base.iter()).collect()
    }

    /// Signal the merge worker regardless of thresholds
    pub fn force_merge(&self) {
        if self
            .inner
            .merge_state
            .transition(MergePhase::Idle, MergePhase::Triggered)
        {
            self.worker.trigger();
        }
    }

    /// Run a merge on the calling thread; returns whether one ran
    pub fn merge_now(&self) -> Result<bool> {
        self.inner
            .merge_state
            .transition(MergePhase::Idle, MergePhase::Triggered);
        run_merge(&self.inner)
    }

    /// Force the current top's log to disk
    pub fn sync(&self) -> Result<()> {
        self.inner.tops.read().current.wal.sync()
    }

    /// Snapshot of structure ids, counters and sizes
    pub fn stats(&self) -> IndexStats {
        let inner = &self.inner;
        let snap = inner.dict.snapshot();
        let tops = inner.tops.read();
        let base = inner.base.read();

        IndexStats {
            heap: snap.heap,
            base_id: snap.base,
            top_id: tops.current.id,
            sealed_top_id: tops.sealed.as_ref().map(|t| t.id),
            insert_count: inner.insert_count.load(Ordering::SeqCst),
            epoch: snap.epoch,
            base_entries: base.meta().entry_count,
            top_entries: tops.current.memtable.len(),
            sealed_entries: tops.sealed.as_ref().map(|t| t.memtable.len()).unwrap_or(0),
            merge_phase: inner.merge_state.phase(),
        }
    }
}

/// One full merge cycle; returns false if another merge holds the claim
fn run_merge(inner: &IndexInner) -> Result<bool> {
    let claimed = inner
        .merge_state
        .transition(MergePhase::Triggered, MergePhase::Merging)
        || inner
            .merge_state
            .transition(MergePhase::Idle, MergePhase::Merging);
    if !claimed {
        return Ok(false);
    }

    let result = do_merge(inner);
    inner.merge_state.set(MergePhase::Idle);
    result.map(|_| true)
}

fn do_merge(inner: &IndexInner) -> Result<()> {
    // Rotation: seal the current top and install a fresh one. Under the
    // write lock no insert is in flight, so the sealed MemTable is final.
    let sealed = {
        let mut tops = inner.tops.write();
        match &tops.sealed {
            Some(sealed) => Arc::clone(sealed),
            None => {
                if tops.current.memtable.is_empty() {
                    debug!("Top structure empty, nothing to merge");
                    return Ok(());
                }

                let new_top_id = inner.next_structure_id.fetch_add(1, Ordering::SeqCst);
                let wal = WalWriter::open(inner.config.wal_config(), new_top_id)?;
                let new_top = Arc::new(TopStructure {
                    id: new_top_id,
                    memtable: MemTable::new(new_top_id),
                    wal,
                });

                inner.dict.begin_merge(new_top_id)?;
                let old = std::mem::replace(&mut tops.current, new_top);
                inner.insert_count.store(0, Ordering::SeqCst);
                tops.sealed = Some(Arc::clone(&old));
                old
            }
        }
    };

    sealed.wal.sync()?;
    let old_base = Arc::clone(&inner.base.read());

    info!(
        "Merging sealed top {} ({} entries) into base {} ({} entries)",
        sealed.id,
        sealed.memtable.len(),
        old_base.meta().id,
        old_base.meta().entry_count
    );

    // Stream the union into a new segment
    let new_base_id = inner.next_structure_id.fetch_add(1, Ordering::SeqCst);
    let seg_path = inner.config.data_dir.join(segment_file_name(new_base_id));

    let top_iter = sealed.memtable.iter().into_iter().map(Ok);
    let merged = MergeIterator::new(top_iter, old_base.iter());
    let meta = match SegmentBuilder::build_from_sorted(
        seg_path.clone(),
        new_base_id,
        merged,
        inner.config.segment.clone(),
    ) {
        Ok(meta) => meta,
        Err(e) => {
            let _ = fs::remove_file(&seg_path);
            return Err(LsmError::Merge(e.to_string()));
        }
    };

    // Swap: one dictionary write moves the truth to the new base
    inner.merge_state.set(MergePhase::Swapping);
    let new_base = match SegmentReader::open(meta.path, new_base_id) {
        Ok(reader) => Arc::new(reader),
        Err(e) => {
            let _ = fs::remove_file(&seg_path);
            return Err(LsmError::Merge(e.to_string()));
        }
    };
    let (old_base_id, sealed_id) = match inner.dict.swap_on_merge(new_base_id) {
        Ok(ids) => ids,
        Err(e) => {
            let _ = fs::remove_file(&seg_path);
            return Err(e);
        }
    };

    {
        let mut base = inner.base.write();
        base.mark_obsolete();
        *base = new_base;
    }
    {
        let mut tops = inner.tops.write();
        tops.sealed = None;
    }
    drop(sealed);
    WalWriter::remove(&inner.config.data_dir, sealed_id)?;

    info!(
        "Merge complete: base {} -> {} ({} entries)",
        old_base_id, new_base_id, meta.entry_count
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemHeap;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> IndexConfig {
        IndexConfig::new(dir.path().join("idx"))
    }

    fn heap_of(keys: &[u64]) -> MemHeap {
        let mut heap = MemHeap::new("orders");
        for (i, &k) in keys.iter().enumerate() {
            heap.push(IndexEntry::new(k, format!("r{}", k), RowRef::new(0, i as u16)));
        }
        heap
    }

    fn scanned_keys(index: &LsmIndex) -> Vec<u64> {
        index
            .scan_all()
            .unwrap()
            .iter()
            .map(|e| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(e.key.as_bytes());
                u64::from_be_bytes(buf)
            })
            .collect()
    }

    #[test]
    fn test_build_insert_merge_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let index = LsmIndex::build(test_config(&temp_dir), &heap_of(&[1, 3])).unwrap();

        // Build seeds the counter with the tuple count
        assert_eq!(index.stats().insert_count, 2);

        assert!(index
            .insert(2u64, "r2", RowRef::new(5, 0), UniqueCheck::No)
            .unwrap());
        assert_eq!(index.stats().insert_count, 3);
        assert_eq!(scanned_keys(&index), vec![1, 2, 3]);

        assert!(index.merge_now().unwrap());

        let stats = index.stats();
        assert_eq!(stats.insert_count, 0);
        assert_eq!(stats.sealed_top_id, None);
        assert_eq!(stats.base_entries, 3);
        assert_eq!(stats.top_entries, 0);
        assert_eq!(scanned_keys(&index), vec![1, 2, 3]);
    }

    #[test]
    fn test_empty_build_then_inserts() {
        let temp_dir = TempDir::new().unwrap();
        let index = LsmIndex::build(test_config(&temp_dir), &MemHeap::new("empty")).unwrap();

        assert_eq!(index.stats().insert_count, 0);
        assert!(index.scan_all().unwrap().is_empty());

        index
            .insert(7u64, "", RowRef::new(0, 0), UniqueCheck::No)
            .unwrap();
        assert!(index.contains(&IndexKey::from(7u64)).unwrap());

        index.merge_now().unwrap();
        assert_eq!(index.stats().base_entries, 1);
    }

    #[test]
    fn test_double_build_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);

        let _index = LsmIndex::build(config.clone(), &heap_of(&[1])).unwrap();
        let result = LsmIndex::build(config, &heap_of(&[2]));
        assert!(matches!(result, Err(LsmError::IndexAlreadyExists(_))));
    }

    #[test]
    fn test_open_missing_index() {
        let temp_dir = TempDir::new().unwrap();
        let result = LsmIndex::open(test_config(&temp_dir));
        assert!(matches!(result, Err(LsmError::IndexNotFound(_))));
    }

    #[test]
    fn test_unique_build_rejects_duplicates() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(&temp_dir);
        config.unique = true;

        let mut heap = MemHeap::new("orders");
        heap.push(IndexEntry::new(1u64, "", RowRef::new(0, 0)));
        heap.push(IndexEntry::new(1u64, "", RowRef::new(0, 1)));

        let result = LsmIndex::build(config.clone(), &heap);
        assert!(matches!(result, Err(LsmError::Build(_))));

        // Nothing visible after the failed build
        assert!(matches!(
            LsmIndex::open(config),
            Err(LsmError::IndexNotFound(_))
        ));
    }

    #[test]
    fn test_unique_insert_enforcement() {
        let temp_dir = TempDir::new().unwrap();
        let index = LsmIndex::build(test_config(&temp_dir), &heap_of(&[1, 3])).unwrap();

        // Same key in the base, different row
        let result = index.insert(1u64, "", RowRef::new(9, 9), UniqueCheck::Enforce);
        assert!(matches!(result, Err(LsmError::Insert(_))));

        // Exact (key, row) re-insert is idempotent, not an error
        assert!(!index
            .insert(1u64, "r1", RowRef::new(0, 0), UniqueCheck::Enforce)
            .unwrap());
        assert_eq!(index.stats().insert_count, 2);

        // Rejected insert wrote nothing
        assert_eq!(index.stats().top_entries, 0);
    }

    #[test]
    fn test_non_unique_keys_across_layers() {
        let temp_dir = TempDir::new().unwrap();
        let index = LsmIndex::build(test_config(&temp_dir), &heap_of(&[5])).unwrap();

        index
            .insert(5u64, "dup", RowRef::new(7, 1), UniqueCheck::No)
            .unwrap();

        let rows = index.lookup(&IndexKey::from(5u64)).unwrap();
        assert_eq!(rows.len(), 2);

        index.merge_now().unwrap();
        let rows = index.lookup(&IndexKey::from(5u64)).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_union_preserved_across_merges() {
        let temp_dir = TempDir::new().unwrap();
        let keys: Vec<u64> = (0..100).map(|i| i * 2).collect();
        let index = LsmIndex::build(test_config(&temp_dir), &heap_of(&keys)).unwrap();

        for i in 0..100u64 {
            index
                .insert(i * 2 + 1, "", RowRef::new(50, i as u16), UniqueCheck::No)
                .unwrap();
        }

        index.merge_now().unwrap();

        let scanned = scanned_keys(&index);
        assert_eq!(scanned, (0..200).collect::<Vec<u64>>());
        assert_eq!(index.stats().base_entries, 200);
    }

    #[test]
    fn test_reopen_recovers_top_and_counter() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);

        {
            let index = LsmIndex::build(config.clone(), &heap_of(&[10, 20])).unwrap();
            index
                .insert(15u64, "v", RowRef::new(3, 3), UniqueCheck::No)
                .unwrap();
            index.sync().unwrap();
        }

        let index = LsmIndex::open(config).unwrap();
        let stats = index.stats();
        assert_eq!(stats.insert_count, 3);
        assert_eq!(stats.top_entries, 1);
        assert_eq!(scanned_keys(&index), vec![10, 15, 20]);
    }

    #[test]
    fn test_rejected_reinsert_not_counted_after_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);

        {
            let index = LsmIndex::build(config.clone(), &MemHeap::new("t")).unwrap();
            assert!(index
                .insert(1u64, "v", RowRef::new(0, 0), UniqueCheck::No)
                .unwrap());
            assert!(!index
                .insert(1u64, "v", RowRef::new(0, 0), UniqueCheck::No)
                .unwrap());
            assert_eq!(index.stats().insert_count, 1);
            index.sync().unwrap();
        }

        // The rejected re-insert must not resurface in the recovered count
        let index = LsmIndex::open(config).unwrap();
        let stats = index.stats();
        assert_eq!(stats.insert_count, 1);
        assert_eq!(stats.top_entries, 1);
        assert_eq!(scanned_keys(&index), vec![1]);
    }

    #[test]
    fn test_reopen_after_merge() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);

        {
            let index = LsmIndex::build(config.clone(), &heap_of(&[1, 2])).unwrap();
            index
                .insert(3u64, "", RowRef::new(1, 0), UniqueCheck::No)
                .unwrap();
            index.merge_now().unwrap();
        }

        let index = LsmIndex::open(config).unwrap();
        let stats = index.stats();
        assert_eq!(stats.insert_count, 0);
        assert_eq!(stats.base_entries, 3);
        assert_eq!(scanned_keys(&index), vec![1, 2, 3]);
    }

    #[test]
    fn test_insert_threshold_triggers_background_merge() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(&temp_dir);
        config.merge.insert_threshold = 10;

        let index = LsmIndex::build(config, &MemHeap::new("t")).unwrap();
        for i in 0..10u64 {
            index
                .insert(i, "", RowRef::new(0, i as u16), UniqueCheck::No)
                .unwrap();
        }

        // Background merge; wait for it to land
        for _ in 0..200 {
            if index.stats().base_entries == 10 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(index.stats().base_entries, 10);
        assert_eq!(index.stats().insert_count, 0);
    }

    #[test]
    fn test_concurrent_inserts_count_exactly() {
        let temp_dir = TempDir::new().unwrap();
        let index = Arc::new(
            LsmIndex::build(test_config(&temp_dir), &MemHeap::new("t")).unwrap(),
        );

        let mut handles = Vec::new();
        for t in 0..4u32 {
            let index = Arc::clone(&index);
            handles.push(std::thread::spawn(move || {
                for i in 0..50u16 {
                    index
                        .insert(
                            u64::from(t) * 1000 + u64::from(i),
                            "",
                            RowRef::new(t, i),
                            UniqueCheck::No,
                        )
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(index.stats().insert_count, 200);
        assert_eq!(index.scan_all().unwrap().len(), 200);
    }

    #[test]
    fn test_inserts_during_merge_are_never_lost() {
        let temp_dir = TempDir::new().unwrap();
        let keys: Vec<u64> = (0..30_000).map(|i| i * 2).collect();
        let index = Arc::new(LsmIndex::build(test_config(&temp_dir), &heap_of(&keys)).unwrap());

        // Give the merge something to fold
        index
            .insert(1u64, "", RowRef::new(999, 0), UniqueCheck::No)
            .unwrap();

        let merger = {
            let index = Arc::clone(&index);
            std::thread::spawn(move || index.merge_now().unwrap())
        };
        for i in 0..200u64 {
            index
                .insert(60_001 + i, "", RowRef::new(500, i as u16), UniqueCheck::No)
                .unwrap();
        }
        merger.join().unwrap();
        index.merge_now().unwrap();

        // Every base key and every insert accepted while merging survives
        assert_eq!(index.scan_all().unwrap().len(), 30_000 + 1 + 200);
        for i in 0..200u64 {
            assert!(index.contains(&IndexKey::from(60_001 + i)).unwrap());
        }
    }

    #[test]
    fn test_readers_see_full_union_during_merge() {
        use std::sync::atomic::AtomicBool;

        let temp_dir = TempDir::new().unwrap();
        let keys: Vec<u64> = (0..5_000).map(|i| i * 2).collect();
        let index = Arc::new(LsmIndex::build(test_config(&temp_dir), &heap_of(&keys)).unwrap());

        for i in 0..500u64 {
            index
                .insert(10_001 + i * 2, "", RowRef::new(600, i as u16), UniqueCheck::No)
                .unwrap();
        }
        let total = 5_000 + 500;

        // Readers hammer the index while the swap happens underneath them
        let done = Arc::new(AtomicBool::new(false));
        let mut readers = Vec::new();
        for _ in 0..3 {
            let index = Arc::clone(&index);
            let done = Arc::clone(&done);
            readers.push(std::thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    assert_eq!(index.scan_all().unwrap().len(), total);
                    assert!(index.contains(&IndexKey::from(0u64)).unwrap());
                    assert!(index.contains(&IndexKey::from(10_001u64)).unwrap());
                }
            }));
        }

        index.merge_now().unwrap();
        done.store(true, Ordering::Release);
        for handle in readers {
            handle.join().unwrap();
        }

        assert_eq!(index.stats().base_entries, total);
        assert_eq!(index.scan_all().unwrap().len(), total);
    }

    #[test]
    fn test_interrupted_merge_resumes_on_open() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);

        {
            let index = LsmIndex::build(config.clone(), &heap_of(&[1, 2])).unwrap();
            index
                .insert(3u64, "", RowRef::new(1, 0), UniqueCheck::No)
                .unwrap();
            index.sync().unwrap();
        }

        // Crash after the rotation persisted but before the merge ran
        {
            let dict = crate::dict::Dictionary::open(&config.data_dir).unwrap();
            dict.begin_merge(5).unwrap();
        }

        let index = LsmIndex::open(config).unwrap();
        for _ in 0..200 {
            if index.stats().sealed_top_id.is_none() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        let stats = index.stats();
        assert_eq!(stats.sealed_top_id, None);
        assert_eq!(stats.base_entries, 3);
        assert_eq!(stats.insert_count, 0);
        assert_eq!(scanned_keys(&index), vec![1, 2, 3]);
    }

    #[test]
    fn test_old_base_file_removed_after_merge() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);
        let index = LsmIndex::build(config.clone(), &heap_of(&[1])).unwrap();

        let old_seg = config.data_dir.join(segment_file_name(1));
        assert!(old_seg.exists());

        index
            .insert(2u64, "", RowRef::new(0, 0), UniqueCheck::No)
            .unwrap();
        index.merge_now().unwrap();

        assert!(!old_seg.exists());
        let stats = index.stats();
        assert!(config
            .data_dir
            .join(segment_file_name(stats.base_id))
            .exists());
    }

    #[test]
    fn test_merge_now_on_empty_top_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let index = LsmIndex::build(test_config(&temp_dir), &heap_of(&[1])).unwrap();

        let epoch_before = index.stats().epoch;
        assert!(index.merge_now().unwrap());
        assert_eq!(index.stats().epoch, epoch_before);
        assert_eq!(index.stats().base_id, 1);
    }

    #[test]
    fn test_orphan_segment_removed_on_open() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);

        {
            LsmIndex::build(config.clone(), &heap_of(&[1])).unwrap();
        }

        // A crashed merge leaves a segment the dictionary never adopted
        let orphan = config.data_dir.join(segment_file_name(99));
        std::fs::write(&orphan, b"partial").unwrap();

        let index = LsmIndex::open(config).unwrap();
        assert!(!orphan.exists());
        assert_eq!(scanned_keys(&index), vec![1]);
    }
}
