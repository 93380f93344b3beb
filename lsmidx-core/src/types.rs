//! Core types for lsmidx

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index key: opaque bytes compared in memcmp order
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexKey(Vec<u8>);

impl IndexKey {
    /// Create a key from raw bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Key length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[u8]> for IndexKey {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<Vec<u8>> for IndexKey {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&str> for IndexKey {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<u64> for IndexKey {
    /// Big-endian encoding so byte order matches numeric order
    fn from(v: u64) -> Self {
        Self(v.to_be_bytes().to_vec())
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| !c.is_control()) => write!(f, "{}", s),
            _ => {
                for b in &self.0 {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

/// Reference to a row in the indexed table (heap tuple address)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RowRef {
    /// Heap page number
    pub page: u32,
    /// Slot within the page
    pub slot: u16,
}

impl RowRef {
    /// Create a new row reference
    pub fn new(page: u32, slot: u16) -> Self {
        Self { page, slot }
    }

    /// Smallest possible row reference
    pub const MIN: RowRef = RowRef { page: 0, slot: 0 };

    /// Largest possible row reference
    pub const MAX: RowRef = RowRef {
        page: u32::MAX,
        slot: u16::MAX,
    };
}

impl fmt::Display for RowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.page, self.slot)
    }
}

/// One index tuple: key, optional covering payload, and row address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Ordered key bytes
    pub key: IndexKey,
    /// Covering payload stored alongside the key (may be empty)
    pub value: Vec<u8>,
    /// Address of the indexed row
    pub row: RowRef,
}

impl IndexEntry {
    /// Create a new index entry
    pub fn new(key: impl Into<IndexKey>, value: impl Into<Vec<u8>>, row: RowRef) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            row,
        }
    }

    /// Approximate size in bytes
    pub fn size(&self) -> usize {
        self.key.len() + self.value.len() + 6
    }
}

/// Uniqueness policy for a single insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueCheck {
    /// Accept duplicate keys
    No,
    /// Reject an insert whose key is already present in any layer
    Enforce,
}

/// Opaque reference to the indexed table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapRef(String);

impl HeapRef {
    /// Create a heap reference
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Reference as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HeapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Host table boundary: a full scan of the indexed rows
///
/// The scan may yield entries in any order; the build path sorts them.
pub trait HeapSource {
    /// Reference recorded in the dictionary entry
    fn heap_ref(&self) -> HeapRef;

    /// Full scan producing one index entry per indexed row
    fn scan(&self) -> Result<Box<dyn Iterator<Item = Result<IndexEntry>> + '_>>;
}

/// In-memory heap source for tests and tooling
pub struct MemHeap {
    heap_ref: HeapRef,
    rows: Vec<IndexEntry>,
}

impl MemHeap {
    /// Create an empty heap
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            heap_ref: HeapRef::new(name),
            rows: Vec::new(),
        }
    }

    /// Add a row
    pub fn push(&mut self, entry: IndexEntry) {
        self.rows.push(entry);
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl HeapSource for MemHeap {
    fn heap_ref(&self) -> HeapRef {
        self.heap_ref.clone()
    }

    fn scan(&self) -> Result<Box<dyn Iterator<Item = Result<IndexEntry>> + '_>> {
        Ok(Box::new(self.rows.iter().cloned().map(Ok)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ordering() {
        let a = IndexKey::from(1u64);
        let b = IndexKey::from(2u64);
        let c = IndexKey::from(256u64);

        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_row_ref_ordering() {
        let a = RowRef::new(1, 5);
        let b = RowRef::new(1, 6);
        let c = RowRef::new(2, 0);

        assert!(a < b);
        assert!(b < c);
        assert!(RowRef::MIN < a);
        assert!(c < RowRef::MAX);
    }

    #[test]
    fn test_mem_heap_scan() {
        let mut heap = MemHeap::new("orders");
        heap.push(IndexEntry::new("b", "", RowRef::new(0, 2)));
        heap.push(IndexEntry::new("a", "", RowRef::new(0, 1)));

        let scanned: Vec<_> = heap.scan().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[0].key, IndexKey::from("b"));
        assert_eq!(heap.heap_ref().as_str(), "orders");
    }
}
