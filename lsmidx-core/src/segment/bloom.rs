//! Bloom filter for fast key existence checks

use crate::IndexKey;
use std::hash::{Hash, Hasher};

/// Bloom filter over the distinct keys of a segment
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: usize,
    num_hashes: usize,
}

impl BloomFilter {
    /// Create a new bloom filter sized for `num_keys` keys
    pub fn new(num_keys: usize, bits_per_key: usize) -> Self {
        let num_bits = num_keys.max(1) * bits_per_key;
        let num_bytes = (num_bits + 7) / 8;

        // Optimal number of hash functions
        let num_hashes = ((bits_per_key as f64) * 0.69).round() as usize;
        let num_hashes = num_hashes.clamp(1, 30);

        Self {
            bits: vec![0u8; num_bytes],
            num_bits,
            num_hashes,
        }
    }

    /// Create from existing data
    pub fn from_bytes(data: Vec<u8>, num_hashes: usize) -> Self {
        let num_bits = data.len() * 8;
        Self {
            bits: data,
            num_bits,
            num_hashes,
        }
    }

    /// Derive the double-hashing pair for a key
    pub fn hash_key(key: &IndexKey) -> (u64, u64) {
        let mut hasher1 = std::collections::hash_map::DefaultHasher::new();
        key.as_bytes().hash(&mut hasher1);
        let h1 = hasher1.finish();

        // Use a different seed for second hash
        let mut hasher2 = std::collections::hash_map::DefaultHasher::new();
        h1.hash(&mut hasher2);
        let h2 = hasher2.finish();

        (h1, h2)
    }

    /// Add a key to the filter
    pub fn add(&mut self, key: &IndexKey) {
        let (h1, h2) = Self::hash_key(key);
        self.add_hash(h1, h2);
    }

    /// Add a precomputed hash pair to the filter
    pub fn add_hash(&mut self, h1: u64, h2: u64) {
        for i in 0..self.num_hashes {
            let bit = self.bit_position(h1, h2, i);
            self.set_bit(bit);
        }
    }

    /// Check if a key may be in the set
    pub fn may_contain(&self, key: &IndexKey) -> bool {
        let (h1, h2) = Self::hash_key(key);

        for i in 0..self.num_hashes {
            let bit = self.bit_position(h1, h2, i);
            if !self.get_bit(bit) {
                return false;
            }
        }

        true
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Get number of hash functions
    pub fn num_hashes(&self) -> usize {
        self.num_hashes
    }

    fn bit_position(&self, h1: u64, h2: u64, i: usize) -> usize {
        let hash = h1.wrapping_add((i as u64).wrapping_mul(h2));
        (hash as usize) % self.num_bits
    }

    fn set_bit(&mut self, bit: usize) {
        let byte = bit / 8;
        let offset = bit % 8;
        if byte < self.bits.len() {
            self.bits[byte] |= 1 << offset;
        }
    }

    fn get_bit(&self, bit: usize) -> bool {
        let byte = bit / 8;
        let offset = bit % 8;
        if byte < self.bits.len() {
            (self.bits[byte] >> offset) & 1 == 1
        } else {
            false
        }
    }
}
