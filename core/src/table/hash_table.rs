use crate::error::{EmbeddingError, Result};
use crate::types::{HashKey, RowIndex};

/// Result of [`KeyValueShard::insert_or_lookup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    Existing(RowIndex),
    /// The key was new; its row must be initialised by the caller.
    Inserted(RowIndex),
}

impl Entry {
    pub fn row(self) -> RowIndex {
        match self {
            Entry::Existing(row) | Entry::Inserted(row) => row,
        }
    }
}

/// Per-device hash table from sparse feature key to row index.
///
/// Open addressing with linear probing over a power-of-two bucket array at least
/// twice the row capacity, so probes stay short even when the shard is full.
/// Rows are handed out in insertion order and never reclaimed.
#[derive(Debug, Clone)]
pub struct KeyValueShard<K: HashKey> {
    buckets: Vec<Option<(K, RowIndex)>>,
    keys: Vec<K>,
    capacity: usize,
    mask: usize,
}

impl<K: HashKey> KeyValueShard<K> {
    pub fn new(capacity: usize) -> Self {
        let num_buckets = (capacity.max(1) * 2).next_power_of_two();
        Self {
            buckets: vec![None; num_buckets],
            keys: Vec::with_capacity(capacity),
            capacity,
            mask: num_buckets - 1,
        }
    }

    /// Training-mode resolution: returns the key's row, inserting it if absent.
    pub fn insert_or_lookup(&mut self, key: K) -> Result<Entry> {
        let mut pos = self.home(key);
        loop {
            match self.buckets[pos] {
                Some((k, row)) if k == key => return Ok(Entry::Existing(row)),
                Some(_) => pos = (pos + 1) & self.mask,
                None => break,
            }
        }

        if self.keys.len() >= self.capacity {
            return Err(EmbeddingError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        let row = self.keys.len();
        self.buckets[pos] = Some((key, row));
        self.keys.push(key);
        Ok(Entry::Inserted(row))
    }

    /// Inference-mode resolution. Never inserts.
    pub fn lookup(&self, key: K) -> Option<RowIndex> {
        let mut pos = self.home(key);
        // The bucket array is never full, so an empty bucket always ends the probe.
        loop {
            match self.buckets[pos] {
                Some((k, row)) if k == key => return Some(row),
                Some(_) => pos = (pos + 1) & self.mask,
                None => return None,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Maximum number of distinct keys.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn key_at(&self, row: RowIndex) -> Option<K> {
        self.keys.get(row).copied()
    }

    /// Resident `(key, row)` pairs in row order.
    pub fn iter(&self) -> impl Iterator<Item = (K, RowIndex)> + '_ {
        self.keys.iter().copied().zip(0..)
    }

    #[inline]
    fn home(&self, key: K) -> usize {
        (mix64(key.as_u64()) as usize) & self.mask
    }
}

/// splitmix64 finaliser; spreads sequential ids across buckets.
#[inline]
fn mix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_then_lookup() {
        let mut shard = KeyValueShard::<u64>::new(4);

        assert_eq!(shard.insert_or_lookup(42).unwrap(), Entry::Inserted(0));
        assert_eq!(shard.insert_or_lookup(7).unwrap(), Entry::Inserted(1));
        assert_eq!(shard.insert_or_lookup(42).unwrap(), Entry::Existing(0));

        assert_eq!(shard.lookup(7), Some(1));
        assert_eq!(shard.lookup(8), None);
        assert_eq!(shard.len(), 2);
        assert_eq!(shard.key_at(1), Some(7));
        assert_eq!(shard.key_at(2), None);
    }

    #[test]
    fn test_lookup_does_not_insert() {
        let shard = KeyValueShard::<u32>::new(2);
        assert_eq!(shard.lookup(1), None);
        assert!(shard.is_empty());
    }

    #[test]
    fn test_capacity_exceeded() {
        let mut shard = KeyValueShard::<u32>::new(3);
        for key in 0..3 {
            shard.insert_or_lookup(key * 1000).unwrap();
        }
        // Existing keys still resolve on a full shard.
        assert_eq!(shard.insert_or_lookup(1000).unwrap(), Entry::Existing(1));

        let err = shard.insert_or_lookup(5).unwrap_err();
        assert!(matches!(
            err,
            EmbeddingError::CapacityExceeded { capacity: 3 }
        ));
        assert_eq!(shard.len(), 3);
    }

    #[test]
    fn test_iter_in_row_order() {
        let mut shard = KeyValueShard::<u64>::new(16);
        let keys = [9u64, 3, 27, 1 << 33];
        for &k in &keys {
            shard.insert_or_lookup(k).unwrap();
        }
        let seen: Vec<_> = shard.iter().collect();
        assert_eq!(seen, vec![(9, 0), (3, 1), (27, 2), (1 << 33, 3)]);
    }

    #[test]
    fn test_dense_fill_with_collisions() {
        let mut shard = KeyValueShard::<u64>::new(1000);
        for key in 0..1000u64 {
            let entry = shard.insert_or_lookup(key * 64).unwrap();
            assert_eq!(entry.row(), key as usize);
        }
        for key in 0..1000u64 {
            assert_eq!(shard.lookup(key * 64), Some(key as usize));
        }
    }
}
