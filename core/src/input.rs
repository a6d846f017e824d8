//! Minibatch keys in CSR form, and the per-device views cut from them.

use crate::error::{EmbeddingError, Result};
use crate::sharding::shard_of_key;
use crate::types::{HashKey, SlotId};

/// Keys of one table for a whole minibatch.
///
/// Buckets are sample-major: bucket `sample * slot_num + slot` holds the bag
/// `keys[row_offsets[b]..row_offsets[b + 1]]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseInput<K: HashKey> {
    batch_size: usize,
    slot_num: usize,
    row_offsets: Vec<usize>,
    keys: Vec<K>,
}

impl<K: HashKey> SparseInput<K> {
    pub fn new(
        batch_size: usize,
        slot_num: usize,
        row_offsets: Vec<usize>,
        keys: Vec<K>,
    ) -> Result<Self> {
        let num_buckets = batch_size * slot_num;
        if row_offsets.len() != num_buckets + 1 {
            return Err(EmbeddingError::ShapeMismatch {
                expected: vec![num_buckets + 1],
                got: vec![row_offsets.len()],
            });
        }
        if row_offsets[0] != 0 || row_offsets.windows(2).any(|w| w[0] > w[1]) {
            return Err(EmbeddingError::InvalidInput(
                "row offsets must start at 0 and never decrease".to_string(),
            ));
        }
        if row_offsets[num_buckets] != keys.len() {
            return Err(EmbeddingError::ShapeMismatch {
                expected: vec![row_offsets[num_buckets]],
                got: vec![keys.len()],
            });
        }
        Ok(Self {
            batch_size,
            slot_num,
            row_offsets,
            keys,
        })
    }

    /// Builds the CSR arrays from one bag per bucket, in bucket order.
    pub fn from_bags(batch_size: usize, slot_num: usize, bags: &[Vec<K>]) -> Result<Self> {
        if bags.len() != batch_size * slot_num {
            return Err(EmbeddingError::ShapeMismatch {
                expected: vec![batch_size, slot_num],
                got: vec![bags.len()],
            });
        }
        let mut row_offsets = Vec::with_capacity(bags.len() + 1);
        row_offsets.push(0);
        let mut keys = Vec::new();
        for bag in bags {
            keys.extend_from_slice(bag);
            row_offsets.push(keys.len());
        }
        Self::new(batch_size, slot_num, row_offsets, keys)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn slot_num(&self) -> usize {
        self.slot_num
    }

    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    pub fn bag(&self, sample: usize, slot: SlotId) -> &[K] {
        let b = sample * self.slot_num + slot;
        &self.keys[self.row_offsets[b]..self.row_offsets[b + 1]]
    }

    /// Device view for localized slots: every sample, only the slots pinned to
    /// `device`, padded to `ceil(slot_num / num_devices)` local slots.
    pub fn localized_slice(&self, device: usize, num_devices: usize) -> LocalBatch<K> {
        let local_slots = self.slot_num.div_ceil(num_devices);
        let mut batch = LocalBatch::with_shape(self.batch_size, local_slots);
        for sample in 0..self.batch_size {
            for local in 0..local_slots {
                let slot = local * num_devices + device;
                if slot < self.slot_num {
                    let bag = self.bag(sample, slot);
                    batch.push_bucket(slot, bag.iter().copied(), bag.len());
                } else {
                    batch.push_bucket(slot, std::iter::empty(), 0);
                }
            }
        }
        batch
    }

    /// Device view for key-distributed tables: every sample and slot, only the
    /// keys owned by `device`. Bag lengths still count every key of the bag.
    pub fn distributed_slice(&self, device: usize, num_devices: usize) -> LocalBatch<K> {
        let mut batch = LocalBatch::with_shape(self.batch_size, self.slot_num);
        for sample in 0..self.batch_size {
            for slot in 0..self.slot_num {
                let bag = self.bag(sample, slot);
                let owned = bag
                    .iter()
                    .copied()
                    .filter(|&k| shard_of_key(k, num_devices) == device);
                batch.push_bucket(slot, owned, bag.len());
            }
        }
        batch
    }

    /// Device view for data-parallel tables: the device's contiguous block of
    /// `batch_size / num_devices` samples, every slot.
    pub fn sample_slice(&self, device: usize, num_devices: usize) -> LocalBatch<K> {
        let per_device = self.batch_size / num_devices;
        let mut batch = LocalBatch::with_shape(per_device, self.slot_num);
        for sample in device * per_device..(device + 1) * per_device {
            for slot in 0..self.slot_num {
                let bag = self.bag(sample, slot);
                batch.push_bucket(slot, bag.iter().copied(), bag.len());
            }
        }
        batch
    }

    /// The whole batch as one view.
    pub fn full_slice(&self) -> LocalBatch<K> {
        self.sample_slice(0, 1)
    }
}

/// The buckets one device resolves and reduces, in output order.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalBatch<K: HashKey> {
    pub num_samples: usize,
    pub num_slots: usize,
    pub row_offsets: Vec<usize>,
    pub keys: Vec<K>,
    /// Global slot of every bucket.
    pub bucket_slots: Vec<SlotId>,
    /// Length of the original bag behind every bucket.
    pub bag_lengths: Vec<usize>,
}

impl<K: HashKey> LocalBatch<K> {
    fn with_shape(num_samples: usize, num_slots: usize) -> Self {
        let buckets = num_samples * num_slots;
        let mut row_offsets = Vec::with_capacity(buckets + 1);
        row_offsets.push(0);
        Self {
            num_samples,
            num_slots,
            row_offsets,
            keys: Vec::new(),
            bucket_slots: Vec::with_capacity(buckets),
            bag_lengths: Vec::with_capacity(buckets),
        }
    }

    fn push_bucket(&mut self, slot: SlotId, keys: impl Iterator<Item = K>, bag_length: usize) {
        self.keys.extend(keys);
        self.row_offsets.push(self.keys.len());
        self.bucket_slots.push(slot);
        self.bag_lengths.push(bag_length);
    }

    pub fn num_buckets(&self) -> usize {
        self.bucket_slots.len()
    }

    pub fn bucket(&self, b: usize) -> &[K] {
        &self.keys[self.row_offsets[b]..self.row_offsets[b + 1]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> SparseInput<u64> {
        // 2 samples x 3 slots
        let bags = vec![vec![1, 2], vec![3], vec![], vec![4], vec![5, 6, 7], vec![8]];
        SparseInput::from_bags(2, 3, &bags).unwrap()
    }

    #[test]
    fn test_from_bags() {
        let input = input();
        assert_eq!(input.bag(0, 0), &[1, 2]);
        assert_eq!(input.bag(1, 1), &[5, 6, 7]);
        assert!(input.bag(0, 2).is_empty());
        assert_eq!(input.keys().len(), 8);
    }

    #[test]
    fn test_new_rejects_bad_offsets() {
        let decreasing = SparseInput::<u32>::new(1, 2, vec![0, 2, 1], vec![1]);
        assert!(decreasing.is_err());
        assert!(SparseInput::<u32>::new(1, 2, vec![0, 1], vec![1]).is_err());
        assert!(SparseInput::<u32>::new(1, 1, vec![0, 2], vec![1]).is_err());
    }

    #[test]
    fn test_localized_slice_pads() {
        let batch = input().localized_slice(1, 2);
        // device 1 owns slot 1 plus one padding slot, for both samples
        assert_eq!(batch.num_slots, 2);
        assert_eq!(batch.bucket_slots, vec![1, 3, 1, 3]);
        assert_eq!(batch.bucket(0), &[3]);
        assert!(batch.bucket(1).is_empty());
        assert_eq!(batch.bucket(2), &[5, 6, 7]);
        assert_eq!(batch.bag_lengths, vec![1, 0, 3, 0]);
    }

    #[test]
    fn test_distributed_slice_keeps_bag_lengths() {
        let batch = input().distributed_slice(0, 2);
        assert_eq!(batch.num_buckets(), 6);
        assert_eq!(batch.bucket(0), &[2]);
        assert_eq!(batch.bag_lengths[0], 2);
        assert_eq!(batch.bucket(4), &[6]);
        assert_eq!(batch.bag_lengths[4], 3);
    }

    #[test]
    fn test_sample_slice() {
        let batch = input().sample_slice(1, 2);
        assert_eq!(batch.num_samples, 1);
        assert_eq!(batch.bucket(0), &[4]);
        assert_eq!(batch.bucket_slots, vec![0, 1, 2]);
        assert_eq!(input().full_slice().num_buckets(), 6);
    }
}
