use crate::error::Result;
use crate::input::LocalBatch;
use crate::table::{EmbeddingValueStore, Entry, KeyValueShard};
use crate::types::{Combiner, HashKey, RowIndex, SlotId};
use tracing::warn;

/// Resolved form of a [`LocalBatch`]: every surviving key replaced by its row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexedBatch {
    /// CSR offsets over `value_indices`, one bucket per output vector.
    pub row_offsets: Vec<usize>,
    pub value_indices: Vec<RowIndex>,
    /// Bucket each resolved key came from; the gradient row it reads in backward.
    pub sample_ids: Vec<usize>,
    pub slot_ids: Vec<SlotId>,
    /// Original bag length per bucket, dropped keys included.
    pub bag_lengths: Vec<usize>,
}

impl IndexedBatch {
    pub fn num_buckets(&self) -> usize {
        self.bag_lengths.len()
    }

    pub fn nnz(&self) -> usize {
        self.value_indices.len()
    }

    /// Per-bucket divisors for `combiner`; `None` means plain sums.
    pub fn divisors(&self, combiner: Combiner) -> Option<Vec<f32>> {
        match combiner {
            Combiner::Sum => None,
            Combiner::Mean => Some(self.bag_lengths.iter().map(|&n| n as f32).collect()),
        }
    }
}

/// Key to row resolution for one table on one device.
#[derive(Debug, Clone, Copy)]
pub struct IndexingPipeline {
    pub seed: u64,
    pub is_train: bool,
}

impl IndexingPipeline {
    pub fn new(seed: u64, is_train: bool) -> Self {
        Self { seed, is_train }
    }

    /// Resolves every key of `batch`.
    ///
    /// Training inserts unseen keys and initialises their rows; evaluation drops
    /// them, so they contribute nothing to the output.
    pub fn run<K: HashKey>(
        &self,
        batch: &LocalBatch<K>,
        table: &mut KeyValueShard<K>,
        store: &mut EmbeddingValueStore,
    ) -> Result<IndexedBatch> {
        let mut indexed = IndexedBatch {
            row_offsets: Vec::with_capacity(batch.num_buckets() + 1),
            value_indices: Vec::with_capacity(batch.keys.len()),
            sample_ids: Vec::with_capacity(batch.keys.len()),
            slot_ids: Vec::with_capacity(batch.keys.len()),
            bag_lengths: batch.bag_lengths.clone(),
        };
        indexed.row_offsets.push(0);

        let mut dropped = 0usize;
        for (b, &slot) in batch.bucket_slots.iter().enumerate() {
            for &key in batch.bucket(b) {
                let row = if self.is_train {
                    Some(self.resolve(key, slot, table, store)?)
                } else {
                    table.lookup(key)
                };
                match row {
                    Some(row) => {
                        indexed.value_indices.push(row);
                        indexed.sample_ids.push(b);
                        indexed.slot_ids.push(slot);
                    }
                    None => dropped += 1,
                }
            }
            indexed.row_offsets.push(indexed.value_indices.len());
        }

        if dropped > 0 {
            warn!(dropped, "unknown keys skipped during evaluation");
        }
        Ok(indexed)
    }

    /// Inserts every key of `batch` without producing an index. Replicas of a
    /// data-parallel table call this on the whole batch so they grow in lockstep.
    pub fn register<K: HashKey>(
        &self,
        batch: &LocalBatch<K>,
        table: &mut KeyValueShard<K>,
        store: &mut EmbeddingValueStore,
    ) -> Result<()> {
        if !self.is_train {
            return Ok(());
        }
        for (b, &slot) in batch.bucket_slots.iter().enumerate() {
            for &key in batch.bucket(b) {
                self.resolve(key, slot, table, store)?;
            }
        }
        Ok(())
    }

    fn resolve<K: HashKey>(
        &self,
        key: K,
        slot: SlotId,
        table: &mut KeyValueShard<K>,
        store: &mut EmbeddingValueStore,
    ) -> Result<RowIndex> {
        let row = match table.insert_or_lookup(key)? {
            Entry::Inserted(row) => {
                store.init_row(row, self.seed, key);
                row
            }
            Entry::Existing(row) => row,
        };
        store.set_slot_id(row, slot);
        Ok(row)
    }
}
