use crate::checkpoint::CheckpointRecord;
use crate::error::{EmbeddingError, Result};
use crate::optim::OptimizerUpdateEngine;
use crate::params::OptimizerParams;
use crate::pipeline::{AggregationPlan, IndexedBatch, Wgrad};
use crate::table::{EmbeddingValueStore, KeyValueShard};
use crate::types::HashKey;

/// Everything one device owns for one table.
///
/// No other device reads or writes these fields; data only leaves through the
/// exchange buffers of the owning [`GroupedEmbedding`](super::GroupedEmbedding).
#[derive(Debug, Clone)]
pub struct DeviceShard<K: HashKey> {
    device: usize,
    table: KeyValueShard<K>,
    store: EmbeddingValueStore,
    optimizer: OptimizerUpdateEngine,
    pub(crate) indexed: Option<IndexedBatch>,
    pub(crate) plan: Option<AggregationPlan>,
    /// Local forward output before exchange, or final output for data-parallel tables.
    pub(crate) output: Vec<f32>,
    /// Gradient w.r.t. `indexed` buckets, once it has reached this device.
    pub(crate) local_grad: Option<Vec<f32>>,
    pub(crate) wgrad: Option<Wgrad<K>>,
}

impl<K: HashKey> DeviceShard<K> {
    pub fn new(
        device: usize,
        capacity: usize,
        vec_size: usize,
        optimizer: OptimizerParams,
    ) -> Result<Self> {
        Ok(Self {
            device,
            table: KeyValueShard::new(capacity),
            store: EmbeddingValueStore::new(capacity, vec_size),
            optimizer: OptimizerUpdateEngine::new(optimizer, capacity, vec_size)?,
            indexed: None,
            plan: None,
            output: Vec::new(),
            local_grad: None,
            wgrad: None,
        })
    }

    pub fn device(&self) -> usize {
        self.device
    }

    pub fn table(&self) -> &KeyValueShard<K> {
        &self.table
    }

    pub fn store(&self) -> &EmbeddingValueStore {
        &self.store
    }

    pub fn optimizer(&self) -> &OptimizerUpdateEngine {
        &self.optimizer
    }

    pub fn wgrad(&self) -> Option<&Wgrad<K>> {
        self.wgrad.as_ref()
    }

    /// Current value of `key`, if resident here.
    pub fn row_of(&self, key: K) -> Option<&[f32]> {
        self.table.lookup(key).map(|row| self.store.row(row))
    }

    pub fn params_num(&self) -> usize {
        self.table.len() * self.store.vec_size()
    }

    pub(crate) fn parts_mut(&mut self) -> (&mut KeyValueShard<K>, &mut EmbeddingValueStore) {
        (&mut self.table, &mut self.store)
    }

    pub(crate) fn set_learning_rate(&mut self, learning_rate: f32) -> Result<()> {
        self.optimizer.set_learning_rate(learning_rate)
    }

    /// Consumes the pending gradient, if any. A gradient is applied at most once.
    pub(crate) fn apply_wgrad(&mut self) -> Result<()> {
        if let Some(wgrad) = self.wgrad.take() {
            self.optimizer.update(&wgrad, &mut self.store)?;
        }
        Ok(())
    }

    /// Inserts (or overwrites) one record.
    pub(crate) fn load_record(&mut self, record: &CheckpointRecord<K>) -> Result<()> {
        if record.vector.len() != self.store.vec_size() {
            return Err(EmbeddingError::ShapeMismatch {
                expected: vec![self.store.vec_size()],
                got: vec![record.vector.len()],
            });
        }
        let row = self.table.insert_or_lookup(record.key)?.row();
        self.store.set_row(row, &record.vector)?;
        self.store.set_slot_id(row, record.slot_id);
        Ok(())
    }

    /// Resident rows as records, in row order.
    pub(crate) fn dump_records(&self) -> Vec<CheckpointRecord<K>> {
        self.table
            .iter()
            .map(|(key, row)| CheckpointRecord {
                key,
                slot_id: self.store.slot_id(row),
                vector: self.store.row(row).to_vec(),
            })
            .collect()
    }

    pub(crate) fn clear_pass(&mut self) {
        self.indexed = None;
        self.plan = None;
        self.local_grad = None;
        self.wgrad = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_load_and_dump() {
        let mut shard = DeviceShard::<u64>::new(0, 4, 2, OptimizerParams::default()).unwrap();
        let record = CheckpointRecord {
            key: 5,
            slot_id: 3,
            vector: vec![1.0, 2.0],
        };

        shard.load_record(&record).unwrap();
        shard.load_record(&record).unwrap();

        assert_eq!(shard.params_num(), 2);
        assert_eq!(shard.row_of(5), Some(&[1.0, 2.0][..]));
        assert_eq!(shard.dump_records(), vec![record]);
    }

    #[test]
    fn test_record_width_checked() {
        let mut shard = DeviceShard::<u32>::new(0, 4, 2, OptimizerParams::default()).unwrap();
        let record = CheckpointRecord {
            key: 5,
            slot_id: 0,
            vector: vec![1.0],
        };
        assert!(shard.load_record(&record).is_err());
        assert!(shard.table().is_empty());
    }
}
