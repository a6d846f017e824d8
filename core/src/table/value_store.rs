use crate::error::{EmbeddingError, Result};
use crate::types::{HashKey, RowIndex, SlotId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Dense row arena of one shard, plus the slot each row was last seen in.
///
/// Sized for the shard's full capacity up front; rows are addressed by the
/// [`RowIndex`] handed out by the owning [`KeyValueShard`](super::KeyValueShard).
#[derive(Debug, Clone)]
pub struct EmbeddingValueStore {
    vec_size: usize,
    capacity: usize,
    values: Vec<f32>,
    slot_ids: Vec<SlotId>,
}

impl EmbeddingValueStore {
    pub fn new(capacity: usize, vec_size: usize) -> Self {
        Self {
            vec_size,
            capacity,
            values: vec![0.0; capacity * vec_size],
            slot_ids: vec![0; capacity],
        }
    }

    pub fn vec_size(&self) -> usize {
        self.vec_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The whole arena, `[capacity, vec_size]`.
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn row(&self, row: RowIndex) -> &[f32] {
        &self.values[row * self.vec_size..(row + 1) * self.vec_size]
    }

    pub fn row_mut(&mut self, row: RowIndex) -> &mut [f32] {
        &mut self.values[row * self.vec_size..(row + 1) * self.vec_size]
    }

    pub fn set_row(&mut self, row: RowIndex, values: &[f32]) -> Result<()> {
        if values.len() != self.vec_size {
            return Err(EmbeddingError::ShapeMismatch {
                expected: vec![self.vec_size],
                got: vec![values.len()],
            });
        }
        self.check_row(row)?;
        self.row_mut(row).copy_from_slice(values);
        Ok(())
    }

    pub fn slot_id(&self, row: RowIndex) -> SlotId {
        self.slot_ids[row]
    }

    pub fn set_slot_id(&mut self, row: RowIndex, slot: SlotId) {
        self.slot_ids[row] = slot;
    }

    /// Fills `row` with values uniform in `(-1/vec_size, 1/vec_size)`.
    ///
    /// The generator is seeded from the table seed and the key alone, so any
    /// replica that inserts the same key produces the same row.
    pub fn init_row<K: HashKey>(&mut self, row: RowIndex, table_seed: u64, key: K) {
        let bound = 1.0 / self.vec_size as f32;
        let mut rng = StdRng::seed_from_u64(row_seed(table_seed, key));
        for v in self.row_mut(row) {
            *v = rng.random_range(-bound..bound);
        }
    }

    fn check_row(&self, row: RowIndex) -> Result<()> {
        if row >= self.capacity {
            return Err(EmbeddingError::InvalidInput(format!(
                "row {row} is outside a store of {} rows",
                self.capacity
            )));
        }
        Ok(())
    }
}

fn row_seed<K: HashKey>(table_seed: u64, key: K) -> u64 {
    table_seed ^ key.as_u64().wrapping_mul(0x9e37_79b9_7f4a_7c15)
}
