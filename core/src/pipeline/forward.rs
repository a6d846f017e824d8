use super::indexing::IndexedBatch;
use crate::error::Result;
use crate::table::EmbeddingValueStore;
use crate::types::Combiner;
use sparse_embedding_kernels::cpu_bag_reduce;

/// Combines the rows of every bucket into one vector.
#[derive(Debug, Clone, Copy)]
pub struct ForwardReductionStage {
    pub combiner: Combiner,
}

impl ForwardReductionStage {
    pub fn new(combiner: Combiner) -> Self {
        Self { combiner }
    }

    /// Returns `[num_buckets, vec_size]`. Empty bags produce zeros.
    pub fn run(&self, indexed: &IndexedBatch, store: &EmbeddingValueStore) -> Result<Vec<f32>> {
        let divisors = indexed.divisors(self.combiner);
        let out = cpu_bag_reduce(
            store.values(),
            store.vec_size(),
            &indexed.row_offsets,
            &indexed.value_indices,
            divisors.as_deref(),
        )?;
        Ok(out)
    }
}
