use super::indexing::IndexedBatch;
use crate::error::{EmbeddingError, Result};
use crate::table::KeyValueShard;
use crate::types::{Combiner, HashKey, RowIndex};
use sparse_embedding_kernels::{
    cpu_radix_sort_pairs, cpu_run_length_encode, cpu_segment_sum, significant_bits, RunLength,
};

/// Deduplicated gradient of one table on one device.
#[derive(Debug, Clone, PartialEq)]
pub struct Wgrad<K: HashKey> {
    pub unique_keys: Vec<K>,
    pub rows: Vec<RowIndex>,
    pub table_ids: Vec<usize>,
    /// Offset of every key's gradient inside `data`.
    pub ev_start_indices: Vec<usize>,
    pub data: Vec<f32>,
    pub vec_size: usize,
}

impl<K: HashKey> Wgrad<K> {
    pub fn empty(vec_size: usize) -> Self {
        Self {
            unique_keys: Vec::new(),
            rows: Vec::new(),
            table_ids: Vec::new(),
            ev_start_indices: Vec::new(),
            data: Vec::new(),
            vec_size,
        }
    }

    pub(crate) fn push(&mut self, key: K, row: RowIndex, table_id: usize, grad: &[f32]) {
        self.unique_keys.push(key);
        self.rows.push(row);
        self.table_ids.push(table_id);
        self.ev_start_indices.push(self.data.len());
        self.data.extend_from_slice(grad);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn grad(&self, i: usize) -> &[f32] {
        let start = self.ev_start_indices[i];
        &self.data[start..start + self.vec_size]
    }

    /// Gradient of `key`, if the batch touched it.
    pub fn grad_of(&self, key: K) -> Option<&[f32]> {
        self.unique_keys
            .iter()
            .position(|&k| k == key)
            .map(|i| self.grad(i))
    }
}

/// Output of the index-calculation phase: (row, bucket) pairs sorted by row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregationPlan {
    pub run: RunLength,
    pub sorted_samples: Vec<u64>,
}

impl AggregationPlan {
    pub fn num_unique(&self) -> usize {
        self.run.len()
    }
}

/// Sort-by-row then segmented reduction of per-bucket gradients.
#[derive(Debug, Clone, Copy)]
pub struct GradientAggregationPipeline {
    pub combiner: Combiner,
    pub table_id: usize,
}

impl GradientAggregationPipeline {
    pub fn new(combiner: Combiner, table_id: usize) -> Self {
        Self { combiner, table_id }
    }

    /// Stable radix sort of `(row, bucket)` by row, then run-length encode.
    pub fn index_calculation(&self, indexed: &IndexedBatch) -> Result<AggregationPlan> {
        let rows: Vec<u64> = indexed.value_indices.iter().map(|&r| r as u64).collect();
        let samples: Vec<u64> = indexed.sample_ids.iter().map(|&s| s as u64).collect();
        let end_bit = significant_bits(&rows);
        let (sorted_rows, sorted_samples) = cpu_radix_sort_pairs(&rows, &samples, end_bit)?;
        let run = cpu_run_length_encode(&sorted_rows)?;
        Ok(AggregationPlan {
            run,
            sorted_samples,
        })
    }

    /// Sums the gradient rows of every segment. `top_grad` is `[num_buckets, vec_size]`.
    ///
    /// With [`Combiner::Mean`] every contribution is scaled by `1 / bag_length`
    /// of its bucket.
    pub fn local_reduce<K: HashKey>(
        &self,
        plan: &AggregationPlan,
        indexed: &IndexedBatch,
        top_grad: &[f32],
        table: &KeyValueShard<K>,
        vec_size: usize,
    ) -> Result<Wgrad<K>> {
        let expected = indexed.num_buckets() * vec_size;
        if top_grad.len() != expected {
            return Err(EmbeddingError::ShapeMismatch {
                expected: vec![indexed.num_buckets(), vec_size],
                got: vec![top_grad.len()],
            });
        }

        let scales: Option<Vec<f32>> = match self.combiner {
            Combiner::Sum => None,
            Combiner::Mean => Some(
                indexed
                    .bag_lengths
                    .iter()
                    .map(|&n| if n == 0 { 0.0 } else { 1.0 / n as f32 })
                    .collect(),
            ),
        };
        let data = cpu_segment_sum(
            top_grad,
            vec_size,
            &plan.run,
            &plan.sorted_samples,
            scales.as_deref(),
        )?;

        let mut wgrad = Wgrad::empty(vec_size);
        for (i, &row) in plan.run.unique.iter().enumerate() {
            let row = row as RowIndex;
            let key = table.key_at(row).ok_or_else(|| {
                EmbeddingError::InvalidInput(format!("row {row} has no resident key"))
            })?;
            wgrad.push(
                key,
                row,
                self.table_id,
                &data[i * vec_size..(i + 1) * vec_size],
            );
        }
        Ok(wgrad)
    }
}
