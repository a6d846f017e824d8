use super::device_shard::DeviceShard;
use crate::checkpoint::{
    load_records_from_file, read_records, save_records_to_file, write_records, CheckpointRecord,
};
use crate::distributed::{CollectiveExchange, ExchangeHandle, ExchangePlan};
use crate::error::{EmbeddingError, Result};
use crate::input::SparseInput;
use crate::params::{CollectionParams, TableParams};
use crate::pipeline::{
    ForwardReductionStage, GradientAggregationPipeline, IndexingPipeline, ReorderStage, Wgrad,
};
use crate::sharding::{Sharding, ShardingScheme};
use crate::types::{HashKey, Stage, TablePlacementStrategy};
use rayon::prelude::*;
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, info};

/// One embedding table spread over every device, with the stages that move it
/// through a training step.
///
/// Model-parallel tables shard their keys ([`ShardingScheme`]) and exchange
/// partial outputs and gradients. Data-parallel tables keep a full replica per
/// device, split the batch by samples and all-reduce their weight gradients.
pub struct GroupedEmbedding<K: HashKey> {
    table_id: usize,
    params: TableParams,
    num_devices: usize,
    batch_size: usize,
    sharding: Sharding,
    indexing: IndexingPipeline,
    reduction: ForwardReductionStage,
    aggregation: GradientAggregationPipeline,
    reorder: Option<ReorderStage>,
    exchange: CollectiveExchange,
    shards: Vec<DeviceShard<K>>,
    /// Set once the final output of the current pass is in place.
    output_ready: bool,
}

impl<K: HashKey> GroupedEmbedding<K> {
    pub fn new(
        table_id: usize,
        params: TableParams,
        collection: &CollectionParams,
    ) -> Result<Self> {
        let n = collection.num_devices;
        params.validate(n)?;

        let vec_size = params.embedding_vec_size;
        let slot_num = params.slot_num;
        let capacity = params.max_vocabulary_size_per_shard(params.num_shards(n));
        let sharding = Sharding::new(params.sharding, n);
        let bpd = collection.batch_per_device();

        // Data-parallel tables only ever all-reduce, which sizes itself.
        let (count, reorder) = match (params.placement, params.sharding) {
            (TablePlacementStrategy::DataParallel, _) => (0, None),
            (TablePlacementStrategy::ModelParallel, ShardingScheme::LocalizedSlot) => (
                bpd * sharding.slots_per_shard(slot_num) * vec_size,
                Some(ReorderStage::new(
                    collection.batch_size,
                    slot_num,
                    vec_size,
                    n,
                )),
            ),
            (TablePlacementStrategy::ModelParallel, ShardingScheme::DistributedKey) => {
                (bpd * slot_num * vec_size, None)
            }
        };
        let exchange = CollectiveExchange::init(
            ExchangePlan::new(n, count),
            collection.comm_strategy,
            collection.p2p_enabled,
        )?;

        let shards = (0..n)
            .map(|device| DeviceShard::new(device, capacity, vec_size, params.optimizer))
            .collect::<Result<Vec<_>>>()?;

        info!(
            table = %params.name,
            table_id,
            placement = ?params.placement,
            max_vocabulary_size_per_shard = capacity,
            slots_per_device = sharding.slots_per_shard(slot_num),
            optimizer = %params.optimizer.kind(),
            "embedding table ready"
        );

        Ok(Self {
            table_id,
            indexing: IndexingPipeline::new(params.seed, collection.is_train),
            reduction: ForwardReductionStage::new(params.combiner),
            aggregation: GradientAggregationPipeline::new(params.combiner, table_id),
            params,
            num_devices: n,
            batch_size: collection.batch_size,
            sharding,
            reorder,
            exchange,
            shards,
            output_ready: false,
        })
    }

    pub fn table_id(&self) -> usize {
        self.table_id
    }

    pub fn params(&self) -> &TableParams {
        &self.params
    }

    pub fn placement(&self) -> TablePlacementStrategy {
        self.params.placement
    }

    /// Whether this table takes part in `stage`. Tables of the other placement skip it.
    pub fn is_valid_stage(&self, stage: Stage) -> bool {
        stage.placement() == self.params.placement
    }

    pub fn shards(&self) -> &[DeviceShard<K>] {
        &self.shards
    }

    pub fn shard(&self, device: usize) -> Option<&DeviceShard<K>> {
        self.shards.get(device)
    }

    /// Values per sample in this table's output: `slot_num * vec_size`.
    pub fn output_width(&self) -> usize {
        self.params.slot_num * self.params.embedding_vec_size
    }

    /// Final output of `device`, `[batch_size / num_devices][slot_num][vec_size]`.
    ///
    /// `None` until the pass has produced it: after the data-parallel forward,
    /// or after the network forward for model-parallel tables.
    pub fn output(&self, device: usize) -> Option<&[f32]> {
        if !self.output_ready {
            return None;
        }
        let out = &self.shards.get(device)?.output;
        (out.len() == self.local_output_len()).then_some(out.as_slice())
    }

    pub fn wgrad(&self, device: usize) -> Option<&Wgrad<K>> {
        self.shards.get(device)?.wgrad()
    }

    /// Resident parameters. Data-parallel replicas are counted once.
    pub fn params_num(&self) -> usize {
        match self.params.placement {
            TablePlacementStrategy::DataParallel => {
                self.shards.first().map_or(0, DeviceShard::params_num)
            }
            TablePlacementStrategy::ModelParallel => {
                self.shards.iter().map(DeviceShard::params_num).sum()
            }
        }
    }

    pub fn set_learning_rate(&mut self, learning_rate: f32) -> Result<()> {
        self.shards
            .iter_mut()
            .try_for_each(|shard| shard.set_learning_rate(learning_rate))?;
        self.params.optimizer.set_learning_rate(learning_rate);
        Ok(())
    }

    fn local_output_len(&self) -> usize {
        self.batch_size / self.num_devices * self.output_width()
    }

    fn check_input(&self, input: &SparseInput<K>) -> Result<()> {
        if input.batch_size() != self.batch_size || input.slot_num() != self.params.slot_num {
            return Err(EmbeddingError::ShapeMismatch {
                expected: vec![self.batch_size, self.params.slot_num],
                got: vec![input.batch_size(), input.slot_num()],
            });
        }
        Ok(())
    }

    fn check_top_grads(&self, top_grads: &[Vec<f32>]) -> Result<()> {
        let expected = self.local_output_len();
        if top_grads.len() != self.num_devices {
            return Err(EmbeddingError::ShapeMismatch {
                expected: vec![self.num_devices, expected],
                got: vec![top_grads.len()],
            });
        }
        if let Some(bad) = top_grads.iter().find(|g| g.len() != expected) {
            return Err(EmbeddingError::ShapeMismatch {
                expected: vec![expected],
                got: vec![bad.len()],
            });
        }
        Ok(())
    }

    // ----- forward -----

    /// Data-parallel forward: every replica registers the whole batch, then
    /// reduces its own block of samples.
    pub(crate) fn dp_forward(&mut self, input: &SparseInput<K>) -> Result<()> {
        self.check_input(input)?;
        self.output_ready = false;
        let (n, indexing, reduction) = (self.num_devices, self.indexing, self.reduction);
        let full = input.full_slice();

        for_each_device(&mut self.shards, |shard| {
            shard.clear_pass();
            let local = input.sample_slice(shard.device(), n);
            let (table, store) = shard.parts_mut();
            indexing.register(&full, table, store)?;
            let indexed = indexing.run(&local, table, store)?;
            shard.output = reduction.run(&indexed, shard.store())?;
            shard.indexed = Some(indexed);
            Ok(())
        })?;
        self.output_ready = true;
        Ok(())
    }

    /// Model-parallel local step: resolve and reduce the keys this device owns.
    pub(crate) fn model_forward(&mut self, input: &SparseInput<K>) -> Result<()> {
        self.check_input(input)?;
        self.output_ready = false;
        let (n, indexing, reduction) = (self.num_devices, self.indexing, self.reduction);
        let scheme = self.sharding.scheme;

        for_each_device(&mut self.shards, |shard| {
            shard.clear_pass();
            let local = match scheme {
                ShardingScheme::LocalizedSlot => input.localized_slice(shard.device(), n),
                ShardingScheme::DistributedKey => input.distributed_slice(shard.device(), n),
            };
            let (table, store) = shard.parts_mut();
            let indexed = indexing.run(&local, table, store)?;
            shard.output = reduction.run(&indexed, shard.store())?;
            shard.indexed = Some(indexed);
            Ok(())
        })
    }

    pub(crate) fn issue_network_forward(&mut self, stage: Stage) -> Result<ExchangeHandle> {
        if self.shards.iter().any(|s| s.indexed.is_none()) {
            return Err(EmbeddingError::illegal(stage, "model forward has not run"));
        }
        self.output_ready = false;
        let src = self
            .shards
            .iter_mut()
            .map(|s| std::mem::take(&mut s.output))
            .collect();
        debug!(table_id = self.table_id, %stage, "network forward issued");
        self.exchange.exchange_async(src)
    }

    pub(crate) fn complete_network_forward(&mut self, received: Vec<Vec<f32>>) -> Result<()> {
        let reorder = self.reorder;
        let count = self.exchange.plan().element_count_per_peer;

        run_per_device(&mut self.shards, received, |shard, buf| {
            shard.output = match reorder {
                Some(reorder) => reorder.forward(&buf)?,
                // Key-distributed: sum the partial bags from every source.
                None => {
                    let mut sum = vec![0.0f32; count];
                    for part in buf.chunks(count.max(1)) {
                        for (s, v) in sum.iter_mut().zip(part) {
                            *s += v;
                        }
                    }
                    sum
                }
            };
            Ok(())
        })?;
        self.output_ready = true;
        Ok(())
    }

    // ----- backward -----

    pub(crate) fn index_calculation(&mut self, stage: Stage) -> Result<()> {
        let aggregation = self.aggregation;
        for_each_device(&mut self.shards, |shard| {
            let indexed = shard
                .indexed
                .as_ref()
                .ok_or_else(|| EmbeddingError::illegal(stage, "forward has not run"))?;
            shard.plan = Some(aggregation.index_calculation(indexed)?);
            Ok(())
        })
    }

    /// Data-parallel local reduce; `top_grads` are already sample-split.
    pub(crate) fn dp_local_reduce(&mut self, stage: Stage, top_grads: Vec<Vec<f32>>) -> Result<()> {
        self.check_top_grads(&top_grads)?;
        let (aggregation, vec_size) = (self.aggregation, self.params.embedding_vec_size);
        run_per_device(&mut self.shards, top_grads, |shard, grad| {
            shard.local_grad = Some(grad);
            reduce_on_device(shard, stage, aggregation, vec_size)
        })
    }

    /// Sums the replicas' weight gradients so every replica applies the same update.
    ///
    /// Replicas grow in lockstep, so row `r` names the same key everywhere and the
    /// gradients can be all-reduced as a dense `[rows][vec_size]` block followed by a
    /// `[rows]` touch mask.
    pub(crate) fn dp_allreduce(&mut self, stage: Stage) -> Result<()> {
        let vec_size = self.params.embedding_vec_size;
        let rows = self.shards.first().map_or(0, |s| s.table().len());
        if self.shards.iter().any(|s| s.table().len() != rows) {
            return Err(EmbeddingError::transport("data-parallel replicas diverged"));
        }

        let mut dense = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            let wgrad = shard
                .wgrad
                .as_ref()
                .ok_or_else(|| EmbeddingError::illegal(stage, "local reduce has not run"))?;
            let mut buf = vec![0.0f32; rows * vec_size + rows];
            for (i, &row) in wgrad.rows.iter().enumerate() {
                for (d, g) in buf[row * vec_size..(row + 1) * vec_size]
                    .iter_mut()
                    .zip(wgrad.grad(i))
                {
                    *d += g;
                }
                buf[rows * vec_size + row] = 1.0;
            }
            dense.push(buf);
        }
        debug!(table_id = self.table_id, rows, "data-parallel all-reduce");
        let reduced = self.exchange.all_reduce_sum(dense)?;

        let table_id = self.table_id;
        run_per_device(&mut self.shards, reduced, |shard, buf| {
            let mut wgrad = Wgrad::empty(vec_size);
            for row in 0..rows {
                if buf[rows * vec_size + row] > 0.0 {
                    let key = shard.table().key_at(row).ok_or_else(|| {
                        EmbeddingError::InvalidInput(format!("row {row} has no resident key"))
                    })?;
                    wgrad.push(
                        key,
                        row,
                        table_id,
                        &buf[row * vec_size..(row + 1) * vec_size],
                    );
                }
            }
            shard.wgrad = Some(wgrad);
            Ok(())
        })
    }

    /// Sends every device's top-gradient slice back to the devices that own the keys.
    pub(crate) fn issue_network_backward(
        &mut self,
        stage: Stage,
        top_grads: Vec<Vec<f32>>,
    ) -> Result<ExchangeHandle> {
        self.check_top_grads(&top_grads)?;
        if self.shards.iter().any(|s| s.plan.is_none()) {
            return Err(EmbeddingError::illegal(
                stage,
                "index calculation has not run",
            ));
        }
        let n = self.num_devices;
        let src = match self.reorder {
            Some(reorder) => top_grads
                .iter()
                .map(|grad| reorder.backward(grad))
                .collect::<Result<Vec<_>>>()?,
            // Key-distributed: every owner needs the full gradient of its samples.
            None => top_grads.into_iter().map(|grad| grad.repeat(n)).collect(),
        };
        debug!(table_id = self.table_id, %stage, "network backward issued");
        self.exchange.exchange_async(src)
    }

    pub(crate) fn complete_network_backward(&mut self, received: Vec<Vec<f32>>) -> Result<()> {
        run_per_device(&mut self.shards, received, |shard, buf| {
            shard.local_grad = Some(buf);
            Ok(())
        })
    }

    pub(crate) fn mp_local_reduce(&mut self, stage: Stage) -> Result<()> {
        let (aggregation, vec_size) = (self.aggregation, self.params.embedding_vec_size);
        for_each_device(&mut self.shards, |shard| {
            reduce_on_device(shard, stage, aggregation, vec_size)
        })
    }

    /// Applies the pending weight gradient on every device.
    pub(crate) fn update(&mut self) -> Result<()> {
        for_each_device(&mut self.shards, DeviceShard::apply_wgrad)
    }

    // ----- checkpoint -----

    /// Reads the whole stream, then routes every record to its owner(s).
    /// Returns the number of records loaded.
    pub fn upload<R: Read>(&mut self, reader: R, max_records: Option<usize>) -> Result<usize> {
        let records = read_records::<K, _>(reader, self.params.embedding_vec_size, max_records)?;
        self.load_records(&records)?;
        Ok(records.len())
    }

    pub fn upload_file<P: AsRef<Path>>(
        &mut self,
        path: P,
        max_records: Option<usize>,
    ) -> Result<usize> {
        let records =
            load_records_from_file::<K, _>(path, self.params.embedding_vec_size, max_records)?;
        self.load_records(&records)?;
        Ok(records.len())
    }

    /// Serialises every resident row, then writes once. Returns the record count.
    pub fn download<W: Write>(&self, writer: W) -> Result<usize> {
        let records = self.dump_records();
        write_records(writer, &records)?;
        Ok(records.len())
    }

    pub fn download_file<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let records = self.dump_records();
        save_records_to_file(path, &records)?;
        Ok(records.len())
    }

    pub fn load_records(&mut self, records: &[CheckpointRecord<K>]) -> Result<()> {
        let vec_size = self.params.embedding_vec_size;
        let slot_num = self.params.slot_num;
        if let Some(bad) = records
            .iter()
            .find(|r| r.vector.len() != vec_size || r.slot_id >= slot_num)
        {
            return Err(EmbeddingError::InvalidInput(format!(
                "record for key {} does not fit table '{}' (slot {}, width {})",
                bad.key,
                self.params.name,
                bad.slot_id,
                bad.vector.len()
            )));
        }

        let per_device: Vec<Vec<&CheckpointRecord<K>>> = match self.params.placement {
            TablePlacementStrategy::DataParallel => {
                vec![records.iter().collect(); self.num_devices]
            }
            TablePlacementStrategy::ModelParallel => {
                let mut routed = vec![Vec::new(); self.num_devices];
                for record in records {
                    routed[self.sharding.owner(record.key, record.slot_id)].push(record);
                }
                routed
            }
        };
        run_per_device(&mut self.shards, per_device, |shard, records| {
            records.into_iter().try_for_each(|r| shard.load_record(r))
        })
    }

    /// Resident rows in device order, then row order. Data-parallel tables dump
    /// their first replica.
    pub fn dump_records(&self) -> Vec<CheckpointRecord<K>> {
        match self.params.placement {
            TablePlacementStrategy::DataParallel => self
                .shards
                .first()
                .map(DeviceShard::dump_records)
                .unwrap_or_default(),
            TablePlacementStrategy::ModelParallel => self
                .shards
                .iter()
                .flat_map(DeviceShard::dump_records)
                .collect(),
        }
    }
}

fn reduce_on_device<K: HashKey>(
    shard: &mut DeviceShard<K>,
    stage: Stage,
    aggregation: GradientAggregationPipeline,
    vec_size: usize,
) -> Result<()> {
    let (Some(indexed), Some(plan), Some(grad)) = (&shard.indexed, &shard.plan, &shard.local_grad)
    else {
        return Err(EmbeddingError::illegal(
            stage,
            "index calculation or gradient exchange has not run",
        ));
    };
    let wgrad = aggregation.local_reduce(plan, indexed, grad, shard.table(), vec_size)?;
    shard.wgrad = Some(wgrad);
    Ok(())
}

/// Runs `f` once per device, pairing device `d` with `items[d]`.
///
/// Devices run in parallel on the rayon pool and are all joined before this
/// returns; a single device runs inline.
fn run_per_device<K, T, F>(shards: &mut [DeviceShard<K>], items: Vec<T>, f: F) -> Result<()>
where
    K: HashKey,
    T: Send,
    F: Fn(&mut DeviceShard<K>, T) -> Result<()> + Send + Sync,
{
    if shards.len() == 1 {
        return shards
            .iter_mut()
            .zip(items)
            .try_for_each(|(shard, item)| f(shard, item));
    }
    shards
        .par_iter_mut()
        .zip(items.into_par_iter())
        .try_for_each(|(shard, item)| f(shard, item))
}

fn for_each_device<K, F>(shards: &mut [DeviceShard<K>], f: F) -> Result<()>
where
    K: HashKey,
    F: Fn(&mut DeviceShard<K>) -> Result<()> + Send + Sync,
{
    let units = vec![(); shards.len()];
    run_per_device(shards, units, |shard, ()| f(shard))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Combiner;

    fn collection(n: usize, batch: usize) -> CollectionParams {
        CollectionParams::new(n, batch)
    }

    #[test]
    fn test_localized_forward_routes_slots() {
        let params = TableParams::new(64, 1, 2).with_load_factor(1.0);
        let mut group = GroupedEmbedding::<u64>::new(0, params, &collection(2, 2)).unwrap();
        let input = SparseInput::from_bags(2, 2, &[vec![1], vec![2], vec![3], vec![4]]).unwrap();

        group.model_forward(&input).unwrap();

        // Slot 0 keys live on device 0, slot 1 keys on device 1.
        assert_eq!(group.shard(0).unwrap().table().len(), 2);
        assert!(group.shard(0).unwrap().row_of(1).is_some());
        assert!(group.shard(1).unwrap().row_of(4).is_some());
        assert!(group.shard(1).unwrap().row_of(1).is_none());
    }

    #[test]
    fn test_network_forward_requires_model_forward() {
        let params = TableParams::new(64, 1, 2);
        let mut group = GroupedEmbedding::<u64>::new(0, params, &collection(2, 2)).unwrap();
        let result = group.issue_network_forward(Stage::MPNetworkForward);
        assert!(matches!(result, Err(EmbeddingError::IllegalCall { .. })));
    }

    #[test]
    fn test_distributed_key_forward_sums_partials() {
        let params = TableParams::new(64, 2, 1)
            .with_sharding(ShardingScheme::DistributedKey)
            .with_combiner(Combiner::Mean);
        let mut group = GroupedEmbedding::<u64>::new(0, params, &collection(2, 2)).unwrap();
        group
            .load_records(&[
                CheckpointRecord {
                    key: 2,
                    slot_id: 0,
                    vector: vec![2.0, 4.0],
                },
                CheckpointRecord {
                    key: 3,
                    slot_id: 0,
                    vector: vec![4.0, 8.0],
                },
            ])
            .unwrap();
        // Keys 2 and 3 live on different devices.
        assert!(group.shard(0).unwrap().row_of(2).is_some());
        assert!(group.shard(1).unwrap().row_of(3).is_some());

        let input = SparseInput::from_bags(2, 1, &[vec![2, 3], vec![3]]).unwrap();
        group.model_forward(&input).unwrap();
        let handle = group
            .issue_network_forward(Stage::MPNetworkForward)
            .unwrap();
        group
            .complete_network_forward(handle.wait().unwrap())
            .unwrap();

        assert_eq!(group.output(0).unwrap(), &[3.0, 6.0]);
        assert_eq!(group.output(1).unwrap(), &[4.0, 8.0]);
    }

    #[test]
    fn test_data_parallel_replicas_stay_identical() {
        let params = TableParams::new(16, 2, 1)
            .with_placement(TablePlacementStrategy::DataParallel)
            .with_seed(5);
        let mut group = GroupedEmbedding::<u32>::new(0, params, &collection(2, 2)).unwrap();
        let input = SparseInput::from_bags(2, 1, &[vec![7, 1], vec![1]]).unwrap();

        group.dp_forward(&input).unwrap();
        group
            .index_calculation(Stage::DPBackwardIndexCalculation)
            .unwrap();
        group
            .dp_local_reduce(Stage::DPLocalReduce, vec![vec![1.0, 1.0], vec![1.0, 1.0]])
            .unwrap();
        group.dp_allreduce(Stage::DPAllreduce).unwrap();

        // Key 1 appears in both samples, so its summed gradient is 2.
        let wgrad = group.wgrad(1).unwrap();
        assert_eq!(wgrad.grad_of(1), Some(&[2.0, 2.0][..]));
        assert_eq!(wgrad.grad_of(7), Some(&[1.0, 1.0][..]));

        group.update().unwrap();
        assert!(group.wgrad(1).is_none());

        let a = group.shard(0).unwrap();
        let b = group.shard(1).unwrap();
        assert_eq!(a.store().values(), b.store().values());
        assert_eq!(group.params_num(), 4);
        assert_eq!(group.dump_records().len(), 2);
    }

    #[test]
    fn test_upload_rejects_foreign_slot() {
        let params = TableParams::new(64, 1, 2);
        let mut group = GroupedEmbedding::<u64>::new(0, params, &collection(1, 1)).unwrap();
        let record = CheckpointRecord {
            key: 1,
            slot_id: 5,
            vector: vec![0.0],
        };
        assert!(group.load_records(&[record]).is_err());
    }
}
