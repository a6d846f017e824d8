use super::grouped::GroupedEmbedding;
use crate::distributed::ExchangeGroup;
use crate::error::{EmbeddingError, Result};
use crate::input::SparseInput;
use crate::params::CollectionParams;
use crate::pipeline::Wgrad;
use crate::types::{CommunicationStrategy, HashKey, Stage, TablePlacementStrategy};
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, info};

/// All embedding tables of a model, driven stage by stage.
///
/// Each device sees one dense buffer of `[batch_size / num_devices][width]`
/// values, where `width` is the sum of `slot_num * vec_size` over tables and
/// table `t` sits at a fixed offset inside every sample.
///
/// ```no_run
/// use sparse_embedding::{CollectionParams, EmbeddingCollection, SparseInput, TableParams};
///
/// let params = CollectionParams::new(2, 4).with_table(TableParams::new(1024, 8, 3));
/// let mut collection = EmbeddingCollection::<u64>::new(params)?;
/// let input = SparseInput::from_bags(4, 3, &vec![vec![1u64, 2]; 12])?;
///
/// let outputs = collection.forward(&[input])?;
/// let top_grads: Vec<Vec<f32>> = outputs.iter().map(|o| vec![1.0; o.len()]).collect();
/// collection.backward(&top_grads)?;
/// collection.update()?;
/// # Ok::<(), sparse_embedding::EmbeddingError>(())
/// ```
pub struct EmbeddingCollection<K: HashKey> {
    params: CollectionParams,
    groups: Vec<GroupedEmbedding<K>>,
    /// Per-sample offset of every table inside a device's output row.
    offsets: Vec<usize>,
    width: usize,
}

impl<K: HashKey> EmbeddingCollection<K> {
    pub fn new(params: CollectionParams) -> Result<Self> {
        params.validate()?;
        let groups = params
            .tables
            .iter()
            .enumerate()
            .map(|(id, table)| GroupedEmbedding::new(id, table.clone(), &params))
            .collect::<Result<Vec<_>>>()?;

        let mut offsets = Vec::with_capacity(groups.len());
        let mut width = 0;
        for group in &groups {
            offsets.push(width);
            width += group.output_width();
        }

        info!(
            num_devices = params.num_devices,
            batch_size = params.batch_size,
            tables = groups.len(),
            comm_strategy = ?params.comm_strategy,
            is_train = params.is_train,
            "embedding collection ready"
        );
        Ok(Self {
            params,
            groups,
            offsets,
            width,
        })
    }

    pub fn params(&self) -> &CollectionParams {
        &self.params
    }

    pub fn num_tables(&self) -> usize {
        self.groups.len()
    }

    pub fn groups(&self) -> &[GroupedEmbedding<K>] {
        &self.groups
    }

    pub fn group(&self, table: usize) -> Option<&GroupedEmbedding<K>> {
        self.groups.get(table)
    }

    /// Values per sample in the combined output.
    pub fn output_width(&self) -> usize {
        self.width
    }

    pub fn wgrad(&self, table: usize, device: usize) -> Option<&Wgrad<K>> {
        self.groups.get(table)?.wgrad(device)
    }

    pub fn params_num(&self) -> usize {
        self.groups.iter().map(GroupedEmbedding::params_num).sum()
    }

    /// Runs every forward stage and returns the per-device output.
    /// `inputs[t]` is the batch for table `t`.
    pub fn forward(&mut self, inputs: &[SparseInput<K>]) -> Result<Vec<Vec<f32>>> {
        for stage in Stage::forward_stages(self.params.comm_strategy) {
            self.forward_stage(stage, inputs)?;
        }
        self.output()
    }

    pub fn forward_stage(&mut self, stage: Stage, inputs: &[SparseInput<K>]) -> Result<()> {
        if !stage.is_forward() {
            return Err(EmbeddingError::illegal(stage, "not a forward stage"));
        }
        self.check_comm(stage)?;
        if inputs.len() != self.groups.len() {
            return Err(EmbeddingError::ShapeMismatch {
                expected: vec![self.groups.len()],
                got: vec![inputs.len()],
            });
        }
        debug!(%stage, "forward stage");

        match stage {
            Stage::DPForward => {
                for (group, input) in self.groups.iter_mut().zip(inputs) {
                    if group.is_valid_stage(stage) {
                        group.dp_forward(input)?;
                    }
                }
            }
            Stage::MPModelForward | Stage::HierMPModelForward => {
                for (group, input) in self.groups.iter_mut().zip(inputs) {
                    if group.is_valid_stage(stage) {
                        group.model_forward(input)?;
                    }
                }
            }
            Stage::MPNetworkForward | Stage::HierMPNetworkForward => {
                let mut pending = ExchangeGroup::new();
                let mut ids = Vec::new();
                for (id, group) in self.groups.iter_mut().enumerate() {
                    if group.is_valid_stage(stage) {
                        pending.push(group.issue_network_forward(stage)?);
                        ids.push(id);
                    }
                }
                for (id, received) in ids.into_iter().zip(pending.wait_all()?) {
                    self.groups[id].complete_network_forward(received)?;
                }
            }
            _ => return Err(EmbeddingError::illegal(stage, "not a forward stage")),
        }
        Ok(())
    }

    /// Gathers every table's output into one buffer per device.
    ///
    /// Fails with `IllegalCall` naming the stage that produces a missing output:
    /// `DPForward` for data-parallel tables, the network forward otherwise.
    pub fn output(&self) -> Result<Vec<Vec<f32>>> {
        let bpd = self.params.batch_per_device();
        (0..self.params.num_devices)
            .map(|device| {
                let mut out = vec![0.0f32; bpd * self.width];
                for (group, &offset) in self.groups.iter().zip(&self.offsets) {
                    let table_out = group.output(device).ok_or_else(|| {
                        EmbeddingError::illegal(
                            self.output_stage(group.placement()),
                            format!("table {} has no forward output", group.table_id()),
                        )
                    })?;
                    let w = group.output_width();
                    for (sample, values) in table_out.chunks(w.max(1)).enumerate() {
                        let start = sample * self.width + offset;
                        out[start..start + values.len()].copy_from_slice(values);
                    }
                }
                Ok(out)
            })
            .collect()
    }

    /// Runs every backward stage. `top_grads` has the shape of [`output`](Self::output).
    pub fn backward(&mut self, top_grads: &[Vec<f32>]) -> Result<()> {
        for stage in Stage::backward_stages(self.params.comm_strategy) {
            self.backward_stage(stage, top_grads)?;
        }
        Ok(())
    }

    pub fn backward_stage(&mut self, stage: Stage, top_grads: &[Vec<f32>]) -> Result<()> {
        if stage.is_forward() {
            return Err(EmbeddingError::illegal(stage, "not a backward stage"));
        }
        if !self.params.is_train {
            return Err(EmbeddingError::illegal(
                stage,
                "collection is in evaluation mode",
            ));
        }
        self.check_comm(stage)?;
        debug!(%stage, "backward stage");

        match stage {
            Stage::DPBackwardIndexCalculation
            | Stage::MPBackwardIndexCalculation
            | Stage::HierMPBackwardIndexCalculation => {
                for group in self.groups.iter_mut().filter(|g| g.is_valid_stage(stage)) {
                    group.index_calculation(stage)?;
                }
            }
            Stage::DPLocalReduce => {
                let mut split = self.split_top_grads(top_grads)?;
                for (group, grads) in self.groups.iter_mut().zip(split.iter_mut()) {
                    if group.is_valid_stage(stage) {
                        group.dp_local_reduce(stage, std::mem::take(grads))?;
                    }
                }
            }
            Stage::DPAllreduce => {
                for group in self.groups.iter_mut().filter(|g| g.is_valid_stage(stage)) {
                    group.dp_allreduce(stage)?;
                }
            }
            Stage::MPNetworkBackward | Stage::HierMPNetworkBackward => {
                let split = self.split_top_grads(top_grads)?;
                let mut pending = ExchangeGroup::new();
                let mut ids = Vec::new();
                for ((id, group), grads) in self.groups.iter_mut().enumerate().zip(split) {
                    if group.is_valid_stage(stage) {
                        pending.push(group.issue_network_backward(stage, grads)?);
                        ids.push(id);
                    }
                }
                for (id, received) in ids.into_iter().zip(pending.wait_all()?) {
                    self.groups[id].complete_network_backward(received)?;
                }
            }
            Stage::MPLocalReduce | Stage::HierMPLocalReduce => {
                for group in self.groups.iter_mut().filter(|g| g.is_valid_stage(stage)) {
                    group.mp_local_reduce(stage)?;
                }
            }
            _ => return Err(EmbeddingError::illegal(stage, "not a backward stage")),
        }
        Ok(())
    }

    /// Applies pending gradients: data-parallel tables first, then model-parallel.
    pub fn update(&mut self) -> Result<()> {
        for placement in [
            TablePlacementStrategy::DataParallel,
            TablePlacementStrategy::ModelParallel,
        ] {
            for group in self
                .groups
                .iter_mut()
                .filter(|g| g.placement() == placement)
            {
                group.update()?;
            }
        }
        Ok(())
    }

    pub fn set_learning_rate(&mut self, learning_rate: f32) -> Result<()> {
        self.groups
            .iter_mut()
            .try_for_each(|g| g.set_learning_rate(learning_rate))
    }

    pub fn upload_table<R: Read>(
        &mut self,
        table: usize,
        reader: R,
        max_records: Option<usize>,
    ) -> Result<usize> {
        self.group_mut(table)?.upload(reader, max_records)
    }

    pub fn download_table<W: Write>(&self, table: usize, writer: W) -> Result<usize> {
        self.group_ref(table)?.download(writer)
    }

    pub fn upload_table_file<P: AsRef<Path>>(
        &mut self,
        table: usize,
        path: P,
        max_records: Option<usize>,
    ) -> Result<usize> {
        self.group_mut(table)?.upload_file(path, max_records)
    }

    pub fn download_table_file<P: AsRef<Path>>(&self, table: usize, path: P) -> Result<usize> {
        self.group_ref(table)?.download_file(path)
    }

    fn group_ref(&self, table: usize) -> Result<&GroupedEmbedding<K>> {
        let tables = self.groups.len();
        self.groups
            .get(table)
            .ok_or_else(|| EmbeddingError::InvalidInput(format!("no table {table} of {tables}")))
    }

    fn group_mut(&mut self, table: usize) -> Result<&mut GroupedEmbedding<K>> {
        let tables = self.groups.len();
        self.groups
            .get_mut(table)
            .ok_or_else(|| EmbeddingError::InvalidInput(format!("no table {table} of {tables}")))
    }

    /// The forward stage after which a table of `placement` has its output.
    fn output_stage(&self, placement: TablePlacementStrategy) -> Stage {
        match (placement, self.params.comm_strategy) {
            (TablePlacementStrategy::DataParallel, _) => Stage::DPForward,
            (_, CommunicationStrategy::Uniform) => Stage::MPNetworkForward,
            (_, CommunicationStrategy::Hierarchical) => Stage::HierMPNetworkForward,
        }
    }

    fn check_comm(&self, stage: Stage) -> Result<()> {
        match stage.comm_strategy() {
            Some(comm) if comm != self.params.comm_strategy => Err(EmbeddingError::illegal(
                stage,
                format!(
                    "stage belongs to {comm:?} exchange, collection uses {:?}",
                    self.params.comm_strategy
                ),
            )),
            _ => Ok(()),
        }
    }

    /// Cuts the combined per-device gradient into `[table][device][bpd * width_t]`.
    fn split_top_grads(&self, top_grads: &[Vec<f32>]) -> Result<Vec<Vec<Vec<f32>>>> {
        let bpd = self.params.batch_per_device();
        let expected = bpd * self.width;
        if top_grads.len() != self.params.num_devices {
            return Err(EmbeddingError::ShapeMismatch {
                expected: vec![self.params.num_devices, expected],
                got: vec![top_grads.len()],
            });
        }
        if let Some(bad) = top_grads.iter().find(|g| g.len() != expected) {
            return Err(EmbeddingError::ShapeMismatch {
                expected: vec![bpd, self.width],
                got: vec![bad.len()],
            });
        }

        Ok(self
            .groups
            .iter()
            .zip(&self.offsets)
            .map(|(group, &offset)| {
                let w = group.output_width();
                top_grads
                    .iter()
                    .map(|grad| {
                        grad.chunks(self.width.max(1))
                            .flat_map(|sample| sample[offset..offset + w].iter().copied())
                            .collect()
                    })
                    .collect()
            })
            .collect())
    }
}
