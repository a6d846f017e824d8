//! Configuration for tables, optimizers and the collection.
//!
//! Plain structs with `with_*` builders; everything also derives serde so a
//! driver can load it from JSON. Validation happens when a collection is built.

use crate::error::{EmbeddingError, Result};
use crate::optim::{Adam, MomentumSgd, Nesterov, OptimizerKind, Sgd};
use crate::sharding::ShardingScheme;
use crate::types::{Combiner, CommunicationStrategy, TablePlacementStrategy};
use serde::{Deserialize, Serialize};

/// Optimizer selection plus its hyper-parameters. Fixed for the lifetime of a table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizerParams {
    Sgd(Sgd),
    MomentumSgd(MomentumSgd),
    Nesterov(Nesterov),
    Adam(Adam),
}

impl OptimizerParams {
    /// Default hyper-parameters for `kind`.
    pub fn from_kind(kind: OptimizerKind, learning_rate: f32) -> Self {
        match kind {
            OptimizerKind::Adam => Self::Adam(Adam::new(learning_rate)),
            OptimizerKind::MomentumSgd => Self::MomentumSgd(MomentumSgd::new(learning_rate)),
            OptimizerKind::Nesterov => Self::Nesterov(Nesterov::new(learning_rate)),
            OptimizerKind::Sgd => Self::Sgd(Sgd::new(learning_rate)),
        }
    }

    pub fn kind(&self) -> OptimizerKind {
        match self {
            Self::Sgd(_) => OptimizerKind::Sgd,
            Self::MomentumSgd(_) => OptimizerKind::MomentumSgd,
            Self::Nesterov(_) => OptimizerKind::Nesterov,
            Self::Adam(_) => OptimizerKind::Adam,
        }
    }

    pub fn learning_rate(&self) -> f32 {
        match self {
            Self::Sgd(o) => o.learning_rate,
            Self::MomentumSgd(o) => o.learning_rate,
            Self::Nesterov(o) => o.learning_rate,
            Self::Adam(o) => o.learning_rate,
        }
    }

    pub(crate) fn set_learning_rate(&mut self, learning_rate: f32) {
        match self {
            Self::Sgd(o) => o.learning_rate = learning_rate,
            Self::MomentumSgd(o) => o.learning_rate = learning_rate,
            Self::Nesterov(o) => o.learning_rate = learning_rate,
            Self::Adam(o) => o.learning_rate = learning_rate,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Sgd(o) => o.validate(),
            Self::MomentumSgd(o) => o.validate(),
            Self::Nesterov(o) => o.validate(),
            Self::Adam(o) => o.validate(),
        }
    }
}

impl Default for OptimizerParams {
    fn default() -> Self {
        Self::Sgd(Sgd::new(0.01))
    }
}

/// One embedding table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableParams {
    #[serde(default)]
    pub name: String,
    /// Number of distinct keys the table is sized for, across all shards.
    pub vocabulary_size: usize,
    pub embedding_vec_size: usize,
    /// Number of slots (feature columns) this table serves.
    pub slot_num: usize,
    #[serde(default)]
    pub combiner: Combiner,
    #[serde(default)]
    pub placement: TablePlacementStrategy,
    #[serde(default)]
    pub sharding: ShardingScheme,
    /// Values below 1 over-provision every shard.
    #[serde(default = "default_load_factor")]
    pub load_factor: f32,
    #[serde(default)]
    pub optimizer: OptimizerParams,
    /// Seeds the initial value of every row.
    #[serde(default)]
    pub seed: u64,
}

fn default_load_factor() -> f32 {
    0.75
}

impl TableParams {
    pub fn new(vocabulary_size: usize, embedding_vec_size: usize, slot_num: usize) -> Self {
        Self {
            name: String::new(),
            vocabulary_size,
            embedding_vec_size,
            slot_num,
            combiner: Combiner::default(),
            placement: TablePlacementStrategy::default(),
            sharding: ShardingScheme::default(),
            load_factor: default_load_factor(),
            optimizer: OptimizerParams::default(),
            seed: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_combiner(mut self, combiner: Combiner) -> Self {
        self.combiner = combiner;
        self
    }

    pub fn with_placement(mut self, placement: TablePlacementStrategy) -> Self {
        self.placement = placement;
        self
    }

    pub fn with_sharding(mut self, sharding: ShardingScheme) -> Self {
        self.sharding = sharding;
        self
    }

    pub fn with_load_factor(mut self, load_factor: f32) -> Self {
        self.load_factor = load_factor;
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerParams) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Number of shards the key space is split over for this placement.
    pub fn num_shards(&self, num_devices: usize) -> usize {
        match self.placement {
            TablePlacementStrategy::DataParallel => 1,
            TablePlacementStrategy::ModelParallel => num_devices,
        }
    }

    /// `vocabulary_size / num_shards / load_factor`, computed in floating point
    /// and truncated.
    pub fn max_vocabulary_size_per_shard(&self, num_shards: usize) -> usize {
        (self.vocabulary_size as f32 / num_shards.max(1) as f32 / self.load_factor) as usize
    }

    pub fn validate(&self, num_devices: usize) -> Result<()> {
        let name = &self.name;
        if self.vocabulary_size == 0 {
            return Err(EmbeddingError::config(format!(
                "table '{name}': vocabulary size must be positive"
            )));
        }
        if self.embedding_vec_size == 0 || self.slot_num == 0 {
            return Err(EmbeddingError::config(format!(
                "table '{name}': embedding_vec_size and slot_num must be positive"
            )));
        }
        if !(self.load_factor > 0.0 && self.load_factor <= 1.0) {
            return Err(EmbeddingError::config(format!(
                "table '{name}': load factor must lie in (0, 1], got {}",
                self.load_factor
            )));
        }
        if self.max_vocabulary_size_per_shard(self.num_shards(num_devices)) == 0 {
            return Err(EmbeddingError::config(format!(
                "table '{name}': vocabulary {} is too small for {} shards",
                self.vocabulary_size,
                self.num_shards(num_devices)
            )));
        }
        self.optimizer.validate()
    }
}

/// The whole collection: device count, batch geometry and its tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionParams {
    pub num_devices: usize,
    /// Global batch size; every device handles `batch_size / num_devices` samples.
    pub batch_size: usize,
    #[serde(default)]
    pub comm_strategy: CommunicationStrategy,
    /// Whether every device pair can access each other's memory directly.
    #[serde(default = "default_true")]
    pub p2p_enabled: bool,
    /// Training inserts unseen keys; evaluation only looks them up.
    #[serde(default = "default_true")]
    pub is_train: bool,
    #[serde(default)]
    pub tables: Vec<TableParams>,
}

fn default_true() -> bool {
    true
}

impl CollectionParams {
    pub fn new(num_devices: usize, batch_size: usize) -> Self {
        Self {
            num_devices,
            batch_size,
            comm_strategy: CommunicationStrategy::default(),
            p2p_enabled: true,
            is_train: true,
            tables: Vec::new(),
        }
    }

    pub fn with_comm_strategy(mut self, comm_strategy: CommunicationStrategy) -> Self {
        self.comm_strategy = comm_strategy;
        self
    }

    pub fn with_p2p(mut self, p2p_enabled: bool) -> Self {
        self.p2p_enabled = p2p_enabled;
        self
    }

    pub fn with_train(mut self, is_train: bool) -> Self {
        self.is_train = is_train;
        self
    }

    pub fn with_table(mut self, table: TableParams) -> Self {
        self.tables.push(table);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_devices == 0 {
            return Err(EmbeddingError::config("at least one device is required"));
        }
        if self.batch_size == 0 || self.batch_size % self.num_devices != 0 {
            return Err(EmbeddingError::config(format!(
                "batch size {} must be a positive multiple of {} devices",
                self.batch_size, self.num_devices
            )));
        }
        if self.tables.is_empty() {
            return Err(EmbeddingError::config("collection has no tables"));
        }
        if self.comm_strategy == CommunicationStrategy::Hierarchical && !self.p2p_enabled {
            return Err(EmbeddingError::config(
                "hierarchical communication requires peer access between all devices",
            ));
        }
        self.tables
            .iter()
            .try_for_each(|table| table.validate(self.num_devices))
    }

    pub fn batch_per_device(&self) -> usize {
        self.batch_size / self.num_devices.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_vocabulary_size_per_shard() {
        let table = TableParams::new(1000, 8, 2).with_load_factor(0.5);
        // 1000 / 4 / 0.5
        assert_eq!(table.max_vocabulary_size_per_shard(4), 500);

        let table = TableParams::new(10, 8, 2).with_load_factor(0.75);
        // 10 / 3 / 0.75 = 4.44..
        assert_eq!(table.max_vocabulary_size_per_shard(3), 4);
    }

    #[test]
    fn test_table_validation() {
        assert!(TableParams::new(0, 8, 1).validate(1).is_err());
        assert!(TableParams::new(10, 0, 1).validate(1).is_err());
        assert!(TableParams::new(10, 8, 1)
            .with_load_factor(1.5)
            .validate(1)
            .is_err());
        // 1 key over 4 shards at load factor 1 leaves empty shards.
        assert!(TableParams::new(1, 8, 1)
            .with_load_factor(1.0)
            .validate(4)
            .is_err());
        assert!(TableParams::new(100, 8, 1).validate(4).is_ok());
    }

    #[test]
    fn test_data_parallel_uses_one_shard() {
        let table =
            TableParams::new(100, 4, 1).with_placement(TablePlacementStrategy::DataParallel);
        assert_eq!(table.num_shards(8), 1);
    }

    #[test]
    fn test_collection_validation() {
        let table = TableParams::new(100, 4, 2);

        let ok = CollectionParams::new(2, 4).with_table(table.clone());
        assert!(ok.validate().is_ok());

        let odd_batch = CollectionParams::new(2, 3).with_table(table.clone());
        assert!(matches!(
            odd_batch.validate(),
            Err(EmbeddingError::Configuration(_))
        ));

        let no_p2p = CollectionParams::new(2, 4)
            .with_comm_strategy(CommunicationStrategy::Hierarchical)
            .with_p2p(false)
            .with_table(table);
        assert!(no_p2p.validate().is_err());

        assert!(CollectionParams::new(1, 1).validate().is_err());
    }

    #[test]
    fn test_optimizer_from_kind() {
        let params = OptimizerParams::from_kind(OptimizerKind::Nesterov, 0.05);
        assert_eq!(params.kind(), OptimizerKind::Nesterov);
        assert_eq!(params.learning_rate(), 0.05);
    }
}
