//! # sparse-embedding
//!
//! Sharded sparse embedding tables for recommendation models, running one
//! shard per device on the CPU.
//!
//! Tables grow as new keys arrive, are spread over devices by slot or by key,
//! and move partial results between devices through an all-to-all exchange.
//! Gradients are deduplicated per key and applied in place by SGD, momentum,
//! Nesterov or Adam.
//!
//! ## Modules
//!
//! - [`embedding`]: [`EmbeddingCollection`] and the per-table stages it drives.
//! - [`table`]: the key to row hash shard and the value store behind it.
//! - [`pipeline`]: indexing, forward reduction, reordering and gradient aggregation.
//! - [`distributed`]: the collective exchange and its transports.
//! - [`optim`]: in-place optimizer updates and learning-rate schedules.
//! - [`checkpoint`]: the binary table record format.
//!
//! ## Example
//!
//! ```rust
//! use sparse_embedding::{CollectionParams, EmbeddingCollection, SparseInput, TableParams};
//!
//! let params = CollectionParams::new(2, 2).with_table(TableParams::new(64, 4, 2));
//! let mut collection = EmbeddingCollection::<u64>::new(params).unwrap();
//!
//! let input = SparseInput::from_bags(2, 2, &[vec![1, 2], vec![3], vec![], vec![4]]).unwrap();
//! let outputs = collection.forward(&[input]).unwrap();
//! assert_eq!(outputs[0].len(), 2 * 4);
//! ```

pub mod checkpoint;
pub mod distributed;
pub mod embedding;
pub mod error;
pub mod input;
pub mod optim;
pub mod params;
pub mod pipeline;
pub mod sharding;
pub mod table;
pub mod types;

pub use checkpoint::CheckpointRecord;
pub use embedding::{DeviceShard, EmbeddingCollection, GroupedEmbedding};
pub use error::{EmbeddingError, Result};
pub use input::SparseInput;
pub use optim::{OptimizerKind, OptimizerUpdateEngine};
pub use params::{CollectionParams, OptimizerParams, TableParams};
pub use sharding::ShardingScheme;
pub use types::{Combiner, CommunicationStrategy, HashKey, Stage, TablePlacementStrategy};
