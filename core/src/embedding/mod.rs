//! Tables, their per-device shards, and the collection that steps them.

pub mod collection;
pub mod device_shard;
pub mod grouped;

pub use collection::EmbeddingCollection;
pub use device_shard::DeviceShard;
pub use grouped::GroupedEmbedding;
