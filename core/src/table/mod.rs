//! Per-device parameter storage: the key index and the dense row arena.

pub mod hash_table;
pub mod value_store;

pub use hash_table::{Entry, KeyValueShard};
pub use value_store::EmbeddingValueStore;
