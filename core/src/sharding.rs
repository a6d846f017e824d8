//! Assignment of keys and slots to devices.
//!
//! Both schemes are pure functions of their inputs and the shard count, so every
//! device agrees on ownership without coordination.

use crate::types::{HashKey, SlotId};
use serde::{Deserialize, Serialize};

/// How a model-parallel table spreads its keys over devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardingScheme {
    /// Whole slots are pinned to devices: slot `s` lives on device `s % n`.
    #[default]
    LocalizedSlot,
    /// Keys are spread by value: key `k` lives on device `k % n`.
    DistributedKey,
}

/// Owning shard of a key under [`ShardingScheme::DistributedKey`].
#[inline]
pub fn shard_of_key<K: HashKey>(key: K, num_shards: usize) -> usize {
    (key.as_u64() % num_shards as u64) as usize
}

/// Owning shard of a slot under [`ShardingScheme::LocalizedSlot`].
#[inline]
pub fn shard_of_slot(slot: SlotId, num_shards: usize) -> usize {
    slot % num_shards
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sharding {
    pub scheme: ShardingScheme,
    pub num_shards: usize,
}

impl Sharding {
    pub fn new(scheme: ShardingScheme, num_shards: usize) -> Self {
        Self { scheme, num_shards }
    }

    /// Device that owns `key` when it appears in `slot`.
    pub fn owner<K: HashKey>(&self, key: K, slot: SlotId) -> usize {
        match self.scheme {
            ShardingScheme::LocalizedSlot => shard_of_slot(slot, self.num_shards),
            ShardingScheme::DistributedKey => shard_of_key(key, self.num_shards),
        }
    }

    /// Local slot positions every device reserves, padding included.
    pub fn slots_per_shard(&self, slot_num: usize) -> usize {
        match self.scheme {
            ShardingScheme::LocalizedSlot => slot_num.div_ceil(self.num_shards),
            ShardingScheme::DistributedKey => slot_num,
        }
    }

    /// Global slots whose keys (partly) live on `shard`, in local order.
    pub fn local_slots(&self, shard: usize, slot_num: usize) -> Vec<SlotId> {
        match self.scheme {
            ShardingScheme::LocalizedSlot => (shard..slot_num).step_by(self.num_shards).collect(),
            ShardingScheme::DistributedKey => (0..slot_num).collect(),
        }
    }
}
