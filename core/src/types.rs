//! Core vocabulary shared by every component: keys, placements and stages.

use num_traits::PrimInt;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};
use std::hash::Hash;

/// Position of a key's vector inside a shard's value store.
pub type RowIndex = usize;

/// Global id of a logical feature column.
pub type SlotId = usize;

/// Trait bound for sparse feature keys.
///
/// Keys are fixed-width unsigned integers and are stored little-endian on disk.
pub trait HashKey:
    PrimInt + Hash + Debug + Display + Default + Send + Sync + 'static
{
    /// Width in bytes of the on-disk representation.
    const BYTES: usize;

    fn as_u64(self) -> u64;

    /// Narrowing conversion; `None` when `value` does not fit.
    fn from_u64(value: u64) -> Option<Self>;

    fn write_le(self, out: &mut Vec<u8>);

    /// Decodes exactly [`Self::BYTES`] bytes.
    fn read_le(bytes: &[u8]) -> Option<Self>;
}

macro_rules! impl_hash_key {
    ($t:ty) => {
        impl HashKey for $t {
            const BYTES: usize = std::mem::size_of::<$t>();

            #[inline]
            fn as_u64(self) -> u64 {
                self as u64
            }

            fn from_u64(value: u64) -> Option<Self> {
                <$t>::try_from(value).ok()
            }

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Option<Self> {
                bytes.try_into().ok().map(<$t>::from_le_bytes)
            }
        }
    };
}

impl_hash_key!(u32);
impl_hash_key!(u64);

/// How the vectors of one bag are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combiner {
    #[default]
    Sum,
    /// Sum divided by the bag length.
    Mean,
}

/// Whether a table is replicated on every device or sharded across them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TablePlacementStrategy {
    DataParallel,
    #[default]
    ModelParallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationStrategy {
    /// Flat all-to-all among every device.
    #[default]
    Uniform,
    /// Peer buffers published behind a device barrier.
    Hierarchical,
}

/// Execution stages of an [`EmbeddingCollection`](crate::embedding::EmbeddingCollection).
///
/// Every table valid for a stage runs it before any table proceeds to the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    DPForward,
    MPModelForward,
    MPNetworkForward,
    HierMPModelForward,
    HierMPNetworkForward,
    DPBackwardIndexCalculation,
    DPLocalReduce,
    DPAllreduce,
    MPBackwardIndexCalculation,
    MPNetworkBackward,
    MPLocalReduce,
    HierMPBackwardIndexCalculation,
    HierMPNetworkBackward,
    HierMPLocalReduce,
}

impl Stage {
    pub fn is_forward(self) -> bool {
        matches!(
            self,
            Stage::DPForward
                | Stage::MPModelForward
                | Stage::MPNetworkForward
                | Stage::HierMPModelForward
                | Stage::HierMPNetworkForward
        )
    }

    pub fn placement(self) -> TablePlacementStrategy {
        match self {
            Stage::DPForward
            | Stage::DPBackwardIndexCalculation
            | Stage::DPLocalReduce
            | Stage::DPAllreduce => TablePlacementStrategy::DataParallel,
            _ => TablePlacementStrategy::ModelParallel,
        }
    }

    /// The communication strategy a stage belongs to. Data-parallel stages work with both.
    pub fn comm_strategy(self) -> Option<CommunicationStrategy> {
        match self {
            Stage::MPModelForward
            | Stage::MPNetworkForward
            | Stage::MPBackwardIndexCalculation
            | Stage::MPNetworkBackward
            | Stage::MPLocalReduce => Some(CommunicationStrategy::Uniform),
            Stage::HierMPModelForward
            | Stage::HierMPNetworkForward
            | Stage::HierMPBackwardIndexCalculation
            | Stage::HierMPNetworkBackward
            | Stage::HierMPLocalReduce => Some(CommunicationStrategy::Hierarchical),
            _ => None,
        }
    }

    pub fn forward_stages(comm: CommunicationStrategy) -> Vec<Stage> {
        match comm {
            CommunicationStrategy::Uniform => vec![
                Stage::DPForward,
                Stage::MPModelForward,
                Stage::MPNetworkForward,
            ],
            CommunicationStrategy::Hierarchical => vec![
                Stage::DPForward,
                Stage::HierMPModelForward,
                Stage::HierMPNetworkForward,
            ],
        }
    }

    pub fn backward_stages(comm: CommunicationStrategy) -> Vec<Stage> {
        let mut stages = vec![
            Stage::DPBackwardIndexCalculation,
            Stage::DPLocalReduce,
            Stage::DPAllreduce,
        ];
        match comm {
            CommunicationStrategy::Uniform => stages.extend([
                Stage::MPBackwardIndexCalculation,
                Stage::MPNetworkBackward,
                Stage::MPLocalReduce,
            ]),
            CommunicationStrategy::Hierarchical => stages.extend([
                Stage::HierMPBackwardIndexCalculation,
                Stage::HierMPNetworkBackward,
                Stage::HierMPLocalReduce,
            ]),
        }
        stages
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_le_round_trip() {
        let mut buf = Vec::new();
        0x0102_0304u32.write_le(&mut buf);
        assert_eq!(buf, vec![4, 3, 2, 1]);
        assert_eq!(u32::read_le(&buf), Some(0x0102_0304));
        assert_eq!(u32::read_le(&buf[..3]), None);
    }

    #[test]
    fn test_key_narrowing() {
        assert_eq!(u32::from_u64(7), Some(7));
        assert_eq!(u32::from_u64(u64::MAX), None);
        assert_eq!(<u64 as HashKey>::BYTES, 8);
    }

    #[test]
    fn test_stage_order() {
        let fwd = Stage::forward_stages(CommunicationStrategy::Hierarchical);
        assert_eq!(fwd[0], Stage::DPForward);
        assert!(fwd.iter().all(|s| s.is_forward()));

        let bwd = Stage::backward_stages(CommunicationStrategy::Uniform);
        assert_eq!(bwd.len(), 6);
        assert!(bwd.iter().all(|s| !s.is_forward()));
        assert_eq!(
            bwd[4].comm_strategy(),
            Some(CommunicationStrategy::Uniform)
        );
    }

    #[test]
    fn test_stage_placement() {
        assert_eq!(
            Stage::DPAllreduce.placement(),
            TablePlacementStrategy::DataParallel
        );
        assert_eq!(
            Stage::HierMPNetworkForward.placement(),
            TablePlacementStrategy::ModelParallel
        );
        assert_eq!(Stage::DPForward.comm_strategy(), None);
    }
}
