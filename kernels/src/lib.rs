//! CPU kernels behind the sparse embedding pipeline.
//!
//! Every kernel works on flat slices and returns freshly allocated output, so the
//! caller (one logical device in `sparse-embedding`) decides what it owns.

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod cpu_bag_reduce;
pub mod cpu_radix_sort;
pub mod cpu_reorder;
pub mod cpu_segment;

pub use cpu_bag_reduce::cpu_bag_reduce;
pub use cpu_radix_sort::{cpu_radix_sort_pairs, significant_bits};
pub use cpu_reorder::{cpu_reorder_backward, cpu_reorder_forward, ReorderShape};
pub use cpu_segment::{cpu_run_length_encode, cpu_segment_sum, RunLength};

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("Invalid layout: {0}")]
    InvalidLayout(String),
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Trait bound for elements that can be processed by kernels.
/// This mirrors the element bound of the main crate to avoid circular dependencies.
pub trait KernelElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> KernelElem for T where
    T: Num
        + NumAssign
        + Copy
        + Clone
        + Debug
        + Send
        + Sync
        + FromPrimitive
        + ToPrimitive
        + PartialOrd
{
}
