//! Per-device compute stages of one table: resolve keys, reduce bags, reorder
//! exchange buffers, and aggregate gradients per unique row.

pub mod aggregation;
pub mod forward;
pub mod indexing;
pub mod reorder;

pub use aggregation::{AggregationPlan, GradientAggregationPipeline, Wgrad};
pub use forward::ForwardReductionStage;
pub use indexing::{IndexedBatch, IndexingPipeline};
pub use reorder::ReorderStage;
