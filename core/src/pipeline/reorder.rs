use crate::error::Result;
use sparse_embedding_kernels::{cpu_reorder_backward, cpu_reorder_forward, ReorderShape};

/// Layout change between exchange buffers and the dense consumer.
///
/// Device-major `[src][batch/n][slots/n][vec]` on one side, sample-major
/// `[batch/n][slots][vec]` on the other. No arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReorderStage {
    shape: ReorderShape,
}

impl ReorderStage {
    pub fn new(batch_size: usize, slot_num: usize, vec_size: usize, num_devices: usize) -> Self {
        Self {
            shape: ReorderShape::new(batch_size, slot_num, vec_size, num_devices),
        }
    }

    pub fn shape(&self) -> ReorderShape {
        self.shape
    }

    pub fn forward(&self, device_major: &[f32]) -> Result<Vec<f32>> {
        Ok(cpu_reorder_forward(device_major, self.shape)?)
    }

    pub fn backward(&self, sample_major: &[f32]) -> Result<Vec<f32>> {
        Ok(cpu_reorder_backward(sample_major, self.shape)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EmbeddingError;

    #[test]
    fn test_round_trip_is_identity() {
        let stage = ReorderStage::new(6, 7, 2, 3);
        let sample_major: Vec<f32> = (0..stage.shape().sample_major_len())
            .map(|i| i as f32 * 0.5)
            .collect();

        let back = stage
            .forward(&stage.backward(&sample_major).unwrap())
            .unwrap();

        assert_eq!(back, sample_major);
    }

    #[test]
    fn test_wrong_length_is_kernel_error() {
        let stage = ReorderStage::new(2, 2, 1, 2);
        let err = stage.forward(&[0.0; 3]).unwrap_err();
        assert!(matches!(err, EmbeddingError::Kernel(_)));
    }
}
