use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;

/// Geometry of a localized-slot exchange buffer.
///
/// Global slot `s` lives on device `s % num_devices` at local position
/// `s / num_devices`; every device holds `ceil(slot_num / num_devices)` local slots,
/// the last ones possibly padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReorderShape {
    pub batch_size: usize,
    pub slot_num: usize,
    pub vec_size: usize,
    pub num_devices: usize,
}

impl ReorderShape {
    pub fn new(batch_size: usize, slot_num: usize, vec_size: usize, num_devices: usize) -> Self {
        Self {
            batch_size,
            slot_num,
            vec_size,
            num_devices,
        }
    }

    pub fn batch_per_device(&self) -> usize {
        self.batch_size / self.num_devices
    }

    pub fn slots_per_device(&self) -> usize {
        self.slot_num.div_ceil(self.num_devices)
    }

    /// Element count of the device-major buffer `[src][batch/n][slots/n][vec]`.
    pub fn device_major_len(&self) -> usize {
        self.num_devices * self.batch_per_device() * self.slots_per_device() * self.vec_size
    }

    /// Element count of the sample-major buffer `[batch/n][slots][vec]`.
    pub fn sample_major_len(&self) -> usize {
        self.batch_per_device() * self.slot_num * self.vec_size
    }

    fn validate(&self) -> Result<()> {
        if self.num_devices == 0 || self.vec_size == 0 {
            return Err(KernelError::InvalidLayout(format!(
                "num_devices and vec_size must be positive: {self:?}"
            )));
        }
        if self.batch_size % self.num_devices != 0 {
            return Err(KernelError::InvalidLayout(format!(
                "batch size {} is not divisible by {} devices",
                self.batch_size, self.num_devices
            )));
        }
        Ok(())
    }

    /// Offset of `(sample, global slot)` inside the device-major buffer.
    #[inline]
    fn device_major_offset(&self, sample: usize, slot: usize) -> usize {
        let src = slot % self.num_devices;
        let local = slot / self.num_devices;
        ((src * self.batch_per_device() + sample) * self.slots_per_device() + local) * self.vec_size
    }
}

/// CPU Implementation of the forward reorder.
///
/// Permutes the concatenated per-source contributions received by one device
/// (`[src][batch/n][slots/n][vec]`) into sample-major, slot-ordered layout
/// (`[batch/n][slots][vec]`). Padding slots are dropped.
pub fn cpu_reorder_forward<T>(input: &[T], shape: ReorderShape) -> Result<Vec<T>>
where
    T: KernelElem,
{
    shape.validate()?;
    if input.len() != shape.device_major_len() {
        return Err(KernelError::ShapeMismatch {
            expected: vec![shape.device_major_len()],
            got: vec![input.len()],
        });
    }

    let vec_size = shape.vec_size;
    let slot_num = shape.slot_num;
    let mut out = vec![T::zero(); shape.sample_major_len()];
    out.par_chunks_mut(vec_size)
        .enumerate()
        .for_each(|(i, out_row)| {
            let sample = i / slot_num;
            let slot = i % slot_num;
            let src = shape.device_major_offset(sample, slot);
            out_row.copy_from_slice(&input[src..src + vec_size]);
        });

    Ok(out)
}

/// CPU Implementation of the backward reorder, the exact inverse of
/// [`cpu_reorder_forward`]. Padding slots come out as zeros.
pub fn cpu_reorder_backward<T>(input: &[T], shape: ReorderShape) -> Result<Vec<T>>
where
    T: KernelElem,
{
    shape.validate()?;
    if input.len() != shape.sample_major_len() {
        return Err(KernelError::ShapeMismatch {
            expected: vec![shape.sample_major_len()],
            got: vec![input.len()],
        });
    }

    let vec_size = shape.vec_size;
    let bpd = shape.batch_per_device();
    let spd = shape.slots_per_device();
    let n = shape.num_devices;
    let mut out = vec![T::zero(); shape.device_major_len()];
    out.par_chunks_mut(vec_size)
        .enumerate()
        .for_each(|(i, out_row)| {
            let local = i % spd;
            let sample = (i / spd) % bpd;
            let src = i / (spd * bpd);
            let slot = local * n + src;
            if slot < shape.slot_num {
                let from = (sample * shape.slot_num + slot) * vec_size;
                out_row.copy_from_slice(&input[from..from + vec_size]);
            }
        });

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reorder_forward_two_devices() {
        // 2 devices, 1 sample per device, 4 slots, vec_size 1.
        // Device-major input: src 0 holds slots {0, 2}, src 1 holds slots {1, 3}.
        let shape = ReorderShape::new(2, 4, 1, 2);
        let input = vec![0.0f32, 2.0, 1.0, 3.0];

        let out = cpu_reorder_forward(&input, shape).unwrap();

        assert_eq!(out, vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_reorder_backward_is_inverse() {
        let shape = ReorderShape::new(4, 5, 3, 2);
        let sample_major: Vec<f32> = (0..shape.sample_major_len()).map(|i| i as f32).collect();

        let device_major = cpu_reorder_backward(&sample_major, shape).unwrap();
        let back = cpu_reorder_forward(&device_major, shape).unwrap();

        assert_eq!(back, sample_major);
    }

    #[test]
    fn test_reorder_padding_is_zero() {
        // 3 slots over 2 devices: device 1 has one padding slot.
        let shape = ReorderShape::new(2, 3, 1, 2);
        let sample_major = vec![1.0f32, 2.0, 3.0];

        let device_major = cpu_reorder_backward(&sample_major, shape).unwrap();

        // src 0: slots {0, 2}; src 1: slots {1, pad}
        assert_eq!(device_major, vec![1.0, 3.0, 2.0, 0.0]);
    }

    #[test]
    fn test_reorder_rejects_indivisible_batch() {
        let shape = ReorderShape::new(3, 2, 1, 2);
        assert!(cpu_reorder_forward(&[0.0f32; 4], shape).is_err());
    }
}
