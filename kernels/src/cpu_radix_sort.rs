use crate::{KernelError, Result};

const RADIX_BITS: u32 = 8;
const RADIX: usize = 1 << RADIX_BITS;

/// CPU Implementation of a stable key/value radix sort.
///
/// Sorts `keys` ascending and carries `values` along. This is a least-significant-digit
/// sort, so equal keys keep their input order: gradient aggregation relies on that to
/// keep the sample ids of one row in the order they were produced.
///
/// Only bits `[0, end_bit)` are considered. Passing the bit width of the largest key
/// (see [`significant_bits`]) skips passes that would only move zeros around.
pub fn cpu_radix_sort_pairs(
    keys: &[u64],
    values: &[u64],
    end_bit: u32,
) -> Result<(Vec<u64>, Vec<u64>)> {
    if keys.len() != values.len() {
        return Err(KernelError::ShapeMismatch {
            expected: vec![keys.len()],
            got: vec![values.len()],
        });
    }
    if end_bit > u64::BITS {
        return Err(KernelError::InvalidLayout(format!(
            "end_bit {end_bit} exceeds key width {}",
            u64::BITS
        )));
    }

    let n = keys.len();
    let mut keys_in = keys.to_vec();
    let mut values_in = values.to_vec();
    let mut keys_out = vec![0u64; n];
    let mut values_out = vec![0u64; n];

    let mut shift = 0;
    while shift < end_bit {
        let mut counts = [0usize; RADIX];
        for &k in &keys_in {
            counts[digit(k, shift)] += 1;
        }

        // Exclusive prefix sum turns counts into output positions.
        let mut total = 0;
        for c in counts.iter_mut() {
            let count = *c;
            *c = total;
            total += count;
        }

        for (&k, &v) in keys_in.iter().zip(values_in.iter()) {
            let d = digit(k, shift);
            let pos = counts[d];
            keys_out[pos] = k;
            values_out[pos] = v;
            counts[d] += 1;
        }

        std::mem::swap(&mut keys_in, &mut keys_out);
        std::mem::swap(&mut values_in, &mut values_out);
        shift += RADIX_BITS;
    }

    Ok((keys_in, values_in))
}

/// Number of bits needed to represent the largest key in `keys`.
pub fn significant_bits(keys: &[u64]) -> u32 {
    let max = keys.iter().copied().max().unwrap_or(0);
    u64::BITS - max.leading_zeros()
}

#[inline]
fn digit(key: u64, shift: u32) -> usize {
    ((key >> shift) as usize) & (RADIX - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_pairs_simple() {
        let keys = vec![5, 1, 3, 1, 0];
        let values = vec![0, 1, 2, 3, 4];

        let (k, v) = cpu_radix_sort_pairs(&keys, &values, 64).unwrap();

        assert_eq!(k, vec![0, 1, 1, 3, 5]);
        assert_eq!(v, vec![4, 1, 3, 2, 0]);
    }

    #[test]
    fn test_sort_is_stable_across_passes() {
        // Keys that only differ above the first digit exercise more than one pass.
        let keys = vec![0x300, 0x100, 0x300, 0x100, 0x200];
        let values = vec![10, 11, 12, 13, 14];

        let end_bit = significant_bits(&keys);
        let (k, v) = cpu_radix_sort_pairs(&keys, &values, end_bit).unwrap();

        assert_eq!(k, vec![0x100, 0x100, 0x200, 0x300, 0x300]);
        assert_eq!(v, vec![11, 13, 14, 10, 12]);
    }

    #[test]
    fn test_sort_empty() {
        let (k, v) = cpu_radix_sort_pairs(&[], &[], 64).unwrap();
        assert!(k.is_empty());
        assert!(v.is_empty());
    }

    #[test]
    fn test_sort_length_mismatch() {
        let result = cpu_radix_sort_pairs(&[1, 2], &[1], 64);
        assert!(result.is_err());
    }

    #[test]
    fn test_significant_bits() {
        assert_eq!(significant_bits(&[]), 0);
        assert_eq!(significant_bits(&[0, 1]), 1);
        assert_eq!(significant_bits(&[255]), 8);
        assert_eq!(significant_bits(&[256, 3]), 9);
    }
}
