use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;

/// CPU Implementation of the bag combiner.
///
/// `row_offsets` is a CSR offset array over buckets: bucket `b` gathers the embedding
/// rows `value_indices[row_offsets[b]..row_offsets[b + 1]]` from `values`
/// (`[num_rows, vec_size]`) and sums them. With `divisors`, bucket `b` is then divided
/// by `divisors[b]`; a zero divisor leaves the (empty) bucket at zero.
///
/// Returns `[num_buckets, vec_size]`.
pub fn cpu_bag_reduce<T>(
    values: &[T],
    vec_size: usize,
    row_offsets: &[usize],
    value_indices: &[usize],
    divisors: Option<&[T]>,
) -> Result<Vec<T>>
where
    T: KernelElem,
{
    if vec_size == 0 || values.len() % vec_size != 0 {
        return Err(KernelError::ShapeMismatch {
            expected: vec![values.len() / vec_size.max(1), vec_size],
            got: vec![values.len()],
        });
    }
    let Some(&nnz) = row_offsets.last() else {
        return Err(KernelError::InvalidLayout("empty row offsets".to_string()));
    };
    if nnz != value_indices.len() {
        return Err(KernelError::ShapeMismatch {
            expected: vec![nnz],
            got: vec![value_indices.len()],
        });
    }
    if row_offsets.windows(2).any(|w| w[0] > w[1]) {
        return Err(KernelError::InvalidLayout(
            "row offsets are not monotonic".to_string(),
        ));
    }
    let num_buckets = row_offsets.len() - 1;
    if let Some(d) = divisors {
        if d.len() != num_buckets {
            return Err(KernelError::ShapeMismatch {
                expected: vec![num_buckets],
                got: vec![d.len()],
            });
        }
    }
    let num_rows = values.len() / vec_size;
    if let Some(&bad) = value_indices.iter().find(|&&r| r >= num_rows) {
        return Err(KernelError::IndexOutOfBounds {
            index: bad,
            len: num_rows,
        });
    }

    let mut out = vec![T::zero(); num_buckets * vec_size];
    out.par_chunks_mut(vec_size)
        .enumerate()
        .for_each(|(bucket, out_row)| {
            for &row in &value_indices[row_offsets[bucket]..row_offsets[bucket + 1]] {
                let src = &values[row * vec_size..(row + 1) * vec_size];
                for (o, &v) in out_row.iter_mut().zip(src) {
                    *o += v;
                }
            }
            if let Some(d) = divisors {
                let divisor = d[bucket];
                if divisor != T::zero() {
                    for o in out_row.iter_mut() {
                        *o = *o / divisor;
                    }
                }
            }
        });

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bag_sum() {
        // 3 rows of width 2
        let values = vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        // bucket 0 = rows {0, 2}, bucket 1 = {}, bucket 2 = {1}
        let row_offsets = vec![0, 2, 2, 3];
        let value_indices = vec![0, 2, 1];

        let out = cpu_bag_reduce(&values, 2, &row_offsets, &value_indices, None).unwrap();

        assert_eq!(out, vec![6.0, 8.0, 0.0, 0.0, 3.0, 4.0]);
    }

    #[test]
    fn test_bag_mean() {
        let values = vec![1.0f32, 2.0, 3.0, 4.0];
        let row_offsets = vec![0, 2, 2];
        let value_indices = vec![0, 1];
        let divisors = vec![2.0, 0.0];

        let out =
            cpu_bag_reduce(&values, 2, &row_offsets, &value_indices, Some(&divisors)).unwrap();

        assert_eq!(out, vec![2.0, 3.0, 0.0, 0.0]);
    }

    #[test]
    fn test_bag_reduce_out_of_bounds() {
        let values = vec![1.0f32, 2.0];
        let result = cpu_bag_reduce(&values, 2, &[0, 1], &[4], None);
        assert!(result.is_err());
    }
}
