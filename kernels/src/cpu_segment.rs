use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;

/// Run-length encoding of a sorted key array.
///
/// `offsets[i]` is where the run of `unique[i]` starts in the sorted input and
/// `counts[i]` is how long it is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunLength {
    pub unique: Vec<u64>,
    pub counts: Vec<u32>,
    pub offsets: Vec<u32>,
}

impl RunLength {
    pub fn len(&self) -> usize {
        self.unique.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unique.is_empty()
    }
}

/// Computes segment boundaries of an ascending key array.
pub fn cpu_run_length_encode(sorted: &[u64]) -> Result<RunLength> {
    if sorted.len() > u32::MAX as usize {
        return Err(KernelError::InvalidLayout(format!(
            "{} keys do not fit 32-bit segment offsets",
            sorted.len()
        )));
    }

    let mut run = RunLength::default();
    for (i, &key) in sorted.iter().enumerate() {
        match run.unique.last() {
            Some(&last) if last == key => {
                if let Some(c) = run.counts.last_mut() {
                    *c += 1;
                }
            }
            Some(&last) if last > key => {
                return Err(KernelError::InvalidLayout(format!(
                    "input is not sorted at position {i}"
                )));
            }
            _ => {
                run.unique.push(key);
                run.counts.push(1);
                run.offsets.push(i as u32);
            }
        }
    }
    Ok(run)
}

/// CPU Implementation of a segmented row sum.
///
/// For every segment of `run`, sums the gradient rows named by `sorted_samples` over
/// that segment. `grad` is laid out as `[num_samples, vec_size]`. When `scales` is
/// given, each contributing row is multiplied by `scales[sample]` first.
///
/// Returns `[run.len(), vec_size]`. Segments are reduced in parallel; within one
/// segment rows are added in `sorted_samples` order.
pub fn cpu_segment_sum<T>(
    grad: &[T],
    vec_size: usize,
    run: &RunLength,
    sorted_samples: &[u64],
    scales: Option<&[T]>,
) -> Result<Vec<T>>
where
    T: KernelElem,
{
    if vec_size == 0 || grad.len() % vec_size != 0 {
        return Err(KernelError::ShapeMismatch {
            expected: vec![grad.len() / vec_size.max(1), vec_size],
            got: vec![grad.len()],
        });
    }
    let num_samples = grad.len() / vec_size;
    if let Some(s) = scales {
        if s.len() != num_samples {
            return Err(KernelError::ShapeMismatch {
                expected: vec![num_samples],
                got: vec![s.len()],
            });
        }
    }
    if run.counts.len() != run.len() || run.offsets.len() != run.len() {
        return Err(KernelError::InvalidLayout(format!(
            "run has {} keys, {} counts and {} offsets",
            run.len(),
            run.counts.len(),
            run.offsets.len()
        )));
    }
    let covered: usize = run.counts.iter().map(|&c| c as usize).sum();
    if covered != sorted_samples.len() {
        return Err(KernelError::ShapeMismatch {
            expected: vec![covered],
            got: vec![sorted_samples.len()],
        });
    }
    if let Some(&bad) = sorted_samples.iter().find(|&&s| s as usize >= num_samples) {
        return Err(KernelError::IndexOutOfBounds {
            index: bad as usize,
            len: num_samples,
        });
    }
    let overrun = run
        .offsets
        .iter()
        .zip(&run.counts)
        .map(|(&offset, &count)| offset as usize + count as usize)
        .find(|&end| end > sorted_samples.len());
    if let Some(end) = overrun {
        return Err(KernelError::IndexOutOfBounds {
            index: end - 1,
            len: sorted_samples.len(),
        });
    }

    let mut out = vec![T::zero(); run.len() * vec_size];
    out.par_chunks_mut(vec_size)
        .enumerate()
        .for_each(|(seg, out_row)| {
            let start = run.offsets[seg] as usize;
            let end = start + run.counts[seg] as usize;
            for &sample in &sorted_samples[start..end] {
                let sample = sample as usize;
                let row = &grad[sample * vec_size..(sample + 1) * vec_size];
                let scale = scales.map_or(T::one(), |s| s[sample]);
                for (o, &g) in out_row.iter_mut().zip(row) {
                    *o += g * scale;
                }
            }
        });

    Ok(out)
}
