use criterion::{criterion_group, criterion_main, Criterion};
use sparse_embedding_kernels::{
    cpu_bag_reduce, cpu_radix_sort_pairs, cpu_reorder_backward, cpu_reorder_forward,
    cpu_run_length_encode, cpu_segment_sum, significant_bits, ReorderShape,
};
use std::hint::black_box;

fn benchmark_radix_sort(c: &mut Criterion) {
    let mut group = c.benchmark_group("radix_sort_pairs");
    let sizes = [1 << 12, 1 << 16, 1 << 20];

    for &size in &sizes {
        // Cheap deterministic scramble so runs are realistic but repeatable.
        let keys: Vec<u64> = (0..size as u64)
            .map(|i| (i.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 40) % (size as u64 / 4))
            .collect();
        let values: Vec<u64> = (0..size as u64).collect();
        let end_bit = significant_bits(&keys);

        group.bench_function(format!("{}", size), |b| {
            b.iter(|| {
                cpu_radix_sort_pairs(black_box(&keys), black_box(&values), end_bit).unwrap()
            })
        });
    }
    group.finish();
}

fn benchmark_segment_sum(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment_sum");
    let vec_size = 64;

    for &samples in &[1024usize, 16384] {
        let grad = vec![1.0f32; samples * vec_size];
        let sorted: Vec<u64> = (0..samples as u64).map(|i| i / 8).collect();
        let run = cpu_run_length_encode(&sorted).unwrap();
        let sample_ids: Vec<u64> = (0..samples as u64).collect();

        group.bench_function(format!("{}x{}", samples, vec_size), |b| {
            b.iter(|| {
                cpu_segment_sum(
                    black_box(&grad),
                    vec_size,
                    black_box(&run),
                    black_box(&sample_ids),
                    None,
                )
                .unwrap()
            })
        });
    }
    group.finish();
}

fn benchmark_bag_reduce(c: &mut Criterion) {
    let mut group = c.benchmark_group("bag_reduce");
    let vec_size = 64;
    let rows = 1 << 16;
    let values = vec![0.5f32; rows * vec_size];

    for &buckets in &[4096usize, 65536] {
        let hotness = 4;
        let row_offsets: Vec<usize> = (0..=buckets).map(|b| b * hotness).collect();
        let value_indices: Vec<usize> = (0..buckets * hotness).map(|i| (i * 7919) % rows).collect();

        group.bench_function(format!("{}x{}", buckets, hotness), |b| {
            b.iter(|| {
                cpu_bag_reduce(
                    black_box(&values),
                    vec_size,
                    black_box(&row_offsets),
                    black_box(&value_indices),
                    None,
                )
                .unwrap()
            })
        });
    }
    group.finish();
}

fn benchmark_reorder(c: &mut Criterion) {
    let mut group = c.benchmark_group("reorder");
    let shape = ReorderShape::new(16384, 26, 16, 8);
    let sample_major = vec![1.0f32; shape.sample_major_len()];
    let device_major = cpu_reorder_backward(&sample_major, shape).unwrap();

    group.bench_function("forward", |b| {
        b.iter(|| cpu_reorder_forward(black_box(&device_major), shape).unwrap())
    });
    group.bench_function("backward", |b| {
        b.iter(|| cpu_reorder_backward(black_box(&sample_major), shape).unwrap())
    });
    group.finish();
}

criterion_group!(
    benches,
    benchmark_radix_sort,
    benchmark_segment_sum,
    benchmark_bag_reduce,
    benchmark_reorder
);
criterion_main!(benches);
