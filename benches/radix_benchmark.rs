#![allow(clippy::unwrap_used, clippy::expect_used)]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kmerbin::kmer::PackedKmer;
use kmerbin::radix::radix_sort;

fn pseudo_random(n: usize, bits: usize) -> Vec<PackedKmer<1>> {
    let mask = if bits >= 64 { u64::MAX } else { (1 << bits) - 1 };
    let mut state = 0x2545_f491_4f6c_dd1du64;
    (0..n)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let mut k = PackedKmer::zero();
            for i in 0..8 {
                k.set_byte(i, (((state & mask) >> (8 * i)) & 0xff) as u8);
            }
            k
        })
        .collect()
}

fn bench_radix_sort(c: &mut Criterion) {
    let mut group = c.benchmark_group("radix_sort");

    for n in [1_000usize, 100_000, 1_000_000] {
        let data = pseudo_random(n, 56);
        group.bench_with_input(BenchmarkId::from_parameter(n), &data, |b, data| {
            b.iter(|| {
                let mut records = data.clone();
                let mut tmp = Vec::new();
                radix_sort(black_box(&mut records), &mut tmp, 56);
                records
            })
        });
    }

    group.finish();
}

fn bench_std_sort_baseline(c: &mut Criterion) {
    let mut group = c.benchmark_group("sort_unstable_baseline");

    for n in [100_000usize, 1_000_000] {
        let data = pseudo_random(n, 56);
        group.bench_with_input(BenchmarkId::from_parameter(n), &data, |b, data| {
            b.iter(|| {
                let mut records = data.clone();
                records.sort_unstable();
                records
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_radix_sort, bench_std_sort_baseline);
criterion_main!(benches);
