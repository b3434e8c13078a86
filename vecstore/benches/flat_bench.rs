use criterion::{black_box, criterion_group, criterion_main, Criterion};
use facebank_vecstore::{l2_normalize, FlatIndex, IndexMetric, VecIndex};

fn random_unit_vec(dim: usize, seed: u64) -> Vec<f32> {
    let mut v = Vec::with_capacity(dim);
    let mut state = seed;
    for _ in 0..dim {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        v.push(((state >> 33) as f32) / (u32::MAX as f32) - 0.5);
    }
    l2_normalize(&mut v);
    v
}

fn filled_index(metric: IndexMetric, dim: usize, n: usize) -> FlatIndex {
    let mut idx = FlatIndex::new(dim, metric).unwrap();
    let vectors: Vec<Vec<f32>> = (0..n).map(|i| random_unit_vec(dim, i as u64 + 1)).collect();
    let refs: Vec<&[f32]> = vectors.iter().map(|v| v.as_slice()).collect();
    idx.add(&refs).unwrap();
    idx
}

fn bench_search(c: &mut Criterion) {
    let dim = 512;
    let query = random_unit_vec(dim, 424242);

    let ip = filled_index(IndexMetric::InnerProduct, dim, 10_000);
    c.bench_function("flat_search_ip_10k_512d", |b| {
        b.iter(|| ip.search(black_box(&query), 1).unwrap())
    });

    let l2 = filled_index(IndexMetric::L2, dim, 10_000);
    c.bench_function("flat_search_l2_10k_512d", |b| {
        b.iter(|| l2.search(black_box(&query), 5).unwrap())
    });
}

fn bench_add(c: &mut Criterion) {
    let dim = 512;
    let batch: Vec<Vec<f32>> = (0..64).map(|i| random_unit_vec(dim, i + 7)).collect();
    let refs: Vec<&[f32]> = batch.iter().map(|v| v.as_slice()).collect();

    c.bench_function("flat_add_batch64_512d", |b| {
        b.iter(|| {
            let mut idx = FlatIndex::new(dim, IndexMetric::L2).unwrap();
            idx.add(black_box(&refs)).unwrap();
            idx
        })
    });
}

criterion_group!(benches, bench_search, bench_add);
criterion_main!(benches);
