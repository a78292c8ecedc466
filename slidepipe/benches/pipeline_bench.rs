//! Benchmarks for tile grid generation and top-k sampling.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use slidepipe::sampler::TopK;
use slidepipe::tiler::tile_grid;

fn grid_benchmark(c: &mut Criterion) {
    c.bench_function("tile_grid_100k_px", |b| {
        b.iter(|| tile_grid(black_box(100_000), black_box(80_000), black_box(512), black_box(448)));
    });
}

fn top_k_benchmark(c: &mut Criterion) {
    let scores: Vec<f32> = (0..100_000u32)
        .map(|i| (i.wrapping_mul(2_654_435_761) % 10_000) as f32 / 10_000.0)
        .collect();
    c.bench_function("top_k_12_of_100k", |b| {
        b.iter(|| {
            let mut top = TopK::new(12);
            for (i, score) in scores.iter().enumerate() {
                top.offer(*score, i);
            }
            black_box(top.into_sorted_desc())
        });
    });
}

criterion_group!(benches, grid_benchmark, top_k_benchmark);
criterion_main!(benches);
