//! Criterion benchmarks for the voxel-wise comparison and cluster extraction.
//!
//! Run with: cargo bench --bench welch

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use medvba::cluster::{ClusterConfig, ClusterExtractor, CorrectionPolicy};
use medvba::sampler::VolumeSampler;
use medvba::stats::GroupStatistics;
use medvba::{Affine, Grid, Mask, Volume};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn random_group(rng: &mut ChaCha8Rng, grid: Grid, count: usize, shift: f64) -> Vec<Volume> {
    (0..count)
        .map(|_| {
            let data = (0..grid.len()).map(|_| rng.gen::<f64>() + shift).collect();
            Volume::new(grid, data).unwrap()
        })
        .collect()
}

fn bench_compare(c: &mut Criterion) {
    let mut group = c.benchmark_group("welch_compare");
    let mut rng = ChaCha8Rng::seed_from_u64(42);

    for shape in [[32, 32, 32], [64, 64, 48]] {
        let grid = Grid::new(shape, Affine::identity());
        let sampler = VolumeSampler::new(grid, None).unwrap();
        let a = sampler.sample_volumes(&random_group(&mut rng, grid, 10, 0.1), 0).unwrap();
        let b = sampler.sample_volumes(&random_group(&mut rng, grid, 12, 0.0), 1).unwrap();
        let stats = GroupStatistics::new(sampler);

        let label = format!("{}x{}x{}, 10 vs 12", shape[0], shape[1], shape[2]);
        group.throughput(Throughput::Elements(grid.len() as u64));
        group.bench_function(BenchmarkId::new("voxels", label), |bench| {
            bench.iter(|| black_box(stats.compare(black_box(&a), black_box(&b)).unwrap()))
        });
    }

    group.finish();
}

fn bench_cluster(c: &mut Criterion) {
    let mut group = c.benchmark_group("cluster_extract");
    let mut rng = ChaCha8Rng::seed_from_u64(7);

    let grid = Grid::new([64, 64, 48], Affine::identity());
    let data = (0..grid.len()).map(|_| rng.gen_range(-4.0..4.0)).collect();
    let statistic = Volume::new(grid, data).unwrap();
    let mask = Mask::full(grid);

    for threshold in [2.0, 3.0] {
        let extractor =
            ClusterExtractor::new(ClusterConfig::new(threshold, CorrectionPolicy::Extent(10)))
                .unwrap();
        group.throughput(Throughput::Elements(grid.len() as u64));
        group.bench_with_input(BenchmarkId::new("threshold", threshold), &statistic, |b, map| {
            b.iter(|| black_box(extractor.extract(black_box(map), &mask, None).unwrap()))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_compare, bench_cluster);
criterion_main!(benches);
