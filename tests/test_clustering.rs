//! Cluster extraction on synthetic statistic maps.

use medvba::cluster::{write_table, ClusterConfig, ClusterExtractor, CorrectionPolicy, Tail};
use medvba::nifti;
use medvba::smoothness::{PrecomputedSmoothness, Smoothness};
use medvba::{Affine, Grid, Mask, OutputMode, Volume};

fn grid(shape: [usize; 3]) -> Grid {
    Grid::new(shape, Affine::identity())
}

/// Map of `shape` holding `value` at each listed voxel.
fn map_with(shape: [usize; 3], voxels: &[([usize; 3], f64)]) -> Volume {
    let grid = grid(shape);
    let mut data = vec![0.0; grid.len()];
    for &(index, value) in voxels {
        data[grid.linear_index(index)] = value;
    }
    Volume::new(grid, data).unwrap()
}

fn cube(origin: [usize; 3], side: usize, value: f64) -> Vec<([usize; 3], f64)> {
    let mut voxels = Vec::new();
    for k in 0..side {
        for j in 0..side {
            for i in 0..side {
                voxels.push(([origin[0] + i, origin[1] + j, origin[2] + k], value));
            }
        }
    }
    voxels
}

fn extractor(threshold: f64, policy: CorrectionPolicy) -> ClusterExtractor {
    ClusterExtractor::new(ClusterConfig::new(threshold, policy)).unwrap()
}

#[test]
fn test_small_clusters_are_removed() {
    let map = map_with(
        [10, 10, 10],
        &[
            ([1, 1, 1], 5.0),
            ([2, 1, 1], 5.0),
            ([3, 1, 1], 5.0),
            ([7, 7, 7], -5.0),
            ([7, 8, 7], -5.0),
            ([7, 9, 7], -5.0),
        ],
    );
    let mask = Mask::full(*map.grid());

    let result = extractor(3.0, CorrectionPolicy::Extent(5))
        .extract(&map, &mask, None)
        .unwrap();
    assert!(result.map.data().iter().all(|&v| v == 0.0));
    assert!(result.table.is_empty());
    assert_eq!(result.surviving_voxels(), 0);
}

#[test]
fn test_zero_extent_keeps_every_supra_threshold_voxel() {
    let map = map_with(
        [6, 6, 6],
        &[([0, 0, 0], 4.0), ([5, 5, 5], -4.5), ([3, 0, 2], 3.5), ([2, 2, 2], 3.0)],
    );
    let mask = Mask::full(*map.grid());

    let result = extractor(3.0, CorrectionPolicy::Extent(0))
        .extract(&map, &mask, None)
        .unwrap();
    assert_eq!(result.surviving_voxels(), 3);
    assert_eq!(result.map.get([5, 5, 5]), 4.5);
    // strictly above the threshold
    assert_eq!(result.map.get([2, 2, 2]), 0.0);
}

#[test]
fn test_tails_are_symmetric() {
    let mut voxels = cube([1, 1, 1], 2, 6.0);
    voxels.extend(cube([5, 5, 5], 3, -4.0));
    let map = map_with([9, 9, 9], &voxels);
    let mask = Mask::full(*map.grid());
    let extractor = extractor(3.0, CorrectionPolicy::Extent(4));

    let direct = extractor.extract(&map, &mask, None).unwrap();
    let flipped = extractor.extract(&map.negated(), &mask, None).unwrap();

    assert_eq!(direct.map, flipped.map);
    assert_eq!(direct.table.len(), 2);
    for (a, b) in direct.table.iter().zip(&flipped.table) {
        assert_eq!(a.voxels, b.voxels);
        assert_ne!(a.tail, b.tail);
        assert_eq!(a.max, -b.max);
        assert_eq!(a.peak, b.peak);
    }
    assert_eq!(direct.table[0].tail, Tail::Negative);
    assert_eq!(direct.table[0].voxels, 27);
    assert_eq!(direct.table[1].voxels, 8);
    assert_eq!(direct.table[1].index, 2);
}

#[test]
fn test_binary_output() {
    let map = map_with([4, 4, 4], &cube([0, 0, 0], 2, -7.0));
    let mask = Mask::full(*map.grid());
    let config = ClusterConfig::new(2.0, CorrectionPolicy::Extent(1)).with_output(OutputMode::Binary);

    let result = ClusterExtractor::new(config)
        .unwrap()
        .extract(&map, &mask, None)
        .unwrap();
    assert_eq!(result.map.data().iter().filter(|&&v| v == 1.0).count(), 8);
    assert_eq!(result.surviving_voxels(), 8);
}

#[test]
fn test_probability_correction_with_precomputed_smoothness() {
    let mut voxels = cube([1, 1, 1], 3, 5.0);
    voxels.push(([8, 8, 8], 5.0));
    let map = map_with([10, 10, 10], &voxels);
    let mask = Mask::full(*map.grid());
    let smoothness = PrecomputedSmoothness(Smoothness {
        volume: 1000.0,
        dlh: 0.5,
        resels: 8.0,
    });

    let result = extractor(2.3, CorrectionPolicy::Probability { max_p: 0.05 })
        .extract(&map, &mask, Some(&smoothness))
        .unwrap();
    assert_eq!(result.min_extent, Some(19));
    assert_eq!(result.table.len(), 1);
    let p = result.table[0].p.unwrap();
    assert!((p - 0.015584).abs() < 1e-4);
    assert_eq!(result.surviving_voxels(), 27);
}

#[test]
fn test_run_writes_map_and_table() {
    let dir = tempfile::tempdir().unwrap();
    let statistic = dir.path().join("t.nii.gz");
    let mask = dir.path().join("mask.nii.gz");
    let mut voxels = cube([0, 0, 0], 2, 4.0);
    voxels.push(([2, 2, 2], 9.0));
    let map = map_with([5, 5, 5], &voxels);
    nifti::save(&map, &statistic).unwrap();
    nifti::save(&Volume::filled(*map.grid(), 1.0).unwrap(), &mask).unwrap();

    let clusters = dir.path().join("clusters.nii.gz");
    let table = dir.path().join("clusters.csv");
    let result = extractor(3.0, CorrectionPolicy::Extent(2))
        .run(&statistic, Some(&mask), None, &clusters, Some(&table))
        .unwrap();

    // (2,2,2) touches (1,1,1) by a corner under 26-connectivity
    assert_eq!(result.table.len(), 1);
    assert_eq!(result.table[0].voxels, 9);
    assert_eq!(result.table[0].peak, [2, 2, 2]);
    assert_eq!(nifti::load(&clusters).unwrap().get([2, 2, 2]), 9.0);

    let text = std::fs::read_to_string(&table).unwrap();
    let mut lines = text.lines();
    assert!(lines.next().unwrap().starts_with("Cluster Index,Tail,Voxels,P,Max"));
    assert!(lines.next().unwrap().starts_with("1,positive,9,,9,2,2,2,"));
    assert!(lines.next().is_none());
}

#[test]
fn test_failed_table_write_removes_cluster_map() {
    let dir = tempfile::tempdir().unwrap();
    let statistic = dir.path().join("t.nii.gz");
    nifti::save(&map_with([4, 4, 4], &cube([0, 0, 0], 2, 4.0)), &statistic).unwrap();

    let clusters = dir.path().join("clusters.nii.gz");
    let table = dir.path().join("missing").join("clusters.csv");
    let err = extractor(3.0, CorrectionPolicy::Extent(1))
        .run(&statistic, None, None, &clusters, Some(&table))
        .unwrap_err();
    assert_eq!(err.kind(), medvba::ErrorKind::Io);
    assert!(!clusters.exists());
}

#[test]
fn test_write_empty_table() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.csv");
    write_table(&[], &path).unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);
}
