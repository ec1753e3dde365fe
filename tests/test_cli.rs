//! End-to-end runs of the `medvba` binary.

use assert_cmd::Command;
use medvba::nifti;
use medvba::{Affine, Grid, Volume};
use predicates::prelude::*;
use std::path::{Path, PathBuf};

fn medvba() -> Command {
    Command::cargo_bin("medvba").unwrap()
}

fn grid() -> Grid {
    Grid::new([4, 4, 4], Affine::from_spacing([1.0, 1.0, 1.0]))
}

/// Subject image: `level` plus a small subject-specific ripple, with a
/// 2×2×2 block raised by `effect`.
fn write_subject(path: &Path, level: f64, effect: f64, subject: usize) {
    let grid = grid();
    let data = (0..grid.len())
        .map(|i| {
            let [x, y, z] = grid.coordinates(i);
            let ripple = ((i * 7 + subject * 13) % 5) as f64 * 0.01;
            let block = if x < 2 && y < 2 && z < 2 { effect } else { 0.0 };
            level + ripple + block
        })
        .collect();
    nifti::save(&Volume::new(grid, data).unwrap(), path).unwrap();
}

fn subjects(dir: &Path) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let a: Vec<PathBuf> = (0..3)
        .map(|s| {
            let path = dir.join(format!("a{s}.nii.gz"));
            write_subject(&path, 1.0, 5.0, s);
            path
        })
        .collect();
    let b: Vec<PathBuf> = (0..3)
        .map(|s| {
            let path = dir.join(format!("b{s}.nii.gz"));
            write_subject(&path, 1.0, 0.0, s + 3);
            path
        })
        .collect();
    (a, b)
}

#[test]
fn test_help_lists_commands() {
    medvba()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("welch"))
        .stdout(predicate::str::contains("cluster"))
        .stdout(predicate::str::contains("report"));
}

#[test]
fn test_labels_conversion() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("charm.tsv");
    let output = dir.path().join("labels.txt");
    std::fs::write(&input, "Index\tAbbreviation\tFull_Name\n3\tFP\tfrontal pole\n7\tV1\tprimary visual cortex\n")
        .unwrap();

    medvba().arg("labels").arg(&input).arg(&output).assert().success();
    assert_eq!(
        std::fs::read_to_string(&output).unwrap(),
        "3 frontal pole\n7 primary visual cortex\n"
    );
}

#[test]
fn test_welch_writes_maps() {
    let dir = tempfile::tempdir().unwrap();
    subjects(dir.path());
    let table = dir.path().join("data.csv");
    std::fs::write(
        &table,
        "Image,Group\na0.nii.gz,1\nb0.nii.gz,0\na1.nii.gz,1\nb1.nii.gz,0\na2.nii.gz,1\nb2.nii.gz,0\n",
    )
    .unwrap();

    let t = dir.path().join("t.nii.gz");
    let z = dir.path().join("z.nii.gz");
    medvba()
        .arg("welch")
        .arg(&table)
        .arg("Group")
        .arg(&t)
        .arg(dir.path().join("p.nii.gz"))
        .arg(&z)
        .arg("--root")
        .arg(dir.path())
        .assert()
        .success();

    // group "0" (b images) comes first, so the raised block is negative
    let t_map = nifti::load(&t).unwrap();
    assert!(t_map.get([0, 0, 0]) < 0.0);
    assert!(z.exists());
}

#[test]
fn test_welch_reads_spreadsheet_with_patterns() {
    let dir = tempfile::tempdir().unwrap();
    subjects(dir.path());
    let table = dir.path().join("data.xlsx");
    let mut workbook = rust_xlsxwriter::Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.write_string(0, 0, "Image").unwrap();
    sheet.write_string(0, 1, "Group").unwrap();
    for (row, (image, group)) in [("a0*", 1.0), ("b0*", 0.0), ("a1.nii.gz", 1.0), ("b1.nii.?z", 0.0)]
        .into_iter()
        .enumerate()
    {
        sheet.write_string(row as u32 + 1, 0, image).unwrap();
        sheet.write_number(row as u32 + 1, 1, group).unwrap();
    }
    workbook.save(&table).unwrap();

    let t = dir.path().join("t.nii.gz");
    medvba()
        .arg("welch")
        .arg(&table)
        .arg("Group")
        .arg(&t)
        .arg("--root")
        .arg(dir.path())
        .assert()
        .success();
    assert!(nifti::load(&t).unwrap().get([0, 0, 0]) < 0.0);
}

#[test]
fn test_welch_rejects_ambiguous_pattern() {
    let dir = tempfile::tempdir().unwrap();
    subjects(dir.path());
    let table = dir.path().join("data.csv");
    std::fs::write(&table, "Image,Group
a*.nii.gz,1
b0.nii.gz,0
b1.nii.gz,0
").unwrap();

    medvba()
        .arg("welch")
        .arg(&table)
        .arg("Group")
        .arg(dir.path().join("t.nii.gz"))
        .arg("--root")
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("3 images matching"));
    assert!(!dir.path().join("t.nii.gz").exists());
}

#[test]
fn test_welch_rejects_third_group() {
    let dir = tempfile::tempdir().unwrap();
    let table = dir.path().join("data.csv");
    std::fs::write(&table, "Image,Group\na.nii,x\nb.nii,y\nc.nii,z\n").unwrap();

    medvba()
        .arg("welch")
        .arg(&table)
        .arg("Group")
        .arg(dir.path().join("t.nii"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected two groups"));
}

#[test]
fn test_cluster_and_report() {
    let dir = tempfile::tempdir().unwrap();
    let grid = grid();
    let statistic = dir.path().join("t.nii.gz");
    let mask = dir.path().join("mask.nii.gz");
    let atlas = dir.path().join("atlas.nii.gz");
    let labels = dir.path().join("labels.txt");
    let data = (0..grid.len())
        .map(|i| if grid.coordinates(i)[2] == 0 && i % 4 < 2 { 6.0 } else { 0.0 })
        .collect();
    nifti::save(&Volume::new(grid, data).unwrap(), &statistic).unwrap();
    nifti::save(&Volume::filled(grid, 1.0).unwrap(), &mask).unwrap();
    nifti::save(&Volume::filled(grid, 5.0).unwrap(), &atlas).unwrap();
    std::fs::write(&labels, "5 whole brain\n").unwrap();

    let clusters = dir.path().join("clusters.nii.gz");
    medvba()
        .arg("cluster")
        .args([&statistic, &mask])
        .args(["3.0", "4"])
        .arg(&clusters)
        .arg("--table")
        .arg(dir.path().join("clusters.csv"))
        .assert()
        .success()
        .stdout(predicate::str::contains("1 cluster(s), 8 voxel(s)"));

    let report = dir.path().join("report.csv");
    medvba()
        .arg("report")
        .args([&clusters, &atlas, &labels, &report])
        .assert()
        .success()
        .stdout(predicate::str::contains("whole brain"));
    assert_eq!(
        std::fs::read_to_string(&report).unwrap(),
        "Name,Number,Volume (mm³)\nwhole brain,5,8.0\n"
    );
}

#[test]
fn test_report_unsupported_format() {
    let dir = tempfile::tempdir().unwrap();
    medvba()
        .arg("report")
        .arg("clusters.nii")
        .arg("atlas.nii")
        .arg("labels.txt")
        .arg(dir.path().join("report.pdf"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("unsupported output format"));
}

#[test]
fn test_cluster_rejects_negative_threshold() {
    medvba()
        .args(["cluster", "t.nii", "m.nii", "--", "-1", "10", "c.nii"])
        .assert()
        .failure();
}

#[test]
fn test_run_then_rerun_is_up_to_date() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = subjects(dir.path());
    let list = |paths: &[PathBuf]| {
        paths
            .iter()
            .map(|p| format!("{:?}", p.file_name().unwrap().to_string_lossy()))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let config = dir.path().join("analysis.toml");
    std::fs::write(
        &config,
        format!(
            "output = \"vba\"\nalphas = [0.05]\nmin_cluster_size = 2\n\n\
             [[groups]]\nname = \"raised\"\nimages = [{}]\n\n\
             [[groups]]\nname = \"flat\"\nimages = [{}]\n",
            list(&a),
            list(&b)
        ),
    )
    .unwrap();

    medvba()
        .arg("run")
        .arg(&config)
        .arg("--dry-run")
        .assert()
        .success()
        .stdout(predicate::str::contains("pending  welch"));

    medvba()
        .arg("run")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("4 task(s) run, 0 up to date"));
    let output = dir.path().join("vba");
    assert!(output.join("t.nii.gz").exists());
    assert!(output.join("raised.nii.gz").exists());
    assert!(output.join("clusters_t_0.05_2.nii.gz").exists());
    assert!(output.join("clusters_t_0.05_2.csv").exists());

    medvba()
        .arg("run")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("0 task(s) run, 4 up to date"));
}
