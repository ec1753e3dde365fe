//! CLI argument parsing for medvba

use crate::cluster::Connectivity;
use crate::error::{Error, Result};
use crate::table::Table;
use clap::{Args, Parser, Subcommand};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "medvba")]
#[command(version)]
#[command(about = "Voxel-based group analysis of aligned NIfTI images", long_about = None)]
pub struct Cli {
    /// Increase log verbosity (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Voxel-wise Welch t-test, writing t, p and z maps
    Welch(WelchArgs),
    /// Threshold a statistic map and keep clusters by size or probability
    Cluster(ClusterArgs),
    /// Region volumes of a cluster map within an atlas
    Report(ReportArgs),
    /// Estimate the smoothness of a z map
    Smoothness(SmoothnessArgs),
    /// Convert a label dictionary to "<id> <name>" lines
    Labels(LabelsArgs),
    /// Run the analysis described by a TOML file
    Run(RunArgs),
}

#[derive(Args, Debug)]
pub struct WelchArgs {
    /// Data table (CSV or spreadsheet) with an "Image" column and the grouping column
    pub table: PathBuf,
    /// Name of the grouping column (exactly two distinct values)
    pub group: String,
    /// Output t-statistic map
    #[arg(value_name = "t.nii.gz")]
    pub t: PathBuf,
    /// Output p-value map
    #[arg(value_name = "p.nii.gz")]
    pub p: Option<PathBuf>,
    /// Output z-score map
    #[arg(value_name = "z.nii.gz")]
    pub z: Option<PathBuf>,
    /// Directory against which relative image paths are resolved
    #[arg(long, value_name = "DIR")]
    pub root: Option<PathBuf>,
    /// Mask image (only nonzero voxels are processed)
    #[arg(long, value_name = "MASK")]
    pub mask: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ClusterArgs {
    /// Statistic (t or z) map
    pub statistic: PathBuf,
    /// Binary mask of the statistic map
    pub mask: PathBuf,
    /// Cluster-forming threshold
    pub threshold: f64,
    /// If <= 1, cluster-wise p-value threshold; if > 1, minimum cluster size in voxels
    pub p_or_size: f64,
    /// Output cluster map
    pub clusters: PathBuf,
    /// Voxel connectivity
    #[arg(long, default_value = "26", value_name = "6|18|26", value_parser = parse_connectivity)]
    pub connectivity: Connectivity,
    /// Write 1 instead of |statistic| at surviving voxels
    #[arg(long)]
    pub binary: bool,
    /// Write the cluster table to this CSV file
    #[arg(long, value_name = "CSV")]
    pub table: Option<PathBuf>,
    /// Precomputed smoothness descriptor (DLH/VOLUME/RESELS)
    #[arg(long, value_name = "FILE")]
    pub smoothness: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ReportArgs {
    /// Cluster map
    pub clusters: PathBuf,
    /// Integer-labelled atlas on the grid of the cluster map
    pub atlas: PathBuf,
    /// Label dictionary
    pub labels: PathBuf,
    /// Output table (.csv, .xls or .xlsx)
    pub output: PathBuf,
    /// Drop regions with at most this many voxels
    #[arg(long, value_name = "N")]
    pub min_size: Option<usize>,
}

#[derive(Args, Debug)]
pub struct SmoothnessArgs {
    /// z-score map
    pub z: PathBuf,
    /// Mask image
    pub mask: PathBuf,
    /// Write the descriptor here instead of stdout
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct LabelsArgs {
    /// Label dictionary in either dialect
    pub input: PathBuf,
    /// Output dictionary
    pub output: PathBuf,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Analysis description
    pub config: PathBuf,
    /// Print the plan without running anything
    #[arg(long)]
    pub dry_run: bool,
}

fn parse_connectivity(value: &str) -> std::result::Result<Connectivity, String> {
    let count: u8 = value.parse().map_err(|_| format!("invalid connectivity {value:?}"))?;
    Connectivity::from_neighbours(count).map_err(|e| e.to_string())
}

/// Image groups read from a data table, ordered by group value.
///
/// Values that all parse as numbers are ordered numerically, others
/// lexicographically. Relative image paths are resolved against `root`;
/// entries holding glob patterns must match exactly one file.
pub fn load_groups(
    table: &Table,
    group: &str,
    root: &Path,
    source: &Path,
) -> Result<Vec<(String, Vec<PathBuf>)>> {
    let image_column = table
        .column("Image")
        .ok_or_else(|| Error::parse(source, 1, "mandatory column \"Image\" is missing"))?;
    let group_column = table
        .column(group)
        .ok_or_else(|| Error::parse(source, 1, format!("mandatory column {group:?} is missing")))?;

    let mut groups: Vec<(String, Vec<PathBuf>)> = Vec::new();
    for (number, row) in table.rows.iter().enumerate() {
        let value = row[group_column].trim();
        let image = PathBuf::from(row[image_column].trim());
        let image = if image.is_relative() { root.join(image) } else { image };
        // header is row 1
        let image = expand_image(image, source, number + 2)?;
        match groups.iter_mut().find(|(name, _)| name == value) {
            Some((_, images)) => images.push(image),
            None => groups.push((value.to_string(), vec![image])),
        }
    }

    let numeric = groups.iter().all(|(name, _)| name.parse::<f64>().is_ok());
    groups.sort_by(|(a, _), (b, _)| {
        if numeric {
            let (a, b) = (a.parse::<f64>().unwrap_or(0.0), b.parse::<f64>().unwrap_or(0.0));
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        } else {
            a.cmp(b)
        }
    });
    Ok(groups)
}

fn is_pattern(image: &Path) -> bool {
    image.to_string_lossy().contains(['*', '?', '['])
}

/// The single file matched by a glob pattern; plain paths are returned as is.
fn expand_image(image: PathBuf, source: &Path, row: usize) -> Result<PathBuf> {
    if !is_pattern(&image) {
        return Ok(image);
    }
    let pattern = image.to_string_lossy();
    let mut matches: Vec<PathBuf> = glob::glob(&pattern)
        .map_err(|e| Error::parse(source, row, format!("invalid image pattern {pattern:?}: {e}")))?
        .flat_map(|entry| entry.ok())
        .collect();
    match matches.len() {
        0 => Err(Error::parse(source, row, format!("no image matching {pattern}"))),
        1 => Ok(matches.remove(0)),
        count => {
            matches.sort();
            let listed: Vec<String> = matches.iter().map(|m| m.display().to_string()).collect();
            Err(Error::parse(
                source,
                row,
                format!("{count} images matching {pattern}: {}", listed.join(", ")),
            ))
        }
    }
}
