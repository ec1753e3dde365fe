//! TOML description of a complete two-group analysis.
//!
//! ```toml
//! output = "vba"
//! mask = "mask.nii.gz"
//! alphas = [0.01, 0.005, 0.001]
//!
//! [[groups]]
//! name = "social"
//! images = ["s01.nii.gz", "s02.nii.gz"]
//!
//! [[groups]]
//! name = "not_social"
//! images = ["s03.nii.gz", "s04.nii.gz"]
//!
//! [[atlases]]
//! name = "D99"
//! image = "atlas/D99.nii.gz"
//! labels = "atlas/D99_labels.txt"
//! ```
//!
//! Relative paths are resolved against the directory of the config file.

use crate::cluster::Connectivity;
use crate::error::{Error, Result};
use crate::pipeline::{Action, TaskGraph};
use crate::stats::student_threshold;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the task state file inside the output directory.
pub const STATE_FILE: &str = ".medvba-state.json";

fn default_alphas() -> Vec<f64> {
    vec![0.01, 0.005, 0.001]
}

fn default_min_cluster_size() -> usize {
    100
}

fn default_min_region_size() -> usize {
    50
}

fn default_connectivity() -> u8 {
    Connectivity::default().neighbours()
}

fn default_true() -> bool {
    true
}

/// One group of the comparison.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    pub name: String,
    pub images: Vec<PathBuf>,
}

/// An atlas image with its label dictionary.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AtlasConfig {
    pub name: String,
    pub image: PathBuf,
    pub labels: PathBuf,
}

/// Analysis parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisConfig {
    /// Directory receiving every output.
    pub output: PathBuf,
    pub mask: Option<PathBuf>,
    /// Group A, then group B.
    pub groups: Vec<GroupConfig>,
    /// Per-voxel significance levels; each gives one forming threshold.
    #[serde(default = "default_alphas")]
    pub alphas: Vec<f64>,
    #[serde(default = "default_min_cluster_size")]
    pub min_cluster_size: usize,
    #[serde(default = "default_min_region_size")]
    pub min_region_size: usize,
    #[serde(default = "default_connectivity")]
    pub connectivity: u8,
    /// Also keep clusters by random-field probability at this level.
    pub cluster_p: Option<f64>,
    /// Write the voxel-wise mean image of each group.
    #[serde(default = "default_true")]
    pub averages: bool,
    #[serde(default)]
    pub atlases: Vec<AtlasConfig>,
}

impl AnalysisConfig {
    /// Parse TOML text. Relative paths are resolved against `base`.
    pub fn parse(text: &str, base: &Path, source: &Path) -> Result<Self> {
        let mut config: Self = toml::from_str(text).map_err(|e| {
            let line = e
                .span()
                .map(|span| text[..span.start].matches('\n').count() + 1)
                .unwrap_or(0);
            Error::parse(source, line, e.message())
        })?;
        config.resolve(base);
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::MissingFile(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path).map_err(|e| Error::read(path, e))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&text, base, path)
    }

    fn resolve(&mut self, base: &Path) {
        let join = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        join(&mut self.output);
        if let Some(mask) = self.mask.as_mut() {
            join(mask);
        }
        for group in &mut self.groups {
            group.images.iter_mut().for_each(join);
        }
        for atlas in &mut self.atlases {
            join(&mut atlas.image);
            join(&mut atlas.labels);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.groups.len() != 2 {
            return Err(Error::GroupCount(self.groups.len()));
        }
        for (index, group) in self.groups.iter().enumerate() {
            if group.images.len() < 2 {
                return Err(Error::GroupTooSmall {
                    index,
                    size: group.images.len(),
                });
            }
        }
        if self.groups[0].name == self.groups[1].name {
            return Err(Error::config(format!(
                "group names must differ, both are {:?}",
                self.groups[0].name
            )));
        }
        if let Some(&alpha) = self.alphas.iter().find(|&&a| !(a > 0.0 && a < 1.0)) {
            return Err(Error::config(format!("alpha must be in (0, 1), got {alpha}")));
        }
        Connectivity::from_neighbours(self.connectivity)?;
        if let Some(p) = self.cluster_p {
            if !(p > 0.0 && p <= 1.0) {
                return Err(Error::config(format!("cluster_p must be in (0, 1], got {p}")));
            }
            if self.mask.is_none() {
                return Err(Error::config("cluster_p requires a mask"));
            }
        }
        let mut names = HashSet::new();
        for atlas in &self.atlases {
            if atlas.name.is_empty() || !names.insert(atlas.name.as_str()) {
                return Err(Error::config(format!(
                    "atlas names must be unique and non-empty, got {:?}",
                    atlas.name
                )));
            }
        }
        Ok(())
    }

    /// Total number of images in both groups.
    pub fn sample_count(&self) -> usize {
        self.groups.iter().map(|g| g.images.len()).sum()
    }

    pub fn state_file(&self) -> PathBuf {
        self.output.join(STATE_FILE)
    }

    /// Expand the analysis into tasks.
    ///
    /// Forming thresholds use the pooled degrees of freedom `N - 2`, not the
    /// per-voxel Welch–Satterthwaite value.
    pub fn to_graph(&self) -> Result<TaskGraph> {
        let out = |name: String| self.output.join(name);
        let mut graph = TaskGraph::new();

        let t_map = out("t.nii.gz".into());
        let z_map = out("z.nii.gz".into());
        graph.add(
            "welch",
            Action::WelchTest {
                groups: self.groups.iter().map(|g| g.images.clone()).collect(),
                mask: self.mask.clone(),
                t: t_map.clone(),
                p: Some(out("p.nii.gz".into())),
                z: Some(z_map.clone()),
            },
        )?;

        if self.averages {
            for group in &self.groups {
                graph.add(
                    format!("average_{}", group.name),
                    Action::AverageImages {
                        sources: group.images.clone(),
                        target: out(format!("{}.nii.gz", group.name)),
                    },
                )?;
            }
        }

        let mut labels = Vec::with_capacity(self.atlases.len());
        for atlas in &self.atlases {
            let target = out(format!("labels_{}.txt", atlas.name));
            graph.add(
                format!("labels_{}", atlas.name),
                Action::ConvertLabels {
                    source: atlas.labels.clone(),
                    target: target.clone(),
                },
            )?;
            labels.push(target);
        }

        let smoothness = match (self.cluster_p, &self.mask) {
            (Some(_), Some(mask)) => {
                let target = out("smoothness.txt".into());
                graph.add(
                    "smoothness",
                    Action::Smoothness {
                        z: z_map.clone(),
                        mask: mask.clone(),
                        target: target.clone(),
                    },
                )?;
                Some((target, mask))
            }
            _ => None,
        };

        let df = (self.sample_count() - 2) as f64;
        for &alpha in &self.alphas {
            let threshold = student_threshold(alpha, df)?;
            debug!(alpha, threshold, "forming threshold");

            let stem = format!("clusters_t_{alpha}_{}", self.min_cluster_size);
            graph.add(
                stem.clone(),
                Action::ExtentClustering {
                    statistic: t_map.clone(),
                    mask: self.mask.clone(),
                    threshold,
                    min_size: self.min_cluster_size,
                    connectivity: self.connectivity,
                    target: out(format!("{stem}.nii.gz")),
                    table: Some(out(format!("{stem}.csv"))),
                },
            )?;
            self.add_reports(&mut graph, &stem, &labels)?;

            if let (Some(max_p), Some((smoothness, mask))) = (self.cluster_p, &smoothness) {
                let stem = format!("clusters_t_{alpha}_p{max_p}");
                graph.add(
                    stem.clone(),
                    Action::ProbabilityClustering {
                        statistic: t_map.clone(),
                        mask: (*mask).clone(),
                        threshold,
                        max_p,
                        connectivity: self.connectivity,
                        smoothness: Some(smoothness.clone()),
                        target: out(format!("{stem}.nii.gz")),
                        table: Some(out(format!("{stem}.csv"))),
                    },
                )?;
                self.add_reports(&mut graph, &stem, &labels)?;
            }
        }
        Ok(graph)
    }

    fn add_reports(&self, graph: &mut TaskGraph, stem: &str, labels: &[PathBuf]) -> Result<()> {
        for (atlas, labels) in self.atlases.iter().zip(labels) {
            let name = format!("{stem}_{}_{}", self.min_region_size, atlas.name);
            graph.add(
                name.clone(),
                Action::VolumeReport {
                    clusters: self.output.join(format!("{stem}.nii.gz")),
                    atlas: atlas.image.clone(),
                    labels: labels.clone(),
                    min_size: Some(self.min_region_size),
                    target: self.output.join(format!("{name}.xlsx")),
                },
            )?;
        }
        Ok(())
    }
}
