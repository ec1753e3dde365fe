//! Cluster extraction and cluster-level correction.
//!
//! A statistic map is thresholded at `θ`, split into connected components,
//! and each component is kept or dropped by a [`CorrectionPolicy`]. The same
//! procedure runs on the map (positive tail) and on its negation (negative
//! tail); surviving voxels of both tails are merged into one cluster map.

use crate::error::{Error, Result};
use crate::nifti;
use crate::output::{self, OutputSet};
use crate::smoothness::{
    AutocorrelationEstimator, PrecomputedSmoothness, Smoothness, SmoothnessEstimator,
};
use crate::table;
use crate::volume::{Mask, Volume};
use statrs::distribution::{ContinuousCDF, Normal};
use statrs::function::gamma::gamma;
use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

/// Voxel neighbourhood used to connect supra-threshold voxels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connectivity {
    /// Shared faces only.
    Face6,
    /// Faces and edges.
    Edge18,
    /// Faces, edges and corners.
    #[default]
    Corner26,
}

impl Connectivity {
    /// Connectivity from its neighbour count (6, 18 or 26).
    pub fn from_neighbours(count: u8) -> Result<Self> {
        match count {
            6 => Ok(Self::Face6),
            18 => Ok(Self::Edge18),
            26 => Ok(Self::Corner26),
            other => Err(Error::config(format!(
                "connectivity must be 6, 18 or 26, got {other}"
            ))),
        }
    }

    pub fn neighbours(self) -> u8 {
        match self {
            Self::Face6 => 6,
            Self::Edge18 => 18,
            Self::Corner26 => 26,
        }
    }

    /// Neighbour offsets `(di, dj, dk)`.
    pub fn offsets(self) -> Vec<[isize; 3]> {
        let max_nonzero = match self {
            Self::Face6 => 1,
            Self::Edge18 => 2,
            Self::Corner26 => 3,
        };
        let mut offsets = Vec::with_capacity(self.neighbours() as usize);
        for dk in -1..=1isize {
            for dj in -1..=1isize {
                for di in -1..=1isize {
                    let nonzero = [di, dj, dk].iter().filter(|&&d| d != 0).count();
                    if nonzero > 0 && nonzero <= max_nonzero {
                        offsets.push([di, dj, dk]);
                    }
                }
            }
        }
        offsets
    }
}

/// Sign of the effects a cluster belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tail {
    Positive,
    Negative,
}

impl Tail {
    pub fn sign(self) -> f64 {
        match self {
            Self::Positive => 1.0,
            Self::Negative => -1.0,
        }
    }
}

impl fmt::Display for Tail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
        })
    }
}

/// Survival criterion applied to every cluster of both tails.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CorrectionPolicy {
    /// Keep clusters with at least this many voxels.
    Extent(usize),
    /// Keep clusters whose random-field probability is at most `max_p`.
    Probability { max_p: f64 },
}

impl CorrectionPolicy {
    /// Policy from a single number: a probability when `value <= 1`, a
    /// minimum extent (rounded) otherwise.
    pub fn from_value(value: f64) -> Result<Self> {
        if !value.is_finite() || value < 0.0 {
            return Err(Error::config(format!(
                "cluster p-value or size must be a non-negative number, got {value}"
            )));
        }
        if value <= 1.0 {
            Ok(Self::Probability { max_p: value })
        } else {
            Ok(Self::Extent(value.round() as usize))
        }
    }
}

/// Value written at surviving voxels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// `|statistic|`.
    #[default]
    Magnitude,
    /// `1.0`.
    Binary,
}

/// Cluster extraction parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterConfig {
    /// Cluster-forming threshold, applied to both tails.
    pub threshold: f64,
    pub policy: CorrectionPolicy,
    pub connectivity: Connectivity,
    pub output: OutputMode,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            threshold: 3.0,
            policy: CorrectionPolicy::Extent(100),
            connectivity: Connectivity::default(),
            output: OutputMode::default(),
        }
    }
}

impl ClusterConfig {
    pub fn new(threshold: f64, policy: CorrectionPolicy) -> Self {
        Self {
            threshold,
            policy,
            ..Default::default()
        }
    }

    pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn with_output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.threshold.is_finite() && self.threshold > 0.0) {
            return Err(Error::InvalidThreshold(self.threshold));
        }
        if let CorrectionPolicy::Probability { max_p } = self.policy {
            if !(0.0..=1.0).contains(&max_p) {
                return Err(Error::config(format!(
                    "cluster p-value must be in [0, 1], got {max_p}"
                )));
            }
        }
        Ok(())
    }
}

/// Gaussian random-field model of cluster extents in 3D
/// (Friston et al. 1994, as implemented by FSL `cluster`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterInference {
    /// Expected number of clusters above the threshold.
    pub expected_clusters: f64,
    /// Expected number of voxels above the threshold.
    pub expected_voxels: f64,
    beta: f64,
    volume: f64,
}

impl ClusterInference {
    pub fn new(smoothness: &Smoothness, threshold: f64) -> Result<Self> {
        if !(threshold > 1.0) {
            return Err(Error::config(format!(
                "probability correction needs a forming threshold above 1, got {threshold}"
            )));
        }
        let volume = smoothness.volume;
        let t2 = threshold * threshold;
        let expected_clusters = volume
            * (2.0 * std::f64::consts::PI).powi(-2)
            * smoothness.dlh
            * (t2 - 1.0)
            * (-t2 / 2.0).exp();
        let normal = Normal::new(0.0, 1.0).map_err(|e| Error::Numerical(e.to_string()))?;
        let expected_voxels = volume * normal.cdf(-threshold);
        if !(expected_clusters > 0.0 && expected_voxels > 0.0) {
            return Err(Error::Numerical(format!(
                "degenerate random-field model: E[m] = {expected_clusters}, E[N] = {expected_voxels}"
            )));
        }
        let beta = (gamma(2.5) * expected_clusters / expected_voxels).powf(2.0 / 3.0);
        Ok(Self {
            expected_clusters,
            expected_voxels,
            beta,
            volume,
        })
    }

    /// Probability of observing a cluster of at least `extent` voxels.
    pub fn probability(&self, extent: usize) -> f64 {
        let k = extent as f64;
        1.0 - (-self.expected_clusters * (-self.beta * k.powf(2.0 / 3.0)).exp()).exp()
    }

    /// Smallest extent whose probability is at most `max_p`, or `None` when
    /// no extent within the search volume qualifies.
    pub fn min_extent(&self, max_p: f64) -> Option<usize> {
        let limit = (self.volume.ceil() as usize).max(1);
        if self.probability(limit) > max_p {
            return None;
        }
        let (mut low, mut high) = (1usize, limit);
        while low < high {
            let mid = low + (high - low) / 2;
            if self.probability(mid) <= max_p {
                high = mid;
            } else {
                low = mid + 1;
            }
        }
        Some(low)
    }
}

/// One surviving cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterRecord {
    /// 1-based rank in the table.
    pub index: usize,
    pub tail: Tail,
    pub voxels: usize,
    /// Random-field probability (probability correction only).
    pub p: Option<f64>,
    /// Signed statistic at the peak.
    pub max: f64,
    pub peak: [usize; 3],
    /// Centre of gravity in voxel coordinates, weighted by magnitude.
    pub cog: [f64; 3],
}

/// Output of [`ClusterExtractor::extract`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterResult {
    /// Surviving voxels of both tails; zero elsewhere.
    pub map: Volume,
    /// Surviving clusters sorted by voxel count, descending.
    pub table: Vec<ClusterRecord>,
    /// Minimum surviving extent implied by probability correction.
    pub min_extent: Option<usize>,
}

impl ClusterResult {
    /// Number of nonzero voxels in the cluster map.
    pub fn surviving_voxels(&self) -> usize {
        self.map.data().iter().filter(|&&v| v != 0.0).count()
    }
}

/// Thresholds statistic maps and applies cluster-level correction.
#[derive(Debug, Clone)]
pub struct ClusterExtractor {
    config: ClusterConfig,
}

impl ClusterExtractor {
    pub fn new(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Extract the clusters of both tails of `statistic`.
    ///
    /// Probability correction asks `smoothness` for a descriptor of the map
    /// inside `mask`; extent correction ignores it.
    pub fn extract(
        &self,
        statistic: &Volume,
        mask: &Mask,
        smoothness: Option<&dyn SmoothnessEstimator>,
    ) -> Result<ClusterResult> {
        let grid = *statistic.grid();
        grid.ensure_same_grid(mask.grid(), "mask")?;

        let (inference, min_extent) = match self.config.policy {
            CorrectionPolicy::Extent(_) => (None, None),
            CorrectionPolicy::Probability { max_p } => {
                let estimator = smoothness.ok_or_else(|| {
                    Error::config("probability correction requires a smoothness descriptor")
                })?;
                let descriptor = estimator.estimate(statistic, mask)?;
                let inference = ClusterInference::new(&descriptor, self.config.threshold)?;
                let min_extent = inference.min_extent(max_p);
                debug!(?descriptor, ?min_extent, "random-field model");
                (Some(inference), min_extent)
            }
        };

        let mut data = vec![0.0; grid.len()];
        let mut table = Vec::new();
        for tail in [Tail::Positive, Tail::Negative] {
            let oriented = match tail {
                Tail::Positive => statistic.data().to_vec(),
                Tail::Negative => statistic.negated().into_data(),
            };
            let components = label_components(
                &oriented,
                mask,
                grid.shape,
                self.config.threshold,
                self.config.connectivity,
            );
            let found = components.len();
            for component in components {
                let p = inference.map(|model| model.probability(component.len()));
                if !self.survives(component.len(), p) {
                    continue;
                }
                for &voxel in &component {
                    data[voxel] = match self.config.output {
                        OutputMode::Magnitude => oriented[voxel],
                        OutputMode::Binary => 1.0,
                    };
                }
                table.push(describe(&component, &oriented, tail, p, &grid));
            }
            debug!(%tail, found, "clusters labelled");
        }

        table.sort_by(|a, b| {
            b.voxels
                .cmp(&a.voxels)
                .then(a.tail.cmp(&b.tail))
                .then(a.peak.cmp(&b.peak))
        });
        for (rank, record) in table.iter_mut().enumerate() {
            record.index = rank + 1;
        }
        info!(clusters = table.len(), "cluster extraction done");

        Ok(ClusterResult {
            map: Volume::new(grid, data)?,
            table,
            min_extent,
        })
    }

    /// File-level extraction: load the map and optional mask, extract, and
    /// write the cluster map (and table, when requested).
    ///
    /// Without a `smoothness` descriptor file, probability correction
    /// estimates smoothness from the map itself.
    pub fn run(
        &self,
        statistic: &Path,
        mask: Option<&Path>,
        smoothness: Option<&Path>,
        output: &Path,
        table: Option<&Path>,
    ) -> Result<ClusterResult> {
        let statistic = nifti::load(statistic)?;
        let mask = match mask {
            Some(path) => Mask::from_volume(&nifti::load(path)?),
            None => Mask::full(*statistic.grid()),
        };
        let precomputed = smoothness.map(PrecomputedSmoothness::load).transpose()?;
        let estimator: &dyn SmoothnessEstimator = match &precomputed {
            Some(descriptor) => descriptor,
            None => &AutocorrelationEstimator,
        };

        let result = self.extract(&statistic, &mask, Some(estimator))?;
        let mut outputs = OutputSet::new();
        outputs.publish(output, |path| nifti::save(&result.map, path))?;
        info!(
            path = %output.display(),
            clusters = result.table.len(),
            voxels = result.surviving_voxels(),
            "wrote cluster map"
        );
        if let Some(path) = table {
            outputs.publish(path, |path| write_table(&result.table, path))?;
        }
        outputs.commit();
        Ok(result)
    }

    fn survives(&self, extent: usize, p: Option<f64>) -> bool {
        match (self.config.policy, p) {
            (CorrectionPolicy::Extent(min), _) => extent >= min,
            (CorrectionPolicy::Probability { max_p }, Some(p)) => p <= max_p,
            (CorrectionPolicy::Probability { .. }, None) => false,
        }
    }
}

/// Connected components of the in-mask voxels with `value > threshold`.
///
/// Components are returned in order of their lowest linear index; voxels
/// within a component are in breadth-first order.
pub fn label_components(
    values: &[f64],
    mask: &Mask,
    shape: [usize; 3],
    threshold: f64,
    connectivity: Connectivity,
) -> Vec<Vec<usize>> {
    let [nx, ny, nz] = shape;
    let supra: Vec<bool> = values
        .iter()
        .enumerate()
        .map(|(i, &v)| mask.contains(i) && v > threshold)
        .collect();
    let offsets = connectivity.offsets();
    let mut visited = vec![false; values.len()];
    let mut components = Vec::new();
    let mut queue = VecDeque::new();

    for seed in 0..values.len() {
        if !supra[seed] || visited[seed] {
            continue;
        }
        visited[seed] = true;
        queue.push_back(seed);
        let mut component = Vec::new();

        while let Some(voxel) = queue.pop_front() {
            component.push(voxel);
            let (i, j, k) = (voxel % nx, (voxel / nx) % ny, voxel / (nx * ny));
            for [di, dj, dk] in &offsets {
                let (Some(ni), Some(nj), Some(nk)) = (
                    i.checked_add_signed(*di),
                    j.checked_add_signed(*dj),
                    k.checked_add_signed(*dk),
                ) else {
                    continue;
                };
                if ni >= nx || nj >= ny || nk >= nz {
                    continue;
                }
                let neighbour = ni + nj * nx + nk * nx * ny;
                if supra[neighbour] && !visited[neighbour] {
                    visited[neighbour] = true;
                    queue.push_back(neighbour);
                }
            }
        }
        components.push(component);
    }
    components
}

fn describe(
    component: &[usize],
    oriented: &[f64],
    tail: Tail,
    p: Option<f64>,
    grid: &crate::volume::Grid,
) -> ClusterRecord {
    let mut peak = component[0];
    for &voxel in component {
        if oriented[voxel] > oriented[peak] || (oriented[voxel] == oriented[peak] && voxel < peak) {
            peak = voxel;
        }
    }

    let mut weighted = [0.0; 3];
    let mut plain = [0.0; 3];
    let mut total = 0.0;
    for &voxel in component {
        let coords = grid.coordinates(voxel);
        for axis in 0..3 {
            weighted[axis] += oriented[voxel] * coords[axis] as f64;
            plain[axis] += coords[axis] as f64;
        }
        total += oriented[voxel];
    }
    let cog = if total.is_finite() && weighted.iter().all(|w| w.is_finite()) {
        weighted.map(|w| w / total)
    } else {
        plain.map(|c| c / component.len() as f64)
    };

    ClusterRecord {
        index: 0,
        tail,
        voxels: component.len(),
        p,
        max: tail.sign() * oriented[peak],
        peak: grid.coordinates(peak),
        cog,
    }
}

/// Write a cluster table as CSV.
pub fn write_table<P: AsRef<Path>>(records: &[ClusterRecord], path: P) -> Result<()> {
    let path = path.as_ref();
    let mut text = table::format_row(&[
        "Cluster Index",
        "Tail",
        "Voxels",
        "P",
        "Max",
        "Peak X",
        "Peak Y",
        "Peak Z",
        "COG X",
        "COG Y",
        "COG Z",
    ]);
    for record in records {
        text.push_str(&table::format_row(&[
            record.index.to_string(),
            record.tail.to_string(),
            record.voxels.to_string(),
            record.p.map(|p| format!("{p:e}")).unwrap_or_default(),
            record.max.to_string(),
            record.peak[0].to_string(),
            record.peak[1].to_string(),
            record.peak[2].to_string(),
            format!("{:.2}", record.cog[0]),
            format!("{:.2}", record.cog[1]),
            format!("{:.2}", record.cog[2]),
        ]));
    }
    output::write_bytes_atomic(path, text.as_bytes())?;
    info!(path = %path.display(), "wrote cluster table");
    Ok(())
}
