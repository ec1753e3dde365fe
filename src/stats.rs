//! Per-voxel Welch t-test between two groups.
//!
//! Non-finite policy:
//!
//! | condition                                  | t     | p   | z     |
//! |--------------------------------------------|-------|-----|-------|
//! | pooled variance 0, means differ            | ±inf  | 0   | ±inf  |
//! | pooled variance 0, means equal             | NaN   | NaN | NaN   |
//! | voxel outside the mask                     | 0     | 0   | 0     |

use crate::error::{Error, Result};
use crate::nifti;
use crate::output::OutputSet;
use crate::sampler::{SampleMatrix, VolumeSampler, VoxelIndex};
use crate::volume::{Mask, Volume};
use ndarray::{Array1, ArrayView1};
use statrs::distribution::{ContinuousCDF, Normal, StudentsT};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Result of the test at one voxel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WelchVoxel {
    pub t: f64,
    /// Welch–Satterthwaite degrees of freedom (NaN when the pooled variance is 0).
    pub df: f64,
    pub p: f64,
    pub z: f64,
}

/// Co-registered t, p and z volumes.
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticMap {
    pub t: Volume,
    pub p: Volume,
    pub z: Volume,
    /// Number of samples per group.
    pub sizes: [usize; 2],
}

impl StatisticMap {
    /// Degrees of freedom used for forming thresholds, `n_A + n_B - 2`.
    pub fn pooled_df(&self) -> usize {
        self.sizes[0] + self.sizes[1] - 2
    }

    /// Write the t map and, when requested, the p and z maps.
    ///
    /// Either every requested map is written or none is left behind.
    pub fn save(&self, t: &Path, p: Option<&Path>, z: Option<&Path>) -> Result<()> {
        let mut outputs = OutputSet::new();
        outputs.publish(t, |path| nifti::save(&self.t, path))?;
        info!(path = %t.display(), "wrote t map");
        if let Some(path) = p {
            outputs.publish(path, |path| nifti::save(&self.p, path))?;
            info!(path = %path.display(), "wrote p map");
        }
        if let Some(path) = z {
            outputs.publish(path, |path| nifti::save(&self.z, path))?;
            info!(path = %path.display(), "wrote z map");
        }
        outputs.commit();
        Ok(())
    }
}

/// Welch test of two sample vectors.
///
/// Both samples need at least two values; callers check group sizes.
pub fn welch_voxel(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> Result<WelchVoxel> {
    let (mean_a, var_a) = mean_variance(a);
    let (mean_b, var_b) = mean_variance(b);
    let se_a = var_a / a.len() as f64;
    let se_b = var_b / b.len() as f64;
    let pooled = se_a + se_b;
    let diff = mean_a - mean_b;

    if pooled == 0.0 {
        return Ok(if diff == 0.0 {
            WelchVoxel {
                t: f64::NAN,
                df: f64::NAN,
                p: f64::NAN,
                z: f64::NAN,
            }
        } else {
            let inf = f64::INFINITY.copysign(diff);
            WelchVoxel {
                t: inf,
                df: f64::NAN,
                p: 0.0,
                z: inf,
            }
        });
    }

    let t = diff / pooled.sqrt();
    // Scaled by the pooled variance so subnormal or huge variances stay finite.
    let (ra, rb) = (se_a / pooled, se_b / pooled);
    let df = 1.0 / (ra * ra / (a.len() - 1) as f64 + rb * rb / (b.len() - 1) as f64);
    if t == 0.0 {
        return Ok(WelchVoxel { t: 0.0, df, p: 1.0, z: 0.0 });
    }

    let dist = StudentsT::new(0.0, 1.0, df)
        .map_err(|e| Error::Numerical(format!("Student t with df {df}: {e}")))?;
    let p = (2.0 * dist.sf(t.abs())).min(1.0);
    let z = -standard_normal()?.inverse_cdf(0.5 * p) * t.signum();
    Ok(WelchVoxel { t, df, p, z })
}

fn mean_variance(values: ArrayView1<'_, f64>) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.sum() / n;
    let ss: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
    (mean, ss / (n - 1.0))
}

fn standard_normal() -> Result<Normal> {
    Normal::new(0.0, 1.0).map_err(|e| Error::Numerical(e.to_string()))
}

/// Upper-tail Student t quantile: the `t` with `P(T > t) = alpha`.
pub fn student_threshold(alpha: f64, df: f64) -> Result<f64> {
    if !(alpha > 0.0 && alpha < 1.0) {
        return Err(Error::config(format!("alpha must be in (0, 1), got {alpha}")));
    }
    if !(df > 0.0 && df.is_finite()) {
        return Err(Error::config(format!(
            "degrees of freedom must be positive, got {df}"
        )));
    }
    let dist = StudentsT::new(0.0, 1.0, df).map_err(|e| Error::config(e.to_string()))?;
    Ok(dist.inverse_cdf(1.0 - alpha))
}

/// Two-group voxel-wise comparison over a shared voxel index.
#[derive(Debug, Clone)]
pub struct GroupStatistics {
    sampler: VolumeSampler,
}

impl GroupStatistics {
    pub fn new(sampler: VolumeSampler) -> Self {
        Self { sampler }
    }

    /// Compare two groups of in-memory volumes.
    ///
    /// The first volume of group A fixes the grid of every output.
    pub fn compute(groups: &[Vec<Volume>], mask: Option<&Mask>) -> Result<StatisticMap> {
        check_group_sizes(groups.iter().map(Vec::len))?;
        let grid = *groups[0][0].grid();
        let stats = Self::new(VolumeSampler::new(grid, mask)?);
        let a = stats.sampler.sample_volumes(&groups[0], 0)?;
        let b = stats.sampler.sample_volumes(&groups[1], 1)?;
        stats.compare(&a, &b)
    }

    /// Compare two groups of image files, loading one volume at a time.
    pub fn compute_paths(groups: &[Vec<PathBuf>], mask: Option<&Path>) -> Result<StatisticMap> {
        check_group_sizes(groups.iter().map(Vec::len))?;
        let stats = Self::new(VolumeSampler::from_paths(&groups[0][0], mask)?);
        let a = stats.sampler.sample_paths(&groups[0], 0)?;
        let b = stats.sampler.sample_paths(&groups[1], 1)?;
        stats.compare(&a, &b)
    }

    /// Run the test on already sampled groups.
    pub fn compare(&self, a: &SampleMatrix, b: &SampleMatrix) -> Result<StatisticMap> {
        check_group_sizes([a.samples(), b.samples()].into_iter())?;
        let index = self.sampler.index();
        let voxels = index.len();
        if a.voxels() != voxels || b.voxels() != voxels {
            return Err(Error::InvalidDimensions(format!(
                "sample matrices have {} and {} rows, voxel index has {voxels}",
                a.voxels(),
                b.voxels()
            )));
        }

        let mut t = Array1::zeros(voxels);
        let mut p = Array1::zeros(voxels);
        let mut z = Array1::zeros(voxels);
        let mut undefined = 0usize;
        for (row, (sa, sb)) in a.values().rows().into_iter().zip(b.values().rows()).enumerate() {
            let result = welch_voxel(sa, sb)?;
            if result.p.is_nan() {
                undefined += 1;
            }
            t[row] = result.t;
            p[row] = result.p;
            z[row] = result.z;
        }
        if undefined > 0 {
            warn!(voxels = undefined, "zero variance with equal means, statistics are NaN");
        }
        debug!(voxels, n_a = a.samples(), n_b = b.samples(), "welch test done");

        Ok(StatisticMap {
            t: scatter(index, &t)?,
            p: scatter(index, &p)?,
            z: scatter(index, &z)?,
            sizes: [a.samples(), b.samples()],
        })
    }
}

/// Voxel-wise mean of the images in `paths`, on the grid of the first one.
pub fn average_paths(paths: &[PathBuf]) -> Result<Volume> {
    let first = paths
        .first()
        .ok_or_else(|| Error::config("cannot average an empty list of images"))?;
    let sampler = VolumeSampler::from_paths(first, None)?;
    let samples = sampler.sample_paths(paths, 0)?;
    let mean = samples
        .values()
        .mean_axis(ndarray::Axis(1))
        .ok_or_else(|| Error::config("cannot average an empty list of images"))?;
    debug!(images = samples.samples(), "averaged images");
    scatter(sampler.index(), &mean)
}

fn scatter(index: &VoxelIndex, values: &Array1<f64>) -> Result<Volume> {
    index.scatter(values.view())
}

fn check_group_sizes(sizes: impl ExactSizeIterator<Item = usize>) -> Result<()> {
    if sizes.len() != 2 {
        return Err(Error::GroupCount(sizes.len()));
    }
    for (index, size) in sizes.enumerate() {
        if size < 2 {
            return Err(Error::GroupTooSmall { index, size });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{Affine, Grid};
    use ndarray::array;

    #[test]
    fn test_welch_reference_values() {
        let a = array![1.0, 2.0, 3.0, 4.0];
        let b = array![2.0, 4.0, 6.0, 8.0, 10.0];
        let r = welch_voxel(a.view(), b.view()).unwrap();
        assert!((r.t - (-2.2514363231593695)).abs() < 1e-9);
        assert!((r.df - 5.520787746170677).abs() < 1e-9);
        assert!((r.p - 0.069134).abs() < 1e-4);
        assert!(r.z < 0.0);
    }

    #[test]
    fn test_zero_variance_policy() {
        let a = array![3.0, 3.0];
        let b = array![1.0, 1.0];
        let r = welch_voxel(a.view(), b.view()).unwrap();
        assert_eq!(r.t, f64::INFINITY);
        assert_eq!(r.p, 0.0);
        assert_eq!(r.z, f64::INFINITY);

        let r = welch_voxel(b.view(), a.view()).unwrap();
        assert_eq!(r.t, f64::NEG_INFINITY);
        assert_eq!(r.z, f64::NEG_INFINITY);

        let r = welch_voxel(a.view(), a.view()).unwrap();
        assert!(r.t.is_nan() && r.p.is_nan() && r.z.is_nan());
    }

    #[test]
    fn test_equal_means_give_unit_p() {
        let a = array![1.0, 3.0];
        let b = array![0.0, 4.0];
        let r = welch_voxel(a.view(), b.view()).unwrap();
        assert_eq!(r.t, 0.0);
        assert_eq!(r.p, 1.0);
        assert_eq!(r.z, 0.0);
    }

    #[test]
    fn test_subnormal_variance_keeps_finite_df() {
        let a = array![0.0, 1e-160];
        let b = array![1e-160, 3e-160];
        let r = welch_voxel(a.view(), b.view()).unwrap();
        assert!(r.df.is_finite() && r.df > 0.9 && r.df < 2.1);
        assert!(r.t < 0.0 && r.z < 0.0);
        assert!(r.p > 0.0 && r.p < 1.0);

        let huge = array![1e150, -1e150];
        let r = welch_voxel(huge.view(), b.view()).unwrap();
        assert!((r.df - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_student_threshold() {
        let t = student_threshold(0.01, 10.0).unwrap();
        assert!((t - 2.763769).abs() < 1e-4);
        assert!(student_threshold(0.0, 10.0).is_err());
        assert!(student_threshold(0.05, 0.0).is_err());
    }

    #[test]
    fn test_average_paths() {
        let dir = tempfile::tempdir().unwrap();
        let grid = Grid::new([2, 1, 1], Affine::identity());
        let paths: Vec<PathBuf> = [[1.0, 2.0], [3.0, 6.0]]
            .iter()
            .enumerate()
            .map(|(i, values)| {
                let path = dir.path().join(format!("s{i}.nii"));
                nifti::save(&Volume::new(grid, values.to_vec()).unwrap(), &path).unwrap();
                path
            })
            .collect();
        assert_eq!(average_paths(&paths).unwrap().data(), &[2.0, 4.0]);
        assert!(average_paths(&[]).is_err());
    }

    #[test]
    fn test_group_layout_errors() {
        let grid = Grid::new([1, 1, 1], Affine::identity());
        let v = Volume::filled(grid, 1.0).unwrap();
        let three = vec![vec![v.clone(), v.clone()]; 3];
        assert!(matches!(
            GroupStatistics::compute(&three, None),
            Err(Error::GroupCount(3))
        ));
        let small = vec![vec![v.clone(), v.clone()], vec![v.clone()]];
        assert!(matches!(
            GroupStatistics::compute(&small, None),
            Err(Error::GroupTooSmall { index: 1, size: 1 })
        ));
        assert!(matches!(
            GroupStatistics::compute(&[], None),
            Err(Error::GroupCount(0))
        ));
    }
}
