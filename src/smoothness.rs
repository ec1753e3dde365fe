//! Spatial smoothness of a statistic map.
//!
//! The descriptor uses the key names of FSL `smoothest`:
//!
//! ```text
//! DLH 0.0623
//! VOLUME 161242
//! RESELS 31.4
//! ```
//!
//! `KEY=value` lines are accepted as well and unknown keys are ignored.

use crate::error::{Error, Result};
use crate::nifti;
use crate::output;
use crate::volume::{Mask, Volume};
use std::path::Path;
use tracing::debug;

/// Roughness descriptor used by random-field cluster inference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Smoothness {
    /// Search volume, in voxels.
    pub volume: f64,
    /// Roughness, `sqrt(det(Λ))` in voxel units.
    pub dlh: f64,
    /// Size of one resel, in voxels.
    pub resels: f64,
}

impl Smoothness {
    /// Parse the text form. `path` only labels errors.
    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let mut volume = None;
        let mut dlh = None;
        let mut resels = None;

        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .or_else(|| line.split_once(char::is_whitespace))
                .ok_or_else(|| Error::parse(path, number + 1, format!("expected KEY value, got {line:?}")))?;
            let slot = match key.trim().to_ascii_uppercase().as_str() {
                "VOLUME" => &mut volume,
                "DLH" => &mut dlh,
                "RESELS" => &mut resels,
                _ => continue,
            };
            let value: f64 = value
                .trim()
                .parse()
                .map_err(|_| Error::parse(path, number + 1, format!("invalid number {:?}", value.trim())))?;
            if !(value.is_finite() && value > 0.0) {
                return Err(Error::parse(
                    path,
                    number + 1,
                    format!("{} must be positive, got {value}", key.trim()),
                ));
            }
            *slot = Some(value);
        }

        let missing = |key: &str| Error::parse(path, 0, format!("missing {key}"));
        Ok(Self {
            volume: volume.ok_or_else(|| missing("VOLUME"))?,
            dlh: dlh.ok_or_else(|| missing("DLH"))?,
            resels: resels.ok_or_else(|| missing("RESELS"))?,
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::MissingFile(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path).map_err(|e| Error::read(path, e))?;
        Self::parse(&text, path)
    }

    /// Text form, readable by [`Smoothness::parse`].
    pub fn to_text(&self) -> String {
        format!(
            "DLH {}\nVOLUME {}\nRESELS {}\n",
            self.dlh, self.volume, self.resels
        )
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        output::write_bytes_atomic(path.as_ref(), self.to_text().as_bytes())
    }
}

/// Source of a smoothness descriptor for a z map inside a mask.
pub trait SmoothnessEstimator {
    fn estimate(&self, z: &Volume, mask: &Mask) -> Result<Smoothness>;
}

/// A descriptor computed elsewhere, e.g. by FSL `smoothest`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrecomputedSmoothness(pub Smoothness);

impl PrecomputedSmoothness {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Smoothness::load(path).map(Self)
    }
}

impl SmoothnessEstimator for PrecomputedSmoothness {
    fn estimate(&self, z: &Volume, mask: &Mask) -> Result<Smoothness> {
        z.grid().ensure_same_grid(mask.grid(), "mask")?;
        if mask.count() == 0 {
            return Err(Error::Estimation("mask is empty".into()));
        }
        Ok(self.0)
    }
}

/// Estimates smoothness from lag-1 spatial autocorrelations.
///
/// The map is standardized inside the mask. Along each axis the correlation
/// `ρ` of in-mask neighbour pairs gives the width of an equivalent Gaussian
/// kernel, `σ² = -1 / (4 ln ρ)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutocorrelationEstimator;

impl SmoothnessEstimator for AutocorrelationEstimator {
    fn estimate(&self, z: &Volume, mask: &Mask) -> Result<Smoothness> {
        let grid = z.grid();
        grid.ensure_same_grid(mask.grid(), "mask")?;

        let indices = mask.indices();
        if indices.is_empty() {
            return Err(Error::Estimation("mask is empty".into()));
        }
        let data = z.data();
        if let Some(&bad) = indices.iter().find(|&&i| !data[i].is_finite()) {
            return Err(Error::Estimation(format!(
                "non-finite value {} at voxel {:?}",
                data[bad],
                grid.coordinates(bad)
            )));
        }

        let n = indices.len() as f64;
        let mean = indices.iter().map(|&i| data[i]).sum::<f64>() / n;
        let variance = indices.iter().map(|&i| (data[i] - mean).powi(2)).sum::<f64>() / n;
        if variance == 0.0 {
            return Err(Error::Estimation("map is constant inside the mask".into()));
        }
        let sd = variance.sqrt();
        let standardized: Vec<f64> = data.iter().map(|v| (v - mean) / sd).collect();

        let mut dlh = 1.0;
        let mut resels = 1.0;
        for axis in 0..3 {
            let rho = lag_one_correlation(&standardized, mask, grid.shape, axis)?;
            if !(rho > 0.0 && rho < 1.0) {
                return Err(Error::Estimation(format!(
                    "autocorrelation {rho} along axis {axis} is outside (0, 1)"
                )));
            }
            let sigma2 = -1.0 / (4.0 * rho.ln());
            dlh *= (2.0 * sigma2).powf(-0.5);
            resels *= sigma2.sqrt() * (8.0 * std::f64::consts::LN_2).sqrt();
            debug!(axis, rho, sigma2, "axis smoothness");
        }

        Ok(Smoothness {
            volume: n,
            dlh,
            resels,
        })
    }
}

/// Estimate the smoothness of the z map at `z` inside the mask image at
/// `mask` (nonzero voxels).
pub fn estimate_files(z: &Path, mask: &Path) -> Result<Smoothness> {
    let z = nifti::load(z)?;
    let mask = Mask::from_volume(&nifti::load(mask)?);
    AutocorrelationEstimator.estimate(&z, &mask)
}

fn lag_one_correlation(values: &[f64], mask: &Mask, shape: [usize; 3], axis: usize) -> Result<f64> {
    let [nx, ny, nz] = shape;
    let stride = [1, nx, nx * ny][axis];
    let mut cross = 0.0;
    let mut left = 0.0;
    let mut right = 0.0;
    let mut pairs = 0usize;

    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let position = [i, j, k];
                if position[axis] + 1 >= shape[axis] {
                    continue;
                }
                let a = i + j * nx + k * nx * ny;
                let b = a + stride;
                if !(mask.contains(a) && mask.contains(b)) {
                    continue;
                }
                cross += values[a] * values[b];
                left += values[a] * values[a];
                right += values[b] * values[b];
                pairs += 1;
            }
        }
    }

    if pairs == 0 || left == 0.0 || right == 0.0 {
        return Err(Error::Estimation(format!(
            "no usable neighbour pairs along axis {axis}"
        )));
    }
    Ok(cross / (left * right).sqrt())
}
