//! Masked, flattened sampling of volume groups.
//!
//! A [`VoxelIndex`] holds the ascending linear indices of the valid voxels of
//! a grid. Groups are compressed through it into [`SampleMatrix`] values
//! (one row per valid voxel, one column per volume) and results are scattered
//! back to dense volumes through the same index, so excluded voxels are never
//! stored.

use crate::error::{Error, Result};
use crate::nifti;
use crate::volume::{Grid, Mask, Volume};
use ndarray::{Array2, ArrayView1, ShapeBuilder};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Linear indices of the valid voxels of a grid.
#[derive(Debug, Clone, PartialEq)]
pub struct VoxelIndex {
    grid: Grid,
    indices: Vec<usize>,
}

impl VoxelIndex {
    /// Index of the voxels selected by `mask`, or of every voxel of `grid`.
    pub fn new(grid: Grid, mask: Option<&Mask>) -> Result<Self> {
        let indices = match mask {
            Some(mask) => {
                grid.ensure_same_shape(mask.grid(), "mask")?;
                mask.indices()
            }
            None => (0..grid.len()).collect(),
        };
        Ok(Self { grid, indices })
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Number of valid voxels.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Voxel coordinates of the `row`-th valid voxel.
    pub fn coordinates(&self, row: usize) -> [usize; 3] {
        self.grid.coordinates(self.indices[row])
    }

    /// Values of `volume` at the valid voxels.
    pub fn gather(&self, volume: &Volume) -> Vec<f64> {
        let data = volume.data();
        self.indices.iter().map(|&i| data[i]).collect()
    }

    /// Dense volume holding `values` at the valid voxels and 0 elsewhere.
    pub fn scatter(&self, values: ArrayView1<'_, f64>) -> Result<Volume> {
        if values.len() != self.indices.len() {
            return Err(Error::InvalidDimensions(format!(
                "cannot scatter {} values onto {} valid voxels",
                values.len(),
                self.indices.len()
            )));
        }
        let mut data = vec![0.0; self.grid.len()];
        for (&index, &value) in self.indices.iter().zip(values.iter()) {
            data[index] = value;
        }
        Volume::new(self.grid, data)
    }
}

/// Samples of one group: `[valid voxels × volumes]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleMatrix {
    values: Array2<f64>,
}

impl SampleMatrix {
    pub fn new(values: Array2<f64>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    /// Number of valid voxels.
    pub fn voxels(&self) -> usize {
        self.values.nrows()
    }

    /// Number of volumes in the group.
    pub fn samples(&self) -> usize {
        self.values.ncols()
    }
}

/// Loads groups of volumes onto a shared reference grid.
#[derive(Debug, Clone)]
pub struct VolumeSampler {
    index: VoxelIndex,
}

impl VolumeSampler {
    /// Sampler over `grid`, restricted to `mask` when given.
    pub fn new(grid: Grid, mask: Option<&Mask>) -> Result<Self> {
        let index = VoxelIndex::new(grid, mask)?;
        debug!(
            shape = ?grid.shape,
            valid = index.len(),
            "voxel index built"
        );
        Ok(Self { index })
    }

    /// Sampler whose reference grid is read from `reference`, with an
    /// optional mask image (nonzero voxels are valid).
    pub fn from_paths(reference: &Path, mask: Option<&Path>) -> Result<Self> {
        let header = nifti::load_header(reference)?;
        let grid = Grid::new(header.spatial_shape(), header.affine());
        let mask = match mask {
            Some(path) => {
                let volume = nifti::load(path)?;
                grid.ensure_same_shape(volume.grid(), format!("mask ({})", path.display()))?;
                Some(Mask::from_volume(&volume))
            }
            None => None,
        };
        Self::new(grid, mask.as_ref())
    }

    pub fn index(&self) -> &VoxelIndex {
        &self.index
    }

    pub fn grid(&self) -> &Grid {
        self.index.grid()
    }

    /// Compress in-memory volumes of group `group`.
    pub fn sample_volumes(&self, volumes: &[Volume], group: usize) -> Result<SampleMatrix> {
        let mut columns = Vec::with_capacity(volumes.len() * self.index.len());
        for (position, volume) in volumes.iter().enumerate() {
            let context = format!("group {group}, volume {position}");
            self.append_column(&mut columns, volume, &context)?;
        }
        self.finish(columns, volumes.len())
    }

    /// Load and compress the files of group `group` one at a time.
    ///
    /// A 4D file contributes one sample per 3D frame.
    pub fn sample_paths(&self, paths: &[PathBuf], group: usize) -> Result<SampleMatrix> {
        let mut columns = Vec::with_capacity(paths.len() * self.index.len());
        let mut samples = 0;
        for (position, path) in paths.iter().enumerate() {
            for (frame, volume) in nifti::load_frames(path)?.iter().enumerate() {
                let context = if frame == 0 {
                    format!("group {group}, volume {position} ({})", path.display())
                } else {
                    format!(
                        "group {group}, volume {position} frame {frame} ({})",
                        path.display()
                    )
                };
                self.append_column(&mut columns, volume, &context)?;
                samples += 1;
            }
        }
        self.finish(columns, samples)
    }

    fn append_column(&self, columns: &mut Vec<f64>, volume: &Volume, context: &str) -> Result<()> {
        let grid = self.index.grid();
        grid.ensure_same_shape(volume.grid(), context)?;
        if !grid.affine.approx_eq(volume.affine(), crate::volume::AFFINE_TOLERANCE) {
            warn!(context, "affine differs from the reference grid");
        }

        let start = columns.len();
        columns.extend(self.index.gather(volume));
        if let Some(row) = columns[start..].iter().position(|v| !v.is_finite()) {
            return Err(Error::Numerical(format!(
                "{context}: non-finite value {} at voxel {:?}",
                columns[start + row],
                self.index.coordinates(row)
            )));
        }
        Ok(())
    }

    fn finish(&self, columns: Vec<f64>, samples: usize) -> Result<SampleMatrix> {
        // Columns are stored back to back, i.e. column-major.
        let values = Array2::from_shape_vec((self.index.len(), samples).f(), columns)
            .map_err(|e| Error::InvalidDimensions(format!("sample matrix: {e}")))?;
        Ok(SampleMatrix::new(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Affine;
    use ndarray::Array1;

    fn grid() -> Grid {
        Grid::new([2, 2, 2], Affine::identity())
    }

    fn ramp(offset: f64) -> Volume {
        Volume::new(grid(), (0..8).map(|i| i as f64 + offset).collect()).unwrap()
    }

    #[test]
    fn test_sample_matrix_layout() {
        let sampler = VolumeSampler::new(grid(), None).unwrap();
        let samples = sampler.sample_volumes(&[ramp(0.0), ramp(100.0)], 0).unwrap();
        assert_eq!(samples.voxels(), 8);
        assert_eq!(samples.samples(), 2);
        assert_eq!(samples.values()[[3, 0]], 3.0);
        assert_eq!(samples.values()[[3, 1]], 103.0);
    }

    #[test]
    fn test_mask_selects_rows() {
        let mut flags = vec![false; 8];
        flags[1] = true;
        flags[6] = true;
        let mask = Mask::new(grid(), flags).unwrap();
        let sampler = VolumeSampler::new(grid(), Some(&mask)).unwrap();
        let samples = sampler.sample_volumes(&[ramp(0.0)], 0).unwrap();
        assert_eq!(samples.values().column(0).to_vec(), vec![1.0, 6.0]);
        assert_eq!(sampler.index().coordinates(1), [0, 1, 1]);
    }

    #[test]
    fn test_scatter_zero_fills() {
        let mask = Mask::new(grid(), vec![true, false, false, false, false, false, false, true])
            .unwrap();
        let index = VoxelIndex::new(grid(), Some(&mask)).unwrap();
        let dense = index.scatter(Array1::from(vec![5.0, -2.0]).view()).unwrap();
        assert_eq!(dense.data(), &[5.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, -2.0]);
    }

    #[test]
    fn test_shape_mismatch_names_volume() {
        let sampler = VolumeSampler::new(grid(), None).unwrap();
        let other = Volume::filled(Grid::new([2, 2, 3], Affine::identity()), 0.0).unwrap();
        let err = sampler.sample_volumes(&[ramp(0.0), other], 1).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
        assert!(err.to_string().contains("group 1, volume 1"));
    }

    #[test]
    fn test_non_finite_sample_rejected() {
        let sampler = VolumeSampler::new(grid(), None).unwrap();
        let mut data = vec![0.0; 8];
        data[5] = f64::NAN;
        let volume = Volume::new(grid(), data).unwrap();
        let err = sampler.sample_volumes(&[volume], 0).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Numerical);
        assert!(err.to_string().contains("[1, 0, 1]"));
    }
}
