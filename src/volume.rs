//! In-memory volumes on a voxel grid.
//!
//! Voxels are stored flat in NIfTI order (x varies fastest):
//! `index = i + j*nx + k*nx*ny`. Every derived map, mask and sample matrix in
//! the crate uses this same linear order.

use crate::error::{Error, Result};

/// Tolerance for comparing affines that went through float32 storage.
pub const AFFINE_TOLERANCE: f64 = 1e-5;

/// 4x4 voxel-to-world transform, row-major.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine(pub [[f64; 4]; 4]);

impl Default for Affine {
    fn default() -> Self {
        Self::identity()
    }
}

impl Affine {
    /// Identity transform (1 mm isotropic voxels at the origin).
    pub const fn identity() -> Self {
        Self([
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ])
    }

    /// Diagonal transform with the given voxel spacing.
    pub const fn from_spacing(spacing: [f64; 3]) -> Self {
        Self([
            [spacing[0], 0.0, 0.0, 0.0],
            [0.0, spacing[1], 0.0, 0.0],
            [0.0, 0.0, spacing[2], 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ])
    }

    /// Determinant of the linear 3x3 block.
    pub fn linear_determinant(&self) -> f64 {
        let m = &self.0;
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    }

    /// Physical volume of one voxel, `|det|` of the linear block.
    pub fn voxel_volume(&self) -> f64 {
        self.linear_determinant().abs()
    }

    /// Check that the linear block is finite and invertible.
    pub fn validate(&self) -> Result<()> {
        if self.0.iter().flatten().any(|v| !v.is_finite()) {
            return Err(Error::InvalidAffine(format!(
                "non-finite coefficient in {:?}",
                self.0
            )));
        }
        let det = self.linear_determinant();
        if det == 0.0 {
            return Err(Error::InvalidAffine(
                "linear block is singular (determinant 0)".into(),
            ));
        }
        Ok(())
    }

    /// Element-wise comparison within `tolerance`.
    pub fn approx_eq(&self, other: &Self, tolerance: f64) -> bool {
        self.0
            .iter()
            .flatten()
            .zip(other.0.iter().flatten())
            .all(|(a, b)| (a - b).abs() <= tolerance * a.abs().max(b.abs()).max(1.0))
    }

    /// Map a voxel index to world coordinates.
    pub fn apply(&self, index: [f64; 3]) -> [f64; 3] {
        let m = &self.0;
        let mut out = [0.0; 3];
        for (row, value) in out.iter_mut().enumerate() {
            *value = m[row][0] * index[0] + m[row][1] * index[1] + m[row][2] * index[2] + m[row][3];
        }
        out
    }
}

/// Shape plus affine of a 3D voxel grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grid {
    pub shape: [usize; 3],
    pub affine: Affine,
}

impl Grid {
    pub fn new(shape: [usize; 3], affine: Affine) -> Self {
        Self { shape, affine }
    }

    /// Number of voxels.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Linear index of voxel `(i, j, k)`.
    #[inline]
    pub fn linear_index(&self, [i, j, k]: [usize; 3]) -> usize {
        i + j * self.shape[0] + k * self.shape[0] * self.shape[1]
    }

    /// Voxel coordinates of a linear index.
    #[inline]
    pub fn coordinates(&self, index: usize) -> [usize; 3] {
        let [nx, ny, _] = self.shape;
        [index % nx, (index / nx) % ny, index / (nx * ny)]
    }

    /// Fail with `ShapeMismatch` when `other` has a different shape.
    pub fn ensure_same_shape(&self, other: &Grid, context: impl Into<String>) -> Result<()> {
        if self.shape != other.shape {
            return Err(Error::ShapeMismatch {
                context: context.into(),
                expected: self.shape,
                actual: other.shape,
            });
        }
        Ok(())
    }

    /// Fail with `GridMismatch` when shape or affine differ.
    pub fn ensure_same_grid(&self, other: &Grid, context: &str) -> Result<()> {
        if self.shape != other.shape {
            return Err(Error::GridMismatch(format!(
                "{context}: shape {:?} differs from {:?}",
                other.shape, self.shape
            )));
        }
        if !self.affine.approx_eq(&other.affine, AFFINE_TOLERANCE) {
            return Err(Error::GridMismatch(format!(
                "{context}: affine {:?} differs from {:?}",
                other.affine.0, self.affine.0
            )));
        }
        Ok(())
    }
}

/// A scalar volume.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    grid: Grid,
    data: Vec<f64>,
}

impl Volume {
    /// Wrap flat data (NIfTI order) on `grid`.
    pub fn new(grid: Grid, data: Vec<f64>) -> Result<Self> {
        if grid.shape.contains(&0) {
            return Err(Error::InvalidDimensions(format!(
                "volume shape {:?} has an empty axis",
                grid.shape
            )));
        }
        if data.len() != grid.len() {
            return Err(Error::InvalidDimensions(format!(
                "volume of shape {:?} needs {} values, got {}",
                grid.shape,
                grid.len(),
                data.len()
            )));
        }
        grid.affine.validate()?;
        Ok(Self { grid, data })
    }

    /// Volume filled with `value`.
    pub fn filled(grid: Grid, value: f64) -> Result<Self> {
        Self::new(grid, vec![value; grid.len()])
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn shape(&self) -> [usize; 3] {
        self.grid.shape
    }

    pub fn affine(&self) -> &Affine {
        &self.grid.affine
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    /// Value at voxel `(i, j, k)`.
    pub fn get(&self, index: [usize; 3]) -> f64 {
        self.data[self.grid.linear_index(index)]
    }

    /// Element-wise negation, same grid.
    pub fn negated(&self) -> Self {
        Self {
            grid: self.grid,
            data: self.data.iter().map(|v| -v).collect(),
        }
    }
}

/// Boolean voxel selection on a grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    grid: Grid,
    valid: Vec<bool>,
}

impl Mask {
    /// Mask of nonzero voxels of `volume`.
    pub fn from_volume(volume: &Volume) -> Self {
        Self {
            grid: volume.grid,
            valid: volume.data.iter().map(|&v| v != 0.0).collect(),
        }
    }

    /// Mask from explicit flags.
    pub fn new(grid: Grid, valid: Vec<bool>) -> Result<Self> {
        if valid.len() != grid.len() {
            return Err(Error::InvalidDimensions(format!(
                "mask of shape {:?} needs {} flags, got {}",
                grid.shape,
                grid.len(),
                valid.len()
            )));
        }
        Ok(Self { grid, valid })
    }

    /// Mask selecting every voxel of `grid`.
    pub fn full(grid: Grid) -> Self {
        Self {
            grid,
            valid: vec![true; grid.len()],
        }
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn shape(&self) -> [usize; 3] {
        self.grid.shape
    }

    #[inline]
    pub fn contains(&self, index: usize) -> bool {
        self.valid[index]
    }

    pub fn flags(&self) -> &[bool] {
        &self.valid
    }

    /// Number of selected voxels.
    pub fn count(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }

    /// Linear indices of the selected voxels, ascending.
    pub fn indices(&self) -> Vec<usize> {
        self.valid
            .iter()
            .enumerate()
            .filter_map(|(i, &v)| v.then_some(i))
            .collect()
    }
}
