//! `NIfTI` file format support.
//!
//! Reading and writing of `.nii` and `.nii.gz` volumes on a shared
//! [`Grid`](crate::volume::Grid). Every statistic, cluster and atlas image
//! handled by the crate passes through this module.

pub(crate) mod header;
pub mod io;

pub use header::{DataType, NiftiHeader, NiftiVersion, SpatialUnits};
pub use io::{load, load_frames, load_header, save};
