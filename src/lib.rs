//! # medvba
//!
//! Voxel-based group analysis of aligned 3D images.
//!
//! - **Group comparison**: voxel-wise Welch t-test between two groups of
//!   co-registered volumes, with p-value and signed z-score maps
//! - **Cluster correction**: thresholding and connected-component extraction
//!   on both tails, by cluster extent or by Gaussian random-field probability
//! - **Region reports**: volume of each atlas region covered by the surviving
//!   clusters, as CSV or spreadsheet
//! - **Pipelines**: a TOML analysis description expanded into an explicit task
//!   graph with content-hashed cache keys
//!
//! Volumes are read from and written to `NIfTI` (`.nii`, `.nii.gz`).
//!
//! ## Example
//!
//! ```ignore
//! use medvba::cluster::{ClusterConfig, ClusterExtractor, CorrectionPolicy};
//! use medvba::stats::GroupStatistics;
//!
//! let map = GroupStatistics::compute_paths(&groups, Some(mask.as_ref()))?;
//! map.save("t.nii.gz".as_ref(), None, Some("z.nii.gz".as_ref()))?;
//!
//! let config = ClusterConfig::new(3.1, CorrectionPolicy::Extent(100));
//! let clusters = ClusterExtractor::new(config)?.extract(&map.t, &mask, None)?;
//! ```

pub mod cli;
pub mod cluster;
pub mod config;
pub mod error;
pub mod labels;
pub mod nifti;
pub mod output;
pub mod pipeline;
pub mod report;
pub mod sampler;
pub mod smoothness;
pub mod stats;
pub mod table;
pub mod volume;

pub use cluster::{
    ClusterConfig, ClusterExtractor, ClusterRecord, ClusterResult, Connectivity,
    CorrectionPolicy, OutputMode, Tail,
};
pub use error::{Error, ErrorKind, Result};
pub use labels::{LabelDialect, LabelDictionary};
pub use report::{RegionVolumeReporter, VolumeReport};
pub use sampler::{SampleMatrix, VolumeSampler, VoxelIndex};
pub use smoothness::{AutocorrelationEstimator, PrecomputedSmoothness, Smoothness, SmoothnessEstimator};
pub use stats::{GroupStatistics, StatisticMap};
pub use volume::{Affine, Grid, Mask, Volume};
