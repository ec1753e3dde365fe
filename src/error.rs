//! Error types for medvba operations.
//!
//! Every failure is one concrete [`Error`] variant; [`Error::kind`] groups the
//! variants into the five categories callers dispatch on.

use std::path::PathBuf;
use thiserror::Error;

/// Coarse error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or malformed inputs, shape and grid mismatches, bad group layout.
    Input,
    /// A value violated the defined NaN/infinity policy.
    Numerical,
    /// Smoothness estimation is infeasible for the given map and mask.
    Estimation,
    /// Invalid parameters, unsupported output formats, invalid task graphs.
    Configuration,
    /// Reading or writing a file failed.
    Io,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Input => "input error",
            Self::Numerical => "numerical error",
            Self::Estimation => "estimation error",
            Self::Configuration => "configuration error",
            Self::Io => "I/O error",
        };
        f.write_str(name)
    }
}

/// Main error type.
#[derive(Error, Debug)]
pub enum Error {
    /// An input file does not exist.
    #[error("missing input file: {}", .0.display())]
    MissingFile(PathBuf),

    /// Two volumes that must share a grid have different shapes.
    #[error("shape mismatch: {context} has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        context: String,
        expected: [usize; 3],
        actual: [usize; 3],
    },

    /// Two volumes have the same shape but different voxel-to-world mappings.
    #[error("grid mismatch: {0}")]
    GridMismatch(String),

    /// The comparison did not receive exactly two groups.
    #[error("expected two groups, got {0}")]
    GroupCount(usize),

    /// A group has too few volumes to estimate a variance.
    #[error("group {index} has {size} volume(s), at least 2 are required")]
    GroupTooSmall { index: usize, size: usize },

    /// A volume or header is structurally invalid.
    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),

    /// The affine's linear block is singular or non-finite.
    #[error("invalid affine: {0}")]
    InvalidAffine(String),

    /// NIfTI magic bytes not recognised.
    #[error("invalid NIfTI magic {0:?}")]
    InvalidMagic([u8; 4]),

    /// NIfTI datatype code not supported.
    #[error("unsupported data type code {0}")]
    UnsupportedDataType(i16),

    /// A gzip stream could not be decoded.
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// A text input (labels, table, smoothness descriptor) could not be parsed.
    #[error("parse error in {}:{line}: {message}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// An input file exists but could not be read or decoded.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A NaN or infinity appeared where the numeric policy forbids it.
    #[error("numerical error: {0}")]
    Numerical(String),

    /// Smoothness could not be estimated.
    #[error("smoothness estimation failed: {0}")]
    Estimation(String),

    /// Cluster-forming threshold is not a positive finite number.
    #[error("invalid threshold {0}: must be finite and > 0")]
    InvalidThreshold(f64),

    /// Output destination has an extension with no writer.
    #[error("unsupported output format: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    /// Any other invalid parameter or configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Writing an output failed.
    #[error("cannot write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Spreadsheet serialization failed.
    #[error("spreadsheet error: {0}")]
    Spreadsheet(#[from] rust_xlsxwriter::XlsxError),

    /// Generic I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for medvba operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingFile(_)
            | Self::ShapeMismatch { .. }
            | Self::GridMismatch(_)
            | Self::GroupCount(_)
            | Self::GroupTooSmall { .. }
            | Self::InvalidDimensions(_)
            | Self::InvalidAffine(_)
            | Self::InvalidMagic(_)
            | Self::UnsupportedDataType(_)
            | Self::Decompression(_)
            | Self::Parse { .. }
            | Self::Read { .. } => ErrorKind::Input,
            Self::Numerical(_) => ErrorKind::Numerical,
            Self::Estimation(_) => ErrorKind::Estimation,
            Self::InvalidThreshold(_) | Self::UnsupportedFormat(_) | Self::Configuration(_) => {
                ErrorKind::Configuration
            }
            Self::Write { .. } | Self::Spreadsheet(_) | Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Build a parse error.
    pub fn parse(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            line,
            message: message.into(),
        }
    }

    /// Build a read error for `path`.
    pub fn read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Read {
            path: path.into(),
            source,
        }
    }

    /// Build a write error for `path`.
    pub fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }

    /// Build a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(Error::GroupCount(3).kind(), ErrorKind::Input);
        assert_eq!(Error::InvalidThreshold(0.0).kind(), ErrorKind::Configuration);
        assert_eq!(
            Error::UnsupportedFormat("out.json".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(Error::Estimation("empty mask".into()).kind(), ErrorKind::Estimation);
        assert_eq!(Error::Numerical("nan".into()).kind(), ErrorKind::Numerical);
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(Error::write("/root/x.csv", io).kind(), ErrorKind::Io);
        let io = std::io::Error::new(std::io::ErrorKind::InvalidData, "bad utf-8");
        let err = Error::read("labels.txt", io);
        assert_eq!(err.kind(), ErrorKind::Input);
        assert!(err.to_string().starts_with("cannot read labels.txt"));
    }

    #[test]
    fn test_shape_mismatch_message_names_shapes() {
        let err = Error::ShapeMismatch {
            context: "group 1, volume 2 (b.nii)".into(),
            expected: [4, 4, 4],
            actual: [4, 4, 5],
        };
        let msg = err.to_string();
        assert!(msg.contains("[4, 4, 5]"));
        assert!(msg.contains("b.nii"));
    }
}
