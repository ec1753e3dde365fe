//! `NIfTI` header parsing and serialization.
//!
//! Reads NIfTI-1 (348-byte) and NIfTI-2 (540-byte) headers of either byte
//! order. Writes little-endian NIfTI-1, which is what every map produced by
//! this crate uses.

use crate::error::{Error, Result};
use crate::volume::{Affine, Grid};
use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// NIfTI format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NiftiVersion {
    /// 348-byte header, 16-bit dimensions
    #[default]
    Nifti1,
    /// 540-byte header, 64-bit dimensions
    Nifti2,
}

impl NiftiVersion {
    /// Header size in bytes for this version.
    pub const fn header_size(self) -> usize {
        match self {
            Self::Nifti1 => 348,
            Self::Nifti2 => 540,
        }
    }
}

/// NIfTI-1 field offsets.
mod offsets_v1 {
    pub const SIZEOF_HDR: usize = 0;
    pub const DIM: usize = 40;
    pub const DATATYPE: usize = 70;
    pub const BITPIX: usize = 72;
    pub const PIXDIM: usize = 76;
    pub const VOX_OFFSET: usize = 108;
    pub const SCL_SLOPE: usize = 112;
    pub const SCL_INTER: usize = 116;
    pub const XYZT_UNITS: usize = 123;
    pub const DESCRIP: usize = 148;
    pub const QFORM_CODE: usize = 252;
    pub const SFORM_CODE: usize = 254;
    pub const QUATERN_B: usize = 256;
    pub const QOFFSET_X: usize = 268;
    pub const SROW_X: usize = 280;
    pub const MAGIC: usize = 344;
}

/// NIfTI-2 field offsets.
mod offsets_v2 {
    pub const MAGIC: usize = 4;
    pub const DATATYPE: usize = 12;
    pub const BITPIX: usize = 14;
    pub const DIM: usize = 16;
    pub const PIXDIM: usize = 104;
    pub const VOX_OFFSET: usize = 168;
    pub const SCL_SLOPE: usize = 176;
    pub const SCL_INTER: usize = 184;
    pub const DESCRIP: usize = 240;
    pub const QFORM_CODE: usize = 344;
    pub const SFORM_CODE: usize = 348;
    pub const QUATERN_B: usize = 352;
    pub const QOFFSET_X: usize = 376;
    pub const SROW_X: usize = 400;
    pub const XYZT_UNITS: usize = 500;
}

/// `NIfTI` data type codes readable by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum DataType {
    UInt8 = 2,
    Int16 = 4,
    Int32 = 8,
    Float32 = 16,
    Float64 = 64,
    Int8 = 256,
    UInt16 = 512,
    UInt32 = 768,
    Int64 = 1024,
    UInt64 = 1280,
}

impl DataType {
    /// Parse from a `NIfTI` datatype code.
    pub fn from_code(code: i16) -> Result<Self> {
        match code {
            2 => Ok(Self::UInt8),
            4 => Ok(Self::Int16),
            8 => Ok(Self::Int32),
            16 => Ok(Self::Float32),
            64 => Ok(Self::Float64),
            256 => Ok(Self::Int8),
            512 => Ok(Self::UInt16),
            768 => Ok(Self::UInt32),
            1024 => Ok(Self::Int64),
            1280 => Ok(Self::UInt64),
            _ => Err(Error::UnsupportedDataType(code)),
        }
    }

    /// Size of one element in bytes.
    pub const fn byte_size(self) -> usize {
        match self {
            Self::UInt8 | Self::Int8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
        }
    }

    /// Decode one element starting at `bytes[0]`.
    #[inline]
    pub(crate) fn decode<E: ByteOrder>(self, bytes: &[u8]) -> f64 {
        match self {
            Self::UInt8 => bytes[0] as f64,
            Self::Int8 => bytes[0] as i8 as f64,
            Self::Int16 => E::read_i16(bytes) as f64,
            Self::UInt16 => E::read_u16(bytes) as f64,
            Self::Int32 => E::read_i32(bytes) as f64,
            Self::UInt32 => E::read_u32(bytes) as f64,
            Self::Int64 => E::read_i64(bytes) as f64,
            Self::UInt64 => E::read_u64(bytes) as f64,
            Self::Float32 => E::read_f32(bytes) as f64,
            Self::Float64 => E::read_f64(bytes),
        }
    }
}

/// Spatial units of the voxel spacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpatialUnits {
    #[default]
    Unknown,
    Meter,
    Millimeter,
    Micrometer,
}

impl SpatialUnits {
    fn from_code(code: u8) -> Self {
        match code & 0x07 {
            1 => Self::Meter,
            2 => Self::Millimeter,
            3 => Self::Micrometer,
            _ => Self::Unknown,
        }
    }

    fn to_code(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Meter => 1,
            Self::Millimeter => 2,
            Self::Micrometer => 3,
        }
    }
}

/// Header fields used for reading and writing volumes.
///
/// Values are held at NIfTI-2 width (64-bit dims, f64 floats); NIfTI-1 files
/// are widened on read.
#[derive(Debug, Clone, PartialEq)]
pub struct NiftiHeader {
    pub version: NiftiVersion,
    /// Number of dimensions (1-7).
    pub ndim: u8,
    /// Size along each dimension.
    pub dim: [i64; 7],
    pub datatype: DataType,
    /// qfac at index 0, spacing at 1..=ndim.
    pub pixdim: [f64; 8],
    pub vox_offset: i64,
    pub scl_slope: f64,
    pub scl_inter: f64,
    pub spatial_units: SpatialUnits,
    pub descrip: String,
    pub qform_code: i32,
    pub sform_code: i32,
    /// Quaternion b, c, d.
    pub quatern: [f64; 3],
    pub qoffset: [f64; 3],
    /// Rows of the sform matrix.
    pub srow: [[f64; 4]; 3],
    pub(crate) little_endian: bool,
}

impl Default for NiftiHeader {
    fn default() -> Self {
        Self {
            version: NiftiVersion::Nifti1,
            ndim: 3,
            dim: [1, 1, 1, 1, 1, 1, 1],
            datatype: DataType::Float32,
            pixdim: [1.0; 8],
            vox_offset: 352,
            scl_slope: 1.0,
            scl_inter: 0.0,
            spatial_units: SpatialUnits::Millimeter,
            descrip: String::new(),
            qform_code: 0,
            sform_code: 1,
            quatern: [0.0; 3],
            qoffset: [0.0; 3],
            srow: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
            ],
            little_endian: true,
        }
    }
}

impl NiftiHeader {
    /// Size of NIfTI-1 header in bytes.
    pub const SIZE: usize = 348;

    /// Float32 NIfTI-1 header describing `grid`, with the sform set to its affine.
    pub fn for_grid(grid: &Grid, descrip: &str) -> Self {
        let m = grid.affine.0;
        let mut pixdim = [1.0; 8];
        for axis in 0..3 {
            pixdim[axis + 1] =
                (m[0][axis] * m[0][axis] + m[1][axis] * m[1][axis] + m[2][axis] * m[2][axis])
                    .sqrt();
        }
        let [nx, ny, nz] = grid.shape;
        Self {
            dim: [nx as i64, ny as i64, nz as i64, 1, 1, 1, 1],
            pixdim,
            descrip: descrip.to_string(),
            srow: [m[0], m[1], m[2]],
            ..Self::default()
        }
    }

    /// Read a header, detecting version and byte order from `sizeof_hdr`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(Error::InvalidDimensions(
                "file too short to hold a NIfTI header".into(),
            ));
        }

        let (version, little_endian) = match (
            LittleEndian::read_i32(&bytes[0..4]),
            BigEndian::read_i32(&bytes[0..4]),
        ) {
            (348, _) => (NiftiVersion::Nifti1, true),
            (_, 348) => (NiftiVersion::Nifti1, false),
            (540, _) => (NiftiVersion::Nifti2, true),
            (_, 540) => (NiftiVersion::Nifti2, false),
            _ => return Err(Error::InvalidMagic([bytes[0], bytes[1], bytes[2], bytes[3]])),
        };

        if bytes.len() < version.header_size() {
            return Err(Error::InvalidDimensions(format!(
                "header too short: got {} bytes, need {} for {:?}",
                bytes.len(),
                version.header_size(),
                version
            )));
        }

        let header = match (version, little_endian) {
            (NiftiVersion::Nifti1, true) => Self::parse_v1::<LittleEndian>(bytes)?,
            (NiftiVersion::Nifti1, false) => Self::parse_v1::<BigEndian>(bytes)?,
            (NiftiVersion::Nifti2, true) => Self::parse_v2::<LittleEndian>(bytes)?,
            (NiftiVersion::Nifti2, false) => Self::parse_v2::<BigEndian>(bytes)?,
        };
        let header = Self {
            little_endian,
            ..header
        };
        header.validate()?;
        Ok(header)
    }

    #[allow(clippy::wildcard_imports)]
    fn parse_v1<E: ByteOrder>(bytes: &[u8]) -> Result<Self> {
        use offsets_v1::*;

        let magic = &bytes[MAGIC..MAGIC + 4];
        if magic != b"n+1\0" && magic != b"ni1\0" {
            return Err(Error::InvalidMagic([magic[0], magic[1], magic[2], magic[3]]));
        }

        let ndim = E::read_i16(&bytes[DIM..]);
        let mut dim = [0i64; 7];
        for (i, d) in dim.iter_mut().enumerate() {
            *d = E::read_i16(&bytes[DIM + 2 + i * 2..]) as i64;
        }
        let f32_at = |offset: usize| E::read_f32(&bytes[offset..]) as f64;

        let vox_offset = f32_at(VOX_OFFSET);
        if !vox_offset.is_finite() || vox_offset.fract() != 0.0 {
            return Err(Error::InvalidDimensions(format!(
                "vox_offset must be a finite integer, got {vox_offset}"
            )));
        }

        let mut srow = [[0.0; 4]; 3];
        for (r, row) in srow.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = f32_at(SROW_X + (r * 4 + c) * 4);
            }
        }

        Ok(Self {
            version: NiftiVersion::Nifti1,
            ndim: checked_ndim(ndim as i64)?,
            dim,
            datatype: checked_datatype(
                E::read_i16(&bytes[DATATYPE..]),
                E::read_i16(&bytes[BITPIX..]),
            )?,
            pixdim: std::array::from_fn(|i| f32_at(PIXDIM + i * 4)),
            vox_offset: vox_offset as i64,
            scl_slope: f32_at(SCL_SLOPE),
            scl_inter: f32_at(SCL_INTER),
            spatial_units: SpatialUnits::from_code(bytes[XYZT_UNITS]),
            descrip: read_cstr(&bytes[DESCRIP..DESCRIP + 80]),
            qform_code: E::read_i16(&bytes[QFORM_CODE..]) as i32,
            sform_code: E::read_i16(&bytes[SFORM_CODE..]) as i32,
            quatern: std::array::from_fn(|i| f32_at(QUATERN_B + i * 4)),
            qoffset: std::array::from_fn(|i| f32_at(QOFFSET_X + i * 4)),
            srow,
            little_endian: true,
        })
    }

    #[allow(clippy::wildcard_imports)]
    fn parse_v2<E: ByteOrder>(bytes: &[u8]) -> Result<Self> {
        use offsets_v2::*;

        let magic = &bytes[MAGIC..MAGIC + 8];
        if magic != b"n+2\0\r\n\x1a\n" && magic != b"ni2\0\r\n\x1a\n" {
            return Err(Error::InvalidMagic([magic[0], magic[1], magic[2], magic[3]]));
        }

        let mut dim = [0i64; 7];
        for (i, d) in dim.iter_mut().enumerate() {
            *d = E::read_i64(&bytes[DIM + 8 + i * 8..]);
        }
        let f64_at = |offset: usize| E::read_f64(&bytes[offset..]);

        let mut srow = [[0.0; 4]; 3];
        for (r, row) in srow.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = f64_at(SROW_X + (r * 4 + c) * 8);
            }
        }

        Ok(Self {
            version: NiftiVersion::Nifti2,
            ndim: checked_ndim(E::read_i64(&bytes[DIM..]))?,
            dim,
            datatype: checked_datatype(
                E::read_i16(&bytes[DATATYPE..]),
                E::read_i16(&bytes[BITPIX..]),
            )?,
            pixdim: std::array::from_fn(|i| f64_at(PIXDIM + i * 8)),
            vox_offset: E::read_i64(&bytes[VOX_OFFSET..]),
            scl_slope: f64_at(SCL_SLOPE),
            scl_inter: f64_at(SCL_INTER),
            spatial_units: SpatialUnits::from_code(E::read_i32(&bytes[XYZT_UNITS..]) as u8),
            descrip: read_cstr(&bytes[DESCRIP..DESCRIP + 80]),
            qform_code: E::read_i32(&bytes[QFORM_CODE..]),
            sform_code: E::read_i32(&bytes[SFORM_CODE..]),
            quatern: std::array::from_fn(|i| f64_at(QUATERN_B + i * 8)),
            qoffset: std::array::from_fn(|i| f64_at(QOFFSET_X + i * 8)),
            srow,
            little_endian: true,
        })
    }

    /// Serialize as a little-endian NIfTI-1 header.
    #[allow(clippy::wildcard_imports)]
    pub fn to_bytes(&self) -> Vec<u8> {
        use offsets_v1::*;

        let mut buf = vec![0u8; Self::SIZE];
        LittleEndian::write_i32(&mut buf[SIZEOF_HDR..], 348);

        LittleEndian::write_i16(&mut buf[DIM..], self.ndim as i16);
        for (i, &d) in self.dim.iter().enumerate() {
            let offset = DIM + 2 + i * 2;
            LittleEndian::write_i16(&mut buf[offset..], d.min(i16::MAX as i64) as i16);
        }
        LittleEndian::write_i16(&mut buf[DATATYPE..], self.datatype as i16);
        LittleEndian::write_i16(&mut buf[BITPIX..], (self.datatype.byte_size() * 8) as i16);

        for (i, &p) in self.pixdim.iter().enumerate() {
            LittleEndian::write_f32(&mut buf[PIXDIM + i * 4..], p as f32);
        }
        LittleEndian::write_f32(&mut buf[VOX_OFFSET..], self.vox_offset as f32);
        LittleEndian::write_f32(&mut buf[SCL_SLOPE..], self.scl_slope as f32);
        LittleEndian::write_f32(&mut buf[SCL_INTER..], self.scl_inter as f32);
        buf[XYZT_UNITS] = self.spatial_units.to_code();

        let descrip = self.descrip.as_bytes();
        let len = descrip.len().min(79);
        buf[DESCRIP..DESCRIP + len].copy_from_slice(&descrip[..len]);

        LittleEndian::write_i16(&mut buf[QFORM_CODE..], self.qform_code as i16);
        LittleEndian::write_i16(&mut buf[SFORM_CODE..], self.sform_code as i16);
        for i in 0..3 {
            LittleEndian::write_f32(&mut buf[QUATERN_B + i * 4..], self.quatern[i] as f32);
            LittleEndian::write_f32(&mut buf[QOFFSET_X + i * 4..], self.qoffset[i] as f32);
        }
        for (r, row) in self.srow.iter().enumerate() {
            for (c, &v) in row.iter().enumerate() {
                LittleEndian::write_f32(&mut buf[SROW_X + (r * 4 + c) * 4..], v as f32);
            }
        }

        buf[MAGIC..MAGIC + 4].copy_from_slice(b"n+1\0");
        buf
    }

    /// Voxel-to-world affine: sform if set, else qform, else pixdim scaling.
    pub fn affine(&self) -> Affine {
        if self.sform_code > 0 {
            Affine([self.srow[0], self.srow[1], self.srow[2], [0.0, 0.0, 0.0, 1.0]])
        } else if self.qform_code > 0 {
            self.qform_affine()
        } else {
            Affine::from_spacing([self.pixdim[1], self.pixdim[2], self.pixdim[3]])
        }
    }

    #[allow(clippy::many_single_char_names)]
    fn qform_affine(&self) -> Affine {
        let [b, c, d] = self.quatern;
        let a = (1.0 - b * b - c * c - d * d).max(0.0).sqrt();
        let qfac = if self.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let [i, j, k] = [self.pixdim[1], self.pixdim[2], self.pixdim[3] * qfac];

        Affine([
            [
                (a * a + b * b - c * c - d * d) * i,
                2.0 * (b * c - a * d) * j,
                2.0 * (b * d + a * c) * k,
                self.qoffset[0],
            ],
            [
                2.0 * (b * c + a * d) * i,
                (a * a - b * b + c * c - d * d) * j,
                2.0 * (c * d - a * b) * k,
                self.qoffset[1],
            ],
            [
                2.0 * (b * d - a * c) * i,
                2.0 * (c * d + a * b) * j,
                (a * a - b * b - c * c + d * d) * k,
                self.qoffset[2],
            ],
            [0.0, 0.0, 0.0, 1.0],
        ])
    }

    /// Spatial shape (first three dimensions, padded with 1).
    pub fn spatial_shape(&self) -> [usize; 3] {
        std::array::from_fn(|i| {
            if i < self.ndim as usize {
                self.dim[i] as usize
            } else {
                1
            }
        })
    }

    /// Number of 3D frames (product of dimensions 4..=ndim).
    pub fn frames(&self) -> usize {
        self.dim[3..self.ndim.max(3) as usize]
            .iter()
            .map(|&d| d as usize)
            .product()
    }

    /// Total number of elements.
    pub fn num_voxels(&self) -> usize {
        self.dim[..self.ndim as usize]
            .iter()
            .map(|&d| d as usize)
            .product()
    }

    /// Size of the data block in bytes.
    pub fn data_size(&self) -> usize {
        self.num_voxels() * self.datatype.byte_size()
    }

    /// Effective scaling `(slope, intercept)`; a zero slope means "unscaled".
    pub fn scaling(&self) -> (f64, f64) {
        if self.scl_slope == 0.0 || !self.scl_slope.is_finite() {
            (1.0, 0.0)
        } else {
            (self.scl_slope, self.scl_inter)
        }
    }

    pub fn is_little_endian(&self) -> bool {
        self.little_endian
    }

    /// Validate basic NIfTI invariants.
    pub fn validate(&self) -> Result<()> {
        for i in 0..self.ndim as usize {
            if self.dim[i] <= 0 {
                return Err(Error::InvalidDimensions(format!(
                    "dimension {} must be positive, got {}",
                    i, self.dim[i]
                )));
            }
        }

        if self.vox_offset < self.version.header_size() as i64 {
            return Err(Error::InvalidDimensions(format!(
                "vox_offset {} before header end ({})",
                self.vox_offset,
                self.version.header_size()
            )));
        }

        let mut voxels: usize = 1;
        for &d in &self.dim[..self.ndim as usize] {
            voxels = voxels
                .checked_mul(d as usize)
                .ok_or_else(|| Error::InvalidDimensions("dimension product overflow".into()))?;
        }
        voxels
            .checked_mul(self.datatype.byte_size())
            .ok_or_else(|| Error::InvalidDimensions("data size overflow".into()))?;

        Ok(())
    }
}

fn checked_ndim(raw: i64) -> Result<u8> {
    if (1..=7).contains(&raw) {
        Ok(raw as u8)
    } else {
        Err(Error::InvalidDimensions(format!("ndim must be 1..=7, got {raw}")))
    }
}

fn checked_datatype(code: i16, bitpix: i16) -> Result<DataType> {
    let datatype = DataType::from_code(code)?;
    let expected = (datatype.byte_size() * 8) as i16;
    if bitpix != expected {
        return Err(Error::InvalidDimensions(format!(
            "bitpix {bitpix} does not match datatype {datatype:?} (expected {expected})"
        )));
    }
    Ok(datatype)
}

fn read_cstr(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .to_string()
}
