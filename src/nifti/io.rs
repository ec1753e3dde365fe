//! NIfTI volume reading and writing.
//!
//! - Uncompressed `.nii` files are memory-mapped
//! - `.nii.gz` files are decoded with a multi-member gzip reader
//! - Writes go to a temporary file next to the destination and are renamed
//!   into place, so a failed write never leaves a partial image behind

use super::header::NiftiHeader;
use crate::error::{Error, Result};
use crate::output;
use crate::volume::{Grid, Volume};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use flate2::bufread::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use memmap2::Mmap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use tracing::debug;

const GZIP_BUFFER_SIZE: usize = 256 * 1024;

fn is_gzipped(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "gz")
}

fn open(path: &Path) -> Result<File> {
    if !path.exists() {
        return Err(Error::MissingFile(path.to_path_buf()));
    }
    File::open(path).map_err(|e| Error::read(path, e))
}

/// Read only the header of a NIfTI file.
pub fn load_header<P: AsRef<Path>>(path: P) -> Result<NiftiHeader> {
    let path = path.as_ref();
    let file = open(path)?;
    let mut bytes = Vec::with_capacity(540);
    if is_gzipped(path) {
        let decoder = MultiGzDecoder::new(BufReader::new(file));
        decoder
            .take(540)
            .read_to_end(&mut bytes)
            .map_err(|e| Error::Decompression(format!("{}: {e}", path.display())))?;
    } else {
        file.take(540)
            .read_to_end(&mut bytes)
            .map_err(|e| Error::read(path, e))?;
    }
    NiftiHeader::from_bytes(&bytes)
}

/// Load a 3D volume.
///
/// 4D files with a single frame are accepted; files holding several frames
/// must go through [`load_frames`].
///
/// # Example
/// ```ignore
/// let t_map = medvba::nifti::load("t.nii.gz")?;
/// ```
pub fn load<P: AsRef<Path>>(path: P) -> Result<Volume> {
    let path = path.as_ref();
    let mut frames = load_frames(path)?;
    if frames.len() != 1 {
        return Err(Error::InvalidDimensions(format!(
            "{} holds {} frames, expected a single 3D volume",
            path.display(),
            frames.len()
        )));
    }
    Ok(frames.remove(0))
}

/// Load every 3D frame of a (possibly 4D) NIfTI file.
pub fn load_frames<P: AsRef<Path>>(path: P) -> Result<Vec<Volume>> {
    let path = path.as_ref();
    let file = open(path)?;

    let frames = if is_gzipped(path) {
        let bytes = decompress(file, path)?;
        decode_frames(&bytes, path)?
    } else {
        // SAFETY: read-only map of a file we just opened; the map is dropped
        // before returning and no reference into it escapes.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::read(path, e))?;
        decode_frames(&mmap, path)?
    };

    debug!(
        path = %path.display(),
        frames = frames.len(),
        shape = ?frames[0].shape(),
        "loaded NIfTI"
    );
    Ok(frames)
}

fn decompress(file: File, path: &Path) -> Result<Vec<u8>> {
    let compressed_len = file.metadata().map(|m| m.len() as usize).unwrap_or(0);
    let mut decoder = MultiGzDecoder::new(BufReader::with_capacity(GZIP_BUFFER_SIZE, file));
    let mut output = Vec::with_capacity(compressed_len.saturating_mul(4));
    decoder
        .read_to_end(&mut output)
        .map_err(|e| Error::Decompression(format!("{}: {e}", path.display())))?;
    Ok(output)
}

fn decode_frames(bytes: &[u8], path: &Path) -> Result<Vec<Volume>> {
    let header = NiftiHeader::from_bytes(bytes)?;
    let offset = header.vox_offset as usize;
    let data_size = header.data_size();
    if bytes.len() < offset + data_size {
        return Err(Error::InvalidDimensions(format!(
            "{} is truncated: {} bytes, header requires {}",
            path.display(),
            bytes.len(),
            offset + data_size
        )));
    }

    let grid = Grid::new(header.spatial_shape(), header.affine());
    let frame_bytes = grid.len() * header.datatype.byte_size();
    let data = &bytes[offset..offset + data_size];

    data.chunks_exact(frame_bytes)
        .map(|frame| {
            let values = if header.is_little_endian() {
                decode_values::<LittleEndian>(&header, frame)
            } else {
                decode_values::<BigEndian>(&header, frame)
            };
            Volume::new(grid, values)
        })
        .collect()
}

fn decode_values<E: ByteOrder>(header: &NiftiHeader, frame: &[u8]) -> Vec<f64> {
    let (slope, inter) = header.scaling();
    let datatype = header.datatype;
    frame
        .chunks_exact(datatype.byte_size())
        .map(|raw| datatype.decode::<E>(raw) * slope + inter)
        .collect()
}

/// Save a volume as float32 NIfTI-1.
///
/// Gzip compression is chosen by a `.gz` extension. The file appears at
/// `path` only once it has been written completely.
pub fn save<P: AsRef<Path>>(volume: &Volume, path: P) -> Result<()> {
    let path = path.as_ref();
    let header = NiftiHeader::for_grid(volume.grid(), "medvba");
    let gzip = is_gzipped(path);

    output::write_atomic(path, |writer| {
        if gzip {
            let mut encoder = GzEncoder::new(writer, Compression::default());
            write_image(&mut encoder, &header, volume.data())?;
            encoder.finish()?;
            Ok(())
        } else {
            write_image(writer, &header, volume.data())
        }
    })?;

    debug!(path = %path.display(), shape = ?volume.shape(), "saved NIfTI");
    Ok(())
}

fn write_image<W: Write>(writer: &mut W, header: &NiftiHeader, data: &[f64]) -> std::io::Result<()> {
    writer.write_all(&header.to_bytes())?;
    // Extension flag block up to vox_offset.
    let padding = header.vox_offset as usize - NiftiHeader::SIZE;
    writer.write_all(&vec![0u8; padding])?;

    let mut chunk = [0u8; 4];
    for &value in data {
        LittleEndian::write_f32(&mut chunk, value as f32);
        writer.write_all(&chunk)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nifti::DataType;
    use crate::volume::Affine;

    #[test]
    fn test_decode_scaled_int16() {
        let header = NiftiHeader {
            datatype: DataType::Int16,
            scl_slope: 0.5,
            scl_inter: 1.0,
            ..NiftiHeader::default()
        };
        let mut raw = [0u8; 4];
        LittleEndian::write_i16(&mut raw[0..2], -4);
        LittleEndian::write_i16(&mut raw[2..4], 10);
        assert_eq!(decode_values::<LittleEndian>(&header, &raw), vec![-1.0, 6.0]);
    }

    #[test]
    fn test_decode_frames_splits_4d() {
        let mut header = NiftiHeader::for_grid(&Grid::new([2, 1, 1], Affine::identity()), "");
        header.ndim = 4;
        header.dim[3] = 3;
        let mut bytes = header.to_bytes();
        bytes.resize(352, 0);
        for v in [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }

        let frames = decode_frames(&bytes, Path::new("series.nii")).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].data(), &[5.0, 6.0]);
    }
}
