//! NIfTI volume I/O.
//!
//! Loads signal/mask volumes as flat f64 grids in Fortran (column-major)
//! voxel order and writes result maps as float32 NIfTI-1, propagating the
//! reference image's affine and voxel sizes. Both `.nii` and `.nii.gz` are
//! supported; gzip is auto-detected on read and chosen by extension on
//! write.

use std::io::Cursor;
use std::path::Path;

use flate2::read::GzDecoder;
use ndarray::Array;
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiHeader, NiftiObject};

/// A loaded volume: flat data plus the spatial metadata needed to write
/// derived maps back out on the same grid.
pub struct Volume {
    /// Voxel data as f64, Fortran order: index = x + y*nx + z*nx*ny.
    pub data: Vec<f64>,
    /// Dimensions (nx, ny, nz).
    pub dims: (usize, usize, usize),
    /// Voxel sizes in mm.
    pub voxel_size: (f64, f64, f64),
    /// 4x4 affine, row-major.
    pub affine: [f64; 16],
}

impl Volume {
    pub fn n_total(&self) -> usize {
        self.dims.0 * self.dims.1 * self.dims.2
    }
}

fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Load a NIfTI volume from bytes (`.nii` or gzipped).
///
/// 3D images load whole; for a 4D image only the first timepoint is taken.
pub fn load_volume(bytes: &[u8]) -> Result<Volume, String> {
    let obj: InMemNiftiObject = if is_gzip(bytes) {
        InMemNiftiObject::from_reader(GzDecoder::new(Cursor::new(bytes)))
            .map_err(|e| format!("failed to read gzipped NIfTI: {e}"))?
    } else {
        InMemNiftiObject::from_reader(Cursor::new(bytes))
            .map_err(|e| format!("failed to read NIfTI: {e}"))?
    };

    let header = obj.header();
    let pixdim = header.pixdim;
    let voxel_size = (pixdim[1] as f64, pixdim[2] as f64, pixdim[3] as f64);
    let affine = affine_from_header(header);

    let array: Array<f64, _> = obj
        .into_volume()
        .into_ndarray()
        .map_err(|e| format!("failed to convert NIfTI volume: {e}"))?;

    let shape = array.shape().to_vec();
    if shape.len() < 3 {
        return Err(format!("expected at least a 3D volume, got {}D", shape.len()));
    }
    let (nx, ny, nz) = (shape[0], shape[1], shape[2]);

    // Flatten in Fortran order so index = x + y*nx + z*nx*ny matches the
    // NIfTI convention.
    let mut data = Vec::with_capacity(nx * ny * nz);
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                data.push(if shape.len() == 3 {
                    array[[i, j, k]]
                } else {
                    array[[i, j, k, 0]]
                });
            }
        }
    }

    Ok(Volume { data, dims: (nx, ny, nz), voxel_size, affine })
}

/// Affine from the header's sform when set, otherwise a diagonal voxel
/// scaling.
fn affine_from_header(header: &NiftiHeader) -> [f64; 16] {
    if header.sform_code > 0 {
        let (sx, sy, sz) = (&header.srow_x, &header.srow_y, &header.srow_z);
        [
            sx[0] as f64, sx[1] as f64, sx[2] as f64, sx[3] as f64,
            sy[0] as f64, sy[1] as f64, sy[2] as f64, sy[3] as f64,
            sz[0] as f64, sz[1] as f64, sz[2] as f64, sz[3] as f64,
            0.0, 0.0, 0.0, 1.0,
        ]
    } else {
        let p = &header.pixdim;
        [
            p[1] as f64, 0.0, 0.0, 0.0,
            0.0, p[2] as f64, 0.0, 0.0,
            0.0, 0.0, p[3] as f64, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ]
    }
}

/// Serialize a float32 NIfTI-1 single file (.nii) from a flat f64 grid.
pub fn save_volume(
    data: &[f64],
    dims: (usize, usize, usize),
    voxel_size: (f64, f64, f64),
    affine: &[f64; 16],
) -> Result<Vec<u8>, String> {
    use std::io::Write;

    let (nx, ny, nz) = dims;
    if data.len() != nx * ny * nz {
        return Err(format!(
            "data length {} does not match dims {}x{}x{}",
            data.len(),
            nx,
            ny,
            nz
        ));
    }

    let mut header = [0u8; 348];

    // sizeof_hdr
    header[0..4].copy_from_slice(&348i32.to_le_bytes());

    let dim: [i16; 8] = [3, nx as i16, ny as i16, nz as i16, 1, 1, 1, 1];
    for (i, &d) in dim.iter().enumerate() {
        header[40 + i * 2..42 + i * 2].copy_from_slice(&d.to_le_bytes());
    }

    // datatype = FLOAT32, bitpix = 32
    header[70..72].copy_from_slice(&16i16.to_le_bytes());
    header[72..74].copy_from_slice(&32i16.to_le_bytes());

    let (vsx, vsy, vsz) = voxel_size;
    let pixdim: [f32; 8] = [1.0, vsx as f32, vsy as f32, vsz as f32, 1.0, 1.0, 1.0, 1.0];
    for (i, &p) in pixdim.iter().enumerate() {
        header[76 + i * 4..80 + i * 4].copy_from_slice(&p.to_le_bytes());
    }

    // vox_offset = 352 (header + empty extension marker)
    header[108..112].copy_from_slice(&352.0f32.to_le_bytes());
    // scl_slope = 1, scl_inter = 0
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
    header[116..120].copy_from_slice(&0.0f32.to_le_bytes());

    // sform_code = 1 (scanner anat) with the reference affine rows
    header[254..256].copy_from_slice(&1i16.to_le_bytes());
    for row in 0..3 {
        for col in 0..4 {
            let offset = 280 + row * 16 + col * 4;
            let value = affine[row * 4 + col] as f32;
            header[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    header[344..348].copy_from_slice(b"n+1\0");

    let mut buffer = Vec::with_capacity(352 + data.len() * 4);
    buffer.write_all(&header).map_err(|e| format!("write header failed: {e}"))?;
    buffer.write_all(&[0u8; 4]).map_err(|e| format!("write extension failed: {e}"))?;
    for &val in data {
        buffer
            .write_all(&(val as f32).to_le_bytes())
            .map_err(|e| format!("write data failed: {e}"))?;
    }

    Ok(buffer)
}

/// Serialize a gzipped float32 NIfTI-1 file (.nii.gz).
pub fn save_volume_gz(
    data: &[f64],
    dims: (usize, usize, usize),
    voxel_size: (f64, f64, f64),
    affine: &[f64; 16],
) -> Result<Vec<u8>, String> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let uncompressed = save_volume(data, dims, voxel_size, affine)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&uncompressed)
        .map_err(|e| format!("gzip compression failed: {e}"))?;
    encoder.finish().map_err(|e| format!("gzip finish failed: {e}"))
}

/// Read a NIfTI volume from disk (`.nii` or `.nii.gz`).
pub fn read_volume_file(path: &Path) -> Result<Volume, String> {
    let bytes = std::fs::read(path)
        .map_err(|e| format!("failed to read file '{}': {e}", path.display()))?;
    load_volume(&bytes)
}

/// Write a flat grid to disk as float32 NIfTI; gzip is chosen when the
/// path ends in `.nii.gz`.
pub fn write_volume_file(
    path: &Path,
    data: &[f64],
    dims: (usize, usize, usize),
    voxel_size: (f64, f64, f64),
    affine: &[f64; 16],
) -> Result<(), String> {
    let bytes = if path.to_string_lossy().ends_with(".nii.gz") {
        save_volume_gz(data, dims, voxel_size, affine)?
    } else {
        save_volume(data, dims, voxel_size, affine)?
    };
    std::fs::write(path, &bytes)
        .map_err(|e| format!("failed to write file '{}': {e}", path.display()))
}
