//! NIfTI file I/O
//!
//! Loads 3D and 4D NIfTI-1 images (`.nii` or `.nii.gz`) into [`Volume`]s and
//! writes volumes back as single-file NIfTI-1 with an sform affine.

use std::io::{Cursor, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::{Array, Axis, Ix4, IxDyn};
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiHeader, NiftiObject};
use tracing::debug;

use crate::error::{Error, Result};
use crate::volume::{scaled_identity, Volume};

/// On-disk voxel type used when saving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// Binary masks and label images
    Uint8,
    /// Probabilities, TOMs and density maps
    Float32,
}

impl DataType {
    fn code(self) -> i16 {
        match self {
            Self::Uint8 => 2,
            Self::Float32 => 16,
        }
    }

    fn bitpix(self) -> i16 {
        match self {
            Self::Uint8 => 8,
            Self::Float32 => 32,
        }
    }

    fn bytes(self) -> usize {
        self.bitpix() as usize / 8
    }
}

/// Check if bytes are gzip compressed
fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Get header info for diagnostics
fn get_header_info(bytes: &[u8]) -> String {
    if bytes.len() < 348 {
        return format!("File too small ({} bytes, need at least 348)", bytes.len());
    }

    let sizeof_hdr = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let magic = String::from_utf8_lossy(&bytes[344..348]).to_string();
    let datatype = i16::from_le_bytes([bytes[70], bytes[71]]);
    let ndim = i16::from_le_bytes([bytes[40], bytes[41]]);

    format!(
        "sizeof_hdr={}, magic='{}', datatype={}, ndim={}",
        sizeof_hdr, magic, datatype, ndim
    )
}

/// Load a NIfTI image from bytes
///
/// Supports both .nii and .nii.gz (gzip is auto-detected). 3D images become
/// single-channel volumes; 4D images keep their fourth dimension as channels.
/// Trailing singleton dimensions beyond the fourth are dropped.
pub fn load_volume(bytes: &[u8]) -> Result<Volume> {
    let obj: InMemNiftiObject = if is_gzip(bytes) {
        InMemNiftiObject::from_reader(GzDecoder::new(Cursor::new(bytes))).map_err(|e| {
            let mut decompressed = Vec::new();
            let info = match GzDecoder::new(Cursor::new(bytes)).read_to_end(&mut decompressed) {
                Ok(_) => get_header_info(&decompressed),
                Err(_) => "could not decompress".to_string(),
            };
            Error::Nifti(format!("gzipped NIfTI: {} ({})", e, info))
        })?
    } else {
        let info = get_header_info(bytes);
        InMemNiftiObject::from_reader(Cursor::new(bytes))
            .map_err(|e| Error::Nifti(format!("{} ({})", e, info)))?
    };

    let header = obj.header();
    let ndim = header.dim[0] as usize;
    if ndim < 3 {
        return Err(Error::Nifti(format!("expected at least 3D volume, got {}D", ndim)));
    }

    let voxel_size = (
        header.pixdim[1] as f64,
        header.pixdim[2] as f64,
        header.pixdim[3] as f64,
    );
    let affine = get_affine(header);

    // nifti-rs applies scl_slope / scl_inter during conversion
    let array: Array<f32, IxDyn> = obj
        .into_volume()
        .into_ndarray()
        .map_err(|e| Error::Nifti(format!("failed to convert to ndarray: {}", e)))?;

    let data = to_4d(array)?;
    debug!(shape = ?data.shape(), "loaded NIfTI volume");

    Ok(Volume::new(data, affine, voxel_size))
}

/// Bring an N-D array into `(x, y, z, channel)` layout
fn to_4d(array: Array<f32, IxDyn>) -> Result<ndarray::Array4<f32>> {
    let shape = array.shape().to_vec();
    let array = match shape.len() {
        0..=2 => {
            return Err(Error::Nifti(format!("expected at least 3D array, got {}D", shape.len())));
        }
        3 => array.insert_axis(Axis(3)),
        4 => array,
        _ => {
            if shape[4..].iter().any(|&d| d != 1) {
                return Err(Error::Nifti(format!("unsupported image shape {:?}", shape)));
            }
            let target = (shape[0], shape[1], shape[2], shape[3]);
            return array
                .as_standard_layout()
                .to_owned()
                .into_shape_with_order(target)
                .map_err(|e| Error::Nifti(format!("cannot reshape {:?}: {}", shape, e)));
        }
    };
    array
        .into_dimensionality::<Ix4>()
        .map_err(|e| Error::Nifti(format!("unexpected dimensionality: {}", e)))
}

/// Get affine transformation matrix from header
///
/// sform when `sform_code > 0`, else qform when `qform_code > 0`, else the
/// voxel-size diagonal.
fn get_affine(header: &NiftiHeader) -> [f64; 16] {
    if header.sform_code > 0 {
        let s = &header.srow_x;
        let t = &header.srow_y;
        let u = &header.srow_z;
        [
            s[0] as f64, s[1] as f64, s[2] as f64, s[3] as f64,
            t[0] as f64, t[1] as f64, t[2] as f64, t[3] as f64,
            u[0] as f64, u[1] as f64, u[2] as f64, u[3] as f64,
            0.0, 0.0, 0.0, 1.0,
        ]
    } else if header.qform_code > 0 {
        qform_affine(header)
    } else {
        scaled_identity((
            header.pixdim[1] as f64,
            header.pixdim[2] as f64,
            header.pixdim[3] as f64,
        ))
    }
}

/// Affine from the quaternion, `qfac` and `qoffset` fields
fn qform_affine(header: &NiftiHeader) -> [f64; 16] {
    let (mut b, mut c, mut d) = (
        header.quatern_b as f64,
        header.quatern_c as f64,
        header.quatern_d as f64,
    );
    let aa = 1.0 - (b * b + c * c + d * d);
    let a = if aa < 1e-7 {
        // 180 degree rotation: renormalise (b, c, d)
        let norm = (b * b + c * c + d * d).sqrt();
        if norm > 0.0 {
            b /= norm;
            c /= norm;
            d /= norm;
        }
        0.0
    } else {
        aa.sqrt()
    };

    let rot = [
        [a * a + b * b - c * c - d * d, 2.0 * (b * c - a * d), 2.0 * (b * d + a * c)],
        [2.0 * (b * c + a * d), a * a + c * c - b * b - d * d, 2.0 * (c * d - a * b)],
        [2.0 * (b * d - a * c), 2.0 * (c * d + a * b), a * a + d * d - b * b - c * c],
    ];
    let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
    let scale = [
        (header.pixdim[1] as f64).abs(),
        (header.pixdim[2] as f64).abs(),
        (header.pixdim[3] as f64).abs() * qfac,
    ];
    let offset = [
        header.quatern_x as f64,
        header.quatern_y as f64,
        header.quatern_z as f64,
    ];

    let mut affine = [0.0; 16];
    for row in 0..3 {
        for col in 0..3 {
            affine[row * 4 + col] = rot[row][col] * scale[col];
        }
        affine[row * 4 + 3] = offset[row];
    }
    affine[15] = 1.0;
    affine
}

/// Serialize a volume as uncompressed NIfTI-1 bytes
///
/// Single-channel volumes are written as 3D images, others as 4D.
pub fn save_volume(volume: &Volume, dtype: DataType) -> Result<Vec<u8>> {
    let (nx, ny, nz) = volume.dims();
    let nt = volume.channels();
    let (vsx, vsy, vsz) = volume.voxel_size;

    for (axis, &n) in [nx, ny, nz, nt].iter().enumerate() {
        if n > i16::MAX as usize {
            return Err(Error::InvalidInput(format!(
                "dimension {} has {} voxels, NIfTI-1 allows at most {}",
                axis,
                n,
                i16::MAX
            )));
        }
    }

    let mut header = [0u8; 348];

    // sizeof_hdr = 348
    header[0..4].copy_from_slice(&348i32.to_le_bytes());

    // dim[0..7]
    let ndim: i16 = if nt > 1 { 4 } else { 3 };
    let dim: [i16; 8] = [ndim, nx as i16, ny as i16, nz as i16, nt as i16, 1, 1, 1];
    for (i, &d) in dim.iter().enumerate() {
        let offset = 40 + i * 2;
        header[offset..offset + 2].copy_from_slice(&d.to_le_bytes());
    }

    header[70..72].copy_from_slice(&dtype.code().to_le_bytes());
    header[72..74].copy_from_slice(&dtype.bitpix().to_le_bytes());

    // pixdim[0..7]
    let pixdim: [f32; 8] = [1.0, vsx as f32, vsy as f32, vsz as f32, 1.0, 1.0, 1.0, 1.0];
    for (i, &p) in pixdim.iter().enumerate() {
        let offset = 76 + i * 4;
        header[offset..offset + 4].copy_from_slice(&p.to_le_bytes());
    }

    // vox_offset = 352 (header + 4 bytes extension)
    header[108..112].copy_from_slice(&352.0f32.to_le_bytes());
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
    header[116..120].copy_from_slice(&0.0f32.to_le_bytes());

    // xyzt_units: mm + sec
    header[123] = 2 | 8;

    // sform_code = 1 (scanner anat), qform_code = 0
    header[252..254].copy_from_slice(&0i16.to_le_bytes());
    header[254..256].copy_from_slice(&1i16.to_le_bytes());

    for (row, base) in [280usize, 296, 312].iter().enumerate() {
        for i in 0..4 {
            let offset = base + i * 4;
            header[offset..offset + 4]
                .copy_from_slice(&(volume.affine[row * 4 + i] as f32).to_le_bytes());
        }
    }

    // magic = "n+1\0" for NIfTI-1 single file
    header[344..348].copy_from_slice(b"n+1\0");

    let n_voxels = nx * ny * nz * nt;
    let mut buffer = Vec::with_capacity(352 + n_voxels * dtype.bytes());
    buffer.extend_from_slice(&header);
    buffer.extend_from_slice(&[0u8; 4]);

    // NIfTI stores x fastest: index = x + y*nx + z*nx*ny + t*nx*ny*nz
    for t in 0..nt {
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let v = volume.data[[i, j, k, t]];
                    match dtype {
                        DataType::Float32 => buffer.extend_from_slice(&v.to_le_bytes()),
                        DataType::Uint8 => buffer.push(v.round().clamp(0.0, 255.0) as u8),
                    }
                }
            }
        }
    }

    Ok(buffer)
}

/// Serialize a volume as gzipped NIfTI-1 bytes (.nii.gz)
pub fn save_volume_gz(volume: &Volume, dtype: DataType) -> Result<Vec<u8>> {
    let uncompressed = save_volume(volume, dtype)?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&uncompressed)
        .map_err(|e| Error::Nifti(format!("gzip compression failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| Error::Nifti(format!("gzip finish failed: {}", e)))
}

/// Read a NIfTI file from a filesystem path
pub fn read_volume(path: &Path) -> Result<Volume> {
    let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
    load_volume(&bytes).map_err(|e| match e {
        Error::Nifti(msg) => Error::Nifti(format!("'{}': {}", path.display(), msg)),
        other => other,
    })
}

/// Write a volume to a file
///
/// If the path ends with .nii.gz, the file is gzip compressed.
/// Otherwise it is saved as uncompressed .nii.
pub fn write_volume(path: &Path, volume: &Volume, dtype: DataType) -> Result<()> {
    let bytes = if path.to_string_lossy().ends_with(".nii.gz") {
        save_volume_gz(volume, dtype)?
    } else {
        save_volume(volume, dtype)?
    };

    std::fs::write(path, &bytes).map_err(|e| Error::io(path, e))?;
    debug!(path = %path.display(), "wrote NIfTI volume");
    Ok(())
}
