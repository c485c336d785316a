//! In-memory voxel volumes
//!
//! Every image in the pipeline is held as a 4D `(x, y, z, channel)` array of
//! `f32` together with the affine that maps voxel indices to scanner space.
//! 3D images are volumes with a single channel.

use ndarray::{stack, Array3, Array4, ArrayView3, Axis};

use crate::error::{Error, Result};

/// Largest per-element affine difference still treated as the same grid
pub const AFFINE_TOLERANCE: f64 = 1e-3;

/// A voxel array with its spatial metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    /// Voxel data indexed as `[x, y, z, channel]`
    pub data: Array4<f32>,
    /// Affine transformation matrix (4x4, row-major)
    pub affine: [f64; 16],
    /// Voxel sizes in mm
    pub voxel_size: (f64, f64, f64),
}

impl Volume {
    pub fn new(data: Array4<f32>, affine: [f64; 16], voxel_size: (f64, f64, f64)) -> Self {
        Self {
            data,
            affine,
            voxel_size,
        }
    }

    /// Wrap a 3D array as a single-channel volume
    pub fn from_3d(data: Array3<f32>, affine: [f64; 16], voxel_size: (f64, f64, f64)) -> Self {
        Self::new(data.insert_axis(Axis(3)), affine, voxel_size)
    }

    /// Stack 3D channels into a volume that shares `like`'s geometry
    pub fn from_channels(channels: &[Array3<f32>], like: &Volume) -> Result<Self> {
        if channels.is_empty() {
            return Err(Error::InvalidInput("cannot build a volume from zero channels".into()));
        }
        let views: Vec<ArrayView3<'_, f32>> = channels.iter().map(|c| c.view()).collect();
        let data = stack(Axis(3), &views)
            .map_err(|e| Error::InvalidInput(format!("channels differ in shape: {e}")))?;
        Ok(like.with_data(data))
    }

    /// Same affine and voxel size, different voxel data
    pub fn with_data(&self, data: Array4<f32>) -> Self {
        Self::new(data, self.affine, self.voxel_size)
    }

    /// Spatial dimensions (nx, ny, nz)
    pub fn dims(&self) -> (usize, usize, usize) {
        let s = self.data.shape();
        (s[0], s[1], s[2])
    }

    pub fn channels(&self) -> usize {
        self.data.shape()[3]
    }

    /// Copy of one channel
    pub fn channel(&self, c: usize) -> Array3<f32> {
        self.data.index_axis(Axis(3), c).to_owned()
    }

    /// Voxels where any channel is nonzero
    pub fn nonzero_mask(&self) -> Array3<bool> {
        let (nx, ny, nz) = self.dims();
        let mut mask = Array3::from_elem((nx, ny, nz), false);
        for ((i, j, k, _), &v) in self.data.indexed_iter() {
            if v != 0.0 {
                mask[[i, j, k]] = true;
            }
        }
        mask
    }

    /// Check that `other` lives on the same voxel grid
    ///
    /// `names` label the two volumes in the error message.
    pub fn check_same_grid(&self, other: &Volume, names: (&str, &str)) -> Result<()> {
        let mismatch = |reason: String| Error::GridMismatch {
            first: names.0.to_string(),
            second: names.1.to_string(),
            reason,
        };

        if self.dims() != other.dims() {
            return Err(mismatch(format!(
                "dimensions {:?} vs {:?}",
                self.dims(),
                other.dims()
            )));
        }

        for (i, (a, b)) in self.affine.iter().zip(other.affine.iter()).enumerate() {
            if (a - b).abs() > AFFINE_TOLERANCE {
                return Err(mismatch(format!("affine[{i}] differs: {a} vs {b}")));
            }
        }

        Ok(())
    }
}

/// Identity affine scaled by the voxel size
pub fn scaled_identity(voxel_size: (f64, f64, f64)) -> [f64; 16] {
    let (vsx, vsy, vsz) = voxel_size;
    [
        vsx, 0.0, 0.0, 0.0,
        0.0, vsy, 0.0, 0.0,
        0.0, 0.0, vsz, 0.0,
        0.0, 0.0, 0.0, 1.0,
    ]
}
