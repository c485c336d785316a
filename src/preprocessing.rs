//! Voxel-space transformations around inference
//!
//! The network sees a fixed-size cube. Inputs are cropped to the brain's
//! bounding box, zero-padded to a cube and resampled to the network size;
//! [`SquareTransform::restore`] runs the chain backwards so predictions land
//! on the original voxel grid.

use ndarray::{s, Array3, Array4};

use crate::error::{Error, Result};
use crate::volume::Volume;

/// Axis-aligned box of voxels, `max` exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub min: [usize; 3],
    pub max: [usize; 3],
}

impl BoundingBox {
    pub fn extent(&self) -> [usize; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }
}

/// Bounding box of the nonzero voxels of `mask`
pub fn bounding_box(mask: &Array3<bool>) -> Result<BoundingBox> {
    let mut min = [usize::MAX; 3];
    let mut max = [0usize; 3];
    let mut any = false;

    for ((i, j, k), &m) in mask.indexed_iter() {
        if !m {
            continue;
        }
        any = true;
        for (a, v) in [i, j, k].into_iter().enumerate() {
            min[a] = min[a].min(v);
            max[a] = max[a].max(v + 1);
        }
    }

    if !any {
        return Err(Error::InvalidInput("brain mask is empty".into()));
    }
    Ok(BoundingBox { min, max })
}

/// Cut `bbox` out of every channel
pub fn crop(data: &Array4<f32>, bbox: &BoundingBox) -> Array4<f32> {
    data.slice(s![
        bbox.min[0]..bbox.max[0],
        bbox.min[1]..bbox.max[1],
        bbox.min[2]..bbox.max[2],
        ..
    ])
    .to_owned()
}

/// Place a cropped array back into a zero volume of `dims`
pub fn uncrop(data: &Array4<f32>, bbox: &BoundingBox, dims: (usize, usize, usize)) -> Array4<f32> {
    let mut out = Array4::zeros((dims.0, dims.1, dims.2, data.shape()[3]));
    out.slice_mut(s![
        bbox.min[0]..bbox.max[0],
        bbox.min[1]..bbox.max[1],
        bbox.min[2]..bbox.max[2],
        ..
    ])
    .assign(data);
    out
}

/// Source coordinate of output index `o` when resizing `n_in` to `n_out`
///
/// Corners are aligned: the first and last voxels map onto each other.
fn source_coord(o: usize, n_in: usize, n_out: usize) -> f64 {
    if n_out <= 1 || n_in <= 1 {
        return 0.0;
    }
    o as f64 * (n_in - 1) as f64 / (n_out - 1) as f64
}

/// Nearest-neighbour resampling of the spatial axes
pub fn resize_nearest(data: &Array4<f32>, size: (usize, usize, usize)) -> Array4<f32> {
    let sh = data.shape();
    let (nx, ny, nz, nc) = (sh[0], sh[1], sh[2], sh[3]);
    let pick = |o: usize, n_in: usize, n_out: usize| {
        (source_coord(o, n_in, n_out).round() as usize).min(n_in - 1)
    };
    Array4::from_shape_fn((size.0, size.1, size.2, nc), |(i, j, k, c)| {
        data[[pick(i, nx, size.0), pick(j, ny, size.1), pick(k, nz, size.2), c]]
    })
}

/// Trilinear resampling of the spatial axes
pub fn resize_trilinear(data: &Array4<f32>, size: (usize, usize, usize)) -> Array4<f32> {
    let sh = data.shape();
    let (nx, ny, nz, nc) = (sh[0], sh[1], sh[2], sh[3]);

    // (lower index, upper index, weight of upper)
    let axis_weights = |n_in: usize, n_out: usize| -> Vec<(usize, usize, f32)> {
        (0..n_out)
            .map(|o| {
                let x = source_coord(o, n_in, n_out);
                let lo = (x.floor() as usize).min(n_in - 1);
                let hi = (lo + 1).min(n_in - 1);
                (lo, hi, (x - lo as f64) as f32)
            })
            .collect()
    };
    let wx = axis_weights(nx, size.0);
    let wy = axis_weights(ny, size.1);
    let wz = axis_weights(nz, size.2);

    Array4::from_shape_fn((size.0, size.1, size.2, nc), |(i, j, k, c)| {
        let (x0, x1, fx) = wx[i];
        let (y0, y1, fy) = wy[j];
        let (z0, z1, fz) = wz[k];
        let v = |x: usize, y: usize, z: usize| data[[x, y, z, c]];
        let c00 = v(x0, y0, z0) * (1.0 - fx) + v(x1, y0, z0) * fx;
        let c10 = v(x0, y1, z0) * (1.0 - fx) + v(x1, y1, z0) * fx;
        let c01 = v(x0, y0, z1) * (1.0 - fx) + v(x1, y0, z1) * fx;
        let c11 = v(x0, y1, z1) * (1.0 - fx) + v(x1, y1, z1) * fx;
        let c0 = c00 * (1.0 - fy) + c10 * fy;
        let c1 = c01 * (1.0 - fy) + c11 * fy;
        c0 * (1.0 - fz) + c1 * fz
    })
}

/// Everything needed to map network-space predictions back to the input grid
#[derive(Debug, Clone, PartialEq)]
pub struct SquareTransform {
    pub original_dims: (usize, usize, usize),
    pub bbox: BoundingBox,
    /// Edge length of the zero-padded cube
    pub cube_size: usize,
    /// Zeros added before the cropped data on each axis
    pub pad_before: [usize; 3],
    /// Edge length of the network input
    pub target_size: usize,
}

impl SquareTransform {
    /// Crop, pad to a cube and resample to `target_size` (nearest neighbour)
    pub fn to_network_input(
        volume: &Volume,
        mask: &Array3<bool>,
        target_size: usize,
    ) -> Result<(Array4<f32>, Self)> {
        if mask.dim() != volume.dims() {
            return Err(Error::InvalidInput(format!(
                "mask dimensions {:?} do not match image {:?}",
                mask.dim(),
                volume.dims()
            )));
        }

        let bbox = bounding_box(mask)?;
        let cropped = crop(&volume.data, &bbox);
        let extent = bbox.extent();
        let cube_size = extent.into_iter().max().unwrap_or(1);
        let pad_before = extent.map(|e| (cube_size - e) / 2);

        let mut cube = Array4::zeros((cube_size, cube_size, cube_size, volume.channels()));
        cube.slice_mut(s![
            pad_before[0]..pad_before[0] + extent[0],
            pad_before[1]..pad_before[1] + extent[1],
            pad_before[2]..pad_before[2] + extent[2],
            ..
        ])
        .assign(&cropped);

        let input = resize_nearest(&cube, (target_size, target_size, target_size));
        let transform = Self {
            original_dims: volume.dims(),
            bbox,
            cube_size,
            pad_before,
            target_size,
        };
        Ok((input, transform))
    }

    /// Map a network-space prediction back onto the original voxel grid
    ///
    /// Voxels outside the bounding box are zero.
    pub fn restore(&self, prediction: &Array4<f32>) -> Array4<f32> {
        let n = self.cube_size;
        let cube = if prediction.shape()[..3] == [n, n, n] {
            prediction.clone()
        } else {
            resize_trilinear(prediction, (n, n, n))
        };
        let extent = self.bbox.extent();
        let p = self.pad_before;
        let cropped = cube
            .slice(s![
                p[0]..p[0] + extent[0],
                p[1]..p[1] + extent[1],
                p[2]..p[2] + extent[2],
                ..
            ])
            .to_owned();
        uncrop(&cropped, &self.bbox, self.original_dims)
    }
}

/// Z-score each channel over the voxels inside `mask`; zero outside
pub fn normalize_mean0_std1(volume: &Volume, mask: &Array3<bool>) -> Volume {
    let mut out = volume.clone();
    for c in 0..volume.channels() {
        let values: Vec<f64> = volume
            .data
            .indexed_iter()
            .filter(|&((i, j, k, ch), _)| ch == c && mask[[i, j, k]])
            .map(|(_, &v)| v as f64)
            .collect();
        if values.is_empty() {
            continue;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
        let scale = if std > 1e-12 { 1.0 / std } else { 1.0 };

        for ((i, j, k, ch), v) in out.data.indexed_iter_mut() {
            if ch != c {
                continue;
            }
            *v = if mask[[i, j, k]] {
                ((*v as f64 - mean) * scale) as f32
            } else {
                0.0
            };
        }
    }
    out
}
