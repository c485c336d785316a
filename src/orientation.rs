//! Image orientation conventions
//!
//! The network was trained on images stored in MNI orientation: affine
//! diagonal signs (−, +, +). Inputs are brought into that voxel order
//! before inference and outputs are flipped back afterwards.
//!
//! Peak images also carry a sign convention per vector component. A wrong
//! sign along one axis leaves straight bundles intact but breaks curved
//! ones, so the orientation check tracks short streamlines through the
//! peaks for every candidate flip and keeps the one that tracks longest.

use std::fmt;

use ndarray::{Array3, Axis};
use tracing::{debug, info, warn};

use crate::volume::Volume;

/// A spatial axis of the voxel grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpatialAxis {
    X,
    Y,
    Z,
}

impl SpatialAxis {
    pub const ALL: [SpatialAxis; 3] = [SpatialAxis::X, SpatialAxis::Y, SpatialAxis::Z];

    pub fn index(self) -> usize {
        match self {
            Self::X => 0,
            Self::Y => 1,
            Self::Z => 2,
        }
    }
}

impl fmt::Display for SpatialAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::X => "x",
            Self::Y => "y",
            Self::Z => "z",
        })
    }
}

/// Step length of the orientation-check tracker, in voxels
const STEP_SIZE: f64 = 0.5;

/// Steps per direction before a streamline is cut
const MAX_STEPS: usize = 100;

/// Cosine of the largest turning angle per step (60 degrees)
const MIN_ALIGNMENT: f64 = 0.5;

/// Upper bound on seeds so the check stays fast on large volumes
const MAX_SEEDS: usize = 5000;

/// A flip must beat the unflipped peaks by this factor to be applied
const FLIP_MARGIN: f64 = 1.05;

/// Flip the voxel order along one axis, keeping world positions intact
///
/// The affine column of the axis is negated and the translation moved to
/// the opposite end of the axis. Applying the same flip twice restores the
/// original volume.
pub fn flip_axis(volume: &Volume, axis: SpatialAxis) -> Volume {
    let a = axis.index();
    let n = volume.data.shape()[a];

    let mut data = volume.data.clone();
    data.invert_axis(Axis(a));

    let mut affine = volume.affine;
    for row in 0..3 {
        let col = affine[row * 4 + a];
        affine[row * 4 + 3] += col * (n as f64 - 1.0);
        affine[row * 4 + a] = -col;
    }

    Volume::new(data, affine, volume.voxel_size)
}

/// Flip every axis in `axes`
pub fn flip_axes(volume: &Volume, axes: &[SpatialAxis]) -> Volume {
    axes.iter().fold(volume.clone(), |v, &axis| flip_axis(&v, axis))
}

/// Axes whose affine diagonal sign differs from MNI space
pub fn axes_to_flip_for_mni(affine: &[f64; 16]) -> Vec<SpatialAxis> {
    let mut axes = Vec::new();
    if affine[0] > 0.0 {
        axes.push(SpatialAxis::X);
    }
    if affine[5] < 0.0 {
        axes.push(SpatialAxis::Y);
    }
    if affine[10] < 0.0 {
        axes.push(SpatialAxis::Z);
    }
    axes
}

/// Bring a volume into MNI voxel order
///
/// Returns the flipped volume and the axes that were flipped, which
/// [`flip_axes`] takes to restore the original order.
pub fn flip_axes_to_match_mni(volume: &Volume) -> (Volume, Vec<SpatialAxis>) {
    let axes = axes_to_flip_for_mni(&volume.affine);
    if !axes.is_empty() {
        debug!(axes = ?axes, "flipping voxel axes to match MNI orientation");
    }
    (flip_axes(volume, &axes), axes)
}

/// Negate one vector component of all three peaks
pub fn flip_peaks(peaks: &Volume, axis: SpatialAxis) -> Volume {
    let mut out = peaks.clone();
    let a = axis.index();
    let mut c = a;
    while c < out.channels() {
        out.data.index_axis_mut(Axis(3), c).mapv_inplace(|v| -v);
        c += 3;
    }
    out
}

/// Mean streamline length (in steps) for each candidate: none, x, y, z
pub fn peak_flip_scores(peaks: &Volume, mask: &Array3<bool>) -> [f64; 4] {
    let tracker = Tracker::new(peaks, mask);
    let seeds = tracker.seeds();

    let mut scores = [0.0; 4];
    let candidates = [None, Some(SpatialAxis::X), Some(SpatialAxis::Y), Some(SpatialAxis::Z)];
    for (score, flip) in scores.iter_mut().zip(candidates) {
        if seeds.is_empty() {
            break;
        }
        let total: usize = seeds.iter().map(|&s| tracker.streamline_steps(s, flip)).sum();
        *score = total as f64 / seeds.len() as f64;
    }
    scores
}

/// Detect along which axis the peaks have the wrong sign, if any
pub fn detect_peak_flip(peaks: &Volume, mask: &Array3<bool>) -> Option<SpatialAxis> {
    let scores = peak_flip_scores(peaks, mask);
    debug!(none = scores[0], x = scores[1], y = scores[2], z = scores[3], "peak orientation scores");

    let (best, &best_score) = scores
        .iter()
        .enumerate()
        .skip(1)
        .fold((0, &scores[0]), |acc, cur| if cur.1 > acc.1 { cur } else { acc });

    if best == 0 || best_score <= scores[0] * FLIP_MARGIN {
        return None;
    }
    Some(SpatialAxis::ALL[best - 1])
}

/// Flip the peaks if the orientation check finds a wrong sign
pub fn correct_peak_orientation(
    peaks: &Volume,
    mask: &Array3<bool>,
) -> (Volume, Option<SpatialAxis>) {
    match detect_peak_flip(peaks, mask) {
        Some(axis) => {
            warn!(%axis, "peaks are probably not in the expected orientation, flipping along {axis}");
            (flip_peaks(peaks, axis), Some(axis))
        }
        None => {
            info!("peak orientation looks correct");
            (peaks.clone(), None)
        }
    }
}

type Vec3 = [f64; 3];

fn dot(a: Vec3, b: Vec3) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Inverse of a 3x3 matrix, `None` if singular
fn invert3(m: [[f64; 3]; 3]) -> Option<[[f64; 3]; 3]> {
    let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
    if det.abs() < 1e-12 {
        return None;
    }
    let inv_det = 1.0 / det;
    let mut inv = [[0.0; 3]; 3];
    for r in 0..3 {
        for c in 0..3 {
            // cofactor of (c, r)
            let (r1, r2) = ((c + 1) % 3, (c + 2) % 3);
            let (c1, c2) = ((r + 1) % 3, (r + 2) % 3);
            inv[r][c] = (m[r1][c1] * m[r2][c2] - m[r1][c2] * m[r2][c1]) * inv_det;
        }
    }
    Some(inv)
}

/// Deterministic peak follower used only for the orientation check
struct Tracker<'a> {
    peaks: &'a Volume,
    mask: &'a Array3<bool>,
    world_to_voxel: [[f64; 3]; 3],
}

impl<'a> Tracker<'a> {
    fn new(peaks: &'a Volume, mask: &'a Array3<bool>) -> Self {
        let a = &peaks.affine;
        let linear = [[a[0], a[1], a[2]], [a[4], a[5], a[6]], [a[8], a[9], a[10]]];
        let world_to_voxel = invert3(linear).unwrap_or([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);
        Self {
            peaks,
            mask,
            world_to_voxel,
        }
    }

    /// In-mask voxels with a first peak, evenly subsampled
    fn seeds(&self) -> Vec<(usize, usize, usize)> {
        let candidates: Vec<_> = self
            .mask
            .indexed_iter()
            .filter(|&(p, &m)| m && self.direction(p, 0, None).is_some())
            .map(|(p, _)| p)
            .collect();
        let stride = candidates.len().div_ceil(MAX_SEEDS).max(1);
        candidates.into_iter().step_by(stride).collect()
    }

    /// Unit voxel-space direction of peak `p` at `voxel`
    fn direction(&self, voxel: (usize, usize, usize), p: usize, flip: Option<SpatialAxis>) -> Option<Vec3> {
        let (i, j, k) = voxel;
        let c = p * 3;
        if c + 2 >= self.peaks.channels() {
            return None;
        }
        let mut w = [
            self.peaks.data[[i, j, k, c]] as f64,
            self.peaks.data[[i, j, k, c + 1]] as f64,
            self.peaks.data[[i, j, k, c + 2]] as f64,
        ];
        if let Some(axis) = flip {
            w[axis.index()] = -w[axis.index()];
        }
        let m = &self.world_to_voxel;
        let d = [dot(m[0], w), dot(m[1], w), dot(m[2], w)];
        let norm = dot(d, d).sqrt();
        (norm > 1e-6).then(|| [d[0] / norm, d[1] / norm, d[2] / norm])
    }

    fn voxel_at(&self, pos: Vec3) -> Option<(usize, usize, usize)> {
        let shape = self.mask.shape();
        let mut idx = [0usize; 3];
        for a in 0..3 {
            let r = pos[a].round();
            if r < 0.0 || r >= shape[a] as f64 {
                return None;
            }
            idx[a] = r as usize;
        }
        let v = (idx[0], idx[1], idx[2]);
        self.mask[v].then_some(v)
    }

    /// The peak at `voxel` best aligned with `previous`, sign-matched
    fn next_direction(&self, voxel: (usize, usize, usize), previous: Vec3, flip: Option<SpatialAxis>) -> Option<Vec3> {
        (0..3)
            .filter_map(|p| self.direction(voxel, p, flip))
            .map(|d| {
                let cos = dot(d, previous);
                if cos < 0.0 {
                    ([-d[0], -d[1], -d[2]], -cos)
                } else {
                    (d, cos)
                }
            })
            .filter(|&(_, cos)| cos >= MIN_ALIGNMENT)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(d, _)| d)
    }

    /// Steps taken from `seed` in both directions before termination
    fn streamline_steps(&self, seed: (usize, usize, usize), flip: Option<SpatialAxis>) -> usize {
        let Some(initial) = self.direction(seed, 0, flip) else {
            return 0;
        };

        let mut steps = 0;
        for sign in [1.0, -1.0] {
            let mut pos = [seed.0 as f64, seed.1 as f64, seed.2 as f64];
            let mut dir = [initial[0] * sign, initial[1] * sign, initial[2] * sign];
            for _ in 0..MAX_STEPS {
                for a in 0..3 {
                    pos[a] += dir[a] * STEP_SIZE;
                }
                let Some(voxel) = self.voxel_at(pos) else {
                    break;
                };
                let Some(next) = self.next_direction(voxel, dir, flip) else {
                    break;
                };
                dir = next;
                steps += 1;
            }
        }
        steps
    }
}
