//! Binary mask utilities
//!
//! Structuring elements, morphology and connected-component labeling on
//! 3D boolean masks indexed as `[x, y, z]`.

use std::collections::VecDeque;

use ndarray::Array3;

/// The six face neighbours of a voxel
const FACE_NEIGHBOURS: [(isize, isize, isize); 6] = [
    (-1, 0, 0), (1, 0, 0),
    (0, -1, 0), (0, 1, 0),
    (0, 0, -1), (0, 0, 1),
];

/// Voxel offsets of a ball structuring element
///
/// Contains every offset within `radius` voxels of the center, including
/// the center itself. Radius 1 gives the 6-connected cross.
pub fn ball_offsets(radius: usize) -> Vec<(isize, isize, isize)> {
    let r = radius as isize;
    let r2 = r * r;
    let mut offsets = Vec::new();
    for dz in -r..=r {
        for dy in -r..=r {
            for dx in -r..=r {
                if dx * dx + dy * dy + dz * dz <= r2 {
                    offsets.push((dx, dy, dz));
                }
            }
        }
    }
    offsets
}

fn shifted(
    (i, j, k): (usize, usize, usize),
    (dx, dy, dz): (isize, isize, isize),
    (nx, ny, nz): (usize, usize, usize),
) -> Option<(usize, usize, usize)> {
    let x = i.checked_add_signed(dx)?;
    let y = j.checked_add_signed(dy)?;
    let z = k.checked_add_signed(dz)?;
    (x < nx && y < ny && z < nz).then_some((x, y, z))
}

fn dims(mask: &Array3<bool>) -> (usize, usize, usize) {
    let s = mask.shape();
    (s[0], s[1], s[2])
}

/// Binary dilation with a ball of `radius` voxels
pub fn dilate(mask: &Array3<bool>, radius: usize) -> Array3<bool> {
    if radius == 0 {
        return mask.clone();
    }
    let shape = dims(mask);
    let offsets = ball_offsets(radius);
    let mut out = mask.clone();
    for ((i, j, k), &inside) in mask.indexed_iter() {
        if !inside {
            continue;
        }
        for &o in &offsets {
            if let Some(p) = shifted((i, j, k), o, shape) {
                out[p] = true;
            }
        }
    }
    out
}

/// Binary erosion with a ball of `radius` voxels
///
/// Voxels outside the volume count as background.
pub fn erode(mask: &Array3<bool>, radius: usize) -> Array3<bool> {
    if radius == 0 {
        return mask.clone();
    }
    let shape = dims(mask);
    let offsets = ball_offsets(radius);
    Array3::from_shape_fn(shape, |(i, j, k)| {
        mask[[i, j, k]]
            && offsets
                .iter()
                .all(|&o| shifted((i, j, k), o, shape).is_some_and(|p| mask[p]))
    })
}

/// Morphological closing (dilation followed by erosion)
pub fn close(mask: &Array3<bool>, radius: usize) -> Array3<bool> {
    erode(&dilate(mask, radius), radius)
}

/// Label 6-connected components
///
/// Returns the label image (0 = background, components numbered from 1) and
/// the voxel count of each component, indexed by `label - 1`.
pub fn label_components(mask: &Array3<bool>) -> (Array3<u32>, Vec<usize>) {
    let shape = dims(mask);
    let mut labels = Array3::<u32>::zeros(shape);
    let mut sizes = Vec::new();
    let mut queue = VecDeque::new();

    for ((i, j, k), &inside) in mask.indexed_iter() {
        if !inside || labels[[i, j, k]] != 0 {
            continue;
        }

        let label = sizes.len() as u32 + 1;
        let mut size = 0usize;
        labels[[i, j, k]] = label;
        queue.push_back((i, j, k));

        while let Some(p) = queue.pop_front() {
            size += 1;
            for &o in &FACE_NEIGHBOURS {
                if let Some(q) = shifted(p, o, shape) {
                    if mask[q] && labels[q] == 0 {
                        labels[q] = label;
                        queue.push_back(q);
                    }
                }
            }
        }

        sizes.push(size);
    }

    (labels, sizes)
}

/// Keep only the biggest component
pub fn largest_component(mask: &Array3<bool>) -> Array3<bool> {
    let (labels, sizes) = label_components(mask);
    let Some(best) = sizes
        .iter()
        .enumerate()
        .max_by_key(|(_, &s)| s)
        .map(|(i, _)| i as u32 + 1)
    else {
        return mask.clone();
    };
    labels.mapv(|l| l == best)
}

/// Fill background regions not connected to the volume border
pub fn fill_holes(mask: &Array3<bool>) -> Array3<bool> {
    let (nx, ny, nz) = dims(mask);
    let background = mask.mapv(|m| !m);
    let (labels, _) = label_components(&background);

    let mut outside = std::collections::HashSet::new();
    for ((i, j, k), &l) in labels.indexed_iter() {
        let on_border = i == 0 || j == 0 || k == 0 || i + 1 == nx || j + 1 == ny || k + 1 == nz;
        if l != 0 && on_border {
            outside.insert(l);
        }
    }

    Array3::from_shape_fn((nx, ny, nz), |p| mask[p] || !outside.contains(&labels[p]))
}
