//! Brain mask without FSL
//!
//! Mean of the b0 volumes, thresholded with Otsu's method, reduced to the
//! largest connected component and closed.

use std::path::Path;

use ndarray::{Array3, Axis};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::utils::{close, fill_holes, largest_component, otsu_threshold};
use crate::volume::Volume;

/// Volumes with a b-value below this count as b0
pub const B0_THRESHOLD: f64 = 50.0;

/// Radius of the closing applied to the mask
const CLOSING_RADIUS: usize = 2;

/// Parse an FSL-style bvals file (whitespace separated)
pub fn parse_bvals(text: &str) -> Result<Vec<f64>> {
    text.split_whitespace()
        .map(|t| {
            t.parse::<f64>()
                .map_err(|_| Error::InvalidInput(format!("invalid b-value '{t}'")))
        })
        .collect()
}

/// Parse an FSL-style bvecs file (three rows of equal length)
pub fn parse_bvecs(text: &str) -> Result<Vec<[f64; 3]>> {
    let rows: Vec<Vec<f64>> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(parse_bvals)
        .collect::<Result<_>>()?;
    if rows.len() != 3 || rows[0].len() != rows[1].len() || rows[1].len() != rows[2].len() {
        return Err(Error::InvalidInput(
            "bvecs must have three rows of equal length".into(),
        ));
    }
    Ok((0..rows[0].len())
        .map(|i| [rows[0][i], rows[1][i], rows[2][i]])
        .collect())
}

pub fn read_bvals(path: &Path) -> Result<Vec<f64>> {
    let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    parse_bvals(&text)
}

pub fn read_bvecs(path: &Path) -> Result<Vec<[f64; 3]>> {
    let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    parse_bvecs(&text)
}

/// Check that the gradient table matches the number of DWI volumes
pub fn check_gradients(volumes: usize, bvals: &[f64], bvecs: &[[f64; 3]]) -> Result<()> {
    if bvals.len() != volumes || bvecs.len() != volumes {
        return Err(Error::InvalidInput(format!(
            "DWI has {volumes} volumes but {} bvals and {} bvecs",
            bvals.len(),
            bvecs.len()
        )));
    }
    Ok(())
}

/// Average of all volumes with b < 50
pub fn mean_b0(dwi: &Volume, bvals: &[f64]) -> Result<Array3<f32>> {
    if bvals.len() != dwi.channels() {
        return Err(Error::InvalidInput(format!(
            "DWI has {} volumes but {} bvals",
            dwi.channels(),
            bvals.len()
        )));
    }
    let b0: Vec<usize> = bvals
        .iter()
        .enumerate()
        .filter(|(_, &b)| b < B0_THRESHOLD)
        .map(|(i, _)| i)
        .collect();
    if b0.is_empty() {
        return Err(Error::InvalidInput("DWI has no b0 volume".into()));
    }
    debug!(count = b0.len(), "averaging b0 volumes");

    let selected = dwi.data.select(Axis(3), &b0);
    selected
        .mean_axis(Axis(3))
        .ok_or_else(|| Error::InvalidInput("DWI has no b0 volume".into()))
}

/// Brain mask from the mean b0 image
pub fn internal_brain_mask(dwi: &Volume, bvals: &[f64]) -> Result<Array3<bool>> {
    let b0 = mean_b0(dwi, bvals)?;
    let values: Vec<f32> = b0.iter().copied().collect();
    let threshold = otsu_threshold(&values, 256);

    let mask = b0.mapv(|v| v > threshold);
    let mask = fill_holes(&close(&largest_component(&mask), CLOSING_RADIUS));
    let voxels = mask.iter().filter(|&&m| m).count();
    info!(threshold, voxels, "internal brain mask");

    if voxels == 0 {
        return Err(Error::InvalidInput("brain mask is empty".into()));
    }
    Ok(mask)
}
