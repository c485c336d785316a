//! FSL command lines
//!
//! Each function builds one FSL invocation, runs it, and returns the path
//! of the file it produces.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

use super::{CommandRunner, ToolCommand};

/// Fractional intensity threshold passed to bet
const BET_FRACTIONAL_THRESHOLD: &str = "0.3";

/// Resampling used by `flirt -applyxfm`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    NearestNeighbour,
    Trilinear,
    Spline,
}

impl Interpolation {
    fn as_str(self) -> &'static str {
        match self {
            Interpolation::NearestNeighbour => "nearestneighbour",
            Interpolation::Trilinear => "trilinear",
            Interpolation::Spline => "spline",
        }
    }
}

/// Brain extraction on the first (b0) volume of the DWI
///
/// Returns the binary mask `<out_dir>/nodif_brain_mask.nii.gz`.
pub fn bet(runner: &dyn CommandRunner, dwi: &Path, out_dir: &Path) -> Result<PathBuf> {
    let nodif = out_dir.join("nodif");
    runner.run(&ToolCommand::new("fslroi").arg(dwi).arg(&nodif).args(["0", "1"]))?;

    let prefix = out_dir.join("nodif_brain");
    runner.run(
        &ToolCommand::new("bet")
            .arg(&nodif)
            .arg(&prefix)
            .args(["-f", BET_FRACTIONAL_THRESHOLD, "-g", "0", "-m"]),
    )?;
    Ok(out_dir.join("nodif_brain_mask.nii.gz"))
}

/// Tensor fit; returns the FA map
pub fn dtifit(
    runner: &dyn CommandRunner,
    dwi: &Path,
    mask: &Path,
    bvecs: &Path,
    bvals: &Path,
    out_dir: &Path,
) -> Result<PathBuf> {
    let prefix = out_dir.join("dti");
    runner.run(
        &ToolCommand::new("dtifit")
            .arg("-k")
            .arg(dwi)
            .arg("-o")
            .arg(&prefix)
            .arg("-m")
            .arg(mask)
            .arg("-r")
            .arg(bvecs)
            .arg("-b")
            .arg(bvals),
    )?;
    Ok(out_dir.join("dti_FA.nii.gz"))
}

/// Rigid (6 dof) registration of `input` to `reference`
///
/// Writes the registered image to `output` and returns the matrix path.
pub fn flirt_rigid(
    runner: &dyn CommandRunner,
    input: &Path,
    reference: &Path,
    output: &Path,
    matrix: &Path,
) -> Result<PathBuf> {
    runner.run(
        &ToolCommand::new("flirt")
            .arg("-ref")
            .arg(reference)
            .arg("-in")
            .arg(input)
            .arg("-out")
            .arg(output)
            .arg("-omat")
            .arg(matrix)
            .args(["-dof", "6", "-cost", "mutualinfo", "-searchcost", "mutualinfo"]),
    )?;
    Ok(matrix.to_path_buf())
}

/// Resample `input` onto `reference` with an existing matrix
pub fn flirt_apply(
    runner: &dyn CommandRunner,
    input: &Path,
    reference: &Path,
    matrix: &Path,
    output: &Path,
    interp: Interpolation,
) -> Result<PathBuf> {
    runner.run(
        &ToolCommand::new("flirt")
            .arg("-ref")
            .arg(reference)
            .arg("-in")
            .arg(input)
            .arg("-out")
            .arg(output)
            .arg("-applyxfm")
            .arg("-init")
            .arg(matrix)
            .args(["-dof", "6", "-interp", interp.as_str()]),
    )?;
    Ok(output.to_path_buf())
}

/// Invert an FSL matrix
pub fn invert_matrix(runner: &dyn CommandRunner, matrix: &Path, output: &Path) -> Result<PathBuf> {
    runner.run(
        &ToolCommand::new("convert_xfm")
            .arg("-omat")
            .arg(output)
            .arg("-inverse")
            .arg(matrix),
    )?;
    Ok(output.to_path_buf())
}

/// Parse a 4x4 FSL matrix file into a row-major array
pub fn parse_fsl_mat(text: &str) -> Result<[f64; 16]> {
    let values: Vec<f64> = text
        .split_whitespace()
        .map(|t| {
            t.parse::<f64>()
                .map_err(|_| Error::InvalidInput(format!("non-numeric entry '{t}' in FSL matrix")))
        })
        .collect::<Result<_>>()?;
    values.try_into().map_err(|v: Vec<f64>| {
        Error::InvalidInput(format!("FSL matrix has {} entries, expected 16", v.len()))
    })
}

/// Read and parse an FSL matrix file
pub fn read_fsl_mat(path: &Path) -> Result<[f64; 16]> {
    let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    parse_fsl_mat(&text)
}
