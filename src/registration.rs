//! Rigid registration to MNI space and back
//!
//! Resampling is done by FSL. Peak vectors are rotated here with the
//! rotation part of the FSL matrix, since `flirt` moves voxels but leaves
//! the vectors stored in them untouched.

use std::path::{Path, PathBuf};

use ndarray::{Axis, Zip};
use tracing::{info, instrument};

use crate::error::{Error, Result};
use crate::external::fsl::{self, Interpolation};
use crate::external::CommandRunner;
use crate::nifti_io::{self, DataType};
use crate::volume::Volume;

/// Matrices and reference images of one subject-to-MNI registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MniRegistration {
    /// Subject-space FA, reference for the way back
    pub subject_reference: PathBuf,
    pub template: PathBuf,
    pub to_mni: PathBuf,
    pub to_subject: PathBuf,
}

/// Orthonormal rotation contained in a row-major 4x4 matrix
///
/// Gram-Schmidt on the columns removes scaling and shear left over from
/// the optimizer.
pub fn rotation_part(mat: &[f64; 16]) -> Result<[[f64; 3]; 3]> {
    let col = |c: usize| [mat[c], mat[4 + c], mat[8 + c]];
    let dot = |a: [f64; 3], b: [f64; 3]| a[0] * b[0] + a[1] * b[1] + a[2] * b[2];
    let normalized = |a: [f64; 3]| -> Result<[f64; 3]> {
        let n = dot(a, a).sqrt();
        if n < 1e-9 {
            return Err(Error::InvalidInput("registration matrix is singular".into()));
        }
        Ok([a[0] / n, a[1] / n, a[2] / n])
    };

    let e0 = normalized(col(0))?;
    let c1 = col(1);
    let p = dot(c1, e0);
    let e1 = normalized([c1[0] - p * e0[0], c1[1] - p * e0[1], c1[2] - p * e0[2]])?;
    let c2 = col(2);
    let (p0, p1) = (dot(c2, e0), dot(c2, e1));
    let e2 = normalized([
        c2[0] - p0 * e0[0] - p1 * e1[0],
        c2[1] - p0 * e0[1] - p1 * e1[1],
        c2[2] - p0 * e0[2] - p1 * e1[2],
    ])?;

    Ok([
        [e0[0], e1[0], e2[0]],
        [e0[1], e1[1], e2[1]],
        [e0[2], e1[2], e2[2]],
    ])
}

/// Apply `rotation` to every peak vector of a 9-channel image
pub fn rotate_peaks(peaks: &Volume, rotation: &[[f64; 3]; 3]) -> Result<Volume> {
    if peaks.channels() % 3 != 0 {
        return Err(Error::InvalidInput(format!(
            "peaks have {} channels, not a multiple of 3",
            peaks.channels()
        )));
    }
    let mut data = peaks.data.clone();
    Zip::from(data.lanes_mut(Axis(3))).for_each(|mut lane| {
        for p in 0..lane.len() / 3 {
            let v = [
                lane[3 * p] as f64,
                lane[3 * p + 1] as f64,
                lane[3 * p + 2] as f64,
            ];
            for (r, row) in rotation.iter().enumerate() {
                lane[3 * p + r] = (row[0] * v[0] + row[1] * v[1] + row[2] * v[2]) as f32;
            }
        }
    });
    Ok(peaks.with_data(data))
}

/// Register the subject to MNI and move the peaks along
///
/// Returns the registered, rotated peaks file and the registration needed
/// to return to subject space.
///
/// # Arguments
/// * `dwi`, `brain_mask`, `bvecs`, `bvals` - Inputs of the tensor fit
/// * `peaks` - Subject-space peaks to move
/// * `template` - MNI FA template
/// * `work_dir` - Directory for FA, matrices and registered peaks
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all)]
pub fn register_to_mni(
    runner: &dyn CommandRunner,
    dwi: &Path,
    brain_mask: &Path,
    bvecs: &Path,
    bvals: &Path,
    peaks: &Path,
    template: &Path,
    work_dir: &Path,
) -> Result<(PathBuf, MniRegistration)> {
    let fa = fsl::dtifit(runner, dwi, brain_mask, bvecs, bvals, work_dir)?;
    let to_mni = fsl::flirt_rigid(
        runner,
        &fa,
        template,
        &work_dir.join("FA_MNI.nii.gz"),
        &work_dir.join("FA_2_MNI.mat"),
    )?;
    let to_subject = fsl::invert_matrix(runner, &to_mni, &work_dir.join("MNI_2_FA.mat"))?;

    let registered = fsl::flirt_apply(
        runner,
        peaks,
        template,
        &to_mni,
        &work_dir.join("peaks_MNI.nii.gz"),
        Interpolation::Spline,
    )?;

    let rotation = rotation_part(&fsl::read_fsl_mat(&to_mni)?)?;
    let rotated = rotate_peaks(&nifti_io::read_volume(&registered)?, &rotation)?;
    nifti_io::write_volume(&registered, &rotated, DataType::Float32)?;
    info!(matrix = %to_mni.display(), "peaks registered to MNI space");

    Ok((
        registered,
        MniRegistration {
            subject_reference: fa,
            template: template.to_path_buf(),
            to_mni,
            to_subject,
        },
    ))
}

impl MniRegistration {
    /// Resample an output file back to subject space
    ///
    /// Binary outputs use nearest-neighbour interpolation, everything else
    /// trilinear. Vector outputs (TOM) are rotated back as well.
    pub fn to_subject_space(
        &self,
        runner: &dyn CommandRunner,
        input: &Path,
        output: &Path,
        binary: bool,
        vectors: bool,
    ) -> Result<PathBuf> {
        let interp = if binary {
            Interpolation::NearestNeighbour
        } else {
            Interpolation::Trilinear
        };
        let out = fsl::flirt_apply(
            runner,
            input,
            &self.subject_reference,
            &self.to_subject,
            output,
            interp,
        )?;
        if vectors {
            let rotation = rotation_part(&fsl::read_fsl_mat(&self.to_subject)?)?;
            let rotated = rotate_peaks(&nifti_io::read_volume(&out)?, &rotation)?;
            nifti_io::write_volume(&out, &rotated, DataType::Float32)?;
        }
        Ok(out)
    }
}
