//! MRtrix command lines: response estimation, CSD and peak extraction

use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::CsdType;
use crate::error::{Error, Result};

use super::{CommandRunner, ToolCommand};

/// Diffusion data and gradient files shared by every CSD step
#[derive(Debug, Clone, Copy)]
pub struct DiffusionInputs<'a> {
    pub dwi: &'a Path,
    pub bvals: &'a Path,
    pub bvecs: &'a Path,
    pub brain_mask: &'a Path,
    pub nthreads: usize,
}

/// Files produced by [`compute_peaks`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsdOutputs {
    /// White-matter FODs, input of probabilistic tracking
    pub wm_fod: PathBuf,
    /// Three peaks per voxel, input of the network
    pub peaks: PathBuf,
}

/// Programs a CSD run of `csd_type` needs
pub fn required_programs(csd_type: CsdType) -> &'static [&'static str] {
    match csd_type {
        CsdType::Csd | CsdType::CsdMsmt => &["dwi2response", "dwi2fod", "sh2peaks"],
        CsdType::CsdMsmt5tt => &["5ttgen", "dwi2response", "dwi2fod", "sh2peaks"],
    }
}

/// Estimate FODs and extract three peaks per voxel
///
/// # Arguments
/// * `runner` - Executes the MRtrix programs
/// * `inputs` - DWI, gradients and brain mask
/// * `csd_type` - Single-shell CSD or one of the multi-tissue variants
/// * `t1` - T1 image, required for `csd_msmt_5tt`
/// * `work_dir` - Directory receiving responses, FODs and peaks
pub fn compute_peaks(
    runner: &dyn CommandRunner,
    inputs: &DiffusionInputs<'_>,
    csd_type: CsdType,
    t1: Option<&Path>,
    work_dir: &Path,
) -> Result<CsdOutputs> {
    info!(?csd_type, "estimating fiber orientation distributions");
    let wm_fod = work_dir.join("WM_FODs.mif");
    let rf_wm = work_dir.join("RF_WM.txt");
    let rf_gm = work_dir.join("RF_GM.txt");
    let rf_csf = work_dir.join("RF_CSF.txt");

    match csd_type {
        CsdType::Csd => {
            let response = work_dir.join("response.txt");
            runner.run(&with_diffusion(
                ToolCommand::new("dwi2response")
                    .arg("tournier")
                    .arg(inputs.dwi)
                    .arg(&response),
                inputs,
            ))?;
            runner.run(&with_diffusion(
                ToolCommand::new("dwi2fod")
                    .arg("csd")
                    .arg(inputs.dwi)
                    .arg(&response)
                    .arg(&wm_fod),
                inputs,
            ))?;
        }
        CsdType::CsdMsmt | CsdType::CsdMsmt5tt => {
            let response = if csd_type == CsdType::CsdMsmt5tt {
                let t1 = t1.ok_or_else(|| Error::Config("csd_msmt_5tt needs a T1 image".into()))?;
                let five_tt = work_dir.join("5TT.nii.gz");
                runner.run(
                    &ToolCommand::new("5ttgen")
                        .arg("fsl")
                        .arg(t1)
                        .arg(&five_tt)
                        .arg("-premasked")
                        .nthreads(inputs.nthreads)
                        .arg("-force"),
                )?;
                ToolCommand::new("dwi2response")
                    .arg("msmt_5tt")
                    .arg(inputs.dwi)
                    .arg(&five_tt)
            } else {
                ToolCommand::new("dwi2response")
                    .arg("dhollander")
                    .arg(inputs.dwi)
            };
            runner.run(&with_diffusion(
                response.arg(&rf_wm).arg(&rf_gm).arg(&rf_csf),
                inputs,
            ))?;
            runner.run(&with_diffusion(
                ToolCommand::new("dwi2fod")
                    .arg("msmt_csd")
                    .arg(inputs.dwi)
                    .arg(&rf_wm)
                    .arg(&wm_fod)
                    .arg(&rf_gm)
                    .arg(work_dir.join("GM_FODs.mif"))
                    .arg(&rf_csf)
                    .arg(work_dir.join("CSF_FODs.mif")),
                inputs,
            ))?;
        }
    }

    let peaks = work_dir.join("peaks.nii.gz");
    runner.run(
        &ToolCommand::new("sh2peaks")
            .arg(&wm_fod)
            .arg(&peaks)
            .args(["-num", "3"])
            .arg("-mask")
            .arg(inputs.brain_mask)
            .nthreads(inputs.nthreads)
            .arg("-force"),
    )?;

    Ok(CsdOutputs { wm_fod, peaks })
}

/// Append mask, gradients and threads to a command reading the DWI
fn with_diffusion(cmd: ToolCommand, inputs: &DiffusionInputs<'_>) -> ToolCommand {
    cmd.arg("-mask")
        .arg(inputs.brain_mask)
        .fslgrad(inputs.bvecs, inputs.bvals)
        .nthreads(inputs.nthreads)
        .arg("-force")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    use crate::external::ToolOutput;

    #[derive(Default)]
    struct Recorder(RefCell<Vec<ToolCommand>>);

    impl CommandRunner for Recorder {
        fn run(&self, cmd: &ToolCommand) -> Result<ToolOutput> {
            self.0.borrow_mut().push(cmd.clone());
            Ok(ToolOutput::default())
        }
    }

    fn inputs() -> DiffusionInputs<'static> {
        DiffusionInputs {
            dwi: Path::new("dwi.nii.gz"),
            bvals: Path::new("dwi.bvals"),
            bvecs: Path::new("dwi.bvecs"),
            brain_mask: Path::new("mask.nii.gz"),
            nthreads: 2,
        }
    }

    fn subcommands(rec: &Recorder) -> Vec<String> {
        rec.0
            .borrow()
            .iter()
            .map(|c| format!("{} {}", c.program(), c.args_lossy()[0]))
            .collect()
    }

    #[test]
    fn test_single_shell_csd() {
        let rec = Recorder::default();
        let out = compute_peaks(&rec, &inputs(), CsdType::Csd, None, Path::new("/w")).unwrap();
        assert_eq!(out.wm_fod, Path::new("/w/WM_FODs.mif"));
        assert_eq!(out.peaks, Path::new("/w/peaks.nii.gz"));
        assert_eq!(
            subcommands(&rec),
            vec!["dwi2response tournier", "dwi2fod csd", "sh2peaks /w/WM_FODs.mif"]
        );

        let cmds = rec.0.borrow();
        for cmd in &cmds[..2] {
            assert_eq!(cmd.flag_value("-fslgrad"), Some(std::ffi::OsStr::new("dwi.bvecs")));
            assert_eq!(cmd.flag_value("-nthreads"), Some(std::ffi::OsStr::new("2")));
            assert_eq!(cmd.flag_value("-mask"), Some(std::ffi::OsStr::new("mask.nii.gz")));
        }
        assert_eq!(cmds[2].flag_value("-num"), Some(std::ffi::OsStr::new("3")));
    }

    #[test]
    fn test_multi_tissue_csd() {
        let rec = Recorder::default();
        compute_peaks(&rec, &inputs(), CsdType::CsdMsmt, None, Path::new("/w")).unwrap();
        assert_eq!(
            subcommands(&rec),
            vec!["dwi2response dhollander", "dwi2fod msmt_csd", "sh2peaks /w/WM_FODs.mif"]
        );
        let fod = rec.0.borrow()[1].to_string();
        assert!(fod.contains("/w/RF_WM.txt /w/WM_FODs.mif /w/RF_GM.txt /w/GM_FODs.mif"), "{fod}");
    }

    #[test]
    fn test_five_tissue_csd_needs_t1() {
        let rec = Recorder::default();
        let err = compute_peaks(&rec, &inputs(), CsdType::CsdMsmt5tt, None, Path::new("/w"));
        assert!(matches!(err, Err(Error::Config(_))));
        assert!(rec.0.borrow().is_empty());

        compute_peaks(&rec, &inputs(), CsdType::CsdMsmt5tt, Some(Path::new("T1.nii.gz")), Path::new("/w")).unwrap();
        assert_eq!(
            subcommands(&rec),
            vec!["5ttgen fsl", "dwi2response msmt_5tt", "dwi2fod msmt_csd", "sh2peaks /w/WM_FODs.mif"]
        );
    }

    #[test]
    fn test_required_programs() {
        assert!(required_programs(CsdType::CsdMsmt5tt).contains(&"5ttgen"));
        assert!(!required_programs(CsdType::Csd).contains(&"5ttgen"));
    }
}
