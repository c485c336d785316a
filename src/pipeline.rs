//! Stage orchestration for one segmentation run
//!
//! Stages run strictly one after another: input preparation (brain mask,
//! CSD, registration), orientation handling, inference, postprocessing,
//! saving and optional tracking. The first failing stage aborts the run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use ndarray::Array3;
use tempfile::TempDir;
use tracing::{info, info_span, warn};

use crate::config::{ModelVariant, OutputType, PipelineConfig, PEAK_CHANNELS};
use crate::error::{Error, Result};
use crate::external::brain_mask::{check_gradients, internal_brain_mask, read_bvals, read_bvecs};
use crate::external::mrtrix::{compute_peaks, required_programs, DiffusionInputs};
use crate::external::{fsl, CommandRunner, SystemRunner};
use crate::inference::{ModelProvider, OnnxProvider, Predictor};
use crate::nifti_io::{read_volume, write_volume, DataType};
use crate::orientation::{correct_peak_orientation, flip_axes, flip_axes_to_match_mni, SpatialAxis};
use crate::output::{output_dtype, save_output, TRACKING_DIR};
use crate::postprocess::{apply_mask, postprocess_output, PostprocessOptions};
use crate::preprocessing::{normalize_mean0_std1, SquareTransform};
use crate::registration::{register_to_mni, MniRegistration};
use crate::tracking::{track_bundles, TrackingInputs};
use crate::volume::Volume;

/// Intermediate artifacts of a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntermediatePaths {
    pub brain_mask: Option<PathBuf>,
    pub fod: Option<PathBuf>,
    /// Peaks the network sees (after CSD and registration)
    pub peaks: PathBuf,
    pub registration: Option<MniRegistration>,
    pub tracks: Vec<PathBuf>,
}

/// What a finished run produced
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// NIfTI files written to the output directory
    pub written: Vec<PathBuf>,
    pub intermediate: IntermediatePaths,
    /// Axes flipped to bring the input into MNI voxel order
    pub mni_flips: Vec<SpatialAxis>,
    /// Peak sign flip found by the orientation check
    pub detected_flip: Option<SpatialAxis>,
    /// Wall time per stage, in execution order
    pub timings: Vec<(&'static str, Duration)>,
}

impl RunSummary {
    fn time<T>(&mut self, stage: &'static str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _span = info_span!("stage", name = stage).entered();
        let start = Instant::now();
        let value = f()?;
        let elapsed = start.elapsed();
        info!(stage, seconds = elapsed.as_secs_f64(), "stage finished");
        self.timings.push((stage, elapsed));
        Ok(value)
    }
}

/// Peaks ready for inference and the mask bounding the brain
struct PreparedInput {
    peaks: Volume,
    mask: Array3<bool>,
    intermediate: IntermediatePaths,
}

/// One segmentation run over injected tools and models
pub struct Pipeline<'a> {
    config: &'a PipelineConfig,
    runner: &'a dyn CommandRunner,
    models: &'a dyn ModelProvider,
}

/// Run with the system's FSL/MRtrix and ONNX weights from the weights dir
pub fn run(config: &PipelineConfig) -> Result<RunSummary> {
    let provider = OnnxProvider {
        weights_dir: crate::config::resolve_weights_dir(config.model_dir.as_deref()),
        threads: config.nr_cpus,
    };
    Pipeline::new(config, &SystemRunner, &provider).run()
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        runner: &'a dyn CommandRunner,
        models: &'a dyn ModelProvider,
    ) -> Self {
        Self {
            config,
            runner,
            models,
        }
    }

    pub fn run(&self) -> Result<RunSummary> {
        let config = self.config;
        config.validate()?;

        let mut summary = RunSummary::default();

        // Weights load before any external tool runs
        let mut predictors = summary.time("load models", || self.load_predictors())?;

        std::fs::create_dir_all(&config.output_dir)
            .map_err(|e| Error::io(&config.output_dir, e))?;
        let scratch = tempfile::Builder::new()
            .prefix("tractseg_")
            .tempdir()
            .map_err(|e| Error::io(std::env::temp_dir(), e))?;
        let work = scratch.path();

        let prepared = summary.time("prepare input", || self.prepare_input(work))?;
        let PreparedInput {
            peaks,
            mask,
            intermediate,
        } = prepared;
        summary.intermediate = intermediate;

        // Network space: MNI voxel order, corrected peak signs
        let (peaks_mni, mni_flips) = flip_axes_to_match_mni(&peaks);
        let mask_mni = flip_mask(&mask, &mni_flips);
        summary.mni_flips = mni_flips.clone();

        let peaks_mni = if config.orientation_check {
            let (corrected, flip) = summary.time("orientation check", || {
                Ok(correct_peak_orientation(&peaks_mni, &mask_mni))
            })?;
            summary.detected_flip = flip;
            corrected
        } else {
            peaks_mni
        };

        let outputs = summary.time("inference", || {
            self.predict_outputs(&mut predictors, &peaks_mni, &mask_mni)
        })?;

        // Back to the input's voxel order and, if registered, subject space
        let registration = summary.intermediate.registration.clone();
        let mut final_outputs = HashMap::new();
        for (output_type, data) in outputs {
            let volume = flip_axes(&peaks_mni.with_data(data), &mni_flips);
            let volume = match &registration {
                Some(reg) => summary.time("back to subject space", || {
                    self.to_subject_space(reg, &volume, output_type, work)
                })?,
                None => volume,
            };
            final_outputs.insert(output_type, volume);
        }

        summary.written = summary.time("save", || {
            let variant = ModelVariant::pretrained(config.output_type, config.tract_definition)?;
            let volume = final_outputs.get(&config.output_type).ok_or_else(|| {
                Error::Inference(format!("no {} output was computed", config.output_type))
            })?;
            save_output(
                volume,
                &variant,
                &config.output_dir,
                config.single_output_file,
                output_dtype(config.output_type, config.get_probabilities),
                config.show_progress,
            )
        })?;

        if let Some(tracking) = &config.tracking {
            let fod = summary.intermediate.fod.clone();
            let tracks = summary.time("tracking", || {
                let get = |t: OutputType| {
                    final_outputs.get(&t).ok_or_else(|| {
                        Error::Inference(format!("tracking needs the {t} output"))
                    })
                };
                let inputs = TrackingInputs {
                    segmentations: get(OutputType::TractSegmentation)?,
                    endings: get(OutputType::EndingsSegmentation)?,
                    toms: get(OutputType::Tom)?,
                    bundles: config.tract_definition.bundles(),
                    fod: fod.as_deref(),
                };
                track_bundles(
                    self.runner,
                    &inputs,
                    tracking,
                    config.nr_cpus,
                    &work.join("tracking"),
                    &config.output_dir.join(TRACKING_DIR),
                    config.show_progress,
                )
            })?;
            summary.intermediate.tracks = tracks;
        }

        self.finish_scratch(scratch)?;
        info!(files = summary.written.len(), "run complete");
        Ok(summary)
    }

    /// Brain mask, CSD and registration; loads the peaks
    fn prepare_input(&self, work: &Path) -> Result<PreparedInput> {
        let config = self.config;
        let mut intermediate = IntermediatePaths::default();

        let brain_mask_file = if config.raw_diffusion_input {
            let (peaks_path, mask_path) = self.peaks_from_dwi(work, &mut intermediate)?;
            intermediate.peaks = peaks_path;
            Some(mask_path)
        } else {
            intermediate.peaks = config.input.clone();
            config.brain_mask.clone()
        };
        intermediate.brain_mask = brain_mask_file.clone();

        let peaks = read_volume(&intermediate.peaks)?;
        if peaks.channels() != PEAK_CHANNELS {
            return Err(Error::InvalidInput(format!(
                "peaks image '{}' has {} channels, expected {}",
                intermediate.peaks.display(),
                peaks.channels(),
                PEAK_CHANNELS
            )));
        }
        info!(dims = ?peaks.dims(), voxel_size = ?peaks.voxel_size, "loaded peaks");

        // After registration the subject-space mask no longer fits the peaks
        let mask = match brain_mask_file.filter(|_| intermediate.registration.is_none()) {
            Some(path) => {
                let mask = read_volume(&path)?;
                peaks.check_same_grid(&mask, ("peaks", "brain mask"))?;
                mask.channel(0).mapv(|v| v > 0.0)
            }
            None => peaks.nonzero_mask(),
        };

        Ok(PreparedInput {
            peaks,
            mask,
            intermediate,
        })
    }

    /// Brain mask, CSD and optional registration from a raw DWI
    ///
    /// Returns the peaks file and the subject-space brain mask.
    fn peaks_from_dwi(
        &self,
        work: &Path,
        intermediate: &mut IntermediatePaths,
    ) -> Result<(PathBuf, PathBuf)> {
        let config = self.config;
        let (bvals_path, bvecs_path) = match (&config.bvals, &config.bvecs) {
            (Some(bvals), Some(bvecs)) => (bvals.as_path(), bvecs.as_path()),
            _ => {
                return Err(Error::Config(
                    "raw diffusion input needs both bvals and bvecs".into(),
                ))
            }
        };

        let dwi = read_volume(&config.input)?;
        let bvals = read_bvals(bvals_path)?;
        check_gradients(dwi.channels(), &bvals, &read_bvecs(bvecs_path)?)?;

        let mask_path = match &config.brain_mask {
            Some(path) => {
                let mask = read_volume(path)?;
                dwi.check_same_grid(&mask, ("DWI", "brain mask"))?;
                path.clone()
            }
            None if config.internal_brain_mask => {
                let mask = internal_brain_mask(&dwi, &bvals)?;
                let path = work.join("nodif_brain_mask.nii.gz");
                let data = mask.mapv(|m| if m { 1.0 } else { 0.0 });
                write_volume(&path, &Volume::from_3d(data, dwi.affine, dwi.voxel_size), DataType::Uint8)?;
                path
            }
            None => {
                self.runner.ensure_available("fslroi")?;
                self.runner.ensure_available("bet")?;
                fsl::bet(self.runner, &config.input, work)?
            }
        };
        drop(dwi);

        for program in required_programs(config.csd_type) {
            self.runner.ensure_available(program)?;
        }
        let inputs = DiffusionInputs {
            dwi: &config.input,
            bvals: bvals_path,
            bvecs: bvecs_path,
            brain_mask: &mask_path,
            nthreads: config.nr_cpus,
        };
        let csd = compute_peaks(self.runner, &inputs, config.csd_type, config.t1.as_deref(), work)?;
        intermediate.fod = Some(csd.wm_fod);

        let peaks = if config.preprocess {
            let template = config.mni_template.as_deref().ok_or_else(|| {
                Error::Config("registration to MNI needs --mni_template".into())
            })?;
            for program in ["dtifit", "flirt", "convert_xfm"] {
                self.runner.ensure_available(program)?;
            }
            let (registered, reg) = register_to_mni(
                self.runner,
                &config.input,
                &mask_path,
                bvecs_path,
                bvals_path,
                &csd.peaks,
                template,
                work,
            )?;
            intermediate.registration = Some(reg);
            registered
        } else {
            csd.peaks
        };

        Ok((peaks, mask_path))
    }

    /// One predictor per output the configuration needs, in run order
    fn load_predictors(&self) -> Result<Vec<Predictor>> {
        self.config
            .required_outputs()
            .into_iter()
            .map(|output_type| {
                let variant = ModelVariant::pretrained(output_type, self.config.tract_definition)?;
                Predictor::load(variant, self.models)
            })
            .collect()
    }

    /// Run every loaded network
    ///
    /// Returns postprocessed outputs on the grid of `peaks`.
    fn predict_outputs(
        &self,
        predictors: &mut [Predictor],
        peaks: &Volume,
        mask: &Array3<bool>,
    ) -> Result<Vec<(OutputType, ndarray::Array4<f32>)>> {
        let config = self.config;
        let opts = PostprocessOptions {
            threshold: config.threshold,
            blob_threshold: config.blob_threshold,
            hole_closing: config.hole_closing,
            postprocess: config.postprocess,
            bundle_specific: config.bundle_specific_postprocessing,
            get_probabilities: config.get_probabilities,
        };

        let mut results: Vec<(OutputType, ndarray::Array4<f32>)> = Vec::new();
        for predictor in predictors.iter_mut() {
            let variant = predictor.variant().clone();
            let output_type = variant.output_type;
            let source = if variant.normalize_input {
                normalize_mean0_std1(peaks, mask)
            } else {
                peaks.clone()
            };
            let input_size = self.models.input_size(&variant);
            let (input, transform) = SquareTransform::to_network_input(&source, mask, input_size)?;

            let prediction = predictor.predict(
                &input,
                config.single_orientation,
                config.batch_size,
                config.show_progress,
            )?;
            let mut restored = transform.restore(&prediction);
            apply_mask(&mut restored, mask);

            // TOMs are masked by this run's final segmentation when there is one
            let seg = results
                .iter()
                .find(|(t, _)| *t == OutputType::TractSegmentation)
                .map(|(_, data)| data)
                .filter(|_| !config.get_probabilities);
            let processed = postprocess_output(&variant, &restored, seg, &opts)?;
            results.push((output_type, processed));
        }
        Ok(results)
    }

    /// Resample one output back from MNI to subject space
    fn to_subject_space(
        &self,
        reg: &MniRegistration,
        volume: &Volume,
        output_type: OutputType,
        work: &Path,
    ) -> Result<Volume> {
        let mni_file = work.join(format!("{output_type}_MNI.nii.gz"));
        let subject_file = work.join(format!("{output_type}_subject.nii.gz"));
        write_volume(&mni_file, volume, DataType::Float32)?;

        let binary = output_type.is_segmentation() && !self.config.get_probabilities;
        let vectors = output_type == OutputType::Tom;
        reg.to_subject_space(self.runner, &mni_file, &subject_file, binary, vectors)?;
        read_volume(&subject_file)
    }

    /// Copy intermediates to `<out>/intermediate` if requested
    fn finish_scratch(&self, scratch: TempDir) -> Result<()> {
        if !self.config.keep_intermediate_files {
            return Ok(());
        }
        let dest = self.config.output_dir.join("intermediate");
        copy_dir(scratch.path(), &dest)?;
        info!(dir = %dest.display(), "kept intermediate files");
        Ok(())
    }
}

fn flip_mask(mask: &Array3<bool>, axes: &[SpatialAxis]) -> Array3<bool> {
    let mut out = mask.clone();
    for axis in axes {
        out.invert_axis(ndarray::Axis(axis.index()));
    }
    out
}

fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest).map_err(|e| Error::io(dest, e))?;
    let entries = std::fs::read_dir(src).map_err(|e| Error::io(src, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(src, e))?;
        let path = entry.path();
        let target = dest.join(entry.file_name());
        if path.is_dir() {
            copy_dir(&path, &target)?;
        } else if let Err(e) = std::fs::copy(&path, &target) {
            warn!(path = %path.display(), error = %e, "could not keep intermediate file");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flip_mask_is_involution() {
        let mask = Array3::from_shape_fn((3, 2, 2), |(i, j, _)| i == 0 && j == 1);
        let axes = [SpatialAxis::X, SpatialAxis::Y];
        let flipped = flip_mask(&mask, &axes);
        assert!(flipped[[2, 0, 0]]);
        assert_eq!(flip_mask(&flipped, &axes), mask);
    }

    #[test]
    fn test_copy_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("a.txt"), "a").unwrap();
        std::fs::write(src.join("nested/b.txt"), "b").unwrap();

        copy_dir(&src, &tmp.path().join("dest")).unwrap();
        assert_eq!(std::fs::read_to_string(tmp.path().join("dest/nested/b.txt")).unwrap(), "b");
    }

    #[test]
    fn test_run_summary_records_timings() {
        let mut summary = RunSummary::default();
        let v = summary.time("stage", || Ok(3)).unwrap();
        assert_eq!(v, 3);
        assert!(summary.time::<()>("failing", || Err(Error::Config("x".into()))).is_err());
        assert_eq!(summary.timings.len(), 1);
        assert_eq!(summary.timings[0].0, "stage");
    }
}
