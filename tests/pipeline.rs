//! End-to-end runs with fake tools and a deterministic stand-in network

mod common;

use common::*;
use tractseg_core::config::{OutputType, TrackingConfig};
use tractseg_core::nifti_io::{read_volume, write_volume, DataType};
use tractseg_core::orientation::SpatialAxis;
use tractseg_core::pipeline::Pipeline;
use tractseg_core::volume::{scaled_identity, Volume};
use tractseg_core::Error;

#[test]
fn test_segmentation_from_peaks_writes_one_file_per_bundle() {
    let tmp = tempfile::tempdir().unwrap();
    let input = write_peaks(tmp.path());
    let out = tmp.path().join("out");
    let config = quiet_config(&input, &out);

    let runner = RecordingRunner::default();
    let models = FakeProvider::default();
    let summary = Pipeline::new(&config, &runner, &models).run().unwrap();

    assert_eq!(summary.written.len(), 72);
    assert!(runner.programs().is_empty());
    assert_eq!(*models.loaded.borrow(), vec![OutputType::TractSegmentation]);
    // positive x voxel axis is flipped for MNI and flipped back
    assert_eq!(summary.mni_flips, vec![SpatialAxis::X]);
    assert_eq!(summary.detected_flip, None);
    assert!(summary.timings.iter().any(|(stage, _)| *stage == "inference"));

    let cst = read_volume(&out.join("bundle_segmentations/CST_left.nii.gz")).unwrap();
    let peaks = read_volume(&input).unwrap();
    assert_eq!(cst.dims(), DIMS);
    assert_eq!(cst.channels(), 1);
    assert!(cst.check_same_grid(&peaks, ("CST_left", "peaks")).is_ok());
    for ((i, j, k, _), &v) in cst.data.indexed_iter() {
        let expected = if in_brain(i, j, k) { 1.0 } else { 0.0 };
        assert_eq!(v, expected, "voxel ({i}, {j}, {k})");
    }
}

#[test]
fn test_run_is_deterministic() {
    let tmp = tempfile::tempdir().unwrap();
    let input = write_peaks(tmp.path());
    let mut outputs = Vec::new();
    for name in ["a", "b"] {
        let mut config = quiet_config(&input, &tmp.path().join(name));
        config.single_output_file = true;
        config.get_probabilities = true;
        Pipeline::new(&config, &RecordingRunner::default(), &FakeProvider::default())
            .run()
            .unwrap();
        outputs.push(read_volume(&tmp.path().join(name).join("bundle_segmentations.nii.gz")).unwrap());
    }
    assert_eq!(outputs[0].data, outputs[1].data);
    assert_eq!(outputs[0].channels(), 72);
}

#[test]
fn test_tom_single_file_is_unit_length_inside_bundles() {
    let tmp = tempfile::tempdir().unwrap();
    let input = write_peaks(tmp.path());
    let out = tmp.path().join("out");
    let mut config = quiet_config(&input, &out);
    config.output_type = OutputType::Tom;
    config.single_output_file = true;
    config.single_orientation = true;

    let summary = Pipeline::new(&config, &RecordingRunner::default(), &FakeProvider::default())
        .run()
        .unwrap();
    assert_eq!(summary.written, vec![out.join("bundle_TOMs.nii.gz")]);

    let toms = read_volume(&summary.written[0]).unwrap();
    assert_eq!(toms.channels(), 216);
    let inside: Vec<f32> = (0..3).map(|ch| toms.data[[10, 10, 9, ch]]).collect();
    let norm = inside.iter().map(|v| v * v).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-5, "norm {norm}");
    assert_eq!(toms.data[[0, 0, 0, 0]], 0.0);
}

#[test]
fn test_tracking_runs_tckgen_for_selected_bundles() {
    let tmp = tempfile::tempdir().unwrap();
    let input = write_peaks(tmp.path());
    let out = tmp.path().join("out");
    let mut config = quiet_config(&input, &out);
    config.single_orientation = true;
    config.keep_intermediate_files = true;
    config.tracking = Some(TrackingConfig {
        bundles: Some(vec!["CST_left".into(), "AF_right".into()]),
        ..TrackingConfig::default()
    });

    let runner = RecordingRunner::default();
    let models = FakeProvider::default();
    let summary = Pipeline::new(&config, &runner, &models).run().unwrap();

    assert_eq!(
        *models.loaded.borrow(),
        vec![OutputType::TractSegmentation, OutputType::EndingsSegmentation, OutputType::Tom]
    );
    assert_eq!(runner.programs(), vec!["tckgen", "tckgen"]);
    assert_eq!(
        summary.intermediate.tracks,
        vec![out.join("TOM_trackings/AF_right.tck"), out.join("TOM_trackings/CST_left.tck")]
    );
    assert!(out.join("TOM_trackings/CST_left.tck").exists());
    assert!(out.join("intermediate/tracking/CST_left_TOM.nii.gz").exists());
}

#[test]
fn test_raw_input_with_internal_mask_runs_csd() {
    let tmp = tempfile::tempdir().unwrap();
    let dwi = write_dwi(tmp.path());
    let out = tmp.path().join("out");
    let mut config = quiet_config(&dwi, &out);
    config.raw_diffusion_input = true;
    config.internal_brain_mask = true;
    config.bvals = Some(tmp.path().join("dwi.bvals"));
    config.bvecs = Some(tmp.path().join("dwi.bvecs"));
    config.single_orientation = true;
    config.output_type = OutputType::DmRegression;

    let runner = RecordingRunner::default();
    let summary = Pipeline::new(&config, &runner, &FakeProvider::default()).run().unwrap();

    assert_eq!(runner.programs(), vec!["dwi2response", "dwi2fod", "sh2peaks"]);
    let mask = summary.intermediate.brain_mask.clone().unwrap();
    assert_eq!(mask.file_name().unwrap(), "nodif_brain_mask.nii.gz");
    assert!(summary.intermediate.fod.is_some());

    let density = read_volume(&out.join("dm_regression/CST_left.nii.gz")).unwrap();
    assert!(density.data.iter().all(|&v| (0.0..=1.0).contains(&v)));
    assert_eq!(density.data[[10, 10, 10, 0]], 1.0);
}

#[test]
fn test_raw_input_without_mask_calls_bet() {
    let tmp = tempfile::tempdir().unwrap();
    let dwi = write_dwi(tmp.path());
    let mut config = quiet_config(&dwi, &tmp.path().join("out"));
    config.raw_diffusion_input = true;
    config.bvals = Some(tmp.path().join("dwi.bvals"));
    config.bvecs = Some(tmp.path().join("dwi.bvecs"));
    config.single_orientation = true;

    let runner = RecordingRunner::default();
    Pipeline::new(&config, &runner, &FakeProvider::default()).run().unwrap();
    assert_eq!(runner.programs()[..2], ["fslroi", "bet"]);
    let bet = runner.commands.borrow()[1].args_lossy();
    assert!(bet[0].ends_with("nodif"), "{bet:?}");
}

#[test]
fn test_missing_weights_stop_the_run_before_external_tools() {
    let tmp = tempfile::tempdir().unwrap();
    let dwi = write_dwi(tmp.path());
    let out = tmp.path().join("out");
    let mut config = quiet_config(&dwi, &out);
    config.raw_diffusion_input = true;
    config.bvals = Some(tmp.path().join("dwi.bvals"));
    config.bvecs = Some(tmp.path().join("dwi.bvecs"));

    let runner = RecordingRunner::default();
    let err = Pipeline::new(&config, &runner, &NoWeights).run().unwrap_err();
    assert!(matches!(err, Error::MissingWeights { .. }), "{err}");
    assert!(runner.programs().is_empty());
    assert!(!out.exists());
}

fn preprocess_config(dir: &std::path::Path) -> tractseg_core::config::PipelineConfig {
    let dwi = write_dwi(dir);
    let mut config = quiet_config(&dwi, &dir.join("out"));
    config.raw_diffusion_input = true;
    config.bvals = Some(dir.join("dwi.bvals"));
    config.bvecs = Some(dir.join("dwi.bvecs"));
    config.preprocess = true;
    config.mni_template = Some(write_mni_template(dir));
    config.single_orientation = true;
    config
}

fn flirt_calls(runner: &RecordingRunner) -> Vec<Vec<String>> {
    runner
        .commands
        .borrow()
        .iter()
        .filter(|c| c.program() == "flirt")
        .map(|c| c.args_lossy())
        .collect()
}

fn flag<'a>(args: &'a [String], name: &str) -> &'a str {
    let i = args.iter().position(|a| a == name).unwrap();
    &args[i + 1]
}

#[test]
fn test_registered_segmentation_returns_to_subject_grid() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = preprocess_config(tmp.path());
    config.keep_intermediate_files = true;
    let out = config.output_dir.clone();

    let runner = RecordingRunner::default();
    let summary = Pipeline::new(&config, &runner, &FakeProvider::default()).run().unwrap();

    assert_eq!(
        runner.programs(),
        vec![
            "fslroi", "bet", "dwi2response", "dwi2fod", "sh2peaks", "dtifit", "flirt",
            "convert_xfm", "flirt", "flirt",
        ]
    );
    let registration = summary.intermediate.registration.clone().unwrap();
    assert_eq!(registration.to_subject.file_name().unwrap(), "MNI_2_FA.mat");

    let flirts = flirt_calls(&runner);
    // FA to template, then peaks forward with spline, then the result back
    assert!(flirts[0].contains(&"-omat".to_string()));
    assert_eq!(flag(&flirts[1], "-interp"), "spline");
    assert_eq!(flag(&flirts[2], "-interp"), "nearestneighbour");
    assert!(flag(&flirts[2], "-ref").ends_with("dti_FA.nii.gz"));
    assert!(flag(&flirts[2], "-init").ends_with("MNI_2_FA.mat"));

    // the network saw rotated peaks on the template grid
    assert_eq!(summary.intermediate.peaks.file_name().unwrap(), "peaks_MNI.nii.gz");
    let registered = read_volume(&out.join("intermediate/peaks_MNI.nii.gz")).unwrap();
    assert_eq!(registered.affine, mni_affine());
    assert_eq!(registered.data[[10, 10, 10, 0]], -1.0);
    assert!(summary.mni_flips.is_empty());

    let dwi = read_volume(&config.input).unwrap();
    let cst = read_volume(&out.join("bundle_segmentations/CST_left.nii.gz")).unwrap();
    assert!(cst.check_same_grid(&dwi, ("CST_left", "DWI")).is_ok());
    assert_eq!(cst.data[[10, 10, 10, 0]], 1.0);
    assert_eq!(cst.data[[1, 1, 1, 0]], 0.0);
}

#[test]
fn test_registered_tom_is_rotated_back() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = preprocess_config(tmp.path());
    config.output_type = OutputType::Tom;
    config.single_output_file = true;

    let runner = RecordingRunner::default();
    let summary = Pipeline::new(&config, &runner, &FakeProvider::default()).run().unwrap();

    let flirts = flirt_calls(&runner);
    assert_eq!(flag(flirts.last().unwrap(), "-interp"), "trilinear");

    let toms = read_volume(&summary.written[0]).unwrap();
    let dwi = read_volume(&config.input).unwrap();
    assert!(toms.check_same_grid(&dwi, ("TOMs", "DWI")).is_ok());
    // the fake network points every TOM along (1, 1, 1); the half turn
    // about z maps it to (-1, -1, 1)
    let a = 1.0 / 3f32.sqrt();
    let v = [toms.data[[10, 10, 10, 0]], toms.data[[10, 10, 10, 1]], toms.data[[10, 10, 10, 2]]];
    for (got, want) in v.iter().zip([-a, -a, a]) {
        assert!((got - want).abs() < 1e-5, "{v:?}");
    }
}

#[test]
fn test_brain_mask_on_other_grid_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let input = write_peaks(tmp.path());
    let mask_path = tmp.path().join("mask.nii.gz");
    let mask = Volume::from_3d(
        ndarray::Array3::ones((10, 10, 10)),
        scaled_identity((1.25, 1.25, 1.25)),
        (1.25, 1.25, 1.25),
    );
    write_volume(&mask_path, &mask, DataType::Uint8).unwrap();

    let mut config = quiet_config(&input, &tmp.path().join("out"));
    config.brain_mask = Some(mask_path);
    let err = Pipeline::new(&config, &RecordingRunner::default(), &FakeProvider::default())
        .run()
        .unwrap_err();
    assert!(matches!(err, Error::GridMismatch { .. }), "{err}");
}

#[test]
fn test_input_without_nine_channels_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("fa.nii.gz");
    let fa = Volume::from_3d(
        ndarray::Array3::ones((8, 8, 8)),
        scaled_identity((1.0, 1.0, 1.0)),
        (1.0, 1.0, 1.0),
    );
    write_volume(&input, &fa, DataType::Float32).unwrap();

    let config = quiet_config(&input, &tmp.path().join("out"));
    let err = Pipeline::new(&config, &RecordingRunner::default(), &FakeProvider::default())
        .run()
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)), "{err}");
}

#[test]
fn test_missing_weights_are_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let input = write_peaks(tmp.path());
    let mut config = quiet_config(&input, &tmp.path().join("out"));
    config.model_dir = Some(tmp.path().join("no_weights_here"));

    let err = tractseg_core::pipeline::run(&config).unwrap_err();
    assert!(matches!(err, Error::MissingWeights { .. }), "{err}");
}
