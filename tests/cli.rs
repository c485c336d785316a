//! Tests for command-line parsing and conversion into a run configuration

use std::path::PathBuf;

use clap::Parser;
use tractseg_core::cli::Cli;
use tractseg_core::config::{
    CsdType, OutputType, TrackingAlgorithm, TractDefinition, DEFAULT_BATCH_SIZE,
    DEFAULT_NR_FIBERS, DEFAULT_THRESHOLD,
};
use tractseg_core::Error;

// Only the input is required; everything else has a default
#[test]
fn test_cli_parse_minimal_args() {
    let cli = Cli::parse_from(["tractseg", "-i", "peaks.nii.gz"]);

    assert_eq!(cli.input, PathBuf::from("peaks.nii.gz"));
    assert_eq!(cli.output_type, OutputType::TractSegmentation);
    assert_eq!(cli.tract_definition, TractDefinition::TractQuerierPlus);
    assert_eq!(cli.csd_type, CsdType::CsdMsmt);
    assert_eq!(cli.threshold, DEFAULT_THRESHOLD);
    assert_eq!(cli.batch_size, DEFAULT_BATCH_SIZE);
    assert_eq!(cli.nr_fibers, DEFAULT_NR_FIBERS);
    assert!(cli.should_show_progress());
}

#[test]
fn test_minimal_config_defaults() {
    let config = Cli::parse_from(["tractseg", "-i", "/data/sub-01/peaks.nii.gz"])
        .into_config()
        .unwrap();

    assert_eq!(config.output_dir, PathBuf::from("/data/sub-01/tractseg_output"));
    assert!(config.postprocess);
    assert!(config.bundle_specific_postprocessing);
    assert!(config.orientation_check);
    assert!(config.tracking.is_none());
    assert!(config.bvals.is_none());
}

// Flag names keep their underscores
#[test]
fn test_cli_parse_underscore_flags() {
    let config = Cli::parse_from([
        "tractseg",
        "-i",
        "peaks.nii.gz",
        "-o",
        "out",
        "--output_type",
        "endings_segmentation",
        "--single_output_file",
        "--get_probabilities",
        "--no_postprocess",
        "--no_bundle_specific_postprocessing",
        "--single_orientation",
        "--no_orientation_check",
        "--batch_size",
        "10",
        "--nr_cpus",
        "3",
        "--keep_intermediate_files",
        "--model_dir",
        "/weights",
        "-q",
    ])
    .into_config()
    .unwrap();

    assert_eq!(config.output_dir, PathBuf::from("out"));
    assert_eq!(config.output_type, OutputType::EndingsSegmentation);
    assert!(config.single_output_file);
    assert!(config.get_probabilities);
    assert!(!config.postprocess);
    assert!(!config.bundle_specific_postprocessing);
    assert!(config.single_orientation);
    assert!(!config.orientation_check);
    assert_eq!(config.batch_size, 10);
    assert_eq!(config.nr_cpus, 3);
    assert!(config.keep_intermediate_files);
    assert_eq!(config.model_dir, Some(PathBuf::from("/weights")));
    assert!(!config.show_progress);
}

#[test]
fn test_raw_input_defaults_gradient_files() {
    let config = Cli::parse_from([
        "tractseg",
        "-i",
        "/data/dwi.nii.gz",
        "--raw_diffusion_input",
        "--csd_type",
        "csd",
    ])
    .into_config()
    .unwrap();

    assert_eq!(config.bvals, Some(PathBuf::from("/data/dwi.bvals")));
    assert_eq!(config.bvecs, Some(PathBuf::from("/data/dwi.bvecs")));
    assert_eq!(config.csd_type, CsdType::Csd);
}

#[test]
fn test_tracking_flags() {
    let config = Cli::parse_from([
        "tractseg",
        "-i",
        "dwi.nii.gz",
        "--raw_diffusion_input",
        "--track",
        "--tracking_algorithm",
        "prob",
        "--nr_fibers",
        "500",
        "--tracking_dilation",
        "2",
        "--bundles",
        "CST_left,CST_right",
    ])
    .into_config()
    .unwrap();

    let tracking = config.tracking.unwrap();
    assert_eq!(tracking.algorithm, TrackingAlgorithm::Prob);
    assert_eq!(tracking.nr_fibers, 500);
    assert_eq!(tracking.dilation, 2);
    assert_eq!(
        tracking.bundles,
        Some(vec!["CST_left".to_string(), "CST_right".to_string()])
    );
}

#[test]
fn test_invalid_combinations_are_rejected() {
    // probabilistic tracking without FODs
    let err = Cli::parse_from(["tractseg", "-i", "peaks.nii.gz", "--track", "--tracking_algorithm", "prob"])
        .into_config()
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));

    // xtract has no TOM model
    let err = Cli::parse_from([
        "tractseg",
        "-i",
        "peaks.nii.gz",
        "--tract_definition",
        "xtract",
        "--output_type",
        "TOM",
    ])
    .into_config()
    .unwrap_err();
    assert!(matches!(err, Error::Config(_)));

    let err = Cli::parse_from(["tractseg", "-i", "peaks.nii.gz", "--threshold", "1.5"])
        .into_config()
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn test_unknown_values_fail_to_parse() {
    assert!(Cli::try_parse_from(["tractseg", "-i", "p.nii.gz", "--output_type", "bogus"]).is_err());
    assert!(Cli::try_parse_from(["tractseg"]).is_err());
}
