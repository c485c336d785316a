//! Saving network outputs
//!
//! By default every bundle gets its own file in a directory named after
//! the output type. With `--single_output_file` all bundles go into one
//! 4D file.

use std::ops::Range;
use std::path::{Path, PathBuf};

use ndarray::s;
use tracing::{debug, info};

use crate::config::{ModelVariant, OutputType};
use crate::error::{Error, Result};
use crate::nifti_io::{write_volume, DataType};
use crate::progress::StageProgress;
use crate::volume::Volume;

/// Directory receiving `.tck` files
pub const TRACKING_DIR: &str = "TOM_trackings";

/// Directory of per-bundle files for `output_type`
pub fn output_subdir(output_type: OutputType) -> &'static str {
    match output_type {
        OutputType::TractSegmentation => "bundle_segmentations",
        OutputType::EndingsSegmentation => "endings_segmentations",
        OutputType::Tom => "TOM",
        OutputType::DmRegression => "dm_regression",
    }
}

/// File name used with `--single_output_file`
pub fn single_file_name(output_type: OutputType) -> &'static str {
    match output_type {
        OutputType::TractSegmentation => "bundle_segmentations.nii.gz",
        OutputType::EndingsSegmentation => "bundle_endings.nii.gz",
        OutputType::Tom => "bundle_TOMs.nii.gz",
        OutputType::DmRegression => "bundle_densities.nii.gz",
    }
}

/// Binary masks are stored as bytes, everything else as floats
pub fn output_dtype(output_type: OutputType, get_probabilities: bool) -> DataType {
    if output_type.is_segmentation() && !get_probabilities {
        DataType::Uint8
    } else {
        DataType::Float32
    }
}

/// One file to write and the channels it holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    pub path: PathBuf,
    pub channels: Range<usize>,
}

/// Files an output of `variant` is split into
pub fn plan_files(variant: &ModelVariant, output_dir: &Path, single_file: bool) -> Vec<OutputFile> {
    let output_type = variant.output_type;
    if single_file {
        return vec![OutputFile {
            path: output_dir.join(single_file_name(output_type)),
            channels: 0..variant.output_channels(),
        }];
    }

    let dir = output_dir.join(output_subdir(output_type));
    let per_class = variant.channels_per_class;
    variant
        .class_names()
        .into_iter()
        .enumerate()
        .map(|(i, name)| OutputFile {
            path: dir.join(format!("{name}.nii.gz")),
            channels: i * per_class..(i + 1) * per_class,
        })
        .collect()
}

/// Write a postprocessed output
///
/// # Arguments
/// * `volume` - All channels of the output on the subject grid
/// * `variant` - Variant that produced it (class names, channels per class)
/// * `output_dir` - Run output directory
/// * `single_file` - One 4D file instead of one file per class
/// * `dtype` - On-disk data type
/// * `show_progress` - Draw a progress bar
///
/// # Returns
/// The written files, in class order
pub fn save_output(
    volume: &Volume,
    variant: &ModelVariant,
    output_dir: &Path,
    single_file: bool,
    dtype: DataType,
    show_progress: bool,
) -> Result<Vec<PathBuf>> {
    let expected = variant.output_channels();
    if volume.channels() != expected {
        return Err(Error::InvalidInput(format!(
            "{} output has {} channels, expected {}",
            variant.output_type,
            volume.channels(),
            expected
        )));
    }

    let files = plan_files(variant, output_dir, single_file);
    if let Some(parent) = files.first().and_then(|f| f.path.parent()) {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }

    let progress = StageProgress::bundles(show_progress, "saving", files.len());
    let mut written = Vec::with_capacity(files.len());
    for file in files {
        let data = volume
            .data
            .slice(s![.., .., .., file.channels.clone()])
            .to_owned();
        write_volume(&file.path, &volume.with_data(data), dtype)?;
        debug!(path = %file.path.display(), "wrote");
        written.push(file.path);
        progress.advance(1);
    }
    progress.finish();

    info!(
        output = %variant.output_type,
        files = written.len(),
        dir = %output_dir.display(),
        "saved output"
    );
    Ok(written)
}
