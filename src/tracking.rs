//! Bundle-specific fiber tracking with MRtrix `tckgen`
//!
//! Every bundle is tracked separately. The segmentation is the seed region
//! and the tracking mask; both endings regions must be traversed.

use std::path::{Path, PathBuf};

use ndarray::{s, Array3};
use tracing::{info, instrument, warn};

use crate::bundles::bundle_index;
use crate::config::{TrackingAlgorithm, TrackingConfig};
use crate::error::{Error, Result};
use crate::external::{CommandRunner, ToolCommand};
use crate::nifti_io::{write_volume, DataType};
use crate::progress::StageProgress;
use crate::utils::dilate;
use crate::volume::Volume;

/// Seeds drawn per selected streamline
const SEEDS_PER_FIBER: usize = 1000;

/// FOD amplitude / TOM length below which tracking stops
const CUTOFF: &str = "0.05";

/// Postprocessed network outputs on the subject grid
pub struct TrackingInputs<'a> {
    /// One channel per bundle
    pub segmentations: &'a Volume,
    /// Two channels per bundle, begin then end
    pub endings: &'a Volume,
    /// Three channels per bundle
    pub toms: &'a Volume,
    pub bundles: &'a [&'static str],
    /// White-matter FODs, needed for probabilistic tracking
    pub fod: Option<&'a Path>,
}

/// Per-bundle files handed to `tckgen`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleTrackingFiles {
    pub source: PathBuf,
    pub seed: PathBuf,
    pub begin: PathBuf,
    pub end: PathBuf,
    pub output: PathBuf,
}

/// Bundles to track, in bundle-list order
pub fn select_bundles(
    all: &[&'static str],
    requested: Option<&[String]>,
) -> Result<Vec<&'static str>> {
    let Some(requested) = requested else {
        return Ok(all.to_vec());
    };
    if let Some(unknown) = requested.iter().find(|r| bundle_index(all, r).is_none()) {
        return Err(Error::Config(format!("unknown bundle '{unknown}'")));
    }
    Ok(all
        .iter()
        .copied()
        .filter(|b| requested.iter().any(|r| r == b))
        .collect())
}

/// Build the `tckgen` call for one bundle
pub fn tckgen_command(
    files: &BundleTrackingFiles,
    config: &TrackingConfig,
    nthreads: usize,
) -> ToolCommand {
    let algorithm = match config.algorithm {
        TrackingAlgorithm::Fact => "FACT",
        TrackingAlgorithm::Prob => "iFOD2",
    };
    ToolCommand::new("tckgen")
        .args(["-algorithm", algorithm])
        .arg(&files.source)
        .arg(&files.output)
        .arg("-seed_image")
        .arg(&files.seed)
        .arg("-mask")
        .arg(&files.seed)
        .arg("-include")
        .arg(&files.begin)
        .arg("-include")
        .arg(&files.end)
        .arg("-minlength")
        .arg(config.min_length.to_string())
        .arg("-maxlength")
        .arg(config.max_length.to_string())
        .arg("-select")
        .arg(config.nr_fibers.to_string())
        .arg("-seeds")
        .arg((config.nr_fibers * SEEDS_PER_FIBER).to_string())
        .args(["-cutoff", CUTOFF])
        .arg("-force")
        .nthreads(nthreads)
}

fn binary_channel(volume: &Volume, c: usize, dilation: usize) -> Array3<bool> {
    dilate(&volume.channel(c).mapv(|v| v > 0.5), dilation)
}

fn write_mask(path: &Path, mask: &Array3<bool>, like: &Volume) -> Result<()> {
    let data = mask.mapv(|m| if m { 1.0 } else { 0.0 });
    write_volume(
        path,
        &Volume::from_3d(data, like.affine, like.voxel_size),
        DataType::Uint8,
    )
}

/// Track every selected bundle
///
/// Masks and per-bundle TOMs are written to `scratch_dir`; streamlines go
/// to `<output_dir>/<bundle>.tck`. Bundles with an empty segmentation or
/// empty endings are skipped. Returns the written `.tck` files.
#[instrument(skip_all, fields(algorithm = ?config.algorithm))]
pub fn track_bundles(
    runner: &dyn CommandRunner,
    inputs: &TrackingInputs<'_>,
    config: &TrackingConfig,
    nthreads: usize,
    scratch_dir: &Path,
    output_dir: &Path,
    show_progress: bool,
) -> Result<Vec<PathBuf>> {
    let n = inputs.bundles.len();
    if inputs.segmentations.channels() != n
        || inputs.endings.channels() != 2 * n
        || inputs.toms.channels() != 3 * n
    {
        return Err(Error::InvalidInput(format!(
            "tracking needs {} segmentation, {} endings and {} TOM channels, got {}, {} and {}",
            n,
            2 * n,
            3 * n,
            inputs.segmentations.channels(),
            inputs.endings.channels(),
            inputs.toms.channels()
        )));
    }
    inputs
        .segmentations
        .check_same_grid(inputs.toms, ("segmentation", "TOM"))?;
    inputs
        .segmentations
        .check_same_grid(inputs.endings, ("segmentation", "endings"))?;

    let fod = match config.algorithm {
        TrackingAlgorithm::Prob => Some(inputs.fod.ok_or_else(|| {
            Error::Config("probabilistic tracking needs the FOD image".into())
        })?),
        TrackingAlgorithm::Fact => None,
    };

    let selected = select_bundles(inputs.bundles, config.bundles.as_deref())?;
    runner.ensure_available("tckgen")?;
    std::fs::create_dir_all(scratch_dir).map_err(|e| Error::io(scratch_dir, e))?;
    std::fs::create_dir_all(output_dir).map_err(|e| Error::io(output_dir, e))?;

    let progress = StageProgress::bundles(show_progress, "tracking", selected.len());
    let mut written = Vec::with_capacity(selected.len());

    for bundle in selected {
        progress.set_message(bundle);
        // selected bundles come from inputs.bundles
        let idx = bundle_index(inputs.bundles, bundle).unwrap_or_default();

        let seed = binary_channel(inputs.segmentations, idx, config.dilation);
        let begin = binary_channel(inputs.endings, 2 * idx, config.dilation);
        let end = binary_channel(inputs.endings, 2 * idx + 1, config.dilation);
        if !seed.iter().any(|&m| m) || !begin.iter().any(|&m| m) || !end.iter().any(|&m| m) {
            warn!(bundle, "empty segmentation or endings, skipping");
            progress.advance(1);
            continue;
        }

        let files = BundleTrackingFiles {
            source: match fod {
                Some(fod) => fod.to_path_buf(),
                None => scratch_dir.join(format!("{bundle}_TOM.nii.gz")),
            },
            seed: scratch_dir.join(format!("{bundle}.nii.gz")),
            begin: scratch_dir.join(format!("{bundle}_b.nii.gz")),
            end: scratch_dir.join(format!("{bundle}_e.nii.gz")),
            output: output_dir.join(format!("{bundle}.tck")),
        };

        write_mask(&files.seed, &seed, inputs.segmentations)?;
        write_mask(&files.begin, &begin, inputs.segmentations)?;
        write_mask(&files.end, &end, inputs.segmentations)?;
        if fod.is_none() {
            let tom = inputs
                .toms
                .data
                .slice(s![.., .., .., 3 * idx..3 * idx + 3])
                .to_owned();
            write_volume(&files.source, &inputs.toms.with_data(tom), DataType::Float32)?;
        }

        runner.run(&tckgen_command(&files, config, nthreads))?;
        written.push(files.output);
        progress.advance(1);
    }
    progress.finish();

    info!(bundles = written.len(), "tracking done");
    Ok(written)
}
