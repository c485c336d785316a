//! Command-line interface

use std::path::{Path, PathBuf};

use clap::Parser;

use crate::config::{
    CsdType, OutputType, PipelineConfig, TrackingAlgorithm, TrackingConfig, TractDefinition,
    DEFAULT_BATCH_SIZE, DEFAULT_NR_FIBERS, DEFAULT_THRESHOLD, DEFAULT_TRACKING_DILATION,
};
use crate::error::Result;

#[derive(Parser, Debug)]
#[command(name = "tractseg")]
#[command(
    author,
    version,
    about = "Segment white matter bundles from diffusion MRI peaks"
)]
/// Command-line arguments of a segmentation run
#[allow(clippy::struct_excessive_bools)]
pub struct Cli {
    /// Peaks image (9 channels), or a raw DWI with --raw_diffusion_input
    #[arg(short, long, value_name = "FILE")]
    pub input: PathBuf,

    /// Output directory (default: directory of the input)
    #[arg(short, long = "output_dir", value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// What to predict
    #[arg(long = "output_type", value_enum, default_value_t = OutputType::TractSegmentation)]
    pub output_type: OutputType,

    /// Bundle definition the model was trained on
    #[arg(long = "tract_definition", value_enum, default_value_t = TractDefinition::TractQuerierPlus)]
    pub tract_definition: TractDefinition,

    /// Input is a raw DWI; compute peaks with MRtrix first
    #[arg(long = "raw_diffusion_input")]
    pub raw_diffusion_input: bool,

    /// b-values (default: <input>.bvals)
    #[arg(long)]
    pub bvals: Option<PathBuf>,

    /// b-vectors (default: <input>.bvecs)
    #[arg(long)]
    pub bvecs: Option<PathBuf>,

    /// Brain mask; computed with FSL bet when omitted
    #[arg(long = "brain_mask")]
    pub brain_mask: Option<PathBuf>,

    /// Compute the brain mask without FSL
    #[arg(long = "internal_brain_mask")]
    pub internal_brain_mask: bool,

    /// Constrained spherical deconvolution variant
    #[arg(long = "csd_type", value_enum, default_value_t = CsdType::CsdMsmt)]
    pub csd_type: CsdType,

    /// T1 image, needed by csd_msmt_5tt
    #[arg(long = "t1")]
    pub t1: Option<PathBuf>,

    /// Rigidly register to MNI space before inference
    #[arg(long)]
    pub preprocess: bool,

    /// MNI FA template used with --preprocess
    #[arg(long = "mni_template")]
    pub mni_template: Option<PathBuf>,

    /// Write one 4D file instead of one file per bundle
    #[arg(long = "single_output_file")]
    pub single_output_file: bool,

    /// Write probabilities instead of binary masks
    #[arg(long = "get_probabilities")]
    pub get_probabilities: bool,

    /// Probability threshold for binary masks
    #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
    pub threshold: f32,

    /// Keep small blobs
    #[arg(long = "no_postprocess")]
    pub no_postprocess: bool,

    /// Use the same threshold for every bundle
    #[arg(long = "no_bundle_specific_postprocessing")]
    pub no_bundle_specific_postprocessing: bool,

    /// Predict along x only instead of averaging x, y and z
    #[arg(long = "single_orientation")]
    pub single_orientation: bool,

    /// Skip the peak orientation check
    #[arg(long = "no_orientation_check")]
    pub no_orientation_check: bool,

    /// Directory with the ONNX weights
    #[arg(long = "model_dir")]
    pub model_dir: Option<PathBuf>,

    /// Slices per inference batch
    #[arg(long = "batch_size", default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Threads for inference and MRtrix (default: all cores)
    #[arg(long = "nr_cpus")]
    pub nr_cpus: Option<usize>,

    /// Copy intermediate files to <output_dir>/intermediate
    #[arg(long = "keep_intermediate_files")]
    pub keep_intermediate_files: bool,

    /// Run bundle-specific tractography after segmentation
    #[arg(long)]
    pub track: bool,

    /// Tracking algorithm
    #[arg(long = "tracking_algorithm", value_enum, default_value_t = TrackingAlgorithm::Fact)]
    pub tracking_algorithm: TrackingAlgorithm,

    /// Streamlines per bundle
    #[arg(long = "nr_fibers", default_value_t = DEFAULT_NR_FIBERS)]
    pub nr_fibers: usize,

    /// Dilation of tracking masks in voxels
    #[arg(long = "tracking_dilation", default_value_t = DEFAULT_TRACKING_DILATION)]
    pub tracking_dilation: usize,

    /// Comma-separated bundles to track (default: all)
    #[arg(long, value_delimiter = ',')]
    pub bundles: Option<Vec<String>>,

    /// Only print warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Print debug output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub const fn should_show_progress(&self) -> bool {
        !self.quiet
    }

    /// Default log filter when `RUST_LOG` is unset
    pub const fn log_level(&self) -> &'static str {
        if self.quiet {
            "warn"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        }
    }

    /// Build and validate the run configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the flags describe a run that cannot work
    pub fn into_config(self) -> Result<PipelineConfig> {
        let output_dir = self.output_dir.clone().unwrap_or_else(|| {
            self.input
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default()
                .join("tractseg_output")
        });

        let show_progress = self.should_show_progress();
        let mut config = PipelineConfig::new(self.input.clone(), output_dir);
        config.output_type = self.output_type;
        config.tract_definition = self.tract_definition;
        config.raw_diffusion_input = self.raw_diffusion_input;
        if self.raw_diffusion_input {
            config.bvals = Some(self.bvals.unwrap_or_else(|| sibling(&self.input, "bvals")));
            config.bvecs = Some(self.bvecs.unwrap_or_else(|| sibling(&self.input, "bvecs")));
        } else {
            config.bvals = self.bvals;
            config.bvecs = self.bvecs;
        }
        config.brain_mask = self.brain_mask;
        config.internal_brain_mask = self.internal_brain_mask;
        config.csd_type = self.csd_type;
        config.t1 = self.t1;
        config.preprocess = self.preprocess;
        config.mni_template = self.mni_template;
        config.single_output_file = self.single_output_file;
        config.get_probabilities = self.get_probabilities;
        config.threshold = self.threshold;
        config.postprocess = !self.no_postprocess;
        config.bundle_specific_postprocessing = !self.no_bundle_specific_postprocessing;
        config.single_orientation = self.single_orientation;
        config.orientation_check = !self.no_orientation_check;
        config.model_dir = self.model_dir;
        config.batch_size = self.batch_size;
        if let Some(n) = self.nr_cpus {
            config.nr_cpus = n;
        }
        config.keep_intermediate_files = self.keep_intermediate_files;
        config.show_progress = show_progress;
        config.tracking = self.track.then(|| TrackingConfig {
            algorithm: self.tracking_algorithm,
            nr_fibers: self.nr_fibers,
            dilation: self.tracking_dilation,
            bundles: self.bundles,
            ..TrackingConfig::default()
        });

        config.validate()?;
        Ok(config)
    }
}

/// `<dir>/<stem>.<ext>` next to a `.nii` or `.nii.gz` file
fn sibling(input: &Path, ext: &str) -> PathBuf {
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name
        .strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))
        .unwrap_or(&name);
    input.with_file_name(format!("{stem}.{ext}"))
}
