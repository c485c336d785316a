//! Model variants and run configuration
//!
//! A [`ModelVariant`] describes one pretrained network: which classes it
//! predicts, what input it expects and where its weights live.
//! [`PipelineConfig`] collects every parameter of a single run.

use std::fmt;
use std::path::{Path, PathBuf};

use clap::ValueEnum;

use crate::bundles::{endings_classes, tom_parts, TRACTSEG_BUNDLES, XTRACT_BUNDLES};
use crate::error::{Error, Result};

/// Number of channels in a peaks image (three peaks, xyz each)
pub const PEAK_CHANNELS: usize = 9;

/// Edge length of the cube the network sees
pub const INPUT_SIZE: usize = 144;

/// Probability above which a voxel belongs to a bundle
pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// Components with at most this many voxels are removed
pub const DEFAULT_BLOB_THRESHOLD: usize = 50;

/// Slices per inference batch
pub const DEFAULT_BATCH_SIZE: usize = 47;

/// Streamlines selected per bundle
pub const DEFAULT_NR_FIBERS: usize = 2000;

/// Dilation (in voxels) applied to tracking masks
pub const DEFAULT_TRACKING_DILATION: usize = 1;

/// Streamline length limits in mm
pub const DEFAULT_MIN_LENGTH: f32 = 40.0;
pub const DEFAULT_MAX_LENGTH: f32 = 250.0;

/// Environment variable overriding the weights directory
pub const WEIGHTS_DIR_ENV: &str = "TRACTSEG_WEIGHTS_DIR";

/// What the network predicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum OutputType {
    /// Binary segmentation per bundle
    #[value(name = "tract_segmentation")]
    TractSegmentation,
    /// Start and end regions per bundle
    #[value(name = "endings_segmentation")]
    EndingsSegmentation,
    /// Tract orientation maps (one direction per voxel and bundle)
    #[value(name = "TOM")]
    Tom,
    /// Tract density maps
    #[value(name = "dm_regression")]
    DmRegression,
}

impl OutputType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TractSegmentation => "tract_segmentation",
            Self::EndingsSegmentation => "endings_segmentation",
            Self::Tom => "TOM",
            Self::DmRegression => "dm_regression",
        }
    }

    /// Whether thresholded outputs are binary masks
    pub fn is_segmentation(self) -> bool {
        matches!(self, Self::TractSegmentation | Self::EndingsSegmentation)
    }
}

impl fmt::Display for OutputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which anatomical definition the bundles follow
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TractDefinition {
    #[value(name = "TractQuerier+")]
    TractQuerierPlus,
    #[value(name = "xtract")]
    Xtract,
}

impl TractDefinition {
    pub fn bundles(self) -> &'static [&'static str] {
        match self {
            Self::TractQuerierPlus => &TRACTSEG_BUNDLES,
            Self::Xtract => &XTRACT_BUNDLES,
        }
    }
}

/// Constrained spherical deconvolution flavour used for raw input
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CsdType {
    /// Single-shell single-tissue CSD
    #[value(name = "csd")]
    Csd,
    /// Multi-shell multi-tissue CSD with dhollander response
    #[value(name = "csd_msmt")]
    CsdMsmt,
    /// Multi-shell multi-tissue CSD with a 5TT image from a T1
    #[value(name = "csd_msmt_5tt")]
    CsdMsmt5tt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TrackingAlgorithm {
    /// Deterministic tracking on the TOM peaks
    #[value(name = "FACT")]
    Fact,
    /// Probabilistic tracking on the CSD FODs
    #[value(name = "prob")]
    Prob,
}

/// A pretrained network and the conventions of its input and output
#[derive(Debug, Clone, PartialEq)]
pub struct ModelVariant {
    pub experiment: &'static str,
    pub output_type: OutputType,
    pub tract_definition: TractDefinition,
    pub input_channels: usize,
    pub input_size: usize,
    pub resolution: &'static str,
    pub bundles: Vec<&'static str>,
    /// One file per model part, relative to the weights directory
    pub weight_files: Vec<String>,
    /// Raw network outputs go through a sigmoid
    pub emits_logits: bool,
    /// Inputs are z-scored inside the brain before inference
    pub normalize_input: bool,
    /// Output channels per class (3 for TOM vectors)
    pub channels_per_class: usize,
}

impl ModelVariant {
    /// Resolve the shipped variant for an output type and tract definition
    pub fn pretrained(output_type: OutputType, definition: TractDefinition) -> Result<Self> {
        if definition == TractDefinition::Xtract && output_type != OutputType::TractSegmentation {
            return Err(Error::Config(format!(
                "the xtract definition only supports tract_segmentation, not {output_type}"
            )));
        }

        let bundles = definition.bundles().to_vec();
        let base = Self {
            experiment: "",
            output_type,
            tract_definition: definition,
            input_channels: PEAK_CHANNELS,
            input_size: INPUT_SIZE,
            resolution: "1.25mm",
            bundles,
            weight_files: Vec::new(),
            emits_logits: true,
            normalize_input: false,
            channels_per_class: 1,
        };

        let variant = match (output_type, definition) {
            (OutputType::TractSegmentation, TractDefinition::TractQuerierPlus) => Self {
                experiment: "TractSeg_PeakRot4",
                weight_files: vec!["pretrained_weights_tract_segmentation_v3.onnx".into()],
                ..base
            },
            (OutputType::TractSegmentation, TractDefinition::Xtract) => Self {
                experiment: "TractSeg_All_xtract_PeakRot4",
                weight_files: vec!["pretrained_weights_tract_segmentation_xtract_v1.onnx".into()],
                ..base
            },
            (OutputType::EndingsSegmentation, _) => Self {
                experiment: "EndingsSeg_PeakRot4",
                weight_files: vec!["pretrained_weights_endings_segmentation_v4.onnx".into()],
                ..base
            },
            (OutputType::Tom, _) => {
                let parts = tom_parts(&base.bundles).len();
                Self {
                    experiment: "Peaks20_12g90g270g_125mm",
                    weight_files: (1..=parts)
                        .map(|p| format!("pretrained_weights_peak_regression_part{p}_v2.onnx"))
                        .collect(),
                    emits_logits: false,
                    channels_per_class: 3,
                    ..base
                }
            }
            (OutputType::DmRegression, _) => Self {
                experiment: "DmReg",
                weight_files: vec!["pretrained_weights_dm_regression_v2.onnx".into()],
                emits_logits: false,
                ..base
            },
        };

        Ok(variant)
    }

    /// Output class names, one per class (not per channel)
    pub fn class_names(&self) -> Vec<String> {
        match self.output_type {
            OutputType::EndingsSegmentation => endings_classes(&self.bundles),
            _ => self.bundles.iter().map(|b| b.to_string()).collect(),
        }
    }

    /// Output channels of the full (all parts) prediction
    pub fn output_channels(&self) -> usize {
        self.class_names().len() * self.channels_per_class
    }

    /// Bundles predicted by each model part
    pub fn part_bundles(&self) -> Vec<Vec<&'static str>> {
        if self.weight_files.len() > 1 {
            tom_parts(&self.bundles)
        } else {
            vec![self.bundles.clone()]
        }
    }

    /// Output channels produced by the part with `bundles`
    pub fn part_channels(&self, bundles: &[&str]) -> usize {
        let classes = match self.output_type {
            OutputType::EndingsSegmentation => bundles.len() * 2,
            _ => bundles.len(),
        };
        classes * self.channels_per_class
    }

    pub fn weight_paths(&self, weights_dir: &Path) -> Vec<PathBuf> {
        self.weight_files.iter().map(|f| weights_dir.join(f)).collect()
    }
}

/// Extract `weights_dir=<path>` from the contents of `~/.tractseg/config.txt`
pub fn parse_weights_dir(config_text: &str) -> Option<PathBuf> {
    config_text
        .lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .find(|(key, _)| key.trim() == "weights_dir")
        .map(|(_, value)| PathBuf::from(value.trim()))
        .filter(|p| !p.as_os_str().is_empty())
}

/// Directory holding the pretrained weights
///
/// Lookup order: explicit path, `TRACTSEG_WEIGHTS_DIR`, `weights_dir=` in
/// `~/.tractseg/config.txt`, then `~/.tractseg`.
pub fn resolve_weights_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    if let Some(dir) = std::env::var_os(WEIGHTS_DIR_ENV) {
        return PathBuf::from(dir);
    }

    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    let default_dir = home.join(".tractseg");

    std::fs::read_to_string(default_dir.join("config.txt"))
        .ok()
        .and_then(|text| parse_weights_dir(&text))
        .unwrap_or(default_dir)
}

/// Fiber tracking parameters
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingConfig {
    pub algorithm: TrackingAlgorithm,
    pub nr_fibers: usize,
    /// Dilation of segmentation and endings masks, in voxels
    pub dilation: usize,
    pub min_length: f32,
    pub max_length: f32,
    /// Restrict tracking to these bundles (all when `None`)
    pub bundles: Option<Vec<String>>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            algorithm: TrackingAlgorithm::Fact,
            nr_fibers: DEFAULT_NR_FIBERS,
            dilation: DEFAULT_TRACKING_DILATION,
            min_length: DEFAULT_MIN_LENGTH,
            max_length: DEFAULT_MAX_LENGTH,
            bundles: None,
        }
    }
}

/// Every parameter of one segmentation run
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Peaks image, or the raw DWI when `raw_diffusion_input` is set
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub output_type: OutputType,
    pub tract_definition: TractDefinition,

    pub raw_diffusion_input: bool,
    pub bvals: Option<PathBuf>,
    pub bvecs: Option<PathBuf>,
    pub brain_mask: Option<PathBuf>,
    /// Build the brain mask in-process instead of calling FSL bet
    pub internal_brain_mask: bool,
    pub csd_type: CsdType,
    pub t1: Option<PathBuf>,

    /// Rigidly register to MNI space before inference
    pub preprocess: bool,
    pub mni_template: Option<PathBuf>,

    pub single_output_file: bool,
    pub get_probabilities: bool,
    pub threshold: f32,
    pub blob_threshold: usize,
    /// Radius of the closing applied to segmentations (0 disables)
    pub hole_closing: usize,
    pub postprocess: bool,
    pub bundle_specific_postprocessing: bool,

    pub single_orientation: bool,
    pub orientation_check: bool,

    pub model_dir: Option<PathBuf>,
    pub batch_size: usize,
    pub nr_cpus: usize,
    pub keep_intermediate_files: bool,
    pub show_progress: bool,

    pub tracking: Option<TrackingConfig>,
}

impl PipelineConfig {
    /// Configuration with defaults for everything but the paths
    pub fn new(input: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output_dir: output_dir.into(),
            output_type: OutputType::TractSegmentation,
            tract_definition: TractDefinition::TractQuerierPlus,
            raw_diffusion_input: false,
            bvals: None,
            bvecs: None,
            brain_mask: None,
            internal_brain_mask: false,
            csd_type: CsdType::CsdMsmt,
            t1: None,
            preprocess: false,
            mni_template: None,
            single_output_file: false,
            get_probabilities: false,
            threshold: DEFAULT_THRESHOLD,
            blob_threshold: DEFAULT_BLOB_THRESHOLD,
            hole_closing: 0,
            postprocess: true,
            bundle_specific_postprocessing: true,
            single_orientation: false,
            orientation_check: true,
            model_dir: None,
            batch_size: DEFAULT_BATCH_SIZE,
            nr_cpus: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            keep_intermediate_files: false,
            show_progress: true,
            tracking: None,
        }
    }

    /// Reject combinations that cannot run
    pub fn validate(&self) -> Result<()> {
        if !(self.threshold > 0.0 && self.threshold < 1.0) {
            return Err(Error::Config(format!(
                "threshold must lie in (0, 1), got {}",
                self.threshold
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch size must be at least 1".into()));
        }
        if self.nr_cpus == 0 {
            return Err(Error::Config("nr_cpus must be at least 1".into()));
        }

        if self.raw_diffusion_input {
            if self.bvals.is_none() || self.bvecs.is_none() {
                return Err(Error::Config(
                    "raw diffusion input needs both bvals and bvecs".into(),
                ));
            }
            if self.csd_type == CsdType::CsdMsmt5tt && self.t1.is_none() {
                return Err(Error::Config("csd_msmt_5tt needs a T1 image".into()));
            }
        }

        if self.preprocess {
            if !self.raw_diffusion_input {
                return Err(Error::Config(
                    "registration to MNI computes FA and needs raw diffusion input".into(),
                ));
            }
            if self.mni_template.is_none() {
                return Err(Error::Config("registration to MNI needs --mni_template".into()));
            }
        }

        for output in self.required_outputs() {
            ModelVariant::pretrained(output, self.tract_definition)?;
        }

        if let Some(tracking) = &self.tracking {
            if tracking.algorithm == TrackingAlgorithm::Prob && !self.raw_diffusion_input {
                return Err(Error::Config(
                    "probabilistic tracking needs FODs, which exist only with raw diffusion input"
                        .into(),
                ));
            }
            if tracking.min_length >= tracking.max_length {
                return Err(Error::Config(format!(
                    "tracking min length {} must be below max length {}",
                    tracking.min_length, tracking.max_length
                )));
            }
            if tracking.nr_fibers == 0 {
                return Err(Error::Config("nr_fibers must be at least 1".into()));
            }
        }

        Ok(())
    }

    /// Network outputs this run has to compute, in execution order
    ///
    /// Tracking needs segmentations, endings and TOMs regardless of the
    /// requested output type.
    pub fn required_outputs(&self) -> Vec<OutputType> {
        if self.tracking.is_none() {
            return vec![self.output_type];
        }
        let mut outputs = vec![
            OutputType::TractSegmentation,
            OutputType::EndingsSegmentation,
            OutputType::Tom,
        ];
        if !outputs.contains(&self.output_type) {
            outputs.push(self.output_type);
        }
        outputs
    }
}
