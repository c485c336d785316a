//! TractSeg-Core: white matter bundle segmentation from diffusion MRI
//!
//! This crate segments anatomical fiber bundles from fiber orientation
//! peaks with a pretrained 2D network, and optionally tracks each bundle.
//!
//! # Modules
//! - `nifti_io`: NIfTI reading and writing
//! - `volume`: Voxel data with its affine
//! - `bundles`: Bundle lists and class naming
//! - `config`: Model variants and run configuration
//! - `orientation`: MNI axis order and peak sign checks
//! - `preprocessing`: Cropping, padding and resampling for the network
//! - `inference`: Slice-wise prediction with ONNX Runtime
//! - `postprocess`: Thresholding, blob removal, TOM normalization
//! - `external`: FSL and MRtrix invocations, internal brain mask
//! - `registration`: Rigid registration to MNI space and back
//! - `tracking`: Bundle-specific tractography
//! - `output`: Output file layout
//! - `pipeline`: Stage orchestration
//! - `cli`: Command-line arguments

// Core modules
pub mod error;
pub mod volume;
pub mod utils;

// I/O modules
pub mod nifti_io;
pub mod output;
pub mod progress;

// Model and run configuration
pub mod bundles;
pub mod config;

// Algorithm modules
pub mod orientation;
pub mod preprocessing;
pub mod inference;
pub mod postprocess;

// External tools
pub mod external;
pub mod registration;
pub mod tracking;

// Orchestration
pub mod pipeline;
pub mod cli;

pub use error::{Error, Result};
pub use volume::Volume;
