//! Common test utilities for tractseg-core integration tests

#![allow(dead_code)]

use std::cell::RefCell;
use std::path::{Path, PathBuf};

use ndarray::Array4;

use tractseg_core::config::{ModelVariant, OutputType, PipelineConfig};
use tractseg_core::external::{CommandRunner, ToolCommand, ToolOutput};
use tractseg_core::inference::{ModelProvider, SegmentationModel};
use tractseg_core::nifti_io::{read_volume, write_volume, DataType};
use tractseg_core::volume::{scaled_identity, Volume};
use tractseg_core::{Error, Result};

/// Grid of the synthetic subjects
pub const DIMS: (usize, usize, usize) = (20, 22, 18);

/// Brain box `[lo, hi)` on every axis
pub const BRAIN: (usize, usize) = (6, 14);

/// Network cube used by the fake models
pub const FAKE_INPUT_SIZE: usize = 16;

/// Registration matrix the fake `flirt` and `convert_xfm` write:
/// 180 degrees about z, its own inverse
pub const HALF_TURN_Z: &str = "-1 0 0 0\n0 -1 0 0\n0 0 1 0\n0 0 0 1\n";

/// Affine of the fake MNI template, same dimensions as the subject
pub fn mni_affine() -> [f64; 16] {
    [
        -1.25, 0.0, 0.0, 90.0, //
        0.0, 1.25, 0.0, -126.0, //
        0.0, 0.0, 1.25, -72.0, //
        0.0, 0.0, 0.0, 1.0,
    ]
}

/// Write an FA template on the MNI grid; returns its path
pub fn write_mni_template(dir: &Path) -> PathBuf {
    let path = dir.join("MNI_FA_template.nii.gz");
    let template = Volume::from_3d(ndarray::Array3::from_elem(DIMS, 0.5), mni_affine(), (1.25, 1.25, 1.25));
    write_volume(&path, &template, DataType::Float32).unwrap();
    path
}

pub fn in_brain(i: usize, j: usize, k: usize) -> bool {
    let (lo, hi) = BRAIN;
    (lo..hi).contains(&i) && (lo..hi).contains(&j) && (lo..hi).contains(&k)
}

pub fn brain_voxels() -> usize {
    (BRAIN.1 - BRAIN.0).pow(3)
}

/// Peaks with a single x-oriented fiber population inside the brain box
pub fn synthetic_peaks() -> Volume {
    let (nx, ny, nz) = DIMS;
    let data = Array4::from_shape_fn((nx, ny, nz, 9), |(i, j, k, c)| {
        if in_brain(i, j, k) && c == 0 {
            1.0
        } else {
            0.0
        }
    });
    Volume::new(data, scaled_identity((1.25, 1.25, 1.25)), (1.25, 1.25, 1.25))
}

/// DWI with two b0 volumes that are bright inside the brain box
pub fn synthetic_dwi() -> Volume {
    let (nx, ny, nz) = DIMS;
    let data = Array4::from_shape_fn((nx, ny, nz, 4), |(i, j, k, v)| {
        match (in_brain(i, j, k), v) {
            (true, 0) | (true, 3) => 1000.0,
            (true, _) => 400.0,
            (false, _) => 10.0,
        }
    });
    Volume::new(data, scaled_identity((1.25, 1.25, 1.25)), (1.25, 1.25, 1.25))
}

/// Write peaks to `<dir>/peaks.nii.gz`
pub fn write_peaks(dir: &Path) -> PathBuf {
    let path = dir.join("peaks.nii.gz");
    write_volume(&path, &synthetic_peaks(), DataType::Float32).unwrap();
    path
}

/// Write a DWI with bvals and bvecs next to it; returns the DWI path
pub fn write_dwi(dir: &Path) -> PathBuf {
    let path = dir.join("dwi.nii.gz");
    write_volume(&path, &synthetic_dwi(), DataType::Float32).unwrap();
    std::fs::write(dir.join("dwi.bvals"), "0 1000 1000 0\n").unwrap();
    std::fs::write(
        dir.join("dwi.bvecs"),
        "0 1 0 0\n0 0 1 0\n0 0 0 0\n",
    )
    .unwrap();
    path
}

/// Configuration without progress bars for a peaks input
pub fn quiet_config(input: &Path, output_dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::new(input, output_dir);
    config.show_progress = false;
    config.nr_cpus = 1;
    config.batch_size = 5;
    config
}

/// Deterministic stand-in for a network
///
/// Every class predicts a large value where the first input channel is
/// set and a large negative value elsewhere.
pub struct FakeModel {
    pub classes: usize,
}

impl SegmentationModel for FakeModel {
    fn predict(&mut self, batch: Array4<f32>) -> Result<Array4<f32>> {
        let (n, _, h, w) = batch.dim();
        Ok(Array4::from_shape_fn((n, self.classes, h, w), |(b, _, y, x)| {
            if batch[[b, 0, y, x]].abs() > 0.5 {
                4.0
            } else {
                -4.0
            }
        }))
    }
}

/// Hands out [`FakeModel`]s and records which outputs were requested
#[derive(Default)]
pub struct FakeProvider {
    pub loaded: RefCell<Vec<OutputType>>,
}

impl ModelProvider for FakeProvider {
    fn load(&self, variant: &ModelVariant) -> Result<Vec<Box<dyn SegmentationModel>>> {
        self.loaded.borrow_mut().push(variant.output_type);
        Ok(variant
            .part_bundles()
            .iter()
            .map(|bundles| {
                Box::new(FakeModel {
                    classes: variant.part_channels(bundles),
                }) as Box<dyn SegmentationModel>
            })
            .collect())
    }

    fn input_size(&self, _variant: &ModelVariant) -> usize {
        FAKE_INPUT_SIZE
    }
}

/// Provider for an installation without weight files
pub struct NoWeights;

impl ModelProvider for NoWeights {
    fn load(&self, variant: &ModelVariant) -> Result<Vec<Box<dyn SegmentationModel>>> {
        Err(Error::MissingWeights {
            path: PathBuf::from("/weights").join(&variant.weight_files[0]),
        })
    }
}

fn flag_path(cmd: &ToolCommand, flag: &str) -> PathBuf {
    PathBuf::from(cmd.flag_value(flag).unwrap())
}

/// Records commands and fakes the files the real tools would write
///
/// `bet` writes the brain box as mask, `sh2peaks` writes
/// [`synthetic_peaks`], `tckgen` writes an empty track file. `dtifit`
/// writes an FA map on the DWI grid, `flirt` copies the input voxels onto
/// the reference grid and, like `convert_xfm`, writes [`HALF_TURN_Z`].
#[derive(Default)]
pub struct RecordingRunner {
    pub commands: RefCell<Vec<ToolCommand>>,
}

impl RecordingRunner {
    pub fn programs(&self) -> Vec<String> {
        self.commands
            .borrow()
            .iter()
            .map(|c| c.program().to_string())
            .collect()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, cmd: &ToolCommand) -> Result<ToolOutput> {
        self.commands.borrow_mut().push(cmd.clone());
        let args = cmd.get_args();
        match cmd.program() {
            "bet" => {
                let prefix = PathBuf::from(&args[1]);
                let path = prefix.with_file_name("nodif_brain_mask.nii.gz");
                let peaks = synthetic_peaks();
                let mask = peaks.channel(0).mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
                let volume = Volume::from_3d(mask, peaks.affine, peaks.voxel_size);
                write_volume(&path, &volume, DataType::Uint8)?;
            }
            "sh2peaks" => {
                write_volume(Path::new(&args[1]), &synthetic_peaks(), DataType::Float32)?;
            }
            "dtifit" => {
                let dwi = read_volume(&flag_path(cmd, "-k"))?;
                let fa = Volume::from_3d(dwi.channel(0).mapv(|v| v / 2000.0), dwi.affine, dwi.voxel_size);
                let prefix = flag_path(cmd, "-o");
                let path = PathBuf::from(format!("{}_FA.nii.gz", prefix.display()));
                write_volume(&path, &fa, DataType::Float32)?;
            }
            "flirt" => {
                if let Some(omat) = cmd.flag_value("-omat") {
                    std::fs::write(omat, HALF_TURN_Z).map_err(|e| Error::io(omat, e))?;
                }
                let input = read_volume(&flag_path(cmd, "-in"))?;
                let reference = read_volume(&flag_path(cmd, "-ref"))?;
                let moved = Volume::new(input.data, reference.affine, reference.voxel_size);
                write_volume(&flag_path(cmd, "-out"), &moved, DataType::Float32)?;
            }
            "convert_xfm" => {
                let omat = flag_path(cmd, "-omat");
                std::fs::write(&omat, HALF_TURN_Z).map_err(|e| Error::io(&omat, e))?;
            }
            "tckgen" => {
                std::fs::write(&args[3], b"").map_err(|e| tractseg_core::Error::io(&args[3], e))?;
            }
            _ => {}
        }
        Ok(ToolOutput::default())
    }
}
