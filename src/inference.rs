//! Network inference
//!
//! The network is a 2D model applied slice by slice. A prediction for the
//! whole cube is assembled from slices along one axis; by default the
//! predictions along x, y and z are averaged.

use std::path::{Path, PathBuf};

use ndarray::{concatenate, Array4, ArrayView4, Axis, Zip};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use tracing::{debug, info, instrument};

use crate::config::ModelVariant;
use crate::error::{Error, Result};
use crate::orientation::SpatialAxis;
use crate::progress::StageProgress;

/// A 2D network over batches of slices
pub trait SegmentationModel {
    /// Run one batch
    ///
    /// `batch` is laid out as `(n, channels, h, w)`; the result as
    /// `(n, classes, h, w)`.
    fn predict(&mut self, batch: Array4<f32>) -> Result<Array4<f32>>;
}

/// Creates the models for a variant, one per weight part
pub trait ModelProvider {
    fn load(&self, variant: &ModelVariant) -> Result<Vec<Box<dyn SegmentationModel>>>;

    /// Edge length of the cube the loaded models expect
    fn input_size(&self, variant: &ModelVariant) -> usize {
        variant.input_size
    }
}

fn ort_error(e: impl std::fmt::Display) -> Error {
    Error::Inference(e.to_string())
}

/// ONNX Runtime session wrapping one exported network
pub struct OnnxModel {
    session: Session,
    path: PathBuf,
}

impl OnnxModel {
    pub fn load(path: &Path, threads: usize) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::MissingWeights {
                path: path.to_path_buf(),
            });
        }
        let session = Session::builder()
            .map_err(ort_error)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(ort_error)?
            .with_intra_threads(threads)
            .map_err(ort_error)?
            .commit_from_file(path)
            .map_err(ort_error)?;
        debug!(path = %path.display(), "loaded ONNX model");
        Ok(Self {
            session,
            path: path.to_path_buf(),
        })
    }
}

impl SegmentationModel for OnnxModel {
    fn predict(&mut self, batch: Array4<f32>) -> Result<Array4<f32>> {
        let (n, c, h, w) = batch.dim();
        let data: Vec<f32> = batch.iter().copied().collect();
        let tensor = Tensor::from_array(([n, c, h, w], data)).map_err(ort_error)?;

        let outputs = self.session.run(ort::inputs![tensor]).map_err(ort_error)?;
        let (shape, values) = outputs[0].try_extract_tensor::<f32>().map_err(ort_error)?;

        if shape.len() != 4 {
            return Err(Error::Inference(format!(
                "'{}' returned a {}D tensor, expected (n, classes, h, w)",
                self.path.display(),
                shape.len()
            )));
        }
        let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
        Array4::from_shape_vec((dims[0], dims[1], dims[2], dims[3]), values.to_vec())
            .map_err(|e| Error::Inference(format!("malformed output tensor: {e}")))
    }
}

/// Loads ONNX weights from a directory
pub struct OnnxProvider {
    pub weights_dir: PathBuf,
    pub threads: usize,
}

impl ModelProvider for OnnxProvider {
    fn load(&self, variant: &ModelVariant) -> Result<Vec<Box<dyn SegmentationModel>>> {
        variant
            .weight_paths(&self.weights_dir)
            .iter()
            .map(|path| {
                OnnxModel::load(path, self.threads).map(|m| Box::new(m) as Box<dyn SegmentationModel>)
            })
            .collect()
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Predict the whole cube from slices along `axis`
///
/// `input` is `(x, y, z, channels)`; the result is `(x, y, z, classes)`.
pub fn predict_volume(
    model: &mut dyn SegmentationModel,
    input: &Array4<f32>,
    axis: SpatialAxis,
    batch_size: usize,
    apply_sigmoid: bool,
    progress: &StageProgress,
) -> Result<Array4<f32>> {
    let a = axis.index();
    let n_slices = input.shape()[a];
    let batch_size = batch_size.max(1);
    let mut result: Option<Array4<f32>> = None;

    let mut start = 0;
    while start < n_slices {
        let end = (start + batch_size).min(n_slices);

        // (slice, h, w, c) -> (slice, c, h, w)
        let slab = input.slice_axis(Axis(a), (start..end).into());
        let batch = move_axis_first(slab, a)
            .permuted_axes([0, 3, 1, 2])
            .as_standard_layout()
            .to_owned();
        let (_, _, h, w) = batch.dim();

        let output = model.predict(batch)?;
        let (on, classes, oh, ow) = output.dim();
        if on != end - start || oh != h || ow != w {
            return Err(Error::Inference(format!(
                "model returned shape {:?} for a batch of {} slices of {}x{}",
                output.dim(),
                end - start,
                h,
                w
            )));
        }

        let full = result.get_or_insert_with(|| {
            let sh = input.shape();
            Array4::zeros((sh[0], sh[1], sh[2], classes))
        });
        if full.shape()[3] != classes {
            return Err(Error::Inference(format!(
                "class count changed between batches ({} vs {})",
                full.shape()[3],
                classes
            )));
        }

        // (slice, classes, h, w) -> (slice, h, w, classes), then back into place
        let output = output.permuted_axes([0, 2, 3, 1]);
        for (b, slice_pred) in output.outer_iter().enumerate() {
            full.index_axis_mut(Axis(a), start + b).assign(&slice_pred);
        }

        progress.advance(end - start);
        start = end;
    }

    let mut full = result.ok_or_else(|| Error::Inference("input has no slices".into()))?;
    if apply_sigmoid {
        full.mapv_inplace(sigmoid);
    }
    Ok(full)
}

/// View a 4D array with axis `a` moved to the front, keeping the other order
fn move_axis_first(view: ArrayView4<'_, f32>, a: usize) -> ArrayView4<'_, f32> {
    match a {
        0 => view,
        1 => view.permuted_axes([1, 0, 2, 3]),
        _ => view.permuted_axes([2, 0, 1, 3]),
    }
}

/// Average predictions along several slicing axes
///
/// With `channels_per_class > 1` every class is a direction without a fixed
/// sign, so each pass's vector is flipped onto the running sum before it is
/// added.
pub fn predict_all_orientations(
    model: &mut dyn SegmentationModel,
    input: &Array4<f32>,
    axes: &[SpatialAxis],
    batch_size: usize,
    apply_sigmoid: bool,
    channels_per_class: usize,
    progress: &StageProgress,
) -> Result<Array4<f32>> {
    let mut sum: Option<Array4<f32>> = None;
    for &axis in axes {
        debug!(%axis, "predicting slices");
        let pred = predict_volume(model, input, axis, batch_size, apply_sigmoid, progress)?;
        match sum.as_mut() {
            Some(acc) if channels_per_class > 1 => add_aligned(acc, &pred, channels_per_class)?,
            Some(acc) => *acc += &pred,
            None => sum = Some(pred),
        }
    }
    let mut mean = sum.ok_or_else(|| Error::Inference("no slicing axis selected".into()))?;
    mean /= axes.len() as f32;
    Ok(mean)
}

/// Add `pred` to `acc` group by group, negating groups that point against `acc`
fn add_aligned(acc: &mut Array4<f32>, pred: &Array4<f32>, group: usize) -> Result<()> {
    if acc.shape() != pred.shape() || acc.shape()[3] % group != 0 {
        return Err(Error::Inference(format!(
            "cannot fuse vector predictions of shape {:?} and {:?}",
            acc.shape(),
            pred.shape()
        )));
    }
    Zip::from(acc.lanes_mut(Axis(3)))
        .and(pred.lanes(Axis(3)))
        .for_each(|mut a, p| {
            for start in (0..a.len()).step_by(group) {
                let dot: f32 = (start..start + group).map(|c| a[c] * p[c]).sum();
                let sign = if dot < 0.0 { -1.0 } else { 1.0 };
                for c in start..start + group {
                    a[c] += sign * p[c];
                }
            }
        });
    Ok(())
}

/// A loaded variant: one model per weight part
pub struct Predictor {
    variant: ModelVariant,
    parts: Vec<Box<dyn SegmentationModel>>,
}

impl Predictor {
    pub fn new(variant: ModelVariant, parts: Vec<Box<dyn SegmentationModel>>) -> Result<Self> {
        if parts.len() != variant.weight_files.len() {
            return Err(Error::Inference(format!(
                "{} expects {} model parts, got {}",
                variant.experiment,
                variant.weight_files.len(),
                parts.len()
            )));
        }
        Ok(Self { variant, parts })
    }

    pub fn load(variant: ModelVariant, provider: &dyn ModelProvider) -> Result<Self> {
        let parts = provider.load(&variant)?;
        Self::new(variant, parts)
    }

    pub fn variant(&self) -> &ModelVariant {
        &self.variant
    }

    /// Predict all classes of the variant for a network-space cube
    #[instrument(skip_all, fields(output = %self.variant.output_type))]
    pub fn predict(
        &mut self,
        input: &Array4<f32>,
        single_orientation: bool,
        batch_size: usize,
        show_progress: bool,
    ) -> Result<Array4<f32>> {
        let channels = input.shape()[3];
        if channels != self.variant.input_channels {
            return Err(Error::InvalidInput(format!(
                "{} expects {} input channels, got {}",
                self.variant.experiment, self.variant.input_channels, channels
            )));
        }

        let axes: &[SpatialAxis] = if single_orientation {
            &[SpatialAxis::X]
        } else {
            &SpatialAxis::ALL
        };
        let slices_per_part: usize = axes.iter().map(|a| input.shape()[a.index()]).sum();
        let progress = StageProgress::slices(
            show_progress,
            self.variant.output_type.as_str(),
            slices_per_part * self.parts.len(),
        );

        let part_bundles = self.variant.part_bundles();
        let mut predictions = Vec::with_capacity(self.parts.len());
        for (model, bundles) in self.parts.iter_mut().zip(&part_bundles) {
            let pred = predict_all_orientations(
                model.as_mut(),
                input,
                axes,
                batch_size,
                self.variant.emits_logits,
                self.variant.channels_per_class,
                &progress,
            )?;
            let expected = self.variant.part_channels(bundles);
            if pred.shape()[3] != expected {
                return Err(Error::Inference(format!(
                    "{} part produced {} channels, expected {}",
                    self.variant.experiment,
                    pred.shape()[3],
                    expected
                )));
            }
            predictions.push(pred);
        }
        progress.finish();

        let views: Vec<_> = predictions.iter().map(|p| p.view()).collect();
        let merged = concatenate(Axis(3), &views)
            .map_err(|e| Error::Inference(format!("cannot merge model parts: {e}")))?;
        info!(
            experiment = self.variant.experiment,
            channels = merged.shape()[3],
            "inference done"
        );
        Ok(merged)
    }
}
