//! Turn raw network outputs into labeled volumes
//!
//! All functions work on network outputs laid out as `(x, y, z, channel)`.

use ndarray::{s, Array3, Array4, Axis, Zip};
use tracing::debug;

use crate::config::{ModelVariant, OutputType, DEFAULT_THRESHOLD};
use crate::error::{Error, Result};
use crate::utils::{close, label_components};

pub use crate::utils::{close as binary_closing, dilate as binary_dilation, erode as binary_erosion};

/// Lower thresholds for bundles that tend to fall apart into blobs
const BUNDLE_THRESHOLDS: [(&str, f32); 3] = [("CA", 0.3), ("FX_left", 0.4), ("FX_right", 0.4)];

/// Postprocessing parameters of a run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostprocessOptions {
    pub threshold: f32,
    pub blob_threshold: usize,
    pub hole_closing: usize,
    /// Remove small blobs and close holes
    pub postprocess: bool,
    pub bundle_specific: bool,
    /// Skip thresholding and return probabilities
    pub get_probabilities: bool,
}

/// Boolean mask of voxels above `threshold`
pub fn binarize(probs: &Array3<f32>, threshold: f32) -> Array3<bool> {
    probs.mapv(|p| p > threshold)
}

/// Drop 6-connected components with at most `min_size` voxels
pub fn remove_small_blobs(mask: &Array3<bool>, min_size: usize) -> Array3<bool> {
    let (labels, sizes) = label_components(mask);
    labels.mapv(|l| l != 0 && sizes[l as usize - 1] > min_size)
}

fn to_channel(mask: &Array3<bool>) -> Array3<f32> {
    mask.mapv(|m| if m { 1.0 } else { 0.0 })
}

/// Threshold, remove small blobs and optionally close holes in every class
pub fn postprocess_segmentations(
    probs: &Array4<f32>,
    threshold: f32,
    blob_threshold: usize,
    hole_closing: usize,
) -> Array4<f32> {
    let mut seg = Array4::zeros(probs.raw_dim());
    for (mut out, prob) in seg
        .axis_iter_mut(Axis(3))
        .zip(probs.axis_iter(Axis(3)))
    {
        let mut mask = binarize(&prob.to_owned(), threshold);
        if hole_closing > 0 {
            mask = close(&mask, hole_closing);
        }
        mask = remove_small_blobs(&mask, blob_threshold);
        out.assign(&to_channel(&mask));
    }
    seg
}

/// Threshold to use for `bundle` given its probability map
///
/// CA and the fornices often break into several pieces at the default
/// threshold; when they do, a lower one reconnects them. Only pieces with
/// more than `min_blob_size` voxels count.
fn bundle_threshold(bundle: &str, probs: &Array3<f32>, default: f32, min_blob_size: usize) -> f32 {
    let Some(&(_, low)) = BUNDLE_THRESHOLDS.iter().find(|(name, _)| *name == bundle) else {
        return default;
    };
    let (_, sizes) = label_components(&binarize(probs, DEFAULT_THRESHOLD));
    let blobs = sizes.iter().filter(|&&size| size > min_blob_size).count();
    if blobs > 1 {
        debug!(bundle, threshold = low, blobs, "bundle split up, lowering threshold");
        low
    } else {
        default
    }
}

/// Threshold each bundle with its own threshold
///
/// Bundles without a special threshold use `default`. Components of at most
/// `min_blob_size` voxels are ignored when deciding whether a bundle split.
pub fn bundle_specific_postprocessing(
    probs: &Array4<f32>,
    bundles: &[&str],
    default: f32,
    min_blob_size: usize,
) -> Result<Array4<f32>> {
    if probs.shape()[3] != bundles.len() {
        return Err(Error::InvalidInput(format!(
            "{} probability channels for {} bundles",
            probs.shape()[3],
            bundles.len()
        )));
    }
    let mut seg = Array4::zeros(probs.raw_dim());
    for ((mut out, prob), bundle) in seg
        .axis_iter_mut(Axis(3))
        .zip(probs.axis_iter(Axis(3)))
        .zip(bundles)
    {
        let prob = prob.to_owned();
        let thr = bundle_threshold(bundle, &prob, default, min_blob_size);
        out.assign(&to_channel(&binarize(&prob, thr)));
    }
    Ok(seg)
}

/// Mask TOM vectors by the bundle segmentation and scale to unit length
///
/// `tom` holds three channels per bundle; `seg` (one channel per bundle)
/// is optional. Zero vectors stay zero.
pub fn postprocess_tom(tom: &Array4<f32>, seg: Option<&Array4<f32>>) -> Result<Array4<f32>> {
    let channels = tom.shape()[3];
    if channels % 3 != 0 {
        return Err(Error::InvalidInput(format!(
            "TOM has {channels} channels, not a multiple of 3"
        )));
    }
    if let Some(seg) = seg {
        if seg.shape()[..3] != tom.shape()[..3] || seg.shape()[3] * 3 != channels {
            return Err(Error::InvalidInput(format!(
                "segmentation shape {:?} does not fit TOM shape {:?}",
                seg.shape(),
                tom.shape()
            )));
        }
    }

    let mut out = tom.clone();
    for b in 0..channels / 3 {
        let mut vecs = out.slice_mut(s![.., .., .., 3 * b..3 * b + 3]);
        Zip::indexed(vecs.lanes_mut(Axis(3))).for_each(|(i, j, k), mut v| {
            let inside = seg.map_or(true, |s| s[[i, j, k, b]] > 0.5);
            let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            if !inside || norm < 1e-8 {
                v.fill(0.0);
            } else {
                v.mapv_inplace(|x| x / norm);
            }
        });
    }
    Ok(out)
}

/// Clip density maps to `[0, 1]`
pub fn postprocess_density(dm: &Array4<f32>) -> Array4<f32> {
    dm.mapv(|v| v.clamp(0.0, 1.0))
}

/// Apply the postprocessing that belongs to the variant's output type
///
/// `seg` is the final tract segmentation of the same run, used to mask TOMs.
pub fn postprocess_output(
    variant: &ModelVariant,
    prediction: &Array4<f32>,
    seg: Option<&Array4<f32>>,
    opts: &PostprocessOptions,
) -> Result<Array4<f32>> {
    match variant.output_type {
        OutputType::TractSegmentation => {
            if opts.get_probabilities {
                return Ok(prediction.clone());
            }
            let mut out = if opts.bundle_specific {
                let min_blob_size = if opts.postprocess { opts.blob_threshold } else { 0 };
                bundle_specific_postprocessing(prediction, &variant.bundles, opts.threshold, min_blob_size)?
            } else {
                prediction.mapv(|p| if p > opts.threshold { 1.0 } else { 0.0 })
            };
            if opts.postprocess {
                out = postprocess_segmentations(&out, 0.5, opts.blob_threshold, opts.hole_closing);
            }
            Ok(out)
        }
        OutputType::EndingsSegmentation => {
            if opts.get_probabilities {
                return Ok(prediction.clone());
            }
            Ok(prediction.mapv(|p| if p > opts.threshold { 1.0 } else { 0.0 }))
        }
        OutputType::Tom => postprocess_tom(prediction, seg),
        OutputType::DmRegression => Ok(postprocess_density(prediction)),
    }
}

/// Zero everything outside `mask` in every channel
pub fn apply_mask(data: &mut Array4<f32>, mask: &Array3<bool>) {
    for mut channel in data.axis_iter_mut(Axis(3)) {
        Zip::from(&mut channel).and(mask).for_each(|v, &m| {
            if !m {
                *v = 0.0;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TractDefinition;

    fn two_blobs(n: usize, big: f32, small: f32) -> Array3<f32> {
        Array3::from_shape_fn((n, n, n), |(i, j, k)| {
            if i < 4 && j < 4 && k < 4 {
                big
            } else if i == n - 1 && j == n - 1 && k == n - 1 {
                small
            } else {
                0.0
            }
        })
    }

    #[test]
    fn test_binarize_is_strict() {
        let probs = Array3::from_shape_vec((3, 1, 1), vec![0.5, 0.51, 0.2]).unwrap();
        let mask = binarize(&probs, 0.5);
        assert_eq!(mask.iter().copied().collect::<Vec<_>>(), vec![false, true, false]);
    }

    #[test]
    fn test_remove_small_blobs_keeps_larger_than_min() {
        let mask = binarize(&two_blobs(10, 1.0, 1.0), 0.5);
        let cleaned = remove_small_blobs(&mask, 1);
        assert!(!cleaned[[9, 9, 9]]);
        assert_eq!(cleaned.iter().filter(|&&m| m).count(), 64);

        // a component of exactly min_size voxels is removed too
        let cleaned = remove_small_blobs(&mask, 64);
        assert!(cleaned.iter().all(|&m| !m));
    }

    #[test]
    fn test_postprocess_segmentations() {
        let mut probs = Array4::zeros((10, 10, 10, 2));
        probs.index_axis_mut(Axis(3), 0).assign(&two_blobs(10, 0.9, 0.9));
        let seg = postprocess_segmentations(&probs, 0.5, 50, 0);
        assert_eq!(seg.index_axis(Axis(3), 0).sum(), 64.0);
        assert_eq!(seg[[9, 9, 9, 0]], 0.0);
        assert_eq!(seg.index_axis(Axis(3), 1).sum(), 0.0);
    }

    #[test]
    fn test_bundle_specific_lowers_threshold_for_split_bundle() {
        // CA: two blobs above 0.5 joined by a bridge at 0.35
        let probs3 = Array3::from_shape_fn((9, 3, 3), |(i, _, _)| match i {
            0..=2 | 6..=8 => 0.9,
            _ => 0.35,
        });
        let mut probs = Array4::zeros((9, 3, 3, 2));
        probs.index_axis_mut(Axis(3), 0).assign(&probs3);
        probs.index_axis_mut(Axis(3), 1).assign(&probs3);

        let seg = bundle_specific_postprocessing(&probs, &["CA", "CST_left"], 0.5, 0).unwrap();
        // CA bridged at 0.3, CST_left stays at 0.5
        assert_eq!(seg.index_axis(Axis(3), 0).sum(), 81.0);
        assert_eq!(seg.index_axis(Axis(3), 1).sum(), 54.0);
    }

    #[test]
    fn test_bundle_specific_keeps_default_for_single_blob() {
        let probs3 = Array3::from_shape_fn((5, 1, 1), |(i, _, _)| if i == 2 { 0.9 } else { 0.35 });
        let probs = probs3.insert_axis(Axis(3));
        let seg = bundle_specific_postprocessing(&probs, &["FX_left"], 0.5, 0).unwrap();
        assert_eq!(seg.sum(), 1.0);
    }

    #[test]
    fn test_small_blob_does_not_count_as_split() {
        // one large CA blob plus a small noisy slab, with a halo at 0.35
        let probs3 = Array3::from_shape_fn((10, 3, 3), |(i, _, _)| match i {
            0..=3 => 0.9,
            9 => 0.9,
            _ => 0.35,
        });
        let probs = probs3.insert_axis(Axis(3));

        let seg = bundle_specific_postprocessing(&probs, &["CA"], 0.5, 10).unwrap();
        assert_eq!(seg.sum(), 36.0 + 9.0);

        // without a size floor the slab lowers the threshold
        let seg = bundle_specific_postprocessing(&probs, &["CA"], 0.5, 0).unwrap();
        assert_eq!(seg.sum(), 90.0);
    }

    #[test]
    fn test_bundle_specific_checks_channel_count() {
        let probs = Array4::zeros((2, 2, 2, 3));
        assert!(bundle_specific_postprocessing(&probs, &["CA"], 0.5, 0).is_err());
    }

    #[test]
    fn test_postprocess_tom_normalizes_and_masks() {
        let mut tom = Array4::zeros((2, 1, 1, 3));
        tom[[0, 0, 0, 0]] = 3.0;
        tom[[0, 0, 0, 1]] = 4.0;
        tom[[1, 0, 0, 2]] = 2.0;
        let mut seg = Array4::zeros((2, 1, 1, 1));
        seg[[0, 0, 0, 0]] = 1.0;

        let out = postprocess_tom(&tom, Some(&seg)).unwrap();
        assert!((out[[0, 0, 0, 0]] - 0.6).abs() < 1e-6);
        assert!((out[[0, 0, 0, 1]] - 0.8).abs() < 1e-6);
        assert_eq!(out[[1, 0, 0, 2]], 0.0);

        let unmasked = postprocess_tom(&tom, None).unwrap();
        assert_eq!(unmasked[[1, 0, 0, 2]], 1.0);
    }

    #[test]
    fn test_postprocess_tom_rejects_bad_channels() {
        assert!(postprocess_tom(&Array4::zeros((1, 1, 1, 4)), None).is_err());
        let seg = Array4::zeros((1, 1, 1, 2));
        assert!(postprocess_tom(&Array4::zeros((1, 1, 1, 3)), Some(&seg)).is_err());
    }

    #[test]
    fn test_postprocess_density_clips() {
        let dm = Array4::from_shape_vec((3, 1, 1, 1), vec![-0.2, 0.4, 1.7]).unwrap();
        let out = postprocess_density(&dm);
        assert_eq!(out.iter().copied().collect::<Vec<_>>(), vec![0.0, 0.4, 1.0]);
    }

    #[test]
    fn test_get_probabilities_passes_through() {
        let variant = ModelVariant::pretrained(OutputType::EndingsSegmentation, TractDefinition::TractQuerierPlus).unwrap();
        let probs = Array4::from_elem((2, 2, 2, 144), 0.7);
        let opts = PostprocessOptions {
            threshold: 0.5,
            blob_threshold: 50,
            hole_closing: 0,
            postprocess: true,
            bundle_specific: true,
            get_probabilities: true,
        };
        assert_eq!(postprocess_output(&variant, &probs, None, &opts).unwrap(), probs);

        let binary = postprocess_output(&variant, &probs, None, &PostprocessOptions { get_probabilities: false, ..opts }).unwrap();
        assert!(binary.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_apply_mask() {
        let mut data = Array4::from_elem((2, 1, 1, 2), 1.0);
        let mask = Array3::from_shape_vec((2, 1, 1), vec![true, false]).unwrap();
        apply_mask(&mut data, &mask);
        assert_eq!(data.sum(), 2.0);
        assert_eq!(data[[1, 0, 0, 1]], 0.0);
    }
}
