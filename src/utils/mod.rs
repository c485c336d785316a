//! Shared voxel utilities
//!
//! - `mask`: morphology and connected components on binary masks
//! - `threshold`: Otsu's automatic threshold

pub mod mask;
pub mod threshold;

pub use mask::{close, dilate, erode, fill_holes, label_components, largest_component};
pub use threshold::otsu_threshold;
