//! Model backend implementations
//!
//! - Tract backend (pure Rust ONNX inference, no external dependencies)
//!
//! Other inference engines plug in by implementing
//! [`ModelBackend`](crate::inference::ModelBackend) for the segmentation or
//! pose model trait.

#[cfg(feature = "tract")]
pub mod tract;

// Test utilities for model-dependent testing
#[cfg(test)]
pub mod test_utils;

#[cfg(feature = "tract")]
pub use self::tract::{
    PoseInputType, PoseModelConfig, SegmentationModelConfig, TensorLayout, TractPoseBackend,
    TractSegmentationBackend,
};
