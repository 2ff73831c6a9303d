//! Model abstractions for segmentation and pose estimation
//!
//! Concrete models are opaque: anything that turns an image into a foreground
//! mask, or into named keypoints, can sit behind these traits. How a model is
//! obtained (bundled file, download, remote service) is the business of its
//! [`ModelBackend`].
//!
//! Inference is awaited under the configured timeout, which can only fire at
//! an `.await`. Models doing heavy CPU work should move it off the async
//! worker, e.g. with `tokio::task::spawn_blocking`.

use crate::{
    error::Result,
    types::{Pose, SegmentationMask},
};
use async_trait::async_trait;
use image::RgbaImage;
use std::sync::Arc;

/// Person segmentation model
#[async_trait]
pub trait SegmentationModel: Send + Sync {
    /// Short model name used in logs
    fn name(&self) -> &str;

    /// Produce a foreground confidence mask at the image's native resolution
    ///
    /// # Errors
    /// - Tensor conversion failures
    /// - Model inference failures
    async fn segment(&self, image: &RgbaImage) -> Result<SegmentationMask>;
}

/// Pose estimation model
#[async_trait]
pub trait PoseModel: Send + Sync {
    fn name(&self) -> &str;

    /// Detect poses in the image, most confident first
    ///
    /// Successive calls on the same image may return different keypoints.
    ///
    /// # Errors
    /// - Tensor conversion failures
    /// - Model inference failures
    async fn estimate_poses(&self, image: &RgbaImage) -> Result<Vec<Pose>>;

    /// Release any resources held by the model
    fn dispose(&self) {}
}

/// Loads a model of type `M`
///
/// Implementations are invoked at most once per load attempt by
/// [`LazyModel`](crate::provider::LazyModel); they do not cache.
#[async_trait]
pub trait ModelBackend<M: ?Sized + Send + Sync>: Send + Sync {
    /// Short backend description used in logs
    fn name(&self) -> &str;

    /// Load and initialize the model
    ///
    /// # Errors
    /// - Model file missing or download failure
    /// - Model parsing or initialization failure
    async fn load(&self) -> Result<Arc<M>>;
}
