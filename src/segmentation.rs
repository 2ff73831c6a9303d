//! Segmentation provider
//!
//! Wraps a person segmentation model behind a lazily loaded, shared handle.
//! The model is loaded at most once per process: concurrent first callers
//! share one load, and a failed load is remembered so later callers go
//! straight to the fallback without retrying.

use crate::{
    config::ModelLoadingConfig,
    error::{Result, VisionError},
    inference::{ModelBackend, SegmentationModel},
    provider::{with_timeout, FailurePolicy, LazyModel, ModelStatus},
    types::SegmentationMask,
};
use async_trait::async_trait;
use image::RgbaImage;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of asking the provider for a mask
#[derive(Debug, Clone)]
pub enum SegmentOutcome {
    /// Foreground confidences at the image's native resolution
    Mask(SegmentationMask),
    /// The model could not be loaded; callers should fall back
    Unavailable,
}

/// Shared, lazily loaded person segmentation
#[derive(Debug)]
pub struct SegmentationProvider {
    model: LazyModel<dyn SegmentationModel>,
    models: ModelLoadingConfig,
}

impl SegmentationProvider {
    pub fn new(backend: Arc<dyn ModelBackend<dyn SegmentationModel>>, models: ModelLoadingConfig) -> Self {
        Self {
            model: LazyModel::new("segmentation", backend, FailurePolicy::Sticky)
                .with_load_timeout(models.load_timeout),
            models,
        }
    }

    /// A provider with no model; every request reports `Unavailable`
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Arc::new(NoSegmentationModel), ModelLoadingConfig::default())
    }

    /// Segment the person in `image`
    ///
    /// The first call triggers the model load. Load failures are not errors
    /// here; they yield [`SegmentOutcome::Unavailable`].
    ///
    /// # Errors
    /// - Inference failures or timeouts of a successfully loaded model
    pub async fn segment(&self, image: &RgbaImage) -> Result<SegmentOutcome> {
        let model = match self.model.acquire().await {
            Ok(model) => model,
            Err(e) => {
                debug!(error = %e, "Segmentation unavailable");
                return Ok(SegmentOutcome::Unavailable);
            },
        };

        let mask = with_timeout(
            self.models.inference_timeout,
            "segmentation inference",
            model.segment(image),
        )
        .await?;

        let (width, height) = image.dimensions();
        if mask.dimensions() == (width, height) {
            Ok(SegmentOutcome::Mask(mask))
        } else {
            debug!(
                mask = ?mask.dimensions(),
                image = ?(width, height),
                "Resizing segmentation mask to image resolution"
            );
            Ok(SegmentOutcome::Mask(mask.resized(width, height)))
        }
    }

    /// Load the model now instead of on first use; returns whether it is ready
    pub async fn preload(&self) -> bool {
        let ready = self.model.acquire().await.is_ok();
        info!(ready, "Segmentation model preload finished");
        ready
    }

    #[must_use]
    pub fn status(&self) -> ModelStatus {
        self.model.status()
    }

    /// Number of model loads attempted so far (never more than one)
    #[must_use]
    pub fn load_attempts(&self) -> u32 {
        self.model.load_attempts()
    }
}

/// Backend used when no segmentation model is configured
#[derive(Debug, Clone, Copy)]
struct NoSegmentationModel;

#[async_trait]
impl ModelBackend<dyn SegmentationModel> for NoSegmentationModel {
    fn name(&self) -> &str {
        "none"
    }

    async fn load(&self) -> Result<Arc<dyn SegmentationModel>> {
        Err(VisionError::model_unavailable(
            "No segmentation model configured",
        ))
    }
}
