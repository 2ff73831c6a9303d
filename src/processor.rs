//! Unified image analysis processor
//!
//! `VisionProcessor` wires the segmentation provider, background remover,
//! crop engine, optimizer and foot validator together around one shared
//! configuration. Every component shares the same model handles, so a model
//! is loaded once no matter which entry point triggers it.

use crate::{
    background::BackgroundRemover,
    config::VisionConfig,
    cropping::CropEngine,
    error::{Result, VisionError},
    feet::FootValidator,
    inference::{ModelBackend, PoseModel, SegmentationModel},
    pipeline::ImageOptimizer,
    segmentation::SegmentationProvider,
    types::{CropResult, OptimizedImage, RemovedBackground, ValidationVerdict},
};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Builder for [`VisionProcessor`]
#[derive(Default)]
pub struct VisionProcessorBuilder {
    config: VisionConfig,
    segmentation: Option<Arc<dyn ModelBackend<dyn SegmentationModel>>>,
    pose: Option<Arc<dyn ModelBackend<dyn PoseModel>>>,
}

impl VisionProcessorBuilder {
    #[must_use]
    pub fn config(mut self, config: VisionConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn segmentation_backend(mut self, backend: Arc<dyn ModelBackend<dyn SegmentationModel>>) -> Self {
        self.segmentation = Some(backend);
        self
    }

    #[must_use]
    pub fn pose_backend(mut self, backend: Arc<dyn ModelBackend<dyn PoseModel>>) -> Self {
        self.pose = Some(backend);
        self
    }

    /// Segment with a Tract ONNX model
    #[cfg(feature = "tract")]
    #[must_use]
    pub fn segmentation_model(
        self,
        source: crate::models::ModelSource,
        model_config: crate::backends::SegmentationModelConfig,
    ) -> Self {
        self.segmentation_backend(Arc::new(crate::backends::TractSegmentationBackend::new(
            source,
            model_config,
        )))
    }

    /// Estimate poses with a Tract ONNX model
    #[cfg(feature = "tract")]
    #[must_use]
    pub fn pose_model(
        self,
        source: crate::models::ModelSource,
        model_config: crate::backends::PoseModelConfig,
    ) -> Self {
        self.pose_backend(Arc::new(crate::backends::TractPoseBackend::new(
            source,
            model_config,
        )))
    }

    /// Validate the configuration and assemble the processor
    ///
    /// Without a segmentation backend, background removal always uses the
    /// chroma-key fallback. Without a pose backend, foot validation is
    /// unavailable.
    ///
    /// # Errors
    /// - `InvalidConfig` if the configuration fails validation
    pub fn build(self) -> Result<VisionProcessor> {
        self.config.validate()?;
        let config = self.config;
        let has_segmentation = self.segmentation.is_some();

        let segmentation = Arc::new(match self.segmentation {
            Some(backend) => SegmentationProvider::new(backend, config.models),
            None => SegmentationProvider::disabled(),
        });
        let remover = Arc::new(BackgroundRemover::new(Arc::clone(&segmentation), &config));
        let crop_engine = Arc::new(CropEngine::new(Arc::clone(&remover), config.crop));
        let optimizer = ImageOptimizer::new(Arc::clone(&crop_engine), config.resize);
        let validator = self.pose.map(|backend| FootValidator::new(backend, &config));

        info!(
            segmentation = has_segmentation,
            pose = validator.is_some(),
            "Vision processor ready"
        );

        Ok(VisionProcessor {
            config,
            segmentation,
            remover,
            crop_engine,
            optimizer,
            validator,
        })
    }
}

/// Entry point bundling the whole image analysis pipeline
pub struct VisionProcessor {
    config: VisionConfig,
    segmentation: Arc<SegmentationProvider>,
    remover: Arc<BackgroundRemover>,
    crop_engine: Arc<CropEngine>,
    optimizer: ImageOptimizer,
    validator: Option<FootValidator>,
}

impl VisionProcessor {
    #[must_use]
    pub fn builder() -> VisionProcessorBuilder {
        VisionProcessorBuilder::default()
    }

    #[must_use]
    pub fn config(&self) -> &VisionConfig {
        &self.config
    }

    #[must_use]
    pub fn segmentation(&self) -> &SegmentationProvider {
        &self.segmentation
    }

    #[must_use]
    pub fn background_remover(&self) -> &BackgroundRemover {
        &self.remover
    }

    #[must_use]
    pub fn crop_engine(&self) -> &CropEngine {
        &self.crop_engine
    }

    #[must_use]
    pub fn optimizer(&self) -> &ImageOptimizer {
        &self.optimizer
    }

    /// The foot validator, if a pose model was configured
    ///
    /// # Errors
    /// - `ModelUnavailable` when no pose backend was given
    pub fn foot_validator(&self) -> Result<&FootValidator> {
        self.validator
            .as_ref()
            .ok_or_else(|| VisionError::model_unavailable("No pose model configured"))
    }

    /// Optimize an uploaded photo with the configured limits
    pub async fn optimize(&self, bytes: &[u8]) -> Result<OptimizedImage> {
        self.optimizer.optimize(bytes).await
    }

    pub async fn optimize_file<P: AsRef<Path>>(&self, path: P) -> Result<OptimizedImage> {
        self.optimizer.optimize_file(path).await
    }

    /// Crop a photo to the person in it without resizing
    pub async fn crop(&self, bytes: &[u8]) -> Result<CropResult> {
        self.crop_engine.crop_image_bytes(bytes).await
    }

    /// Remove the background of an encoded image
    pub async fn remove_background(&self, bytes: &[u8]) -> Result<RemovedBackground> {
        self.remover.process_image_bytes(bytes).await
    }

    /// Decide whether both feet are visible in an encoded image
    ///
    /// # Errors
    /// - `ModelUnavailable` when no pose model is configured or it fails to load
    /// - `Decode` if the bytes are not an image
    pub async fn validate_feet(&self, bytes: &[u8]) -> Result<ValidationVerdict> {
        self.foot_validator()?.validate_batch_result(bytes).await
    }

    /// Load every configured model now; returns `(segmentation, pose)` readiness
    pub async fn preload(&self) -> (bool, bool) {
        let segmentation = self.segmentation.preload().await;
        let pose = match &self.validator {
            Some(validator) => validator.preload().await,
            None => false,
        };
        (segmentation, pose)
    }

    /// Release the pose model
    pub fn cleanup(&self) {
        if let Some(validator) = &self.validator {
            validator.cleanup();
        }
    }
}

impl std::fmt::Debug for VisionProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisionProcessor")
            .field("config", &self.config)
            .field("segmentation", &self.segmentation.status())
            .field("validator", &self.validator)
            .finish_non_exhaustive()
    }
}
