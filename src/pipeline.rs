//! Optimization pipeline: crop to the person, shrink to fit, re-encode losslessly

use crate::{
    config::ResizeConfig,
    cropping::CropEngine,
    error::{Result, VisionError},
    services::ImageIOService,
    types::OptimizedImage,
};
use image::{imageops::FilterType, RgbaImage};
use instant::Instant;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Scale `image` down to fit within `max_width` x `max_height`
///
/// Images that already fit are returned as they are; nothing is upscaled.
#[must_use]
pub fn resize_image(image: &RgbaImage, max_width: u32, max_height: u32) -> RgbaImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image.clone();
    }

    let ratio = (f64::from(max_width) / f64::from(width)).min(f64::from(max_height) / f64::from(height));
    if ratio >= 1.0 {
        return image.clone();
    }

    let new_width = ((f64::from(width) * ratio).round() as u32).max(1);
    let new_height = ((f64::from(height) * ratio).round() as u32).max(1);
    image::imageops::resize(image, new_width, new_height, FilterType::Lanczos3)
}

/// Prepares uploaded photos: crop, resize, lossless encode
pub struct ImageOptimizer {
    crop_engine: Arc<CropEngine>,
    resize: ResizeConfig,
}

impl ImageOptimizer {
    pub fn new(crop_engine: Arc<CropEngine>, resize: ResizeConfig) -> Self {
        Self { crop_engine, resize }
    }

    /// Optimize with the configured maximum dimensions
    pub async fn optimize(&self, bytes: &[u8]) -> Result<OptimizedImage> {
        self.optimize_with_limits(bytes, self.resize.max_width, self.resize.max_height)
            .await
    }

    /// Crop the photo to the person, fit it within the limits and encode it as PNG
    ///
    /// Failures after decoding fall back to the original image re-encoded,
    /// with a compression ratio of 1.
    ///
    /// # Errors
    /// - `InvalidConfig` for a zero maximum dimension
    /// - `Decode` if the bytes are not an image
    #[instrument(skip(self, bytes), fields(input_bytes = bytes.len()))]
    pub async fn optimize_with_limits(
        &self,
        bytes: &[u8],
        max_width: u32,
        max_height: u32,
    ) -> Result<OptimizedImage> {
        if max_width == 0 || max_height == 0 {
            return Err(VisionError::invalid_config(format!(
                "Maximum dimensions must be non-zero, got {max_width}x{max_height}"
            )));
        }

        let started = Instant::now();
        let original = ImageIOService::decode_rgba(bytes)?;

        let optimized = match self.run_stages(&original, bytes.len(), max_width, max_height).await {
            Ok(optimized) => optimized,
            Err(e) => {
                warn!(error = %e, "Optimization failed, returning original image");
                Self::unoptimized(&original, bytes.len())?
            },
        };

        info!(
            original = ?(optimized.original_width, optimized.original_height),
            optimized = ?(optimized.optimized_width, optimized.optimized_height),
            compression_ratio = optimized.compression_ratio,
            output_bytes = optimized.png.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Image optimized"
        );
        Ok(optimized)
    }

    /// Read a file and optimize it
    pub async fn optimize_file<P: AsRef<Path>>(&self, path: P) -> Result<OptimizedImage> {
        let path_ref = path.as_ref();
        let bytes = tokio::fs::read(path_ref)
            .await
            .map_err(|e| VisionError::file_io_error("read image file", path_ref, &e))?;
        self.optimize(&bytes).await
    }

    async fn run_stages(
        &self,
        original: &RgbaImage,
        original_size: usize,
        max_width: u32,
        max_height: u32,
    ) -> Result<OptimizedImage> {
        let cropped = self.crop_engine.crop_to_person(original).await;
        let resized = resize_image(&cropped.image, max_width, max_height);
        let png = ImageIOService::encode_png(&resized)?;

        Ok(OptimizedImage {
            png,
            original_size,
            original_width: original.width(),
            original_height: original.height(),
            optimized_width: resized.width(),
            optimized_height: resized.height(),
            compression_ratio: cropped.compression_ratio,
        })
    }

    fn unoptimized(original: &RgbaImage, original_size: usize) -> Result<OptimizedImage> {
        Ok(OptimizedImage {
            png: ImageIOService::encode_png(original)?,
            original_size,
            original_width: original.width(),
            original_height: original.height(),
            optimized_width: original.width(),
            optimized_height: original.height(),
            compression_ratio: 1.0,
        })
    }
}

impl std::fmt::Debug for ImageOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageOptimizer")
            .field("crop_engine", &self.crop_engine)
            .field("resize", &self.resize)
            .finish()
    }
}
