//! Background removal
//!
//! Removal is an ordered list of strategies tried in turn: segmentation,
//! then a flat-colour chroma key, then passing the image through untouched.
//! A strategy that does not apply or fails hands over to the next one, so
//! [`BackgroundRemover::remove_background`] always produces an image.

use crate::{
    config::{ChromaKeyConfig, CropConfig, VisionConfig},
    cropping::{crop_image, smart_pad},
    error::{Result, VisionError},
    segmentation::{SegmentOutcome, SegmentationProvider},
    services::ImageIOService,
    types::{RemovalMethod, RemovedBackground, SegmentationMask},
};
use async_trait::async_trait;
use image::RgbaImage;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// One way of removing a background
#[async_trait]
pub trait RemovalStrategy: Send + Sync {
    fn method(&self) -> RemovalMethod;

    /// Remove the background of `image`
    ///
    /// `Ok(None)` means the strategy cannot run right now (for example its
    /// model is unavailable) and the next strategy should be tried.
    async fn remove(&self, image: &RgbaImage) -> Result<Option<RemovedBackground>>;
}

/// Make pixels whose mask confidence is below `threshold` fully transparent
#[must_use]
pub fn apply_mask(image: &RgbaImage, mask: &SegmentationMask, threshold: f32) -> RgbaImage {
    let mut output = image.clone();
    for (x, y, pixel) in output.enumerate_pixels_mut() {
        if mask.get(x, y) < threshold {
            pixel[3] = 0;
        }
    }
    output
}

/// Mask-based removal backed by the segmentation provider
pub struct SegmentationRemoval {
    provider: Arc<SegmentationProvider>,
    crop: CropConfig,
}

impl SegmentationRemoval {
    pub fn new(provider: Arc<SegmentationProvider>, crop: CropConfig) -> Self {
        Self { provider, crop }
    }
}

#[async_trait]
impl RemovalStrategy for SegmentationRemoval {
    fn method(&self) -> RemovalMethod {
        RemovalMethod::Segmentation
    }

    async fn remove(&self, image: &RgbaImage) -> Result<Option<RemovedBackground>> {
        let mask = match self.provider.segment(image).await? {
            SegmentOutcome::Mask(mask) => mask,
            SegmentOutcome::Unavailable => return Ok(None),
        };

        let masked = apply_mask(image, &mask, self.crop.mask_threshold);
        let (width, height) = image.dimensions();

        let Some(bounds) = mask.foreground_bounds(self.crop.mask_threshold) else {
            debug!("Segmentation found no foreground, keeping full frame");
            return Ok(Some(RemovedBackground {
                image: masked,
                method: RemovalMethod::Segmentation,
                crop: None,
            }));
        };

        let rect = smart_pad(&bounds, width, height, &self.crop);
        Ok(Some(RemovedBackground {
            image: crop_image(&masked, rect)?,
            method: RemovalMethod::Segmentation,
            crop: Some(rect),
        }))
    }
}

/// Average colour of the top-left `sample_size` square, clamped to the image
///
/// # Errors
/// - `Processing` for an image without pixels
pub fn estimate_background_color(image: &RgbaImage, sample_size: u32) -> Result<[u8; 3]> {
    let block_w = sample_size.min(image.width());
    let block_h = sample_size.min(image.height());
    if block_w == 0 || block_h == 0 {
        return Err(VisionError::processing(
            "Cannot sample background colour of an empty image",
        ));
    }

    let mut sums = [0u64; 3];
    for y in 0..block_h {
        for x in 0..block_w {
            let pixel = image.get_pixel(x, y);
            for (sum, &channel) in sums.iter_mut().zip(pixel.0.iter()) {
                *sum += u64::from(channel);
            }
        }
    }

    let count = f64::from(block_w) * f64::from(block_h);
    Ok(sums.map(|sum| (sum as f64 / count).round() as u8))
}

/// Make every pixel close to the estimated background colour transparent
///
/// The image keeps its size; nothing is cropped.
pub fn chroma_key(image: &RgbaImage, config: &ChromaKeyConfig) -> Result<RgbaImage> {
    let background = estimate_background_color(image, config.sample_size)?;
    let threshold = f64::from(config.distance_threshold);

    let mut output = image.clone();
    for pixel in output.pixels_mut() {
        let distance = pixel
            .0
            .iter()
            .zip(background.iter())
            .map(|(&channel, &bg)| (f64::from(channel) - f64::from(bg)).powi(2))
            .sum::<f64>()
            .sqrt();
        if distance < threshold {
            pixel[3] = 0;
        }
    }
    Ok(output)
}

/// Colour-distance removal from a sampled background colour
pub struct ChromaKeyRemoval {
    config: ChromaKeyConfig,
}

impl ChromaKeyRemoval {
    pub fn new(config: ChromaKeyConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RemovalStrategy for ChromaKeyRemoval {
    fn method(&self) -> RemovalMethod {
        RemovalMethod::ChromaKey
    }

    async fn remove(&self, image: &RgbaImage) -> Result<Option<RemovedBackground>> {
        Ok(Some(RemovedBackground {
            image: chroma_key(image, &self.config)?,
            method: RemovalMethod::ChromaKey,
            crop: None,
        }))
    }
}

/// Last resort: the image as it came in
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Passthrough {
    fn apply(image: &RgbaImage) -> RemovedBackground {
        RemovedBackground {
            image: image.clone(),
            method: RemovalMethod::Passthrough,
            crop: None,
        }
    }
}

#[async_trait]
impl RemovalStrategy for Passthrough {
    fn method(&self) -> RemovalMethod {
        RemovalMethod::Passthrough
    }

    async fn remove(&self, image: &RgbaImage) -> Result<Option<RemovedBackground>> {
        Ok(Some(Self::apply(image)))
    }
}

/// Background remover running its strategies in order
pub struct BackgroundRemover {
    strategies: Vec<Box<dyn RemovalStrategy>>,
    chroma: ChromaKeyConfig,
}

impl BackgroundRemover {
    /// Segmentation, then chroma key, then passthrough
    pub fn new(provider: Arc<SegmentationProvider>, config: &VisionConfig) -> Self {
        Self {
            strategies: vec![
                Box::new(SegmentationRemoval::new(provider, config.crop)),
                Box::new(ChromaKeyRemoval::new(config.chroma)),
                Box::new(Passthrough),
            ],
            chroma: config.chroma,
        }
    }

    /// Use a custom strategy order; the image passes through if all of them decline
    pub fn with_strategies(strategies: Vec<Box<dyn RemovalStrategy>>, chroma: ChromaKeyConfig) -> Self {
        Self { strategies, chroma }
    }

    #[must_use]
    pub fn methods(&self) -> Vec<RemovalMethod> {
        self.strategies.iter().map(|s| s.method()).collect()
    }

    /// Remove the background of `image`
    ///
    /// Never fails: strategy errors are logged and the next strategy runs.
    #[instrument(skip_all, fields(width = image.width(), height = image.height()))]
    pub async fn remove_background(&self, image: &RgbaImage) -> RemovedBackground {
        for strategy in &self.strategies {
            let method = strategy.method();
            match strategy.remove(image).await {
                Ok(Some(result)) => {
                    debug!(%method, crop = ?result.crop, "Background removed");
                    return result;
                },
                Ok(None) => debug!(%method, "Removal strategy not available"),
                Err(e) => warn!(%method, error = %e, "Removal strategy failed, trying next"),
            }
        }
        Passthrough::apply(image)
    }

    /// Decode an image file's bytes and remove its background
    ///
    /// # Errors
    /// - `Decode` if the bytes are not an image
    pub async fn process_image_bytes(&self, bytes: &[u8]) -> Result<RemovedBackground> {
        let image = ImageIOService::decode_rgba(bytes)?;
        Ok(self.remove_background(&image).await)
    }

    /// Chroma-key removal on its own, without segmentation
    pub fn chroma_key(&self, image: &RgbaImage) -> Result<RgbaImage> {
        chroma_key(image, &self.chroma)
    }
}

impl std::fmt::Debug for BackgroundRemover {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundRemover")
            .field("strategies", &self.methods())
            .field("chroma", &self.chroma)
            .finish()
    }
}
