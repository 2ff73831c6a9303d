//! Bounds & crop engine
//!
//! Geometry for cropping a photo to the person in it: find the subject's
//! bounding box, pad it (wider horizontally than vertically), then grow the
//! padded rectangle so it keeps the source image's aspect ratio and the later
//! resize never stretches the subject.

use crate::{
    background::BackgroundRemover,
    config::CropConfig,
    error::{Result, VisionError},
    services::ImageIOService,
    types::{BoundingBox, CropRect, CropResult},
};
use image::RgbaImage;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Tightest box around pixels whose alpha is strictly above `alpha_threshold`
///
/// Returns `None` when no pixel qualifies.
#[must_use]
pub fn find_bounds(image: &RgbaImage, alpha_threshold: u8) -> Option<BoundingBox> {
    let mut bounds: Option<BoundingBox> = None;
    for (x, y, pixel) in image.enumerate_pixels() {
        if pixel[3] > alpha_threshold {
            bounds = Some(match bounds {
                Some(b) => b.including(x, y),
                None => BoundingBox::point(x, y),
            });
        }
    }
    bounds
}

/// Expand `bounds` by padding proportional to its size, clamped to the image
///
/// The box extent counts both edge pixels (`max - min + 1`), so a 21 px wide
/// subject gets the padding of 21 px rather than 20.
#[must_use]
pub fn smart_pad(bounds: &BoundingBox, width: u32, height: u32, config: &CropConfig) -> CropRect {
    let horizontal = padding(bounds.width(), config.horizontal_padding);
    let vertical = padding(bounds.height(), config.vertical_padding);

    CropRect {
        left: bounds.min_x.saturating_sub(horizontal),
        top: bounds.min_y.saturating_sub(vertical),
        right: bounds.max_x.saturating_add(1).saturating_add(horizontal).min(width),
        bottom: bounds.max_y.saturating_add(1).saturating_add(vertical).min(height),
    }
}

fn padding(extent: u32, fraction: f32) -> u32 {
    (f64::from(extent) * f64::from(fraction)).round() as u32
}

/// Grow `crop` along one axis until its shape matches `original_width : original_height`
///
/// Too-wide crops gain height, too-tall crops gain width, split evenly on both
/// sides. Growth that would leave the image is shifted back inside it, so the
/// result always contains `crop`, stays within the image, and matches the
/// target ratio to within half a pixel of the adjusted side.
#[must_use]
pub fn preserve_aspect_ratio(crop: CropRect, original_width: u32, original_height: u32) -> CropRect {
    if crop.is_empty() || original_width == 0 || original_height == 0 {
        return crop;
    }

    let (width, height) = (u64::from(crop.width()), u64::from(crop.height()));
    let (image_w, image_h) = (u64::from(original_width), u64::from(original_height));

    match (width * image_h).cmp(&(height * image_w)) {
        Ordering::Greater => {
            let target = (width as f64 * image_h as f64 / image_w as f64).round() as u32;
            let target = target.clamp(crop.height(), original_height);
            let (top, bottom) = grow_span(crop.top, crop.bottom, target, original_height);
            CropRect { top, bottom, ..crop }
        },
        Ordering::Less => {
            let target = (height as f64 * image_w as f64 / image_h as f64).round() as u32;
            let target = target.clamp(crop.width(), original_width);
            let (left, right) = grow_span(crop.left, crop.right, target, original_width);
            CropRect { left, right, ..crop }
        },
        Ordering::Equal => crop,
    }
}

/// Widen `[start, end)` to `target` around its center, keeping it inside `[0, limit)`
fn grow_span(start: u32, end: u32, target: u32, limit: u32) -> (u32, u32) {
    let grow = i64::from(target) - i64::from(end - start);
    let mut new_start = i64::from(start) - grow / 2;
    let mut new_end = new_start + i64::from(target);

    if new_start < 0 {
        new_end -= new_start;
        new_start = 0;
    }
    if new_end > i64::from(limit) {
        new_start -= new_end - i64::from(limit);
        new_end = i64::from(limit);
    }
    (new_start.max(0) as u32, new_end as u32)
}

/// Copy the region `rect` out of `image`
///
/// # Errors
/// - `Processing` if the rectangle is empty or leaves the image
pub fn crop_image(image: &RgbaImage, rect: CropRect) -> Result<RgbaImage> {
    let (width, height) = image.dimensions();
    if rect.is_empty() || !rect.fits_within(width, height) {
        return Err(VisionError::processing_stage_error(
            "crop",
            &format!("invalid crop rectangle {rect:?}"),
            Some(&format!("{width}x{height}")),
        ));
    }
    Ok(image::imageops::crop_imm(image, rect.left, rect.top, rect.width(), rect.height()).to_image())
}

/// Crops photos to the person in them
pub struct CropEngine {
    remover: Arc<BackgroundRemover>,
    config: CropConfig,
}

impl CropEngine {
    pub fn new(remover: Arc<BackgroundRemover>, config: CropConfig) -> Self {
        Self { remover, config }
    }

    #[must_use]
    pub fn config(&self) -> &CropConfig {
        &self.config
    }

    /// Padded, aspect-corrected crop region for a subject box
    #[must_use]
    pub fn crop_region(&self, bounds: &BoundingBox, width: u32, height: u32) -> CropRect {
        let padded = smart_pad(bounds, width, height, &self.config);
        preserve_aspect_ratio(padded, width, height)
    }

    /// Crop an image that already carries transparency to its subject
    ///
    /// Images without any opaque subject are returned unchanged.
    #[must_use]
    pub fn auto_crop(&self, image: &RgbaImage) -> RgbaImage {
        let (width, height) = image.dimensions();
        let Some(bounds) = find_bounds(image, self.config.alpha_threshold) else {
            debug!("No opaque subject found, skipping auto-crop");
            return image.clone();
        };

        let rect = self.crop_region(&bounds, width, height);
        crop_image(image, rect).unwrap_or_else(|e| {
            warn!(error = %e, "Auto-crop failed, keeping original");
            image.clone()
        })
    }

    /// Locate the person in an opaque photo via background removal
    ///
    /// The returned box is in the photo's own coordinates.
    pub async fn find_person_bounds_with_segmentation(&self, image: &RgbaImage) -> Option<BoundingBox> {
        let removed = self.remover.remove_background(image).await;
        let bounds = find_bounds(&removed.image, self.config.alpha_threshold)?;

        Some(match removed.crop {
            Some(rect) => bounds.offset(rect.left, rect.top),
            None => bounds,
        })
    }

    /// Crop an opaque photo to the person in it, keeping its original pixels
    ///
    /// Never fails: when no person is found the photo comes back uncropped.
    #[instrument(skip_all, fields(width = image.width(), height = image.height()))]
    pub async fn crop_to_person(&self, image: &RgbaImage) -> CropResult {
        let (width, height) = image.dimensions();
        let Some(bounds) = self.find_person_bounds_with_segmentation(image).await else {
            warn!("Person detection failed, returning original image");
            return CropResult::uncropped(image.clone());
        };

        let rect = self.crop_region(&bounds, width, height);
        match crop_image(image, rect) {
            Ok(cropped) => {
                let compression_ratio = rect.area() as f64 / CropRect::full(width, height).area() as f64;
                debug!(?bounds, ?rect, compression_ratio, "Cropped to person");
                CropResult {
                    cropped_width: cropped.width(),
                    cropped_height: cropped.height(),
                    image: cropped,
                    original_width: width,
                    original_height: height,
                    compression_ratio,
                    crop: Some(rect),
                }
            },
            Err(e) => {
                warn!(error = %e, "Crop failed, returning original image");
                CropResult::uncropped(image.clone())
            },
        }
    }

    /// Decode a photo and crop it to the person in it
    ///
    /// # Errors
    /// - `Decode` if the bytes are not an image
    pub async fn crop_image_bytes(&self, bytes: &[u8]) -> Result<CropResult> {
        let image = ImageIOService::decode_rgba(bytes)?;
        Ok(self.crop_to_person(&image).await)
    }
}

impl std::fmt::Debug for CropEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CropEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::MockSegmentationBackend;
    use crate::config::VisionConfig;
    use crate::segmentation::SegmentationProvider;
    use image::Rgba;

    fn engine(backend: MockSegmentationBackend) -> CropEngine {
        let config = VisionConfig::default();
        let provider = Arc::new(SegmentationProvider::new(Arc::new(backend), config.models));
        let remover = Arc::new(BackgroundRemover::new(provider, &config));
        CropEngine::new(remover, config.crop)
    }

    fn with_opaque_block(width: u32, height: u32, x0: u32, x1: u32, y0: u32, y1: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            if (x0..x1).contains(&x) && (y0..y1).contains(&y) {
                Rgba([200, 50, 50, 255])
            } else {
                Rgba([0, 0, 0, 0])
            }
        })
    }

    #[test]
    fn test_find_bounds_empty_alpha() {
        assert_eq!(find_bounds(&RgbaImage::new(16, 9), 10), None);
    }

    #[test]
    fn test_find_bounds_respects_threshold() {
        let mut image = RgbaImage::new(10, 10);
        image.put_pixel(2, 3, Rgba([0, 0, 0, 10]));
        assert_eq!(find_bounds(&image, 10), None);

        image.put_pixel(4, 5, Rgba([0, 0, 0, 11]));
        image.put_pixel(7, 1, Rgba([0, 0, 0, 255]));
        assert_eq!(
            find_bounds(&image, 10),
            Some(BoundingBox {
                min_x: 4,
                max_x: 7,
                min_y: 1,
                max_y: 5
            })
        );
    }

    #[test]
    fn test_smart_pad_proportions() {
        let bounds = BoundingBox {
            min_x: 100,
            max_x: 199,
            min_y: 100,
            max_y: 299,
        };
        let rect = smart_pad(&bounds, 1000, 1000, &CropConfig::default());
        // 12% of 100 wide, 8% of 200 tall
        assert_eq!(rect, CropRect { left: 88, top: 84, right: 212, bottom: 316 });
    }

    #[test]
    fn test_smart_pad_uses_inclusive_extent() {
        let bounds = BoundingBox {
            min_x: 10,
            max_x: 30,
            min_y: 10,
            max_y: 16,
        };
        let rect = smart_pad(&bounds, 100, 100, &CropConfig::default());
        // round(21 * 0.12) = 3 and round(7 * 0.08) = 1
        assert_eq!(rect, CropRect { left: 7, top: 9, right: 34, bottom: 18 });
    }

    #[test]
    fn test_smart_pad_clamps_to_image() {
        let bounds = BoundingBox {
            min_x: 0,
            max_x: 49,
            min_y: 2,
            max_y: 99,
        };
        let rect = smart_pad(&bounds, 50, 100, &CropConfig::default());
        assert_eq!(rect, CropRect::full(50, 100));
    }

    #[test]
    fn test_preserve_aspect_ratio_too_wide() {
        let crop = CropRect { left: 10, top: 40, right: 90, bottom: 60 };
        let adjusted = preserve_aspect_ratio(crop, 100, 200);
        assert_eq!(adjusted.width(), 80);
        assert_eq!(adjusted.height(), 160);
        assert!(adjusted.fits_within(100, 200));
        assert!(adjusted.top <= crop.top && adjusted.bottom >= crop.bottom);
    }

    #[test]
    fn test_preserve_aspect_ratio_too_tall_shifts_inside() {
        let crop = CropRect { left: 0, top: 0, right: 10, bottom: 100 };
        let adjusted = preserve_aspect_ratio(crop, 200, 200);
        assert_eq!(adjusted, CropRect { left: 0, top: 0, right: 100, bottom: 100 });

        let crop = CropRect { left: 190, top: 0, right: 200, bottom: 100 };
        let adjusted = preserve_aspect_ratio(crop, 200, 200);
        assert_eq!(adjusted, CropRect { left: 100, top: 0, right: 200, bottom: 100 });
    }

    #[test]
    fn test_preserve_aspect_ratio_matching_is_noop() {
        let crop = CropRect { left: 5, top: 5, right: 25, bottom: 45 };
        assert_eq!(preserve_aspect_ratio(crop, 50, 100), crop);
    }

    #[test]
    fn test_crop_image_rejects_bad_rect() {
        let image = RgbaImage::new(10, 10);
        assert!(crop_image(&image, CropRect { left: 5, top: 0, right: 5, bottom: 10 }).is_err());
        assert!(crop_image(&image, CropRect { left: 0, top: 0, right: 11, bottom: 10 }).is_err());

        let cropped = crop_image(&image, CropRect { left: 2, top: 3, right: 6, bottom: 10 }).unwrap();
        assert_eq!(cropped.dimensions(), (4, 7));
    }

    #[test]
    fn test_auto_crop_transparent_subject() {
        let engine = engine(MockSegmentationBackend::centered_block(0.5));
        let image = with_opaque_block(100, 100, 40, 60, 30, 70);

        let cropped = engine.auto_crop(&image);
        assert!(cropped.width() < 100 || cropped.height() < 100);
        assert_eq!(cropped.width(), cropped.height());
        assert!(find_bounds(&cropped, 10).is_some());

        let empty = RgbaImage::new(30, 20);
        assert_eq!(engine.auto_crop(&empty), empty);
    }

    #[tokio::test]
    async fn test_person_bounds_in_source_coordinates() {
        let engine = engine(MockSegmentationBackend::centered_block(0.5));
        let photo = RgbaImage::from_pixel(100, 200, Rgba([120, 130, 140, 255]));

        let bounds = engine.find_person_bounds_with_segmentation(&photo).await.unwrap();
        assert_eq!(
            bounds,
            BoundingBox {
                min_x: 25,
                max_x: 74,
                min_y: 50,
                max_y: 149
            }
        );
    }

    #[tokio::test]
    async fn test_crop_to_person_keeps_original_pixels() {
        let engine = engine(MockSegmentationBackend::centered_block(0.5));
        let photo = RgbaImage::from_fn(100, 200, |x, y| Rgba([x as u8, y as u8, 7, 255]));

        let result = engine.crop_to_person(&photo).await;
        let rect = result.crop.unwrap();

        assert_eq!(result.original_width, 100);
        assert_eq!(result.original_height, 200);
        assert_eq!((result.cropped_width, result.cropped_height), result.image.dimensions());
        assert!(result.compression_ratio < 1.0);
        assert_eq!(
            result.image.get_pixel(0, 0),
            photo.get_pixel(rect.left, rect.top)
        );
        assert!(result.image.pixels().all(|p| p[3] == 255));
    }

    #[tokio::test]
    async fn test_crop_bytes_rejects_garbage() {
        let engine = engine(MockSegmentationBackend::centered_block(0.5));
        assert!(matches!(
            engine.crop_image_bytes(b"garbage").await,
            Err(VisionError::Decode(_))
        ));
    }
}
