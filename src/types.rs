//! Core types shared by the segmentation, cropping and validation stages

use crate::error::{Result, VisionError};
use image::RgbaImage;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Per-pixel foreground confidence in `[0, 1]`, stored row-major as `(height, width)`
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationMask {
    data: Array2<f32>,
}

impl SegmentationMask {
    #[must_use]
    pub fn new(data: Array2<f32>) -> Self {
        Self { data }
    }

    /// Build a mask from row-major confidences
    ///
    /// # Errors
    /// - `values.len()` does not equal `width * height`
    pub fn from_vec(width: u32, height: u32, values: Vec<f32>) -> Result<Self> {
        let expected = width as usize * height as usize;
        if values.len() != expected {
            return Err(VisionError::processing(format!(
                "Mask has {} values, expected {} for {}x{}",
                values.len(),
                expected,
                width,
                height
            )));
        }
        let data = Array2::from_shape_vec((height as usize, width as usize), values)
            .map_err(|e| VisionError::internal(format!("Failed to shape mask: {e}")))?;
        Ok(Self { data })
    }

    /// A mask of a single confidence value
    #[must_use]
    pub fn filled(width: u32, height: u32, value: f32) -> Self {
        Self {
            data: Array2::from_elem((height as usize, width as usize), value),
        }
    }

    /// Mask dimensions as `(width, height)`
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        let (rows, cols) = self.data.dim();
        (cols as u32, rows as u32)
    }

    /// Confidence at `(x, y)`; out-of-range coordinates read as background
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data
            .get((y as usize, x as usize))
            .copied()
            .unwrap_or(0.0)
    }

    #[must_use]
    pub fn data(&self) -> &Array2<f32> {
        &self.data
    }

    /// Tightest box around pixels whose confidence is strictly above `threshold`
    #[must_use]
    pub fn foreground_bounds(&self, threshold: f32) -> Option<BoundingBox> {
        let mut bounds: Option<BoundingBox> = None;
        for ((y, x), &value) in self.data.indexed_iter() {
            if value > threshold {
                let (x, y) = (x as u32, y as u32);
                bounds = Some(match bounds {
                    Some(b) => b.including(x, y),
                    None => BoundingBox::point(x, y),
                });
            }
        }
        bounds
    }

    /// Bilinearly resample the mask to `width` x `height`
    #[must_use]
    pub fn resized(&self, width: u32, height: u32) -> Self {
        let (src_w, src_h) = self.dimensions();
        if (src_w, src_h) == (width, height) {
            return self.clone();
        }
        if src_w == 0 || src_h == 0 {
            return Self::filled(width, height, 0.0);
        }

        let scale_x = src_w as f32 / width.max(1) as f32;
        let scale_y = src_h as f32 / height.max(1) as f32;
        let max_x = (src_w - 1) as f32;
        let max_y = (src_h - 1) as f32;

        let data = Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
            let sx = ((x as f32 + 0.5) * scale_x - 0.5).clamp(0.0, max_x);
            let sy = ((y as f32 + 0.5) * scale_y - 0.5).clamp(0.0, max_y);
            let (x0, y0) = (sx.floor(), sy.floor());
            let (fx, fy) = (sx - x0, sy - y0);
            let (x0, y0) = (x0 as u32, y0 as u32);
            let x1 = (x0 + 1).min(src_w - 1);
            let y1 = (y0 + 1).min(src_h - 1);

            let top = self.get(x0, y0) * (1.0 - fx) + self.get(x1, y0) * fx;
            let bottom = self.get(x0, y1) * (1.0 - fx) + self.get(x1, y1) * fx;
            top * (1.0 - fy) + bottom * fy
        });
        Self { data }
    }
}

/// Inclusive pixel bounds of the detected subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: u32,
    pub max_x: u32,
    pub min_y: u32,
    pub max_y: u32,
}

impl BoundingBox {
    #[must_use]
    pub fn point(x: u32, y: u32) -> Self {
        Self {
            min_x: x,
            max_x: x,
            min_y: y,
            max_y: y,
        }
    }

    #[must_use]
    pub fn including(self, x: u32, y: u32) -> Self {
        Self {
            min_x: self.min_x.min(x),
            max_x: self.max_x.max(x),
            min_y: self.min_y.min(y),
            max_y: self.max_y.max(y),
        }
    }

    /// Width in pixels, counting both edge columns
    #[must_use]
    pub fn width(&self) -> u32 {
        self.max_x - self.min_x + 1
    }

    /// Height in pixels, counting both edge rows
    #[must_use]
    pub fn height(&self) -> u32 {
        self.max_y - self.min_y + 1
    }

    /// Shift the box by the origin of the region it was measured in
    #[must_use]
    pub fn offset(self, dx: u32, dy: u32) -> Self {
        Self {
            min_x: self.min_x + dx,
            max_x: self.max_x + dx,
            min_y: self.min_y + dy,
            max_y: self.max_y + dy,
        }
    }
}

/// Half-open crop region `[left, right) x [top, bottom)` in source pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl CropRect {
    /// The whole `width` x `height` image
    #[must_use]
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            left: 0,
            top: 0,
            right: width,
            bottom: height,
        }
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    #[must_use]
    pub fn area(&self) -> u64 {
        u64::from(self.width()) * u64::from(self.height())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Whether the rectangle lies inside a `width` x `height` image
    #[must_use]
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.right <= width && self.bottom <= height
    }
}

/// A named body landmark from the pose model, in pixel coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub name: Option<String>,
    pub x: f32,
    pub y: f32,
    pub score: f32,
}

/// One detected person
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub keypoints: Vec<Keypoint>,
    pub score: Option<f32>,
}

/// Ankle keypoints found in a single detection pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FootDetection {
    pub count: usize,
    pub ankles: Vec<Keypoint>,
}

/// Outcome of one batch of independent detection passes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSummary {
    pub pass_count: usize,
    pub fail_count: usize,
    pub total_checks: usize,
    pub passed: Vec<bool>,
}

/// Why a foot validation ended the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictReason {
    NoFeetDetected,
    FeetLikelyNotVisible,
    FeetDetectedConsistently,
    AmbiguousAfterMaxRetries,
}

impl fmt::Display for VerdictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoFeetDetected => write!(
                f,
                "No feet detected in any check - person may be sitting or feet not visible"
            ),
            Self::FeetLikelyNotVisible => write!(
                f,
                "Too few checks detected feet - feet likely not visible"
            ),
            Self::FeetDetectedConsistently => {
                write!(f, "Feet detected consistently across multiple checks")
            },
            Self::AmbiguousAfterMaxRetries => write!(
                f,
                "Ambiguous results after maximum retries - feet detection inconsistent"
            ),
        }
    }
}

/// Final answer of the foot-visibility validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub valid: bool,
    pub pass_count: usize,
    pub total_checks: usize,
    pub attempts: u32,
    pub reason: VerdictReason,
}

impl ValidationVerdict {
    /// Human-readable reason, with the vote count where it explains the verdict
    #[must_use]
    pub fn message(&self) -> String {
        match self.reason {
            VerdictReason::FeetLikelyNotVisible => format!(
                "Only {}/{} checks detected feet - feet likely not visible",
                self.pass_count, self.total_checks
            ),
            reason => reason.to_string(),
        }
    }

    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} ({}/{} in {} attempt(s)): {}",
            if self.valid { "PASSED" } else { "FAILED" },
            self.pass_count,
            self.total_checks,
            self.attempts,
            self.message()
        )
    }
}

/// Which removal strategy produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalMethod {
    Segmentation,
    ChromaKey,
    Passthrough,
}

impl fmt::Display for RemovalMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Segmentation => write!(f, "segmentation"),
            Self::ChromaKey => write!(f, "chroma-key"),
            Self::Passthrough => write!(f, "passthrough"),
        }
    }
}

/// Image with its background made transparent
#[derive(Debug, Clone)]
pub struct RemovedBackground {
    pub image: RgbaImage,
    pub method: RemovalMethod,
    /// Region of the source image the result was cropped to, if any
    pub crop: Option<CropRect>,
}

impl RemovedBackground {
    /// Encode the result as PNG
    pub fn to_png(&self) -> Result<Vec<u8>> {
        crate::services::ImageIOService::encode_png(&self.image)
    }
}

/// Result of cropping a photo to the person in it
#[derive(Debug, Clone)]
pub struct CropResult {
    pub image: RgbaImage,
    pub original_width: u32,
    pub original_height: u32,
    pub cropped_width: u32,
    pub cropped_height: u32,
    /// Cropped pixel area divided by original pixel area
    pub compression_ratio: f64,
    pub crop: Option<CropRect>,
}

impl CropResult {
    /// A result that leaves the image as it was
    #[must_use]
    pub fn uncropped(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            image,
            original_width: width,
            original_height: height,
            cropped_width: width,
            cropped_height: height,
            compression_ratio: 1.0,
            crop: None,
        }
    }
}

/// Output of the optimization pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizedImage {
    /// Lossless PNG payload
    #[serde(skip)]
    pub png: Vec<u8>,
    /// Size of the input file in bytes
    pub original_size: usize,
    pub original_width: u32,
    pub original_height: u32,
    pub optimized_width: u32,
    pub optimized_height: u32,
    /// Cropped pixel area divided by original pixel area
    pub compression_ratio: f64,
}

impl OptimizedImage {
    /// Write the PNG payload to `path`
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, &self.png)
            .map_err(|e| VisionError::file_io_error("write optimized image", path, &e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_from_vec_checks_length() {
        assert!(SegmentationMask::from_vec(2, 2, vec![0.0; 3]).is_err());

        let mask = SegmentationMask::from_vec(3, 2, vec![0.0, 0.1, 0.2, 0.3, 0.4, 0.5]).unwrap();
        assert_eq!(mask.dimensions(), (3, 2));
        assert!((mask.get(2, 1) - 0.5).abs() < f32::EPSILON);
        assert!((mask.get(0, 1) - 0.3).abs() < f32::EPSILON);
        assert_eq!(mask.get(10, 10), 0.0);
    }

    #[test]
    fn test_mask_foreground_bounds() {
        let mut values = vec![0.0; 10 * 8];
        values[2 * 10 + 3] = 0.9;
        values[6 * 10 + 7] = 0.6;
        values[7 * 10 + 9] = 0.5; // not strictly above threshold
        let mask = SegmentationMask::from_vec(10, 8, values).unwrap();

        let bounds = mask.foreground_bounds(0.5).unwrap();
        assert_eq!(
            bounds,
            BoundingBox {
                min_x: 3,
                max_x: 7,
                min_y: 2,
                max_y: 6
            }
        );

        assert!(SegmentationMask::filled(4, 4, 0.2)
            .foreground_bounds(0.5)
            .is_none());
    }

    #[test]
    fn test_mask_resize_preserves_constant_regions() {
        let mask = SegmentationMask::filled(16, 16, 1.0);
        let resized = mask.resized(40, 24);
        assert_eq!(resized.dimensions(), (40, 24));
        assert!(resized.data().iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_mask_resize_upsamples_halves() {
        // Left half background, right half foreground
        let values: Vec<f32> = (0..4 * 4).map(|i| if i % 4 >= 2 { 1.0 } else { 0.0 }).collect();
        let mask = SegmentationMask::from_vec(4, 4, values).unwrap();
        let resized = mask.resized(8, 8);

        assert!(resized.get(0, 3) < 0.5);
        assert!(resized.get(7, 3) > 0.5);
    }

    #[test]
    fn test_bounding_box_dimensions() {
        let bounds = BoundingBox::point(5, 5).including(14, 24);
        assert_eq!(bounds.width(), 10);
        assert_eq!(bounds.height(), 20);
        assert_eq!(bounds.offset(3, 4).min_x, 8);
        assert_eq!(bounds.offset(3, 4).max_y, 28);
    }

    #[test]
    fn test_crop_rect_geometry() {
        let rect = CropRect {
            left: 10,
            top: 20,
            right: 30,
            bottom: 60,
        };
        assert_eq!(rect.width(), 20);
        assert_eq!(rect.height(), 40);
        assert_eq!(rect.area(), 800);
        assert!(!rect.is_empty());
        assert!(rect.fits_within(30, 60));
        assert!(!rect.fits_within(29, 60));
    }

    #[test]
    fn test_verdict_reason_serialization() {
        let verdict = ValidationVerdict {
            valid: false,
            pass_count: 2,
            total_checks: 4,
            attempts: 10,
            reason: VerdictReason::AmbiguousAfterMaxRetries,
        };
        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["reason"], "ambiguous_after_max_retries");
        assert_eq!(json["attempts"], 10);
        assert!(verdict.summary().starts_with("FAILED (2/4 in 10 attempt(s))"));
    }

    #[test]
    fn test_verdict_message_reports_vote_count() {
        let verdict = ValidationVerdict {
            valid: false,
            pass_count: 1,
            total_checks: 4,
            attempts: 1,
            reason: VerdictReason::FeetLikelyNotVisible,
        };
        assert_eq!(
            verdict.message(),
            "Only 1/4 checks detected feet - feet likely not visible"
        );
        assert!(verdict.summary().ends_with(&verdict.message()));
    }
}
