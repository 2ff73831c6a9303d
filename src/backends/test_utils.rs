//! Test utilities and mock models for testing the pipeline
//!
//! These stand in for real segmentation and pose models so the loading,
//! fallback and quorum logic can be tested without model files.

use crate::{
    error::{Result, VisionError},
    feet::COCO_KEYPOINT_NAMES,
    inference::{ModelBackend, PoseModel, SegmentationModel},
    types::{Keypoint, Pose, SegmentationMask},
};
use async_trait::async_trait;
use image::RgbaImage;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shape of the mask a mock segmenter produces
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MaskPattern {
    /// Foreground block centered in the image, sized as a fraction of each side
    CenteredBlock(f32),
    /// Everything is background
    Empty,
}

/// Half-open `(x0, x1, y0, y1)` of a centered block covering `fraction` of each side
pub fn centered_block_bounds(width: u32, height: u32, fraction: f32) -> (u32, u32, u32, u32) {
    let block_w = ((width as f32 * fraction).round() as u32).clamp(1, width);
    let block_h = ((height as f32 * fraction).round() as u32).clamp(1, height);
    let x0 = (width - block_w) / 2;
    let y0 = (height - block_h) / 2;
    (x0, x0 + block_w, y0, y0 + block_h)
}

/// Mock segmentation model
#[derive(Debug)]
pub struct MockSegmenter {
    pattern: MaskPattern,
    fail_inference: bool,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl SegmentationModel for MockSegmenter {
    fn name(&self) -> &str {
        "mock-segmenter"
    }

    async fn segment(&self, image: &RgbaImage) -> Result<SegmentationMask> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_inference {
            return Err(VisionError::inference("Mock segmenter inference failed"));
        }

        let (width, height) = image.dimensions();
        match self.pattern {
            MaskPattern::Empty => Ok(SegmentationMask::filled(width, height, 0.0)),
            MaskPattern::CenteredBlock(fraction) => {
                let (x0, x1, y0, y1) = centered_block_bounds(width, height, fraction);
                let values = (0..height)
                    .flat_map(|y| {
                        (0..width).map(move |x| {
                            if (x0..x1).contains(&x) && (y0..y1).contains(&y) {
                                0.95
                            } else {
                                0.05
                            }
                        })
                    })
                    .collect();
                SegmentationMask::from_vec(width, height, values)
            },
        }
    }
}

/// Mock backend producing [`MockSegmenter`]s
#[derive(Debug, Clone)]
pub struct MockSegmentationBackend {
    pattern: MaskPattern,
    load_delay: Option<Duration>,
    fail_load: bool,
    fail_inference: bool,
    loads: Arc<AtomicUsize>,
    segment_calls: Arc<AtomicUsize>,
}

impl MockSegmentationBackend {
    #[must_use]
    pub fn centered_block(fraction: f32) -> Self {
        Self {
            pattern: MaskPattern::CenteredBlock(fraction),
            load_delay: None,
            fail_load: false,
            fail_inference: false,
            loads: Arc::new(AtomicUsize::new(0)),
            segment_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn empty_mask() -> Self {
        Self {
            pattern: MaskPattern::Empty,
            ..Self::centered_block(0.5)
        }
    }

    /// A backend whose every load fails
    #[must_use]
    pub fn failing_load() -> Self {
        Self {
            fail_load: true,
            ..Self::centered_block(0.5)
        }
    }

    /// A backend that loads but whose model fails every inference
    #[must_use]
    pub fn failing_inference() -> Self {
        Self {
            fail_inference: true,
            ..Self::centered_block(0.5)
        }
    }

    #[must_use]
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    pub fn load_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.loads)
    }

    pub fn segment_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.segment_calls)
    }
}

#[async_trait]
impl ModelBackend<dyn SegmentationModel> for MockSegmentationBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn load(&self) -> Result<Arc<dyn SegmentationModel>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.load_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_load {
            return Err(VisionError::model("Mock segmentation model failed to load"));
        }
        Ok(Arc::new(MockSegmenter {
            pattern: self.pattern,
            fail_inference: self.fail_inference,
            calls: Arc::clone(&self.segment_calls),
        }))
    }
}

/// Build a full COCO pose where the first `ankles` ankles are confidently visible
pub fn pose_with_ankles(ankles: usize, width: u32, height: u32) -> Pose {
    let keypoints = COCO_KEYPOINT_NAMES
        .iter()
        .enumerate()
        .map(|(index, name)| {
            let score = match *name {
                "left_ankle" if ankles >= 1 => 0.9,
                "right_ankle" if ankles >= 2 => 0.9,
                "left_ankle" | "right_ankle" => 0.05,
                _ => 0.8,
            };
            Keypoint {
                name: Some((*name).to_string()),
                x: width as f32 * 0.5,
                y: height as f32 * (index as f32 + 1.0) / 18.0,
                score,
            }
        })
        .collect();
    Pose {
        keypoints,
        score: Some(0.7),
    }
}

/// Mock pose model replaying a fixed sequence of visible-ankle counts
#[derive(Debug)]
pub struct MockPoseDetector {
    script: Vec<usize>,
    cursor: AtomicUsize,
    disposed: Arc<AtomicBool>,
}

#[async_trait]
impl PoseModel for MockPoseDetector {
    fn name(&self) -> &str {
        "mock-pose"
    }

    async fn estimate_poses(&self, image: &RgbaImage) -> Result<Vec<Pose>> {
        if self.script.is_empty() {
            return Ok(Vec::new());
        }
        let index = self.cursor.fetch_add(1, Ordering::SeqCst) % self.script.len();
        let ankles = self.script.get(index).copied().unwrap_or(0);
        let (width, height) = image.dimensions();
        Ok(vec![pose_with_ankles(ankles, width, height)])
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

/// Mock backend producing [`MockPoseDetector`]s
#[derive(Debug, Clone)]
pub struct MockPoseBackend {
    script: Vec<usize>,
    fail_load: bool,
    loads: Arc<AtomicUsize>,
    disposed: Arc<AtomicBool>,
}

impl MockPoseBackend {
    /// Each `estimate_poses` call shows the next count of visible ankles, cycling
    #[must_use]
    pub fn scripted(script: Vec<usize>) -> Self {
        Self {
            script,
            fail_load: false,
            loads: Arc::new(AtomicUsize::new(0)),
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn failing_load() -> Self {
        Self {
            fail_load: true,
            ..Self::scripted(vec![2])
        }
    }

    pub fn load_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.loads)
    }

    pub fn disposed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.disposed)
    }
}

#[async_trait]
impl ModelBackend<dyn PoseModel> for MockPoseBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn load(&self) -> Result<Arc<dyn PoseModel>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_load {
            return Err(VisionError::model("Mock pose model failed to load"));
        }
        Ok(Arc::new(MockPoseDetector {
            script: self.script.clone(),
            cursor: AtomicUsize::new(0),
            disposed: Arc::clone(&self.disposed),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_centered_block_bounds() {
        assert_eq!(centered_block_bounds(100, 50, 0.5), (25, 75, 12, 37));
        assert_eq!(centered_block_bounds(3, 3, 0.0), (1, 2, 1, 2));
    }

    #[tokio::test]
    async fn test_mock_pose_cycles_script() {
        let backend = MockPoseBackend::scripted(vec![2, 0]);
        let detector = backend.load().await.unwrap();
        let image = RgbaImage::new(50, 100);

        let confident_ankles = |poses: Vec<Pose>| {
            poses[0]
                .keypoints
                .iter()
                .filter(|k| k.name.as_deref().is_some_and(|n| n.contains("ankle")) && k.score >= 0.3)
                .count()
        };

        assert_eq!(confident_ankles(detector.estimate_poses(&image).await.unwrap()), 2);
        assert_eq!(confident_ankles(detector.estimate_poses(&image).await.unwrap()), 0);
        assert_eq!(confident_ankles(detector.estimate_poses(&image).await.unwrap()), 2);
    }
}
