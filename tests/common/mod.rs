//! Shared fixtures for integration tests
//!
//! Model stand-ins built on the public traits, plus synthetic photos.

#![allow(dead_code)]

use async_trait::async_trait;
use image::{Rgba, RgbaImage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tryon_vision::{
    error::{Result, VisionError},
    inference::{ModelBackend, PoseModel, SegmentationModel},
    services::ImageIOService,
    types::{Keypoint, Pose, SegmentationMask},
};

pub const BACKGROUND: Rgba<u8> = Rgba([240, 240, 240, 255]);
pub const SUBJECT: Rgba<u8> = Rgba([40, 60, 160, 255]);

/// Uniform background with a subject rectangle `[x0, x1) x [y0, y1)`
pub fn studio_photo(width: u32, height: u32, subject: (u32, u32, u32, u32)) -> RgbaImage {
    let (x0, x1, y0, y1) = subject;
    RgbaImage::from_fn(width, height, |x, y| {
        if (x0..x1).contains(&x) && (y0..y1).contains(&y) {
            SUBJECT
        } else {
            BACKGROUND
        }
    })
}

pub fn png_bytes(image: &RgbaImage) -> Vec<u8> {
    ImageIOService::encode_png(image).expect("encode test PNG")
}

/// Transparent canvas with an opaque rectangle `[x0, x1) x [y0, y1)`
pub fn cutout(width: u32, height: u32, subject: (u32, u32, u32, u32)) -> RgbaImage {
    let (x0, x1, y0, y1) = subject;
    RgbaImage::from_fn(width, height, |x, y| {
        if (x0..x1).contains(&x) && (y0..y1).contains(&y) {
            SUBJECT
        } else {
            Rgba([0, 0, 0, 0])
        }
    })
}

/// Segmenter marking a fixed rectangle, scaled to every image
struct BlockSegmenter {
    fraction: f32,
    work: Duration,
}

#[async_trait]
impl SegmentationModel for BlockSegmenter {
    fn name(&self) -> &str {
        "block"
    }

    async fn segment(&self, image: &RgbaImage) -> Result<SegmentationMask> {
        // Busy the blocking pool the way a real runtime would
        if !self.work.is_zero() {
            let work = self.work;
            tokio::task::spawn_blocking(move || std::thread::sleep(work))
                .await
                .map_err(|e| VisionError::internal(e.to_string()))?;
        }
        let (width, height) = image.dimensions();
        let block_w = (width as f32 * self.fraction).round() as u32;
        let block_h = (height as f32 * self.fraction).round() as u32;
        let (x0, y0) = ((width - block_w) / 2, (height - block_h) / 2);
        let values = (0..height)
            .flat_map(|y| {
                (0..width).map(move |x| {
                    let inside = (x0..x0 + block_w).contains(&x) && (y0..y0 + block_h).contains(&y);
                    if inside {
                        0.9
                    } else {
                        0.1
                    }
                })
            })
            .collect();
        SegmentationMask::from_vec(width, height, values)
    }
}

/// Segmentation backend with an observable load count
#[derive(Clone)]
pub struct BlockSegmentationBackend {
    fraction: f32,
    fail: bool,
    delay: Duration,
    work: Duration,
    loads: Arc<AtomicUsize>,
}

impl BlockSegmentationBackend {
    pub fn new(fraction: f32) -> Self {
        Self {
            fraction,
            fail: false,
            delay: Duration::ZERO,
            work: Duration::ZERO,
            loads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(0.5)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Each inference blocks a pool thread for `work`
    pub fn with_inference_work(mut self, work: Duration) -> Self {
        self.work = work;
        self
    }

    pub fn loads(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.loads)
    }
}

#[async_trait]
impl ModelBackend<dyn SegmentationModel> for BlockSegmentationBackend {
    fn name(&self) -> &str {
        "block-backend"
    }

    async fn load(&self) -> Result<Arc<dyn SegmentationModel>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(VisionError::model("model file is corrupt"));
        }
        Ok(Arc::new(BlockSegmenter {
            fraction: self.fraction,
            work: self.work,
        }))
    }
}

/// Pose model reporting a scripted number of confident ankles per call
struct ScriptedPose {
    script: Vec<usize>,
    cursor: Arc<AtomicUsize>,
}

#[async_trait]
impl PoseModel for ScriptedPose {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn estimate_poses(&self, image: &RgbaImage) -> Result<Vec<Pose>> {
        let call = self.cursor.fetch_add(1, Ordering::SeqCst);
        let ankles = self.script.get(call % self.script.len()).copied().unwrap_or(0);
        let (width, height) = image.dimensions();

        let mut keypoints = vec![Keypoint {
            name: Some("nose".to_string()),
            x: width as f32 / 2.0,
            y: 5.0,
            score: 0.9,
        }];
        keypoints.extend(
            ["left_ankle", "right_ankle"]
                .iter()
                .take(ankles)
                .map(|name| Keypoint {
                    name: Some((*name).to_string()),
                    x: width as f32 / 2.0,
                    y: height as f32 - 5.0,
                    score: 0.8,
                }),
        );
        // Low-confidence ankles never count
        keypoints.push(Keypoint {
            name: Some("left_ankle".to_string()),
            x: 0.0,
            y: 0.0,
            score: 0.1,
        });

        Ok(vec![Pose {
            keypoints,
            score: Some(0.7),
        }])
    }
}

/// Pose backend whose model replays `script` in a loop
pub struct ScriptedPoseBackend {
    script: Vec<usize>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedPoseBackend {
    pub fn new(script: Vec<usize>) -> Self {
        assert!(!script.is_empty(), "script needs at least one entry");
        Self {
            script,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl ModelBackend<dyn PoseModel> for ScriptedPoseBackend {
    fn name(&self) -> &str {
        "scripted-backend"
    }

    async fn load(&self) -> Result<Arc<dyn PoseModel>> {
        Ok(Arc::new(ScriptedPose {
            script: self.script.clone(),
            cursor: Arc::clone(&self.calls),
        }))
    }
}
