//! Tract backends for segmentation and pose estimation
//!
//! Pure Rust ONNX inference through the Tract engine. Both models run on the
//! CPU with no native dependencies; loading parses and optimizes the graph on
//! a blocking worker thread.

use crate::{
    error::{Result, VisionError},
    feet::COCO_KEYPOINT_NAMES,
    inference::{ModelBackend, PoseModel, SegmentationModel},
    models::ModelSource,
    types::{Keypoint, Pose, SegmentationMask},
};
use async_trait::async_trait;
use image::{imageops::FilterType, Rgba, RgbaImage};
use instant::Instant;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tract_onnx::prelude::*;

// Type alias for the complex Tract model type
type TractModel = RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Memory layout of a 4D image tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// `[batch, channels, height, width]`
    Nchw,
    /// `[batch, height, width, channels]`
    Nhwc,
}

/// Input and output conventions of a segmentation model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationModelConfig {
    pub input_width: u32,
    pub input_height: u32,
    pub layout: TensorLayout,
    /// Per-channel mean subtracted after scaling pixels to `[0, 1]`
    pub mean: [f32; 3],
    /// Per-channel divisor applied after the mean
    pub std: [f32; 3],
    /// Output channel holding the person confidence
    pub foreground_channel: usize,
    /// Output values are logits rather than probabilities
    pub apply_sigmoid: bool,
}

impl Default for SegmentationModelConfig {
    /// Matches the 256x256 selfie segmentation model
    fn default() -> Self {
        Self {
            input_width: 256,
            input_height: 256,
            layout: TensorLayout::Nhwc,
            mean: [0.0; 3],
            std: [1.0; 3],
            foreground_channel: 0,
            apply_sigmoid: false,
        }
    }
}

fn build_model(model_data: Vec<u8>, input_fact: InferenceFact) -> Result<TractModel> {
    onnx()
        .model_for_read(&mut std::io::Cursor::new(model_data))
        .map_err(|e| VisionError::model(format!("Failed to load ONNX model: {e}")))?
        .with_input_fact(0, input_fact)
        .map_err(|e| VisionError::model(format!("Failed to set model input: {e}")))?
        .into_optimized()
        .map_err(|e| VisionError::model(format!("Failed to optimize model: {e}")))?
        .into_runnable()
        .map_err(|e| VisionError::model(format!("Failed to create runnable model: {e}")))
}

async fn load_runnable(
    source: &ModelSource,
    input_fact: InferenceFact,
    show_progress: bool,
) -> Result<TractModel> {
    let load_start = Instant::now();
    let model_data = source.load_bytes_with_progress(show_progress).await?;
    #[allow(clippy::cast_precision_loss)]
    let size_mb = model_data.len() as f64 / (1024.0 * 1024.0);
    log::info!("Initializing Tract model {} ({size_mb:.2} MB)", source.display_name());

    let model = tokio::task::spawn_blocking(move || build_model(model_data, input_fact))
        .await
        .map_err(|e| VisionError::internal(format!("Model build task failed: {e}")))??;

    log::info!(
        "Tract model {} ready in {}ms",
        source.display_name(),
        load_start.elapsed().as_millis()
    );
    Ok(model)
}

fn run_model(model: &TractModel, input: Tensor) -> Result<(Vec<usize>, Vec<f32>)> {
    let outputs = model
        .run(tvec![input.into()])
        .map_err(|e| VisionError::inference(format!("Tract inference failed: {e}")))?;

    let output = outputs
        .into_iter()
        .next()
        .ok_or_else(|| VisionError::inference("No output tensor found"))?
        .into_arc_tensor();

    let values = output
        .as_slice::<f32>()
        .map_err(|e| VisionError::inference(format!("Failed to read output tensor: {e}")))?;
    Ok((output.shape().to_vec(), values.to_vec()))
}

/// Run inference on the blocking pool so callers can time it out
async fn run_model_blocking(model: Arc<TractModel>, input: Tensor) -> Result<(Vec<usize>, Vec<f32>)> {
    tokio::task::spawn_blocking(move || run_model(&model, input))
        .await
        .map_err(|e| VisionError::internal(format!("Inference task failed: {e}")))?
}

/// Loads a [`TractSegmenter`] from a model source
#[derive(Debug, Clone)]
pub struct TractSegmentationBackend {
    source: ModelSource,
    config: SegmentationModelConfig,
    name: String,
    show_progress: bool,
}

impl TractSegmentationBackend {
    pub fn new(source: ModelSource, config: SegmentationModelConfig) -> Self {
        let name = format!("tract:{}", source.display_name());
        Self {
            source,
            config,
            name,
            show_progress: false,
        }
    }

    /// Draw a progress bar while a URL model downloads
    #[must_use]
    pub fn with_download_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    #[must_use]
    pub fn shows_download_progress(&self) -> bool {
        self.show_progress
    }
}

#[async_trait]
impl ModelBackend<dyn SegmentationModel> for TractSegmentationBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self) -> Result<Arc<dyn SegmentationModel>> {
        let config = self.config.clone();
        if config.input_width == 0 || config.input_height == 0 {
            return Err(VisionError::invalid_config(
                "Segmentation model input size must be non-zero",
            ));
        }

        let (w, h) = (config.input_width as usize, config.input_height as usize);
        let shape = match config.layout {
            TensorLayout::Nchw => [1, 3, h, w],
            TensorLayout::Nhwc => [1, h, w, 3],
        };
        let model = load_runnable(&self.source, f32::fact(shape).into(), self.show_progress).await?;
        Ok(Arc::new(TractSegmenter {
            model: Arc::new(model),
            config,
        }))
    }
}

/// Segmentation model running on Tract
pub struct TractSegmenter {
    model: Arc<TractModel>,
    config: SegmentationModelConfig,
}

impl TractSegmenter {
    fn preprocess(&self, image: &RgbaImage) -> Result<Tensor> {
        let config = &self.config;
        let (w, h) = (config.input_width, config.input_height);
        let resized = image::imageops::resize(image, w, h, FilterType::Triangle);
        let (w, h) = (w as usize, h as usize);

        let normalize = |pixel: &Rgba<u8>, c: usize| {
            let mean = config.mean.get(c).copied().unwrap_or(0.0);
            let std = config.std.get(c).copied().unwrap_or(1.0);
            (f32::from(pixel[c]) / 255.0 - mean) / std
        };

        let mut data = Vec::with_capacity(w * h * 3);
        match config.layout {
            TensorLayout::Nchw => {
                for c in 0..3 {
                    data.extend(resized.pixels().map(|p| normalize(p, c)));
                }
            },
            TensorLayout::Nhwc => {
                for pixel in resized.pixels() {
                    data.extend((0..3).map(|c| normalize(pixel, c)));
                }
            },
        }

        let shape = match config.layout {
            TensorLayout::Nchw => [1, 3, h, w],
            TensorLayout::Nhwc => [1, h, w, 3],
        };
        Tensor::from_shape(&shape, data.as_slice())
            .map_err(|e| VisionError::inference(format!("Failed to build input tensor: {e}")))
    }
}

/// Pull the foreground plane out of a segmentation output tensor
///
/// Accepts `[n, c, h, w]` / `[n, h, w, c]` (per `layout`), `[n, h, w]` and `[h, w]`.
fn extract_mask(
    shape: &[usize],
    values: &[f32],
    layout: TensorLayout,
    channel: usize,
    apply_sigmoid: bool,
) -> Result<SegmentationMask> {
    let (h, w, index): (usize, usize, Box<dyn Fn(usize, usize) -> usize>) = match (shape, layout) {
        (&[n, c, h, w], TensorLayout::Nchw) if n > 0 && channel < c => {
            (h, w, Box::new(move |x, y| (channel * h + y) * w + x))
        },
        (&[n, h, w, c], TensorLayout::Nhwc) if n > 0 && channel < c => {
            (h, w, Box::new(move |x, y| (y * w + x) * c + channel))
        },
        (&[n, h, w], _) if n > 0 => (h, w, Box::new(move |x, y| y * w + x)),
        (&[h, w], _) => (h, w, Box::new(move |x, y| y * w + x)),
        _ => {
            return Err(VisionError::inference(format!(
                "Unsupported segmentation output shape {shape:?} for {layout:?} channel {channel}"
            )))
        },
    };

    if values.len() < shape.iter().product::<usize>() {
        return Err(VisionError::inference(format!(
            "Output tensor has {} values for shape {shape:?}",
            values.len()
        )));
    }

    let plane = (0..h)
        .flat_map(|y| (0..w).map(move |x| (x, y)))
        .map(|(x, y)| {
            let value = values.get(index(x, y)).copied().unwrap_or(0.0);
            let value = if apply_sigmoid {
                1.0 / (1.0 + (-value).exp())
            } else {
                value
            };
            value.clamp(0.0, 1.0)
        })
        .collect();
    SegmentationMask::from_vec(w as u32, h as u32, plane)
}

#[async_trait]
impl SegmentationModel for TractSegmenter {
    fn name(&self) -> &str {
        "tract-segmentation"
    }

    async fn segment(&self, image: &RgbaImage) -> Result<SegmentationMask> {
        let inference_start = Instant::now();
        let input = self.preprocess(image)?;
        let (shape, values) = run_model_blocking(Arc::clone(&self.model), input).await?;

        let mask = extract_mask(
            &shape,
            &values,
            self.config.layout,
            self.config.foreground_channel,
            self.config.apply_sigmoid,
        )?;
        log::debug!(
            "Segmentation inference completed in {}ms (output {:?})",
            inference_start.elapsed().as_millis(),
            shape
        );

        let (width, height) = image.dimensions();
        Ok(mask.resized(width, height))
    }
}

/// Element type a pose model takes its input pixels as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoseInputType {
    Int32,
    Float32,
}

/// Input conventions of a single-pose keypoint model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseModelConfig {
    /// Side of the square NHWC input
    pub input_size: u32,
    pub input_type: PoseInputType,
}

impl Default for PoseModelConfig {
    /// Matches MoveNet SinglePose Lightning
    fn default() -> Self {
        Self {
            input_size: 192,
            input_type: PoseInputType::Int32,
        }
    }
}

/// Loads a [`TractPoseDetector`] from a model source
#[derive(Debug, Clone)]
pub struct TractPoseBackend {
    source: ModelSource,
    config: PoseModelConfig,
    name: String,
    show_progress: bool,
}

impl TractPoseBackend {
    pub fn new(source: ModelSource, config: PoseModelConfig) -> Self {
        let name = format!("tract:{}", source.display_name());
        Self {
            source,
            config,
            name,
            show_progress: false,
        }
    }

    /// Draw a progress bar while a URL model downloads
    #[must_use]
    pub fn with_download_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    #[must_use]
    pub fn shows_download_progress(&self) -> bool {
        self.show_progress
    }
}

#[async_trait]
impl ModelBackend<dyn PoseModel> for TractPoseBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self) -> Result<Arc<dyn PoseModel>> {
        let config = self.config.clone();
        if config.input_size == 0 {
            return Err(VisionError::invalid_config("Pose model input size must be non-zero"));
        }

        let side = config.input_size as usize;
        let shape = [1, side, side, 3];
        let fact: InferenceFact = match config.input_type {
            PoseInputType::Int32 => i32::fact(shape).into(),
            PoseInputType::Float32 => f32::fact(shape).into(),
        };
        let model = load_runnable(&self.source, fact, self.show_progress).await?;
        Ok(Arc::new(TractPoseDetector {
            model: Arc::new(model),
            config,
        }))
    }
}

/// Placement of an image letterboxed into a square model input
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    scaled_width: u32,
    scaled_height: u32,
    offset_x: u32,
    offset_y: u32,
    side: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, side: u32) -> Self {
        let scale = side as f32 / width.max(height).max(1) as f32;
        let scaled_width = ((width as f32 * scale).round() as u32).clamp(1, side);
        let scaled_height = ((height as f32 * scale).round() as u32).clamp(1, side);
        Self {
            scale,
            scaled_width,
            scaled_height,
            offset_x: (side - scaled_width) / 2,
            offset_y: (side - scaled_height) / 2,
            side,
        }
    }

    /// Map a normalized `(x, y)` in the square input back to source pixels
    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        let side = self.side as f32;
        (
            (x * side - self.offset_x as f32) / self.scale,
            (y * side - self.offset_y as f32) / self.scale,
        )
    }
}

/// Single-pose keypoint model running on Tract
pub struct TractPoseDetector {
    model: Arc<TractModel>,
    config: PoseModelConfig,
}

impl TractPoseDetector {
    fn preprocess(&self, image: &RgbaImage) -> Result<(Tensor, Letterbox)> {
        let side = self.config.input_size;
        let (width, height) = image.dimensions();
        let letterbox = Letterbox::fit(width, height, side);
        let resized = image::imageops::resize(
            image,
            letterbox.scaled_width,
            letterbox.scaled_height,
            FilterType::Triangle,
        );
        let mut canvas = RgbaImage::from_pixel(side, side, Rgba([0, 0, 0, 255]));
        image::imageops::overlay(
            &mut canvas,
            &resized,
            i64::from(letterbox.offset_x),
            i64::from(letterbox.offset_y),
        );

        let side = side as usize;
        let shape = [1, side, side, 3];
        let channels = canvas.pixels().flat_map(|p| [p[0], p[1], p[2]]);
        let tensor = match self.config.input_type {
            PoseInputType::Int32 => {
                let data: Vec<i32> = channels.map(i32::from).collect();
                Tensor::from_shape(&shape, data.as_slice())
            },
            PoseInputType::Float32 => {
                let data: Vec<f32> = channels.map(f32::from).collect();
                Tensor::from_shape(&shape, data.as_slice())
            },
        }
        .map_err(|e| VisionError::inference(format!("Failed to build input tensor: {e}")))?;

        Ok((tensor, letterbox))
    }
}

/// Decode `[.., 17, 3]` rows of normalized `(y, x, score)` into a pixel-space pose
fn decode_keypoints(values: &[f32], letterbox: &Letterbox) -> Result<Pose> {
    let needed = COCO_KEYPOINT_NAMES.len() * 3;
    let rows = values.get(..needed).ok_or_else(|| {
        VisionError::inference(format!(
            "Pose output has {} values, expected at least {needed}",
            values.len()
        ))
    })?;

    let keypoints: Vec<Keypoint> = rows
        .chunks_exact(3)
        .filter_map(|row| match *row {
            [y, x, score] => Some((y, x, score)),
            _ => None,
        })
        .zip(COCO_KEYPOINT_NAMES)
        .map(|((y, x, score), name)| {
            let (x, y) = letterbox.to_source(x, y);
            Keypoint {
                name: Some(name.to_string()),
                x,
                y,
                score,
            }
        })
        .collect();

    let score = keypoints.iter().map(|k| k.score).sum::<f32>() / keypoints.len() as f32;
    Ok(Pose {
        keypoints,
        score: Some(score),
    })
}

#[async_trait]
impl PoseModel for TractPoseDetector {
    fn name(&self) -> &str {
        "tract-pose"
    }

    async fn estimate_poses(&self, image: &RgbaImage) -> Result<Vec<Pose>> {
        let inference_start = Instant::now();
        let (input, letterbox) = self.preprocess(image)?;
        let (shape, values) = run_model_blocking(Arc::clone(&self.model), input).await?;
        let pose = decode_keypoints(&values, &letterbox)?;

        log::debug!(
            "Pose inference completed in {}ms (output {:?})",
            inference_start.elapsed().as_millis(),
            shape
        );
        Ok(vec![pose])
    }
}
