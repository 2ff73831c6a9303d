#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

//! # Try-On Vision
//!
//! Image analysis for a virtual try-on app: person segmentation, background
//! removal, smart auto-cropping, upload optimization and foot-visibility
//! validation.
//!
//! ## Features
//!
//! - **Lazy models**: segmentation and pose models load once, on first use,
//!   shared by every caller that races for them
//! - **Graceful degradation**: background removal falls back from
//!   segmentation to a corner-color chroma key, then to the untouched photo
//! - **Smart cropping**: asymmetric padding around the person, widened to keep
//!   the photo's aspect ratio
//! - **Foot validation**: repeated pose checks with a pass/fail quorum and a
//!   bounded retry budget
//! - **Pure Rust inference**: Tract runs ONNX models (enable with `tract`)
//! - **CLI Integration**: optional command-line interface (enable with `cli`)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tryon_vision::{ModelSource, VisionProcessor};
//! use tryon_vision::backends::{PoseModelConfig, SegmentationModelConfig};
//!
//! # async fn example(upload: Vec<u8>) -> anyhow::Result<()> {
//! let processor = VisionProcessor::builder()
//!     .segmentation_model(
//!         "models/selfie_segmentation.onnx".parse::<ModelSource>()?,
//!         SegmentationModelConfig::default(),
//!     )
//!     .pose_model(
//!         "models/movenet_lightning.onnx".parse::<ModelSource>()?,
//!         PoseModelConfig::default(),
//!     )
//!     .build()?;
//!
//! let optimized = processor.optimize(&upload).await?;
//! optimized.save("optimized.png")?;
//!
//! let verdict = processor.validate_feet(&upload).await?;
//! println!("{}", verdict.summary());
//! # Ok(())
//! # }
//! ```
//!
//! ### Feature Flags
//!
//! - `tract` (default): pure Rust ONNX backends for segmentation and pose
//! - `cli` (default): command-line interface and progress reporting
//! - `tracing-json`: JSON log output for the CLI
//! - `tracing-files`: log file output for the CLI
//!
//! ### Library-Only Usage
//!
//! ```toml
//! [dependencies]
//! tryon-vision = { version = "0.1", default-features = false, features = ["tract"] }
//! ```

pub mod background;
pub mod backends;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod cropping;
pub mod download;
pub mod error;
pub mod feet;
pub mod inference;
pub mod models;
pub mod pipeline;
pub mod processor;
pub mod provider;
pub mod segmentation;
pub mod services;
#[cfg(feature = "cli")]
pub mod tracing_config;
pub mod types;

use tokio::io::AsyncRead;

// Public API exports
pub use background::{chroma_key, estimate_background_color, BackgroundRemover, RemovalStrategy};
pub use config::{
    ChromaKeyConfig, CropConfig, FootValidationConfig, ModelLoadingConfig, ResizeConfig,
    VisionConfig, VisionConfigBuilder,
};
pub use cropping::{find_bounds, preserve_aspect_ratio, smart_pad, CropEngine};
pub use download::{validate_model_url, ModelDownloader};
pub use error::{Result, VisionError};
pub use feet::{classify_attempt, count_feet, AttemptOutcome, FootValidator};
pub use inference::{ModelBackend, PoseModel, SegmentationModel};
pub use models::ModelSource;
pub use pipeline::{resize_image, ImageOptimizer};
pub use processor::{VisionProcessor, VisionProcessorBuilder};
pub use provider::{FailurePolicy, LazyModel, ModelStatus};
pub use segmentation::{SegmentOutcome, SegmentationProvider};
pub use services::ImageIOService;
pub use types::{
    BoundingBox, CheckSummary, CropRect, CropResult, FootDetection, Keypoint, OptimizedImage,
    Pose, RemovalMethod, RemovedBackground, SegmentationMask, ValidationVerdict, VerdictReason,
};

#[cfg(feature = "cli")]
pub use tracing_config::{init_cli_tracing, TracingConfig, TracingFormat, TracingOutput};

/// Optimize an image read from an async stream
///
/// Reads the whole stream into memory, then runs the processor's optimization
/// pipeline on it.
///
/// ```rust,no_run
/// use tryon_vision::{optimize_from_reader, VisionProcessor};
/// use tokio::fs::File;
///
/// # async fn example() -> anyhow::Result<()> {
/// let processor = VisionProcessor::builder().build()?;
/// let file = File::open("upload.jpg").await?;
/// let optimized = optimize_from_reader(file, &processor).await?;
/// optimized.save("upload_optimized.png")?;
/// # Ok(())
/// # }
/// ```
pub async fn optimize_from_reader<R: AsyncRead + Unpin>(
    reader: R,
    processor: &VisionProcessor,
) -> Result<OptimizedImage> {
    let bytes = ImageIOService::read_bytes(reader).await?;
    processor.optimize(&bytes).await
}
