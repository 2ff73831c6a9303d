//! Foot-visibility validation
//!
//! Pose estimation on a single frame is noisy, so a photo is judged by a
//! quorum: each attempt runs several independent detection passes and counts
//! how many of them see both ankles. Clear majorities decide at once, a split
//! vote triggers another attempt, and a photo that stays ambiguous is rejected.

use crate::{
    config::{FootValidationConfig, ModelLoadingConfig, VisionConfig},
    error::{Result, VisionError},
    inference::{ModelBackend, PoseModel},
    provider::{with_timeout, FailurePolicy, LazyModel},
    services::ImageIOService,
    types::{CheckSummary, FootDetection, Keypoint, ValidationVerdict, VerdictReason},
};
use image::RgbaImage;
use instant::Instant;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Keypoint names of the 17-point COCO skeleton, by index
pub const COCO_KEYPOINT_NAMES: [&str; 17] = [
    "nose",
    "left_eye",
    "right_eye",
    "left_ear",
    "right_ear",
    "left_shoulder",
    "right_shoulder",
    "left_elbow",
    "right_elbow",
    "left_wrist",
    "right_wrist",
    "left_hip",
    "right_hip",
    "left_knee",
    "right_knee",
    "left_ankle",
    "right_ankle",
];

/// Collect the confidently detected ankles of one pose
///
/// Keypoints without a name are named by their COCO index.
#[must_use]
pub fn count_feet(keypoints: &[Keypoint], confidence_threshold: f32) -> FootDetection {
    let ankles: Vec<Keypoint> = keypoints
        .iter()
        .enumerate()
        .filter(|(_, keypoint)| keypoint.score >= confidence_threshold)
        .filter_map(|(index, keypoint)| {
            let name = keypoint
                .name
                .as_deref()
                .or_else(|| COCO_KEYPOINT_NAMES.get(index).copied())?;
            name.contains("ankle").then(|| Keypoint {
                name: Some(name.to_string()),
                ..keypoint.clone()
            })
        })
        .collect();

    FootDetection {
        count: ankles.len(),
        ankles,
    }
}

/// How a single attempt's pass count is judged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Pass,
    Fail,
    Ambiguous,
}

/// Judge one attempt; failing takes precedence when thresholds overlap
#[must_use]
pub fn classify_attempt(pass_count: usize, config: &FootValidationConfig) -> AttemptOutcome {
    if pass_count <= config.fail_at_most {
        AttemptOutcome::Fail
    } else if pass_count >= config.pass_at_least {
        AttemptOutcome::Pass
    } else {
        AttemptOutcome::Ambiguous
    }
}

/// Quorum-based validator deciding whether both feet are visible
///
/// The pose model loads lazily on first use. A failed load is not
/// remembered, so the next validation tries again.
pub struct FootValidator {
    model: LazyModel<dyn PoseModel>,
    config: FootValidationConfig,
    inference_timeout: Option<Duration>,
}

impl FootValidator {
    pub fn new(backend: Arc<dyn ModelBackend<dyn PoseModel>>, config: &VisionConfig) -> Self {
        Self::with_settings(backend, config.feet, config.models)
    }

    pub fn with_settings(
        backend: Arc<dyn ModelBackend<dyn PoseModel>>,
        config: FootValidationConfig,
        models: ModelLoadingConfig,
    ) -> Self {
        Self {
            model: LazyModel::new("pose", backend, FailurePolicy::Retry)
                .with_load_timeout(models.load_timeout),
            config,
            inference_timeout: models.inference_timeout,
        }
    }

    #[must_use]
    pub fn config(&self) -> &FootValidationConfig {
        &self.config
    }

    /// The lazily loaded pose model handle
    #[must_use]
    pub fn model(&self) -> &LazyModel<dyn PoseModel> {
        &self.model
    }

    /// Run pose estimation once and count the confident ankles of the first pose
    ///
    /// # Errors
    /// - `ModelUnavailable` if the pose model cannot be loaded
    /// - Inference errors from the pose model
    pub async fn detect_feet_once(&self, image: &RgbaImage) -> Result<FootDetection> {
        let model = self.model.acquire().await?;
        let poses = with_timeout(
            self.inference_timeout,
            "pose estimation",
            model.estimate_poses(image),
        )
        .await?;

        let detection = poses
            .first()
            .map(|pose| count_feet(&pose.keypoints, self.config.confidence_threshold))
            .unwrap_or_default();
        debug!(
            poses = poses.len(),
            ankles = detection.count,
            "Foot detection pass"
        );
        Ok(detection)
    }

    /// Run `check_count` independent detection passes
    ///
    /// A pass succeeds only when it sees exactly the expected number of feet.
    pub async fn run_checks(&self, image: &RgbaImage, check_count: usize) -> Result<CheckSummary> {
        let mut passed = Vec::with_capacity(check_count);
        for _ in 0..check_count {
            let detection = self.detect_feet_once(image).await?;
            passed.push(detection.count == self.config.expected_feet);
        }

        let pass_count = passed.iter().filter(|&&ok| ok).count();
        Ok(CheckSummary {
            pass_count,
            fail_count: check_count - pass_count,
            total_checks: check_count,
            passed,
        })
    }

    /// Validate with the configured retry budget
    pub async fn validate(&self, image: &RgbaImage) -> Result<ValidationVerdict> {
        self.validate_with_retry(image, self.config.max_retries).await
    }

    /// Validate, retrying split votes up to `max_retries` attempts in total
    ///
    /// Running out of attempts yields an invalid verdict rather than an error.
    ///
    /// # Errors
    /// - `InvalidConfig` if `max_retries` is zero
    /// - Pose model loading or inference errors
    #[instrument(skip(self, image), fields(width = image.width(), height = image.height()))]
    pub async fn validate_with_retry(
        &self,
        image: &RgbaImage,
        max_retries: u32,
    ) -> Result<ValidationVerdict> {
        if max_retries == 0 {
            return Err(VisionError::config_value_error(
                "max_retries",
                max_retries,
                "at least 1",
                Some(10),
            ));
        }

        let checks = self.config.checks_per_attempt;
        let mut last_pass_count = 0;

        for attempt in 1..=max_retries {
            let summary = self.run_checks(image, checks).await?;
            last_pass_count = summary.pass_count;
            debug!(attempt, pass_count = summary.pass_count, checks, "Foot validation attempt");

            let reason = match classify_attempt(summary.pass_count, &self.config) {
                AttemptOutcome::Ambiguous => continue,
                AttemptOutcome::Fail if summary.pass_count == 0 => VerdictReason::NoFeetDetected,
                AttemptOutcome::Fail => VerdictReason::FeetLikelyNotVisible,
                AttemptOutcome::Pass => VerdictReason::FeetDetectedConsistently,
            };
            return Ok(ValidationVerdict {
                valid: reason == VerdictReason::FeetDetectedConsistently,
                pass_count: summary.pass_count,
                total_checks: checks,
                attempts: attempt,
                reason,
            });
        }

        warn!(max_retries, "Foot validation still ambiguous, rejecting");
        Ok(ValidationVerdict {
            valid: false,
            pass_count: last_pass_count,
            total_checks: checks,
            attempts: max_retries,
            reason: VerdictReason::AmbiguousAfterMaxRetries,
        })
    }

    /// Decode an uploaded photo and validate it
    ///
    /// # Errors
    /// - `Decode` if the bytes are not an image
    /// - Pose model loading or inference errors
    pub async fn validate_batch_result(&self, bytes: &[u8]) -> Result<ValidationVerdict> {
        let started = Instant::now();
        let image = ImageIOService::decode_rgba(bytes)?;
        let verdict = self.validate(&image).await?;

        info!(
            valid = verdict.valid,
            reason = %verdict.reason,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "{}",
            verdict.summary()
        );
        Ok(verdict)
    }

    /// Load the pose model ahead of the first validation
    ///
    /// Returns whether the model is ready; failures are only logged.
    pub async fn preload(&self) -> bool {
        match self.model.acquire().await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Pose model preload failed");
                false
            },
        }
    }

    /// Release the pose model; the next validation loads it again
    pub fn cleanup(&self) {
        if let Some(model) = self.model.reset() {
            info!(model = model.name(), "Releasing pose model");
            model.dispose();
        }
    }
}

impl std::fmt::Debug for FootValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FootValidator")
            .field("model", &self.model)
            .field("config", &self.config)
            .finish()
    }
}
