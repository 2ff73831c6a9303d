//! Configuration types for the image analysis pipeline

use crate::error::{Result, VisionError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Bounding-box and smart-padding parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CropConfig {
    /// Pixels with alpha strictly above this value belong to the subject
    pub alpha_threshold: u8,
    /// Mask confidences below this value are background
    pub mask_threshold: f32,
    /// Padding on each side as a fraction of the subject width
    pub horizontal_padding: f32,
    /// Padding on each side as a fraction of the subject height
    pub vertical_padding: f32,
}

impl Default for CropConfig {
    fn default() -> Self {
        Self {
            alpha_threshold: 10,
            mask_threshold: 0.5,
            horizontal_padding: 0.12,
            vertical_padding: 0.08,
        }
    }
}

/// Colour-distance fallback used when segmentation is unavailable
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChromaKeyConfig {
    /// Edge length of the top-left block sampled for the background colour
    pub sample_size: u32,
    /// Pixels closer than this Euclidean RGB distance become transparent
    pub distance_threshold: f32,
}

impl Default for ChromaKeyConfig {
    fn default() -> Self {
        Self {
            sample_size: 10,
            distance_threshold: 30.0,
        }
    }
}

/// Maximum output dimensions of the optimization pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResizeConfig {
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for ResizeConfig {
    fn default() -> Self {
        Self {
            max_width: 1200,
            max_height: 1600,
        }
    }
}

/// Quorum and retry parameters of the foot-visibility validator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FootValidationConfig {
    /// Independent detection passes per attempt
    pub checks_per_attempt: usize,
    /// Attempts allowed before failing safe
    pub max_retries: u32,
    /// Minimum keypoint score for an ankle to count
    pub confidence_threshold: f32,
    /// Ankles a passing check must find
    pub expected_feet: usize,
    /// Attempts with at most this many passes fail immediately
    pub fail_at_most: usize,
    /// Attempts with at least this many passes succeed immediately
    pub pass_at_least: usize,
}

impl Default for FootValidationConfig {
    fn default() -> Self {
        Self {
            checks_per_attempt: 4,
            max_retries: 10,
            confidence_threshold: 0.3,
            expected_feet: 2,
            fail_at_most: 1,
            pass_at_least: 3,
        }
    }
}

/// Time bounds for model loading and inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelLoadingConfig {
    /// Upper bound on a single model load (`None` waits forever)
    #[serde(with = "optional_secs")]
    pub load_timeout: Option<Duration>,
    /// Upper bound on a single inference call (`None` waits forever)
    #[serde(with = "optional_secs")]
    pub inference_timeout: Option<Duration>,
}

impl Default for ModelLoadingConfig {
    fn default() -> Self {
        Self {
            load_timeout: Some(Duration::from_secs(120)),
            inference_timeout: None,
        }
    }
}

mod optional_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<f64>::deserialize(deserializer)?;
        secs.map(|s| {
            if s.is_finite() && s >= 0.0 {
                Ok(Duration::from_secs_f64(s))
            } else {
                Err(serde::de::Error::custom(format!("invalid timeout: {s}")))
            }
        })
        .transpose()
    }
}

/// Configuration for the whole pipeline
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub crop: CropConfig,
    pub chroma: ChromaKeyConfig,
    pub resize: ResizeConfig,
    pub feet: FootValidationConfig,
    pub models: ModelLoadingConfig,
}

impl VisionConfig {
    #[must_use]
    pub fn builder() -> VisionConfigBuilder {
        VisionConfigBuilder::default()
    }

    /// Load and validate a configuration from a JSON file
    ///
    /// Missing fields take their default values.
    ///
    /// # Errors
    /// - The file cannot be read
    /// - The JSON is malformed
    /// - A value fails validation
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| VisionError::file_io_error("read config file", path, &e))?;
        Self::from_json_str(&content)
    }

    /// Parse and validate a configuration from a JSON string
    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| VisionError::invalid_config(format!("Malformed config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration parameters
    ///
    /// # Errors
    /// - Thresholds outside `[0, 1]`
    /// - Negative or non-finite padding and distance values
    /// - Zero resize bounds
    /// - Inconsistent quorum settings or a zero retry budget
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, value: f32, recommended: f32| {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(VisionError::config_value_error(
                    name,
                    value,
                    "0.0-1.0",
                    Some(recommended),
                ))
            }
        };
        let non_negative = |name: &str, value: f32, recommended: f32| {
            if value.is_finite() && value >= 0.0 {
                Ok(())
            } else {
                Err(VisionError::config_value_error(
                    name,
                    value,
                    ">= 0.0",
                    Some(recommended),
                ))
            }
        };

        unit("mask threshold", self.crop.mask_threshold, 0.5)?;
        non_negative("horizontal padding", self.crop.horizontal_padding, 0.12)?;
        non_negative("vertical padding", self.crop.vertical_padding, 0.08)?;
        non_negative("chroma distance threshold", self.chroma.distance_threshold, 30.0)?;
        unit("keypoint confidence threshold", self.feet.confidence_threshold, 0.3)?;

        if self.chroma.sample_size == 0 {
            return Err(VisionError::config_value_error(
                "chroma sample size",
                0,
                ">= 1",
                Some(10),
            ));
        }
        if self.resize.max_width == 0 || self.resize.max_height == 0 {
            return Err(VisionError::invalid_config(format!(
                "Resize bounds must be non-zero, got {}x{}",
                self.resize.max_width, self.resize.max_height
            )));
        }

        let feet = &self.feet;
        if feet.max_retries == 0 {
            return Err(VisionError::config_value_error(
                "max retries",
                0,
                ">= 1",
                Some(10),
            ));
        }
        if feet.checks_per_attempt == 0 {
            return Err(VisionError::config_value_error(
                "checks per attempt",
                0,
                ">= 1",
                Some(4),
            ));
        }
        if feet.fail_at_most >= feet.pass_at_least || feet.pass_at_least > feet.checks_per_attempt
        {
            return Err(VisionError::invalid_config(format!(
                "Quorum must satisfy fail_at_most < pass_at_least <= checks_per_attempt, got {} < {} <= {}",
                feet.fail_at_most, feet.pass_at_least, feet.checks_per_attempt
            )));
        }

        Ok(())
    }
}

/// Builder for `VisionConfig`
#[derive(Debug, Default)]
pub struct VisionConfigBuilder {
    config: VisionConfig,
}

impl VisionConfigBuilder {
    #[must_use]
    pub fn crop(mut self, crop: CropConfig) -> Self {
        self.config.crop = crop;
        self
    }

    #[must_use]
    pub fn chroma(mut self, chroma: ChromaKeyConfig) -> Self {
        self.config.chroma = chroma;
        self
    }

    /// Set the maximum output dimensions of the optimization pipeline
    #[must_use]
    pub fn max_dimensions(mut self, max_width: u32, max_height: u32) -> Self {
        self.config.resize = ResizeConfig {
            max_width,
            max_height,
        };
        self
    }

    #[must_use]
    pub fn feet(mut self, feet: FootValidationConfig) -> Self {
        self.config.feet = feet;
        self
    }

    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.feet.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn load_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.models.load_timeout = timeout;
        self
    }

    #[must_use]
    pub fn inference_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.models.inference_timeout = timeout;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<VisionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
