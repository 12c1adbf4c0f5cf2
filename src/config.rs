//! # Configuration
//!
//! YAML configuration of a diffusion model and of a cascade of them.
//!
//! ```yaml
//! data:
//!   image_size: 64
//!   num_channels: 3
//! diffusion:
//!   noise_scheduler:
//!     steps: 1000
//!     schedule_type: cosine
//!   prediction_type: epsilon
//! super_resolution:
//!   low_resolution_size: 16
//!   conditioning_key: low_resolution
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DiffusionError, Result};
use crate::schedulers::{NoiseSchedule, NoiseScheduleConfig, PredictionType};

/// Key of the low resolution conditioning when none is configured.
pub const DEFAULT_CONDITIONING_KEY: &str = "low_resolution";

/// Shape of the data a model generates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Height and width of the square samples.
    pub image_size: usize,
    #[serde(default = "default_num_channels")]
    pub num_channels: usize,
    /// Number of frames of a video sample, `None` for images.
    #[serde(default)]
    pub input_number_of_frames: Option<usize>,
}

fn default_num_channels() -> usize {
    3
}

/// Exponential moving average settings of training.
///
/// Carried along with the model configuration, sampling never reads them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmaConfig {
    pub target_ema_mode: Option<String>,
    pub start_ema: Option<f64>,
    pub scale_mode: Option<String>,
    pub start_scales: Option<usize>,
    pub end_scales: Option<usize>,
    pub distill_steps_per_iter: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DiffusionSection {
    #[serde(default)]
    pub noise_scheduler: NoiseScheduleConfig,
    #[serde(default)]
    pub prediction_type: PredictionType,
    #[serde(default)]
    pub exponential_moving_average: Option<EmaConfig>,
}

/// Marks a model as a super resolution stage of a cascade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuperResolutionConfig {
    /// Size the previous stage's output is resized to before conditioning.
    pub low_resolution_size: usize,
    #[serde(default = "default_conditioning_key")]
    pub conditioning_key: String,
}

fn default_conditioning_key() -> String {
    DEFAULT_CONDITIONING_KEY.to_string()
}

/// Configuration of a single diffusion model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffusionConfig {
    pub data: DataConfig,
    #[serde(default)]
    pub diffusion: DiffusionSection,
    #[serde(default)]
    pub super_resolution: Option<SuperResolutionConfig>,
}

impl DiffusionConfig {
    pub fn new(data: DataConfig, noise_scheduler: NoiseScheduleConfig) -> Self {
        Self {
            data,
            diffusion: DiffusionSection {
                noise_scheduler,
                ..Default::default()
            },
            super_resolution: None,
        }
    }

    pub fn with_prediction_type(mut self, prediction_type: PredictionType) -> Self {
        self.diffusion.prediction_type = prediction_type;
        self
    }

    pub fn with_super_resolution(
        mut self,
        low_resolution_size: usize,
        conditioning_key: impl Into<String>,
    ) -> Self {
        self.super_resolution = Some(SuperResolutionConfig {
            low_resolution_size,
            conditioning_key: conditioning_key.into(),
        });
        self
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_yaml_str(&fs::read_to_string(path)?)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.data.image_size == 0 || self.data.num_channels == 0 {
            return Err(DiffusionError::InvalidConfig(
                "image_size and num_channels must be positive".into(),
            ));
        }
        if self.data.input_number_of_frames == Some(0) {
            return Err(DiffusionError::InvalidConfig(
                "input_number_of_frames must be positive".into(),
            ));
        }
        if let Some(sr) = &self.super_resolution {
            if sr.low_resolution_size == 0 || sr.low_resolution_size > self.data.image_size {
                return Err(DiffusionError::InvalidConfig(format!(
                    "low_resolution_size {} must be in [1, {}]",
                    sr.low_resolution_size, self.data.image_size
                )));
            }
        }
        Ok(())
    }

    /// Shape of one sample without the batch dimension: `[C, H, W]` for
    /// images, `[C, F, H, W]` for videos.
    pub fn sample_shape(&self) -> Vec<usize> {
        let data = &self.data;
        match data.input_number_of_frames {
            Some(frames) => vec![data.num_channels, frames, data.image_size, data.image_size],
            None => vec![data.num_channels, data.image_size, data.image_size],
        }
    }

    pub fn noise_schedule(&self) -> Result<NoiseSchedule> {
        self.diffusion.noise_scheduler.init()
    }
}

/// Configuration of a cascade, low resolution stage first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeConfig {
    pub diffusion_cascade: Vec<DiffusionConfig>,
}

impl CascadeConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        if config.diffusion_cascade.is_empty() {
            return Err(DiffusionError::InvalidConfig("diffusion_cascade is empty".into()));
        }
        for stage in &config.diffusion_cascade {
            stage.validate()?;
        }
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_yaml_str(&fs::read_to_string(path)?)
    }
}
