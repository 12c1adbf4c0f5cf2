//! # Noise schedules
//!
//! The forward (noising) process and the coefficients needed to invert it.

use core::fmt;

use serde::{Deserialize, Serialize};

pub mod noise_schedule;

pub use noise_schedule::{NoiseSchedule, Posterior};

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Linear interpolation.
    #[default]
    Linear,
    /// Linear interpolation of the square root of beta.
    ScaledLinear,
    /// Glide cosine schedule
    #[serde(alias = "cosine")]
    SquaredcosCapV2,
}

/// prediction type of the denoiser, one of `epsilon` (predicting
/// the noise of the diffusion process), `sample` (directly predicting the clean sample)
/// or `v_prediction` (see section 2.4 https://imagen.research.google/video/paper.pdf)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    #[default]
    Epsilon,
    #[serde(alias = "v")]
    VPrediction,
    Sample,
}

/// A position in the noising process.
///
/// Discrete schedules are indexed by `Index(t)` with `t` in `[0, steps)`,
/// continuous schedules by `Fraction(t)` with `t` in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Timestep {
    Index(usize),
    Fraction(f64),
}

impl Timestep {
    /// The value handed to the denoiser.
    pub fn value(&self) -> f64 {
        match *self {
            Timestep::Index(t) => t as f64,
            Timestep::Fraction(t) => t,
        }
    }

    /// Whether `self` is strictly closer to the clean signal than `other`.
    pub fn is_before(&self, other: &Timestep) -> bool {
        match (self, other) {
            (Timestep::Index(a), Timestep::Index(b)) => a < b,
            (Timestep::Fraction(a), Timestep::Fraction(b)) => a < b,
            _ => false,
        }
    }
}

impl fmt::Display for Timestep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timestep::Index(t) => write!(f, "{t}"),
            Timestep::Fraction(t) => write!(f, "{t:.4}"),
        }
    }
}

/// The configuration of a [noise schedule](NoiseSchedule).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseScheduleConfig {
    /// Number of diffusion steps used to train the model, or the nominal
    /// resolution of a continuous schedule.
    pub steps: usize,
    /// How beta evolved during training.
    #[serde(alias = "beta_schedule")]
    pub schedule_type: BetaSchedule,
    /// The value of beta at the beginning of training.
    pub beta_start: f64,
    /// The value of beta at the end of training.
    pub beta_end: f64,
    /// Upper bound for the betas of the cosine schedule.
    pub max_beta: f64,
    /// Treat timesteps as fractions of the process instead of step indices.
    pub continuous: bool,
}

impl Default for NoiseScheduleConfig {
    fn default() -> Self {
        Self {
            steps: 1000,
            schedule_type: BetaSchedule::Linear,
            beta_start: 0.0001,
            beta_end: 0.02,
            max_beta: 0.999,
            continuous: false,
        }
    }
}

impl NoiseScheduleConfig {
    pub fn new(steps: usize, schedule_type: BetaSchedule) -> Self {
        Self {
            steps,
            schedule_type,
            ..Self::default()
        }
    }

    pub fn with_betas(mut self, beta_start: f64, beta_end: f64) -> Self {
        self.beta_start = beta_start;
        self.beta_end = beta_end;
        self
    }

    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    /// Initialize a new [noise schedule](NoiseSchedule).
    pub fn init(&self) -> crate::Result<NoiseSchedule> {
        NoiseSchedule::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestep_ordering() {
        assert!(Timestep::Index(3).is_before(&Timestep::Index(4)));
        assert!(!Timestep::Index(4).is_before(&Timestep::Index(4)));
        assert!(Timestep::Fraction(0.25).is_before(&Timestep::Fraction(0.5)));
        assert!(!Timestep::Index(0).is_before(&Timestep::Fraction(0.5)));
    }

    #[test]
    fn test_schedule_config_from_yaml() {
        let config: NoiseScheduleConfig =
            serde_yaml::from_str("steps: 500\nschedule_type: cosine\ncontinuous: true\n").unwrap();

        assert_eq!(config.steps, 500);
        assert_eq!(config.schedule_type, BetaSchedule::SquaredcosCapV2);
        assert!(config.continuous);
        assert_eq!(config.beta_end, 0.02);
    }
}
