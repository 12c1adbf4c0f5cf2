use thiserror::Error;

use crate::schedulers::Timestep;

/// Errors raised while building schedules, sampling trajectories or running cascades.
#[derive(Error, Debug)]
pub enum DiffusionError {
    /// The timestep lies outside the schedule's domain.
    #[error("invalid timestep {timestep:?}: {reason}")]
    InvalidTimestep { timestep: Timestep, reason: String },

    /// The sampler cannot operate on this kind of schedule.
    #[error("sampler `{sampler}` does not support {mode} schedules")]
    UnsupportedSchedule {
        sampler: &'static str,
        mode: &'static str,
    },

    #[error("unsupported sampler `{0}`, expected one of: ancestral, ddim")]
    UnsupportedSampler(String),

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Guidance was requested but none of the conditioning keys the model needs are present.
    #[error("guidance requested without conditioning, the model requires one of {required:?}")]
    EmptyContext { required: Vec<String> },

    #[error("guidance scale must be finite and >= 0, got {0}")]
    InvalidGuidanceScale(f64),

    #[error("cannot sample with {requested} steps starting from step {start}")]
    InvalidSamplingSteps { requested: usize, start: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A cascade stage failed; the remaining stages were not run.
    #[error("cascade stage {index} failed: {source}")]
    Stage {
        index: usize,
        #[source]
        source: Box<DiffusionError>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = core::result::Result<T, DiffusionError>;

impl DiffusionError {
    pub(crate) fn invalid_timestep(timestep: Timestep, reason: impl Into<String>) -> Self {
        Self::InvalidTimestep {
            timestep,
            reason: reason.into(),
        }
    }

    pub(crate) fn shape_mismatch(expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Index of the failing cascade stage, if this error came from one.
    pub fn stage_index(&self) -> Option<usize> {
        match self {
            Self::Stage { index, .. } => Some(*index),
            _ => None,
        }
    }
}
