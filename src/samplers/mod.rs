//! # Reverse process samplers
//!
//! A sampler turns the model prediction at `t` into the latent at the earlier
//! timestep `t_prev`. Samplers are stateless between calls: everything a step
//! needs is passed in, including the random number generator.

use core::str::FromStr;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use rand::Rng;

use crate::error::{DiffusionError, Result};
use crate::models::{Context, Denoiser};
use crate::schedulers::{NoiseSchedule, Timestep};

pub mod ancestral;
pub mod ddim;
pub mod guidance;

pub use ancestral::{AncestralSampler, AncestralSamplerConfig, VarianceType};
pub use ddim::{DdimSampler, DdimSamplerConfig};

/// One reverse transition of the diffusion process.
pub trait ReverseProcessSampler {
    /// Name used to select the sampler.
    fn name(&self) -> &'static str;

    /// Whether the sampler can run on `schedule`.
    fn supports(&self, schedule: &NoiseSchedule) -> bool;

    /// Computes `x_{t_prev}` from `x_t`.
    ///
    /// `t_prev` must precede `t`; `None` targets the clean signal and marks the
    /// terminal step of a trajectory.
    #[allow(clippy::too_many_arguments)]
    fn step<B, M, R, const D: usize>(
        &self,
        schedule: &NoiseSchedule,
        model: &M,
        x_t: Tensor<B, D>,
        t: Timestep,
        t_prev: Option<Timestep>,
        context: &Context<B, D>,
        guidance_scale: Option<f64>,
        rng: &mut R,
    ) -> Result<Tensor<B, D>>
    where
        B: Backend,
        M: Denoiser<B, D> + ?Sized,
        R: Rng + ?Sized;
}

/// Checks the schedule mode and the ordering of `t` and `t_prev`.
pub(crate) fn check_transition<S: ReverseProcessSampler + ?Sized>(
    sampler: &S,
    schedule: &NoiseSchedule,
    t: Timestep,
    t_prev: Option<Timestep>,
) -> Result<()> {
    if !sampler.supports(schedule) {
        return Err(DiffusionError::UnsupportedSchedule {
            sampler: sampler.name(),
            mode: schedule.mode(),
        });
    }
    schedule.validate(t)?;
    if let Some(prev) = t_prev {
        schedule.validate(prev)?;
        if !prev.is_before(&t) {
            return Err(DiffusionError::invalid_timestep(
                prev,
                format!("the reverse target must precede {t}"),
            ));
        }
    }
    Ok(())
}

/// The available samplers.
#[derive(Debug, Clone)]
pub enum Sampler {
    Ancestral(AncestralSampler),
    Ddim(DdimSampler),
}

impl Sampler {
    /// Builds a sampler with its default configuration from its name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "ancestral" => Ok(Sampler::Ancestral(AncestralSamplerConfig::new().init())),
            "ddim" => Ok(Sampler::Ddim(DdimSamplerConfig::new().init()?)),
            _ => Err(DiffusionError::UnsupportedSampler(name.to_string())),
        }
    }
}

impl FromStr for Sampler {
    type Err = DiffusionError;

    fn from_str(name: &str) -> Result<Self> {
        Self::from_name(name)
    }
}

impl From<AncestralSampler> for Sampler {
    fn from(sampler: AncestralSampler) -> Self {
        Sampler::Ancestral(sampler)
    }
}

impl From<DdimSampler> for Sampler {
    fn from(sampler: DdimSampler) -> Self {
        Sampler::Ddim(sampler)
    }
}

impl ReverseProcessSampler for Sampler {
    fn name(&self) -> &'static str {
        match self {
            Sampler::Ancestral(sampler) => sampler.name(),
            Sampler::Ddim(sampler) => sampler.name(),
        }
    }

    fn supports(&self, schedule: &NoiseSchedule) -> bool {
        match self {
            Sampler::Ancestral(sampler) => sampler.supports(schedule),
            Sampler::Ddim(sampler) => sampler.supports(schedule),
        }
    }

    fn step<B, M, R, const D: usize>(
        &self,
        schedule: &NoiseSchedule,
        model: &M,
        x_t: Tensor<B, D>,
        t: Timestep,
        t_prev: Option<Timestep>,
        context: &Context<B, D>,
        guidance_scale: Option<f64>,
        rng: &mut R,
    ) -> Result<Tensor<B, D>>
    where
        B: Backend,
        M: Denoiser<B, D> + ?Sized,
        R: Rng + ?Sized,
    {
        match self {
            Sampler::Ancestral(sampler) => {
                sampler.step(schedule, model, x_t, t, t_prev, context, guidance_scale, rng)
            }
            Sampler::Ddim(sampler) => {
                sampler.step(schedule, model, x_t, t, t_prev, context, guidance_scale, rng)
            }
        }
    }
}
