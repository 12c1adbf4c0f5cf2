//! Denoising diffusion implicit models.
//!
//! https://arxiv.org/abs/2010.02502, equation 12.

use burn::config::Config;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use rand::Rng;

use super::guidance::guided_prediction;
use super::{check_transition, ReverseProcessSampler};
use crate::error::DiffusionError;
use crate::models::{Context, Denoiser};
use crate::schedulers::{NoiseSchedule, Timestep};
use crate::utils::gaussian_noise;

/// The configuration for the [DDIM sampler](DdimSampler).
#[derive(Config, Debug)]
pub struct DdimSamplerConfig {
    /// The amount of noise to be added at each step, 0 is deterministic.
    #[config(default = 0.0)]
    pub eta: f64,
    /// Option to clip the predicted clean sample to [-1, 1].
    #[config(default = true)]
    pub clip_denoised: bool,
}

impl DdimSamplerConfig {
    /// Initialize a new [DDIM sampler](DdimSampler).
    pub fn init(&self) -> crate::Result<DdimSampler> {
        if !self.eta.is_finite() || self.eta < 0.0 {
            return Err(DiffusionError::InvalidConfig(format!(
                "eta must be finite and >= 0, got {}",
                self.eta
            )));
        }
        Ok(DdimSampler {
            eta: self.eta,
            clip_denoised: self.clip_denoised,
        })
    }
}

/// Non-Markovian sampler that can skip arbitrary steps.
///
/// Supports discrete and continuous schedules since it only needs `alpha_bar`
/// at both ends of the transition.
#[derive(Debug, Clone)]
pub struct DdimSampler {
    eta: f64,
    clip_denoised: bool,
}

impl Default for DdimSampler {
    fn default() -> Self {
        Self {
            eta: 0.0,
            clip_denoised: true,
        }
    }
}

impl DdimSampler {
    pub fn eta(&self) -> f64 {
        self.eta
    }

    /// `sigma_t` of the transition `t -> t_prev`.
    pub fn noise_scale(
        &self,
        schedule: &NoiseSchedule,
        t: Timestep,
        t_prev: Option<Timestep>,
    ) -> crate::Result<f64> {
        let alpha_prod_t = schedule.alpha_bar(t)?;
        let alpha_prod_t_prev = schedule.alpha_bar_prev(t_prev)?;
        let beta_prod_t = 1. - alpha_prod_t;
        let beta_prod_t_prev = 1. - alpha_prod_t_prev;

        let variance = (beta_prod_t_prev / beta_prod_t) * (1. - alpha_prod_t / alpha_prod_t_prev);
        Ok(self.eta * variance.max(0.0).sqrt())
    }
}

impl ReverseProcessSampler for DdimSampler {
    fn name(&self) -> &'static str {
        "ddim"
    }

    fn supports(&self, _schedule: &NoiseSchedule) -> bool {
        true
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
    ) -> crate::Result<Tensor<B, D>>
    where
        B: Backend,
        M: Denoiser<B, D> + ?Sized,
        R: Rng + ?Sized,
    {
        check_transition(self, schedule, t, t_prev)?;

        let model_output = guided_prediction(model, x_t.clone(), t, context, guidance_scale);
        let pred_original_sample =
            schedule.predict_start(x_t.clone(), t, model_output, model.prediction_type())?;
        let pred_original_sample = if self.clip_denoised {
            pred_original_sample.clamp(-1.0, 1.0)
        } else {
            pred_original_sample
        };
        // Re-derived from the (possibly clipped) estimate so both stay consistent.
        let pred_epsilon =
            schedule.predict_noise_from_start(x_t, t, pred_original_sample.clone())?;

        let alpha_prod_t_prev = schedule.alpha_bar_prev(t_prev)?;
        let std_dev_t = self.noise_scale(schedule, t, t_prev)?;

        let pred_sample_direction = pred_epsilon
            .mul_scalar((1. - alpha_prod_t_prev - std_dev_t * std_dev_t).max(0.0).sqrt());
        let prev_sample =
            pred_original_sample.mul_scalar(alpha_prod_t_prev.sqrt()) + pred_sample_direction;

        if std_dev_t > 0. {
            let noise = gaussian_noise::<B, D, R>(prev_sample.dims(), &prev_sample.device(), rng);
            Ok(prev_sample + noise.mul_scalar(std_dev_t))
        } else {
            Ok(prev_sample)
        }
    }
}
