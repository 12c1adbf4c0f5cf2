//! Ancestral sampling: the stochastic reverse Markov chain of DDPM.
//!
//! https://arxiv.org/abs/2006.11239, algorithm 2.

use burn::config::Config;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::guidance::guided_prediction;
use super::{check_transition, ReverseProcessSampler};
use crate::models::{Context, Denoiser};
use crate::schedulers::{NoiseSchedule, Timestep};
use crate::utils::gaussian_noise;

/// Variance of the noise injected at each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceType {
    /// The posterior variance, `beta_tilde`.
    FixedSmall,
    /// The forward variance, `beta`.
    FixedLarge,
}

/// The configuration for the [ancestral sampler](AncestralSampler).
#[derive(Config, Debug)]
pub struct AncestralSamplerConfig {
    /// How the injected noise is scaled.
    #[config(default = "VarianceType::FixedSmall")]
    pub variance_type: VarianceType,
    /// Option to clip the predicted clean sample to [-1, 1].
    #[config(default = true)]
    pub clip_denoised: bool,
}

impl AncestralSamplerConfig {
    /// Initialize a new [ancestral sampler](AncestralSampler).
    pub fn init(&self) -> AncestralSampler {
        AncestralSampler {
            variance_type: self.variance_type,
            clip_denoised: self.clip_denoised,
        }
    }
}

/// Samples `x_{t_prev} ~ q(x_{t_prev} | x_t, x_0 = x_0_hat)`.
///
/// Works on discrete schedules only. When `t_prev` is not `t - 1` the
/// two-timestep posterior is used, which makes respaced trajectories valid.
#[derive(Debug, Clone)]
pub struct AncestralSampler {
    variance_type: VarianceType,
    clip_denoised: bool,
}

impl Default for AncestralSampler {
    fn default() -> Self {
        AncestralSamplerConfig::new().init()
    }
}

impl AncestralSampler {
    pub fn variance_type(&self) -> VarianceType {
        self.variance_type
    }

    /// Standard deviation of the noise injected by the transition `t -> t_prev`.
    pub fn noise_scale(
        &self,
        schedule: &NoiseSchedule,
        t: Timestep,
        t_prev: Option<Timestep>,
    ) -> crate::Result<f64> {
        if t_prev.is_none() {
            return Ok(0.0);
        }
        let posterior = schedule.posterior(t, t_prev)?;
        Ok(match self.variance_type {
            VarianceType::FixedSmall => posterior.variance.sqrt(),
            VarianceType::FixedLarge => posterior.beta.sqrt(),
        })
    }
}

impl ReverseProcessSampler for AncestralSampler {
    fn name(&self) -> &'static str {
        "ancestral"
    }

    fn supports(&self, schedule: &NoiseSchedule) -> bool {
        !schedule.continuous()
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

        let posterior = schedule.posterior(t, t_prev)?;
        let mean = pred_original_sample.mul_scalar(posterior.coef_start)
            + x_t.mul_scalar(posterior.coef_sample);

        // No noise is added on the way to the clean signal.
        if t_prev.is_none() {
            return Ok(mean);
        }
        let std_dev = self.noise_scale(schedule, t, t_prev)?;
        let noise = gaussian_noise::<B, D, R>(mean.dims(), &mean.device(), rng);

        Ok(mean + noise.mul_scalar(std_dev))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiffusionError;
    use crate::schedulers::{BetaSchedule, NoiseScheduleConfig};
    use crate::TestBackend;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Always predicts the same noise.
    struct FixedNoise(Tensor<TestBackend, 4>);

    impl Denoiser<TestBackend, 4> for FixedNoise {
        fn predict(
            &self,
            _x_t: Tensor<TestBackend, 4>,
            _timesteps: Tensor<TestBackend, 1>,
            _context: &Context<TestBackend, 4>,
        ) -> Tensor<TestBackend, 4> {
            self.0.clone()
        }
    }

    fn schedule() -> NoiseSchedule {
        NoiseScheduleConfig::new(1000, BetaSchedule::Linear)
            .init()
            .unwrap()
    }

    #[test]
    fn test_terminal_step_injects_no_noise() {
        let device = Default::default();
        let schedule = schedule();
        let sampler = AncestralSamplerConfig::new().init();
        let x_t = Tensor::<TestBackend, 4>::ones([2, 1, 2, 2], &device).mul_scalar(0.3);
        let model = FixedNoise(Tensor::zeros([2, 1, 2, 2], &device));
        let context = Context::new();

        let run = |x_t: Tensor<TestBackend, 4>, seed| {
            sampler
                .step(
                    &schedule,
                    &model,
                    x_t,
                    Timestep::Index(0),
                    None,
                    &context,
                    None,
                    &mut StdRng::seed_from_u64(seed),
                )
                .unwrap()
        };
        let (a, b) = (run(x_t.clone(), 1), run(x_t, 2));

        assert_eq!(a.into_data().value, b.into_data().value);
        assert_eq!(sampler.noise_scale(&schedule, Timestep::Index(0), None).unwrap(), 0.0);
    }

    #[test]
    fn test_intermediate_step_injects_noise() {
        let device = Default::default();
        let schedule = schedule();
        let sampler = AncestralSamplerConfig::new().init();
        let x_t = Tensor::<TestBackend, 4>::zeros([1, 1, 4, 4], &device);
        let model = FixedNoise(Tensor::zeros([1, 1, 4, 4], &device));
        let context = Context::new();
        let (t, t_prev) = (Timestep::Index(500), Some(Timestep::Index(499)));

        let run = |seed| {
            sampler
                .step(
                    &schedule,
                    &model,
                    x_t.clone(),
                    t,
                    t_prev,
                    &context,
                    None,
                    &mut StdRng::seed_from_u64(seed),
                )
                .unwrap()
        };
        let (a, b, c) = (run(1), run(2), run(1));
        let (a, b, c) = (a.into_data().value, b.into_data().value, c.into_data().value);
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_fixed_large_uses_beta() {
        let schedule = schedule();
        let sampler = AncestralSamplerConfig::new()
            .with_variance_type(VarianceType::FixedLarge)
            .init();
        let (t, t_prev) = (Timestep::Index(10), Some(Timestep::Index(9)));

        let scale = sampler.noise_scale(&schedule, t, t_prev).unwrap();
        let beta = schedule.betas().unwrap()[10];
        assert!((scale - beta.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_continuous_schedule() {
        let device = Default::default();
        let schedule = NoiseScheduleConfig::new(1000, BetaSchedule::Linear)
            .with_continuous(true)
            .init()
            .unwrap();
        let sampler = AncestralSampler::default();
        let x_t = Tensor::<TestBackend, 4>::zeros([1, 1, 2, 2], &device);
        let model = FixedNoise(x_t.clone());

        let result = sampler.step(
            &schedule,
            &model,
            x_t,
            Timestep::Fraction(0.5),
            Some(Timestep::Fraction(0.25)),
            &Context::new(),
            None,
            &mut StdRng::seed_from_u64(0),
        );
        assert!(matches!(
            result,
            Err(DiffusionError::UnsupportedSchedule { sampler: "ancestral", .. })
        ));
    }

    #[test]
    fn test_rejects_out_of_order_timesteps() {
        let device = Default::default();
        let schedule = schedule();
        let sampler = AncestralSampler::default();
        let x_t = Tensor::<TestBackend, 4>::zeros([1, 1, 2, 2], &device);
        let model = FixedNoise(x_t.clone());

        let result = sampler.step(
            &schedule,
            &model,
            x_t,
            Timestep::Index(5),
            Some(Timestep::Index(6)),
            &Context::new(),
            None,
            &mut StdRng::seed_from_u64(0),
        );
        assert!(matches!(result, Err(DiffusionError::InvalidTimestep { .. })));
    }

    #[test]
    fn test_terminal_step_recovers_start_for_every_schedule() {
        let device = Default::default();
        let x_start = Tensor::<TestBackend, 4>::from_floats(
            [[[[0.5, -0.5], [0.25, 0.9]]], [[[-0.75, 0.0], [0.1, -1.0]]]],
            &device,
        );
        let noise = Tensor::<TestBackend, 4>::from_floats(
            [[[[1.2, -0.3], [0.05, -1.1]]], [[[0.4, 2.1], [-0.6, 0.8]]]],
            &device,
        );
        let sampler = AncestralSampler::default();

        for schedule_type in [
            BetaSchedule::Linear,
            BetaSchedule::ScaledLinear,
            BetaSchedule::SquaredcosCapV2,
        ] {
            let schedule = NoiseScheduleConfig::new(1000, schedule_type)
                .init()
                .unwrap();
            for t in [0, 1, 500, 999] {
                let t = Timestep::Index(t);
                let x_t = schedule.q_sample(x_start.clone(), t, noise.clone()).unwrap();
                let out = sampler
                    .step(
                        &schedule,
                        &FixedNoise(noise.clone()),
                        x_t,
                        t,
                        None,
                        &Context::new(),
                        None,
                        &mut StdRng::seed_from_u64(0),
                    )
                    .unwrap();

                let out = out.into_data().value;
                let expected = x_start.to_data().value;
                for (actual, expected) in out.iter().zip(expected.iter()) {
                    assert!(
                        (actual - expected).abs() < 1e-2,
                        "{schedule_type:?} at {t}: {actual} != {expected}"
                    );
                }
            }
        }
    }
}
