use burn::tensor::{backend::Backend, Tensor};

use super::{BetaSchedule, NoiseScheduleConfig, PredictionType, Timestep};
use crate::error::{DiffusionError, Result};
use crate::utils::broadcast_batch;

/// Bounds applied to the continuous `alpha_bar` so that none of the
/// derived coefficients divide by zero at either end of the process.
const ALPHA_BAR_EPS: f64 = 1e-8;
/// Floor used before taking the log of the posterior variance.
const MIN_POSTERIOR_VARIANCE: f64 = 1e-20;
/// Offset of the cosine schedule (improved DDPM, eq. 17).
const COSINE_OFFSET: f64 = 0.008;

/// Coefficients of `q(x_{t_prev} | x_t, x_0)`.
///
/// `mean = coef_start * x_0 + coef_sample * x_t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Posterior {
    pub coef_start: f64,
    pub coef_sample: f64,
    pub variance: f64,
    pub log_variance_clipped: f64,
    /// The effective beta of the transition, `1 - alpha_bar_t / alpha_bar_prev`.
    pub beta: f64,
}

/// Per-step coefficients of a discrete schedule, computed once.
#[derive(Debug, Clone)]
struct DiscreteCoefficients {
    betas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    sqrt_alphas_cumprod: Vec<f64>,
    sqrt_one_minus_alphas_cumprod: Vec<f64>,
    sqrt_recip_alphas_cumprod: Vec<f64>,
    sqrt_recipm1_alphas_cumprod: Vec<f64>,
    posterior_variance: Vec<f64>,
    posterior_log_variance_clipped: Vec<f64>,
    posterior_mean_coef1: Vec<f64>,
    posterior_mean_coef2: Vec<f64>,
}

impl DiscreteCoefficients {
    fn new(betas: Vec<f64>) -> Self {
        let mut alphas_cumprod = Vec::with_capacity(betas.len());
        for beta in &betas {
            let alpha = 1.0 - beta;
            alphas_cumprod.push(alpha * alphas_cumprod.last().copied().unwrap_or(1.0));
        }
        let alphas_cumprod_prev: Vec<f64> = core::iter::once(1.0)
            .chain(alphas_cumprod.iter().copied())
            .take(betas.len())
            .collect();

        let posterior_variance: Vec<f64> = betas
            .iter()
            .zip(&alphas_cumprod)
            .zip(&alphas_cumprod_prev)
            .map(|((beta, abar), abar_prev)| beta * (1.0 - abar_prev) / (1.0 - abar))
            .collect();
        // The variance is zero at t = 0, so the log is clipped to the next value.
        let posterior_log_variance_clipped = posterior_variance
            .iter()
            .enumerate()
            .map(|(t, variance)| {
                let variance = if t == 0 && posterior_variance.len() > 1 {
                    posterior_variance[1]
                } else {
                    *variance
                };
                variance.max(MIN_POSTERIOR_VARIANCE).ln()
            })
            .collect();

        Self {
            sqrt_alphas_cumprod: alphas_cumprod.iter().map(|a| a.sqrt()).collect(),
            sqrt_one_minus_alphas_cumprod: alphas_cumprod.iter().map(|a| (1.0 - a).sqrt()).collect(),
            sqrt_recip_alphas_cumprod: alphas_cumprod.iter().map(|a| (1.0 / a).sqrt()).collect(),
            sqrt_recipm1_alphas_cumprod: alphas_cumprod
                .iter()
                .map(|a| (1.0 / a - 1.0).sqrt())
                .collect(),
            posterior_mean_coef1: betas
                .iter()
                .zip(&alphas_cumprod)
                .zip(&alphas_cumprod_prev)
                .map(|((beta, abar), abar_prev)| beta * abar_prev.sqrt() / (1.0 - abar))
                .collect(),
            posterior_mean_coef2: betas
                .iter()
                .zip(&alphas_cumprod)
                .zip(&alphas_cumprod_prev)
                .map(|((beta, abar), abar_prev)| {
                    (1.0 - abar_prev) * (1.0 - beta).sqrt() / (1.0 - abar)
                })
                .collect(),
            posterior_variance,
            posterior_log_variance_clipped,
            alphas_cumprod,
            betas,
        }
    }
}

/// The forward noising process `q(x_t | x_0)` of a diffusion model.
///
/// Either a fixed number of discrete steps with precomputed coefficients, or
/// a continuous-time process over `t ∈ [0, 1]`. Immutable once built.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    config: NoiseScheduleConfig,
    discrete: Option<DiscreteCoefficients>,
}

impl NoiseSchedule {
    pub fn new(config: NoiseScheduleConfig) -> Result<Self> {
        validate_config(&config)?;

        let discrete = if config.continuous {
            None
        } else {
            let betas = match config.schedule_type {
                BetaSchedule::Linear => {
                    linear_betas(config.beta_start, config.beta_end, config.steps)
                }
                BetaSchedule::ScaledLinear => {
                    scaled_linear_betas(config.beta_start, config.beta_end, config.steps)
                }
                BetaSchedule::SquaredcosCapV2 => squared_cos_betas(config.steps, config.max_beta),
            };
            let coefficients = DiscreteCoefficients::new(betas);
            if coefficients.alphas_cumprod.iter().any(|abar| *abar <= 0.0) {
                return Err(DiffusionError::InvalidConfig(
                    "the schedule destroys the signal completely before the last step".into(),
                ));
            }
            Some(coefficients)
        };

        Ok(Self { config, discrete })
    }

    pub fn config(&self) -> &NoiseScheduleConfig {
        &self.config
    }

    /// Total number of discrete steps, or the nominal resolution of a continuous schedule.
    pub fn steps(&self) -> usize {
        self.config.steps
    }

    pub fn continuous(&self) -> bool {
        self.config.continuous
    }

    /// Short name of the schedule mode, used in error messages.
    pub fn mode(&self) -> &'static str {
        if self.continuous() {
            "continuous"
        } else {
            "discrete"
        }
    }

    /// The betas of a discrete schedule.
    pub fn betas(&self) -> Option<&[f64]> {
        self.discrete.as_ref().map(|c| c.betas.as_slice())
    }

    /// Checks that `t` belongs to the schedule's domain.
    pub fn validate(&self, t: Timestep) -> Result<()> {
        match (t, self.continuous()) {
            (Timestep::Index(i), false) if i < self.steps() => Ok(()),
            (Timestep::Index(_), false) => Err(DiffusionError::invalid_timestep(
                t,
                format!("expected an index below {}", self.steps()),
            )),
            (Timestep::Fraction(f), true) if f.is_finite() && (0.0..=1.0).contains(&f) => Ok(()),
            (Timestep::Fraction(_), true) => {
                Err(DiffusionError::invalid_timestep(t, "expected a fraction in [0, 1]"))
            }
            (Timestep::Index(_), true) => Err(DiffusionError::invalid_timestep(
                t,
                "continuous schedules expect fractional timesteps",
            )),
            (Timestep::Fraction(_), false) => Err(DiffusionError::invalid_timestep(
                t,
                "discrete schedules expect step indices",
            )),
        }
    }

    /// The timestep of the `index`-th step of the schedule's native grid.
    pub fn timestep(&self, index: usize) -> Timestep {
        if self.continuous() {
            if self.steps() > 1 {
                Timestep::Fraction(index as f64 / (self.steps() - 1) as f64)
            } else {
                Timestep::Fraction(0.0)
            }
        } else {
            Timestep::Index(index)
        }
    }

    /// Cumulative signal retained at `t`.
    pub fn alpha_bar(&self, t: Timestep) -> Result<f64> {
        self.validate(t)?;
        Ok(match (t, &self.discrete) {
            (Timestep::Index(i), Some(c)) => c.alphas_cumprod[i],
            (Timestep::Fraction(f), _) => self.continuous_alpha_bar(f),
            _ => unreachable!("validated above"),
        })
    }

    /// Cumulative signal retained at the reverse target, `1` for the clean signal.
    pub fn alpha_bar_prev(&self, t_prev: Option<Timestep>) -> Result<f64> {
        t_prev.map_or(Ok(1.0), |t| self.alpha_bar(t))
    }

    /// Signal to noise ratio at `t`.
    pub fn snr(&self, t: Timestep) -> Result<f64> {
        let alpha_bar = self.alpha_bar(t)?;
        Ok(alpha_bar / (1.0 - alpha_bar))
    }

    /// `(sqrt(alpha_bar), sqrt(1 - alpha_bar))` at `t`.
    fn signal_and_noise_scales(&self, t: Timestep) -> Result<(f64, f64)> {
        self.validate(t)?;
        Ok(match (t, &self.discrete) {
            (Timestep::Index(i), Some(c)) => {
                (c.sqrt_alphas_cumprod[i], c.sqrt_one_minus_alphas_cumprod[i])
            }
            (Timestep::Fraction(f), _) => {
                let alpha_bar = self.continuous_alpha_bar(f);
                (alpha_bar.sqrt(), (1.0 - alpha_bar).sqrt())
            }
            _ => unreachable!("validated above"),
        })
    }

    fn continuous_alpha_bar(&self, t: f64) -> f64 {
        let config = &self.config;
        let steps = config.steps as f64;
        let alpha_bar = match config.schedule_type {
            // exp(-N * integral of beta(u) over [0, t])
            BetaSchedule::Linear => {
                let (b0, b1) = (config.beta_start, config.beta_end);
                (-steps * (b0 * t + 0.5 * (b1 - b0) * t * t)).exp()
            }
            BetaSchedule::ScaledLinear => {
                let a = config.beta_start.sqrt();
                let c = config.beta_end.sqrt() - a;
                (-steps * (a * a * t + a * c * t * t + c * c * t * t * t / 3.0)).exp()
            }
            BetaSchedule::SquaredcosCapV2 => cosine_alpha_bar(t) / cosine_alpha_bar(0.0),
        };
        alpha_bar.clamp(ALPHA_BAR_EPS, 1.0 - ALPHA_BAR_EPS)
    }

    /// Forward process: noise `x_start` up to timestep `t`.
    pub fn q_sample<B: Backend, const D: usize>(
        &self,
        x_start: Tensor<B, D>,
        t: Timestep,
        noise: Tensor<B, D>,
    ) -> Result<Tensor<B, D>> {
        check_same_shape(&x_start, &noise)?;
        let (signal, sigma) = self.signal_and_noise_scales(t)?;

        Ok(x_start.mul_scalar(signal) + noise.mul_scalar(sigma))
    }

    /// Forward process with one timestep per batch element.
    pub fn q_sample_batch<B: Backend, const D: usize>(
        &self,
        x_start: Tensor<B, D>,
        timesteps: &[Timestep],
        noise: Tensor<B, D>,
    ) -> Result<Tensor<B, D>> {
        check_same_shape(&x_start, &noise)?;
        let batch_size = x_start.dims()[0];
        if timesteps.len() != batch_size {
            return Err(DiffusionError::shape_mismatch(&[batch_size], &[timesteps.len()]));
        }
        let (signal, sigma) = self.batch_scales(timesteps)?;
        let device = x_start.device();

        Ok(x_start * broadcast_batch::<B, D>(&signal, &device)
            + noise * broadcast_batch::<B, D>(&sigma, &device))
    }

    /// Velocity target `sqrt(alpha_bar) * noise - sqrt(1 - alpha_bar) * x_start`,
    /// one timestep per batch element.
    pub fn velocity_batch<B: Backend, const D: usize>(
        &self,
        x_start: Tensor<B, D>,
        timesteps: &[Timestep],
        noise: Tensor<B, D>,
    ) -> Result<Tensor<B, D>> {
        check_same_shape(&x_start, &noise)?;
        let (signal, sigma) = self.batch_scales(timesteps)?;
        let device = x_start.device();

        Ok(noise * broadcast_batch::<B, D>(&signal, &device)
            - x_start * broadcast_batch::<B, D>(&sigma, &device))
    }

    fn batch_scales(&self, timesteps: &[Timestep]) -> Result<(Vec<f64>, Vec<f64>)> {
        let mut signal = Vec::with_capacity(timesteps.len());
        let mut sigma = Vec::with_capacity(timesteps.len());
        for t in timesteps {
            let (s, n) = self.signal_and_noise_scales(*t)?;
            signal.push(s);
            sigma.push(n);
        }
        Ok((signal, sigma))
    }

    /// Estimate of the clean signal from the model output at `t`.
    pub fn predict_start<B: Backend, const D: usize>(
        &self,
        x_t: Tensor<B, D>,
        t: Timestep,
        model_output: Tensor<B, D>,
        prediction_type: PredictionType,
    ) -> Result<Tensor<B, D>> {
        check_same_shape(&x_t, &model_output)?;
        let (signal, sigma) = self.signal_and_noise_scales(t)?;

        Ok(match prediction_type {
            PredictionType::Epsilon => {
                let (recip, recipm1) = match (t, &self.discrete) {
                    (Timestep::Index(i), Some(c)) => {
                        (c.sqrt_recip_alphas_cumprod[i], c.sqrt_recipm1_alphas_cumprod[i])
                    }
                    _ => (1.0 / signal, sigma / signal),
                };
                x_t.mul_scalar(recip) - model_output.mul_scalar(recipm1)
            }
            PredictionType::VPrediction => {
                x_t.mul_scalar(signal) - model_output.mul_scalar(sigma)
            }
            PredictionType::Sample => model_output,
        })
    }

    /// Noise implied by `x_t` and a clean signal estimate at `t`.
    pub fn predict_noise_from_start<B: Backend, const D: usize>(
        &self,
        x_t: Tensor<B, D>,
        t: Timestep,
        x_start: Tensor<B, D>,
    ) -> Result<Tensor<B, D>> {
        check_same_shape(&x_t, &x_start)?;
        let (signal, sigma) = self.signal_and_noise_scales(t)?;

        Ok((x_t - x_start.mul_scalar(signal)).mul_scalar(1.0 / sigma))
    }

    /// Coefficients of the posterior `q(x_{t_prev} | x_t, x_0)`.
    ///
    /// `t_prev = None` targets the clean signal. Consecutive discrete steps use
    /// the precomputed table, any other pair the two-timestep form.
    pub fn posterior(&self, t: Timestep, t_prev: Option<Timestep>) -> Result<Posterior> {
        self.validate(t)?;
        if let Some(prev) = t_prev {
            self.validate(prev)?;
            if !prev.is_before(&t) {
                return Err(DiffusionError::invalid_timestep(
                    prev,
                    format!("the reverse target must precede {t}"),
                ));
            }
        }

        if let (Timestep::Index(i), Some(c)) = (t, &self.discrete) {
            let consecutive = match t_prev {
                Some(Timestep::Index(p)) => p + 1 == i,
                None => i == 0,
                _ => false,
            };
            if consecutive {
                return Ok(Posterior {
                    coef_start: c.posterior_mean_coef1[i],
                    coef_sample: c.posterior_mean_coef2[i],
                    variance: c.posterior_variance[i],
                    log_variance_clipped: c.posterior_log_variance_clipped[i],
                    beta: c.betas[i],
                });
            }
        }

        let alpha_bar = self.alpha_bar(t)?;
        let alpha_bar_prev = self.alpha_bar_prev(t_prev)?;
        let beta = 1.0 - alpha_bar / alpha_bar_prev;
        let variance = (1.0 - alpha_bar_prev) / (1.0 - alpha_bar) * beta;

        Ok(Posterior {
            coef_start: alpha_bar_prev.sqrt() * beta / (1.0 - alpha_bar),
            coef_sample: (alpha_bar / alpha_bar_prev).sqrt() * (1.0 - alpha_bar_prev)
                / (1.0 - alpha_bar),
            variance,
            log_variance_clipped: variance.max(MIN_POSTERIOR_VARIANCE).ln(),
            beta,
        })
    }

    /// The descending timesteps of a reverse trajectory.
    ///
    /// Starts at `start_step` (default: the last step) and ends at step 0.
    /// A shorter `num_sampling_steps` selects an evenly spaced subsequence that
    /// keeps both endpoints.
    pub fn sampling_timesteps(
        &self,
        start_step: Option<usize>,
        num_sampling_steps: Option<usize>,
    ) -> Result<Vec<Timestep>> {
        let start = start_step.unwrap_or(self.steps() - 1);
        if start >= self.steps() {
            return Err(DiffusionError::invalid_timestep(
                Timestep::Index(start),
                format!("sampling must start below step {}", self.steps()),
            ));
        }

        let native = start + 1;
        let requested = num_sampling_steps.unwrap_or(native);
        if requested == 0 || (requested == 1 && start > 0) {
            return Err(DiffusionError::InvalidSamplingSteps { requested, start });
        }
        let count = if requested > native {
            log::warn!(
                "{requested} sampling steps requested but only {native} are available, using {native}"
            );
            native
        } else {
            requested
        };

        let indices: Vec<usize> = if count == native {
            (0..native).rev().collect()
        } else {
            let last = (count - 1) as f64;
            (0..count)
                .map(|i| ((start as f64) * (last - i as f64) / last).round() as usize)
                .collect()
        };
        log::debug!(
            "sampling plan: {} steps from {} down to 0 ({} schedule)",
            indices.len(),
            start,
            self.mode()
        );

        Ok(indices.into_iter().map(|i| self.timestep(i)).collect())
    }
}

fn validate_config(config: &NoiseScheduleConfig) -> Result<()> {
    let invalid = |msg: &str| Err(DiffusionError::InvalidConfig(msg.to_string()));

    if config.steps == 0 {
        return invalid("a noise schedule needs at least one step");
    }
    if !(config.beta_start > 0.0) {
        return invalid("beta_start must be positive");
    }
    if config.beta_end < config.beta_start {
        return invalid("beta_end must not be smaller than beta_start");
    }
    if config.beta_end >= 1.0 {
        return invalid("beta_end must be below 1");
    }
    if !(config.max_beta > 0.0 && config.max_beta < 1.0) {
        return invalid("max_beta must lie in (0, 1)");
    }
    Ok(())
}

fn check_same_shape<B: Backend, const D: usize>(
    expected: &Tensor<B, D>,
    actual: &Tensor<B, D>,
) -> Result<()> {
    let (expected, actual) = (expected.dims(), actual.dims());
    if expected != actual {
        return Err(DiffusionError::shape_mismatch(&expected, &actual));
    }
    Ok(())
}

fn scaled_linear_betas(start: f64, end: f64, num_steps: usize) -> Vec<f64> {
    linear_betas(start.sqrt(), end.sqrt(), num_steps)
        .into_iter()
        .map(|beta| beta * beta)
        .collect()
}

/// Creates a vector with the values `start..=end` evenly distributed over `num_steps`.
fn linear_betas(start: f64, end: f64, num_steps: usize) -> Vec<f64> {
    if num_steps == 1 {
        return vec![start];
    }
    let step_size = (end - start) / (num_steps - 1) as f64;

    (0..num_steps).map(|i| start + step_size * i as f64).collect()
}

fn cosine_alpha_bar(t: f64) -> f64 {
    f64::cos((t + COSINE_OFFSET) / (1.0 + COSINE_OFFSET) * core::f64::consts::FRAC_PI_2).powi(2)
}

/// Create a beta schedule that discretizes the given alpha_t_bar function, which defines the cumulative product of
/// `(1-beta)` over time from `t = [0,1]`.
fn squared_cos_betas(num_diffusion_timesteps: usize, max_beta: f64) -> Vec<f64> {
    let steps = num_diffusion_timesteps as f64;

    (0..num_diffusion_timesteps)
        .map(|i| {
            let t1 = i as f64 / steps;
            let t2 = (i + 1) as f64 / steps;
            (1.0 - cosine_alpha_bar(t2) / cosine_alpha_bar(t1)).min(max_beta)
        })
        .collect()
}
