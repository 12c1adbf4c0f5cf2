use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use rand::Rng;

use crate::config::DiffusionConfig;
use crate::error::{DiffusionError, Result};
use crate::models::{Context, Denoiser};
use crate::samplers::guidance::validate_guidance_scale;
use crate::samplers::ReverseProcessSampler;
use crate::schedulers::{NoiseSchedule, PredictionType, Timestep};
use crate::utils::{
    broadcast_batch, gaussian_noise, normalize_to_neg_one_to_one, unnormalize_to_zero_to_one,
};

/// Number of intermediate samples recorded by default.
pub const DEFAULT_NUM_INTERMEDIATES: usize = 10;

/// Options of a single sampling run.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleOptions {
    /// Number of reverse steps, `None` runs every step of the schedule.
    pub num_sampling_steps: Option<usize>,
    /// Classifier-free guidance scale, `None` disables guidance.
    pub guidance_scale: Option<f64>,
    /// Step the trajectory starts from, `None` starts from pure noise at the last step.
    pub start_step: Option<usize>,
    /// Number of intermediate samples to record.
    pub num_intermediates: usize,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            num_sampling_steps: None,
            guidance_scale: None,
            start_step: None,
            num_intermediates: DEFAULT_NUM_INTERMEDIATES,
        }
    }
}

impl SampleOptions {
    pub fn with_num_sampling_steps(mut self, num_sampling_steps: usize) -> Self {
        self.num_sampling_steps = Some(num_sampling_steps);
        self
    }

    pub fn with_guidance_scale(mut self, guidance_scale: f64) -> Self {
        self.guidance_scale = Some(guidance_scale);
        self
    }

    pub fn with_start_step(mut self, start_step: usize) -> Self {
        self.start_step = Some(start_step);
        self
    }

    pub fn with_num_intermediates(mut self, num_intermediates: usize) -> Self {
        self.num_intermediates = num_intermediates;
        self
    }

    /// Whether the run blends the conditional and unconditional predictions.
    ///
    /// A scale of `1` only calls the conditional branch and `0` only the
    /// unconditional one, so neither counts.
    fn guidance_requested(&self) -> bool {
        matches!(self.guidance_scale, Some(scale) if scale != 1.0 && scale != 0.0)
    }
}

/// Result of a sampling run, in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct SampleOutput<B: Backend, const D: usize> {
    pub samples: Tensor<B, D>,
    /// Snapshots of the trajectory, evenly spread over the steps.
    pub intermediates: Vec<Tensor<B, D>>,
}

/// A denoising network together with its noise schedule.
///
/// Samples are generated in `[-1, 1]` and returned in `[0, 1]`.
#[derive(Debug)]
pub struct DiffusionModel<B: Backend, M, const D: usize> {
    config: DiffusionConfig,
    schedule: NoiseSchedule,
    denoiser: M,
    sample_shape: Vec<usize>,
    device: B::Device,
}

impl<B, M, const D: usize> DiffusionModel<B, M, D>
where
    B: Backend,
    M: Denoiser<B, D>,
{
    pub fn new(config: DiffusionConfig, denoiser: M, device: &B::Device) -> Result<Self> {
        config.validate()?;
        let sample_shape = config.sample_shape();
        if sample_shape.len() + 1 != D {
            return Err(DiffusionError::InvalidConfig(format!(
                "the configuration describes rank {} batches but the model works on rank {}",
                sample_shape.len() + 1,
                D
            )));
        }
        if config.diffusion.prediction_type != denoiser.prediction_type() {
            return Err(DiffusionError::InvalidConfig(format!(
                "configured prediction type {:?} but the denoiser predicts {:?}",
                config.diffusion.prediction_type,
                denoiser.prediction_type()
            )));
        }
        let schedule = config.noise_schedule()?;

        Ok(Self {
            config,
            schedule,
            denoiser,
            sample_shape,
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &DiffusionConfig {
        &self.config
    }

    pub fn noise_schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    pub fn denoiser(&self) -> &M {
        &self.denoiser
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Shape of one sample, without the batch dimension.
    pub fn sample_shape(&self) -> &[usize] {
        &self.sample_shape
    }

    /// Shape of a batch of `num_samples` samples.
    pub fn batch_shape(&self, num_samples: usize) -> [usize; D] {
        let mut shape = [num_samples; D];
        shape[1..].copy_from_slice(&self.sample_shape);
        shape
    }

    /// Generates `num_samples` samples by running the reverse process.
    ///
    /// Without `initial_noise`, the trajectory starts from standard normal
    /// noise drawn from `rng`.
    pub fn sample<S, R>(
        &self,
        num_samples: usize,
        context: &Context<B, D>,
        sampler: &S,
        initial_noise: Option<Tensor<B, D>>,
        options: &SampleOptions,
        rng: &mut R,
    ) -> Result<SampleOutput<B, D>>
    where
        S: ReverseProcessSampler + ?Sized,
        R: Rng + ?Sized,
    {
        validate_guidance_scale(options.guidance_scale)?;
        self.check_context(context, options)?;
        if !sampler.supports(&self.schedule) {
            return Err(DiffusionError::UnsupportedSchedule {
                sampler: sampler.name(),
                mode: self.schedule.mode(),
            });
        }
        if num_samples == 0 {
            return Err(DiffusionError::InvalidConfig("cannot draw zero samples".into()));
        }

        let shape = self.batch_shape(num_samples);
        if let Some(noise) = &initial_noise {
            let dims = noise.dims();
            if dims != shape {
                return Err(DiffusionError::shape_mismatch(&shape, &dims));
            }
        }
        let timesteps = self
            .schedule
            .sampling_timesteps(options.start_step, options.num_sampling_steps)?;
        let checkpoints = snapshot_steps(timesteps.len(), options.num_intermediates);

        log::info!(
            "Sampling {} x {:?} with the {} sampler over {} steps",
            num_samples,
            &self.sample_shape,
            sampler.name(),
            timesteps.len()
        );

        let mut x_t = match initial_noise {
            Some(noise) => noise,
            None => gaussian_noise::<B, D, R>(shape, &self.device, rng),
        };
        let mut intermediates = Vec::with_capacity(checkpoints.len());
        let mut next_checkpoint = checkpoints.iter().peekable();

        for (i, t) in timesteps.iter().enumerate() {
            let t_prev = timesteps.get(i + 1).copied();
            x_t = sampler.step(
                &self.schedule,
                &self.denoiser,
                x_t,
                *t,
                t_prev,
                context,
                options.guidance_scale,
                rng,
            )?;

            while next_checkpoint.next_if(|step| **step == i).is_some() {
                intermediates.push(to_output_range(x_t.clone()));
            }
        }

        log::info!("Sampling done, {} intermediate outputs", intermediates.len());

        Ok(SampleOutput {
            samples: to_output_range(x_t),
            intermediates,
        })
    }

    /// Noises `images` in `[0, 1]` up to the start step and denoises them back.
    pub fn reconstruct<S, R>(
        &self,
        images: Tensor<B, D>,
        context: &Context<B, D>,
        sampler: &S,
        options: &SampleOptions,
        rng: &mut R,
    ) -> Result<SampleOutput<B, D>>
    where
        S: ReverseProcessSampler + ?Sized,
        R: Rng + ?Sized,
    {
        let num_samples = self.check_batch(&images)?;
        let start = options.start_step.unwrap_or(self.schedule.steps() - 1);
        let t = self.schedule.timestep(start);

        let x_start = normalize_to_neg_one_to_one(images);
        let noise = gaussian_noise::<B, D, R>(x_start.dims(), &self.device, rng);
        let x_t = self.schedule.q_sample(x_start, t, noise)?;

        let options = SampleOptions {
            start_step: Some(start),
            ..options.clone()
        };
        self.sample(num_samples, context, sampler, Some(x_t), &options, rng)
    }

    /// Mean squared error of the denoiser on a batch of `images` in `[0, 1]`.
    ///
    /// Every element gets its own random timestep and noise, the target
    /// follows the denoiser's prediction type.
    pub fn loss_on_batch<R: Rng + ?Sized>(
        &self,
        images: Tensor<B, D>,
        context: &Context<B, D>,
        rng: &mut R,
    ) -> Result<Tensor<B, 1>> {
        let batch_size = self.check_batch(&images)?;
        let x_start = normalize_to_neg_one_to_one(images);

        let timesteps: Vec<Timestep> = (0..batch_size)
            .map(|_| {
                if self.schedule.continuous() {
                    Timestep::Fraction(rng.gen_range(0.0..=1.0))
                } else {
                    Timestep::Index(rng.gen_range(0..self.schedule.steps()))
                }
            })
            .collect();
        let noise = gaussian_noise::<B, D, R>(x_start.dims(), &self.device, rng);
        let x_t = self
            .schedule
            .q_sample_batch(x_start.clone(), &timesteps, noise.clone())?;

        let values: Vec<f64> = timesteps.iter().map(Timestep::value).collect();
        let t = broadcast_batch::<B, 1>(&values, &self.device);
        let prediction = self.denoiser.predict(x_t, t, context);

        let target = match self.denoiser.prediction_type() {
            PredictionType::Epsilon => noise,
            PredictionType::VPrediction => {
                self.schedule.velocity_batch(x_start, &timesteps, noise)?
            }
            PredictionType::Sample => x_start,
        };
        if prediction.dims() != target.dims() {
            return Err(DiffusionError::shape_mismatch(&target.dims(), &prediction.dims()));
        }
        let error = prediction - target;

        Ok((error.clone() * error).mean())
    }

    /// Checks that `images` is a batch of this model's samples and returns its size.
    fn check_batch(&self, images: &Tensor<B, D>) -> Result<usize> {
        let dims = images.dims();
        let expected = self.batch_shape(dims[0]);
        if dims != expected || dims[0] == 0 {
            return Err(DiffusionError::shape_mismatch(&expected, &dims));
        }
        Ok(dims[0])
    }

    fn check_context(&self, context: &Context<B, D>, options: &SampleOptions) -> Result<()> {
        let required = self.denoiser.required_context();
        if options.guidance_requested()
            && !required.is_empty()
            && !required.iter().any(|key| context.contains(key))
        {
            return Err(DiffusionError::EmptyContext {
                required: required.iter().map(|key| key.to_string()).collect(),
            });
        }
        Ok(())
    }
}

fn to_output_range<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    unnormalize_to_zero_to_one(x).clamp(0.0, 1.0)
}

/// Step indices after which a snapshot is recorded: `ceil((k + 1) * n / count) - 1`.
///
/// Always `count` entries; they repeat when the trajectory is shorter than `count`.
pub fn snapshot_steps(num_steps: usize, count: usize) -> Vec<usize> {
    if num_steps == 0 {
        return Vec::new();
    }
    (0..count)
        .map(|k| ((k + 1) * num_steps).div_ceil(count) - 1)
        .collect()
}
