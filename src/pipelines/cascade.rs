use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use rand::Rng;

use super::diffusion::{DiffusionModel, SampleOptions, SampleOutput};
use crate::config::SuperResolutionConfig;
use crate::error::{DiffusionError, Result};
use crate::models::{Context, Denoiser};
use crate::samplers::{ReverseProcessSampler, Sampler};
use crate::utils::resize_spatial;

/// One model of a cascade together with how it is sampled.
#[derive(Debug)]
pub struct CascadeStage<B: Backend, M, const D: usize> {
    pub model: DiffusionModel<B, M, D>,
    pub sampler: Sampler,
    pub options: SampleOptions,
}

impl<B: Backend, M: Denoiser<B, D>, const D: usize> CascadeStage<B, M, D> {
    pub fn new(model: DiffusionModel<B, M, D>, sampler: Sampler, options: SampleOptions) -> Self {
        Self {
            model,
            sampler,
            options,
        }
    }

    fn image_size(&self) -> usize {
        self.model.config().data.image_size
    }

    fn super_resolution(&self) -> Option<&SuperResolutionConfig> {
        self.model.config().super_resolution.as_ref()
    }
}

#[derive(Debug, Clone)]
pub struct CascadeOutput<B: Backend, const D: usize> {
    /// Output of the last stage.
    pub samples: Tensor<B, D>,
    /// Output of every stage, lowest resolution first.
    pub stage_outputs: Vec<SampleOutput<B, D>>,
}

/// A chain of diffusion models, each one conditioned on the output of the
/// previous, lower resolution, one.
///
/// Stages usually wrap different networks, use `Box<dyn Denoiser<B, D>>` as
/// `M` to mix them.
#[derive(Debug)]
pub struct Cascade<B: Backend, M, const D: usize> {
    stages: Vec<CascadeStage<B, M, D>>,
}

impl<B: Backend, M: Denoiser<B, D>, const D: usize> Cascade<B, M, D> {
    pub fn new(stages: Vec<CascadeStage<B, M, D>>) -> Result<Self> {
        if stages.is_empty() {
            return Err(DiffusionError::InvalidConfig(
                "a cascade needs at least one stage".into(),
            ));
        }
        for (index, pair) in stages.windows(2).enumerate() {
            let (previous, stage) = (&pair[0], &pair[1]);
            let Some(sr) = stage.super_resolution() else {
                return Err(DiffusionError::InvalidConfig(format!(
                    "stage {} follows another stage but has no super_resolution section",
                    index + 1
                )));
            };
            if stage.image_size() < previous.image_size() {
                return Err(DiffusionError::InvalidConfig(format!(
                    "stage {} generates {}px samples after {}px ones, stages must go from low to high resolution",
                    index + 1,
                    stage.image_size(),
                    previous.image_size()
                )));
            }
            let (from, to) = (previous.image_size(), sr.low_resolution_size);
            if from.max(to) % from.min(to) != 0 {
                return Err(DiffusionError::InvalidConfig(format!(
                    "stage {} cannot resize {}px samples to {}px",
                    index + 1,
                    from,
                    to
                )));
            }
        }

        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[CascadeStage<B, M, D>] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Samples every stage in turn.
    ///
    /// The output of a stage is resized to the next stage's
    /// `low_resolution_size` and added to its context under the configured
    /// key. The first failing stage aborts the cascade.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        num_samples: usize,
        context: &Context<B, D>,
        rng: &mut R,
    ) -> Result<CascadeOutput<B, D>> {
        log::info!("Sampling a cascade of {} stages", self.stages.len());
        let mut stage_outputs: Vec<SampleOutput<B, D>> = Vec::with_capacity(self.stages.len());

        for (index, stage) in self.stages.iter().enumerate() {
            let stage_context = match stage_outputs.last() {
                Some(previous) => self.conditioned_context(index, context, &previous.samples)?,
                None => context.clone(),
            };
            log::debug!(
                "Cascade stage {index}: {}px with the {} sampler",
                stage.image_size(),
                stage.sampler.name()
            );

            let output = stage
                .model
                .sample(
                    num_samples,
                    &stage_context,
                    &stage.sampler,
                    None,
                    &stage.options,
                    rng,
                )
                .map_err(|err| stage_error(index, err))?;
            stage_outputs.push(output);
        }

        let samples = stage_outputs
            .last()
            .map(|output| output.samples.clone())
            .ok_or_else(|| DiffusionError::InvalidConfig("the cascade has no stages".into()))?;
        log::info!("Cascade done");

        Ok(CascadeOutput {
            samples,
            stage_outputs,
        })
    }

    /// Training loss of every stage on `images` in `[0, 1]`.
    ///
    /// Each stage sees the images at its own resolution; super resolution
    /// stages are conditioned on a downsampled copy.
    pub fn loss_on_batch<R: Rng + ?Sized>(
        &self,
        images: Tensor<B, D>,
        context: &Context<B, D>,
        rng: &mut R,
    ) -> Result<Vec<Tensor<B, 1>>> {
        self.stages
            .iter()
            .map(|stage| {
                let stage_images = resize_spatial(images.clone(), stage.image_size())?;
                let stage_context = match stage.super_resolution() {
                    Some(sr) => context.clone().with_signal(
                        sr.conditioning_key.clone(),
                        resize_spatial(stage_images.clone(), sr.low_resolution_size)?,
                    ),
                    None => context.clone(),
                };
                stage.model.loss_on_batch(stage_images, &stage_context, rng)
            })
            .enumerate()
            .map(|(index, loss)| loss.map_err(|err| stage_error(index, err)))
            .collect()
    }

    fn conditioned_context(
        &self,
        index: usize,
        context: &Context<B, D>,
        previous: &Tensor<B, D>,
    ) -> Result<Context<B, D>> {
        let stage = &self.stages[index];
        let Some(sr) = stage.super_resolution() else {
            return Ok(context.clone());
        };
        let low_resolution = resize_spatial(previous.clone(), sr.low_resolution_size)
            .map_err(|err| stage_error(index, err))?;

        Ok(context
            .clone()
            .with_signal(sr.conditioning_key.clone(), low_resolution))
    }
}

fn stage_error(index: usize, source: DiffusionError) -> DiffusionError {
    DiffusionError::Stage {
        index,
        source: Box::new(source),
    }
}
