use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::context::Context;
use crate::schedulers::PredictionType;

/// The trained denoising network, seen from the sampler.
///
/// Implementations wrap a concrete architecture (a UNet, a DiT, ...). The
/// sampling core only relies on this trait, so tests can inject
/// deterministic stubs.
pub trait Denoiser<B: Backend, const D: usize> {
    /// Predicts the quantity given by [`prediction_type`](Denoiser::prediction_type)
    /// for the noisy batch `x_t`.
    ///
    /// # Shapes
    ///
    /// - x_t: `[batch, ...]`
    /// - timesteps: `[batch]`, step indices or fractions depending on the schedule
    /// - output: same as `x_t`
    fn predict(
        &self,
        x_t: Tensor<B, D>,
        timesteps: Tensor<B, 1>,
        context: &Context<B, D>,
    ) -> Tensor<B, D>;

    fn prediction_type(&self) -> PredictionType {
        PredictionType::Epsilon
    }

    /// Conditioning keys the model needs when sampled with guidance.
    fn required_context(&self) -> &[&str] {
        &[]
    }
}

impl<B: Backend, const D: usize, T: Denoiser<B, D> + ?Sized> Denoiser<B, D> for Box<T> {
    fn predict(
        &self,
        x_t: Tensor<B, D>,
        timesteps: Tensor<B, 1>,
        context: &Context<B, D>,
    ) -> Tensor<B, D> {
        (**self).predict(x_t, timesteps, context)
    }

    fn prediction_type(&self) -> PredictionType {
        (**self).prediction_type()
    }

    fn required_context(&self) -> &[&str] {
        (**self).required_context()
    }
}

impl<B: Backend, const D: usize, T: Denoiser<B, D> + ?Sized> Denoiser<B, D> for &T {
    fn predict(
        &self,
        x_t: Tensor<B, D>,
        timesteps: Tensor<B, 1>,
        context: &Context<B, D>,
    ) -> Tensor<B, D> {
        (**self).predict(x_t, timesteps, context)
    }

    fn prediction_type(&self) -> PredictionType {
        (**self).prediction_type()
    }

    fn required_context(&self) -> &[&str] {
        (**self).required_context()
    }
}
