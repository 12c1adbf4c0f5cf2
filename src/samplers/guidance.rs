//! Classifier-free guidance.
//!
//! One formula is used everywhere: `guided = uncond + scale * (cond - uncond)`.
//! A scale of exactly `1` only evaluates the conditional branch and a scale of
//! exactly `0` only the unconditional one, so both reductions are bit exact.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::error::{DiffusionError, Result};
use crate::models::{Context, Denoiser};
use crate::schedulers::Timestep;

/// Rejects negative or non-finite guidance scales.
pub fn validate_guidance_scale(guidance_scale: Option<f64>) -> Result<()> {
    match guidance_scale {
        Some(scale) if !scale.is_finite() || scale < 0.0 => {
            Err(DiffusionError::InvalidGuidanceScale(scale))
        }
        _ => Ok(()),
    }
}

/// Blends a conditional and an unconditional prediction.
pub fn apply_guidance<B: Backend, const D: usize>(
    uncond: Tensor<B, D>,
    cond: Tensor<B, D>,
    guidance_scale: f64,
) -> Tensor<B, D> {
    uncond.clone() + (cond - uncond).mul_scalar(guidance_scale)
}

/// Invokes `model` at `t` and applies guidance.
///
/// `None` runs the conditional model once, without guidance.
pub fn guided_prediction<B, M, const D: usize>(
    model: &M,
    x_t: Tensor<B, D>,
    t: Timestep,
    context: &Context<B, D>,
    guidance_scale: Option<f64>,
) -> Tensor<B, D>
where
    B: Backend,
    M: Denoiser<B, D> + ?Sized,
{
    let batch_size = x_t.dims()[0];
    let timesteps = Tensor::full([batch_size], t.value(), &x_t.device());

    match guidance_scale {
        None => model.predict(x_t, timesteps, context),
        Some(scale) if scale == 1.0 => model.predict(x_t, timesteps, context),
        Some(scale) if scale == 0.0 => model.predict(x_t, timesteps, &context.unconditional()),
        Some(scale) => {
            let uncond =
                model.predict(x_t.clone(), timesteps.clone(), &context.unconditional());
            let cond = model.predict(x_t, timesteps, context);
            apply_guidance(uncond, cond, scale)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::context::CLASSES;
    use crate::TestBackend;
    use burn::tensor::{Data, Int};
    use std::cell::Cell;

    /// Returns `x + 1` with labels and `x - 1` without.
    struct LabelShift {
        calls: Cell<usize>,
    }

    impl Denoiser<TestBackend, 2> for LabelShift {
        fn predict(
            &self,
            x_t: Tensor<TestBackend, 2>,
            _timesteps: Tensor<TestBackend, 1>,
            context: &Context<TestBackend, 2>,
        ) -> Tensor<TestBackend, 2> {
            self.calls.set(self.calls.get() + 1);
            if context.labels(CLASSES).is_some() {
                x_t.add_scalar(1.0)
            } else {
                x_t.sub_scalar(1.0)
            }
        }
    }

    fn setup() -> (LabelShift, Tensor<TestBackend, 2>, Context<TestBackend, 2>) {
        let device = Default::default();
        let model = LabelShift {
            calls: Cell::new(0),
        };
        let x = Tensor::<TestBackend, 2>::from_floats([[0.0, 2.0]], &device);
        let context =
            Context::new().with_labels(Tensor::<TestBackend, 2, Int>::zeros([1, 1], &device));
        (model, x, context)
    }

    #[test]
    fn test_scale_one_is_conditional_only() {
        let (model, x, context) = setup();
        let out = guided_prediction(&model, x, Timestep::Index(3), &context, Some(1.0));

        assert_eq!(model.calls.get(), 1);
        assert_eq!(out.into_data().value, vec![1.0, 3.0]);
    }

    #[test]
    fn test_scale_zero_is_unconditional_only() {
        let (model, x, context) = setup();
        let out = guided_prediction(&model, x, Timestep::Index(3), &context, Some(0.0));

        assert_eq!(model.calls.get(), 1);
        assert_eq!(out.into_data().value, vec![-1.0, 1.0]);
    }

    #[test]
    fn test_scale_blends_both_branches() {
        let (model, x, context) = setup();
        let out = guided_prediction(&model, x, Timestep::Index(3), &context, Some(3.0));

        assert_eq!(model.calls.get(), 2);
        // uncond + 3 * (cond - uncond) = (x - 1) + 6
        out.to_data()
            .assert_approx_eq(&Data::from([[5.0, 7.0]]), 3);
    }

    #[test]
    fn test_validate_guidance_scale() {
        assert!(validate_guidance_scale(None).is_ok());
        assert!(validate_guidance_scale(Some(7.5)).is_ok());
        assert!(validate_guidance_scale(Some(-1.0)).is_err());
        assert!(validate_guidance_scale(Some(f64::INFINITY)).is_err());
    }
}
