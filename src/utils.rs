use burn::tensor::backend::Backend;
use burn::tensor::{Data, Shape, Tensor};
use rand::Rng;
use rand_distr::StandardNormal;

pub mod resize;

pub use resize::resize_spatial;

/// Draws a tensor of i.i.d. standard normal values from `rng`.
///
/// Randomness comes from the caller so that a seeded generator reproduces a
/// trajectory exactly, independently of the backend's global seed.
pub fn gaussian_noise<B: Backend, const D: usize, R: Rng + ?Sized>(
    dims: [usize; D],
    device: &B::Device,
    rng: &mut R,
) -> Tensor<B, D> {
    let num_elements = dims.iter().product();
    let values: Vec<f32> = (0..num_elements)
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect();

    Tensor::from_data(
        Data::new(values, Shape::new(dims)).convert::<B::FloatElem>(),
        device,
    )
}

/// Builds a `[batch, 1, ..., 1]` tensor holding one coefficient per batch element,
/// ready to broadcast against a `[batch, ...]` sample.
pub(crate) fn broadcast_batch<B: Backend, const D: usize>(
    values: &[f64],
    device: &B::Device,
) -> Tensor<B, D> {
    let mut dims = [1; D];
    dims[0] = values.len();
    let values: Vec<f32> = values.iter().map(|value| *value as f32).collect();

    Tensor::from_data(
        Data::new(values, Shape::new(dims)).convert::<B::FloatElem>(),
        device,
    )
}

/// Maps data from `[0, 1]` to the `[-1, 1]` range the diffusion process works in.
pub fn normalize_to_neg_one_to_one<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.mul_scalar(2.0).sub_scalar(1.0)
}

/// Maps samples from `[-1, 1]` back to `[0, 1]`.
pub fn unnormalize_to_zero_to_one<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.add_scalar(1.0).mul_scalar(0.5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_gaussian_noise_is_seeded() {
        let device = Default::default();
        let a: Tensor<TestBackend, 3> =
            gaussian_noise([2, 3, 4], &device, &mut StdRng::seed_from_u64(7));
        let b: Tensor<TestBackend, 3> =
            gaussian_noise([2, 3, 4], &device, &mut StdRng::seed_from_u64(7));
        let c: Tensor<TestBackend, 3> =
            gaussian_noise([2, 3, 4], &device, &mut StdRng::seed_from_u64(8));

        assert_eq!(a.dims(), [2, 3, 4]);
        assert_eq!(a.to_data().value, b.to_data().value);
        assert_ne!(a.to_data().value, c.to_data().value);
    }

    #[test]
    fn test_gaussian_noise_statistics() {
        let device = Default::default();
        let noise: Tensor<TestBackend, 2> =
            gaussian_noise([64, 256], &device, &mut StdRng::seed_from_u64(0));
        let values = noise.into_data().value;

        let mean = values.iter().sum::<f32>() / values.len() as f32;
        let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>()
            / values.len() as f32;
        assert!(mean.abs() < 0.05);
        assert!((variance - 1.0).abs() < 0.05);
    }

    #[test]
    fn test_broadcast_batch() {
        let device = Default::default();
        let coefficients: Tensor<TestBackend, 4> = broadcast_batch(&[0.5, 2.0], &device);
        assert_eq!(coefficients.dims(), [2, 1, 1, 1]);

        let scaled = Tensor::<TestBackend, 4>::ones([2, 1, 2, 2], &device) * coefficients;
        scaled.to_data().assert_approx_eq(
            &Data::from([[[[0.5, 0.5], [0.5, 0.5]]], [[[2.0, 2.0], [2.0, 2.0]]]]),
            3,
        );
    }

    #[test]
    fn test_normalize_round_trip() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([0.0, 0.25, 1.0], &device);

        let normalized = normalize_to_neg_one_to_one(x.clone());
        normalized
            .to_data()
            .assert_approx_eq(&Data::from([-1.0, -0.5, 1.0]), 3);
        unnormalize_to_zero_to_one(normalized)
            .to_data()
            .assert_approx_eq(&x.to_data(), 3);
    }
}
