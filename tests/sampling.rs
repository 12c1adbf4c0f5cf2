use std::cell::Cell;

use burn::backend::NdArray;
use burn::tensor::{Int, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;

use cascade_diffusion_burn::config::{DataConfig, DiffusionConfig};
use cascade_diffusion_burn::models::context::CLASSES;
use cascade_diffusion_burn::models::{Context, Denoiser};
use cascade_diffusion_burn::pipelines::{DiffusionModel, SampleOptions};
use cascade_diffusion_burn::samplers::{AncestralSampler, DdimSampler, ReverseProcessSampler, Sampler};
use cascade_diffusion_burn::schedulers::{BetaSchedule, NoiseScheduleConfig};

type TestBackend = NdArray<f32>;

/// Shrinks the sample, shifted by `+shift` with labels and `-shift` without.
/// Counts its invocations.
struct CountingDenoiser {
    shift: f64,
    calls: Cell<usize>,
}

impl CountingDenoiser {
    fn new(shift: f64) -> Self {
        Self {
            shift,
            calls: Cell::new(0),
        }
    }
}

impl Denoiser<TestBackend, 4> for CountingDenoiser {
    fn predict(
        &self,
        x_t: Tensor<TestBackend, 4>,
        _timesteps: Tensor<TestBackend, 1>,
        context: &Context<TestBackend, 4>,
    ) -> Tensor<TestBackend, 4> {
        self.calls.set(self.calls.get() + 1);
        let x_t = x_t.mul_scalar(0.5);
        if context.labels(CLASSES).is_some() {
            x_t.add_scalar(self.shift)
        } else {
            x_t.sub_scalar(self.shift)
        }
    }
}

fn config(image_size: usize) -> DiffusionConfig {
    DiffusionConfig::new(
        DataConfig {
            image_size,
            num_channels: 3,
            input_number_of_frames: None,
        },
        NoiseScheduleConfig::new(1000, BetaSchedule::Linear),
    )
}

fn labels(num_samples: usize) -> Context<TestBackend, 4> {
    Context::new().with_labels(Tensor::<TestBackend, 2, Int>::zeros(
        [num_samples, 1],
        &Default::default(),
    ))
}

#[test]
fn end_to_end_ancestral_sampling() {
    let model =
        DiffusionModel::new(config(32), CountingDenoiser::new(0.1), &Default::default()).unwrap();
    let options = SampleOptions::default()
        .with_num_sampling_steps(50)
        .with_guidance_scale(1.0);

    let output = model
        .sample(
            4,
            &labels(4),
            &AncestralSampler::default(),
            None,
            &options,
            &mut StdRng::seed_from_u64(42),
        )
        .unwrap();

    assert_eq!(output.samples.dims(), [4, 3, 32, 32]);
    assert_eq!(model.denoiser().calls.get(), 50);
    assert_eq!(output.intermediates.len(), 10);
    let values = output.samples.into_data().value;
    assert!(values.iter().all(|v| v.is_finite() && (0.0..=1.0).contains(v)));
}

#[test]
fn sampling_is_reproducible_with_a_seed() {
    let model =
        DiffusionModel::new(config(8), CountingDenoiser::new(0.1), &Default::default()).unwrap();
    let options = SampleOptions::default().with_num_sampling_steps(20);
    let sampler = Sampler::from_name("ancestral").unwrap();

    let run = |seed| {
        model
            .sample(
                2,
                &labels(2),
                &sampler,
                None,
                &options,
                &mut StdRng::seed_from_u64(seed),
            )
            .unwrap()
            .samples
            .into_data()
            .value
    };

    assert_eq!(run(7), run(7));
    assert_ne!(run(7), run(8));
}

/// Runs a full trajectory with guidance and compares it to one without.
fn compare_guided_run(
    guidance_scale: f64,
    reference_context: Context<TestBackend, 4>,
    sampler: &impl ReverseProcessSampler,
) {
    let model =
        DiffusionModel::new(config(8), CountingDenoiser::new(0.2), &Default::default()).unwrap();
    let noise = Tensor::<TestBackend, 4>::ones([2, 3, 8, 8], &Default::default()).mul_scalar(0.3);
    let steps = SampleOptions::default().with_num_sampling_steps(10);

    let guided = model
        .sample(
            2,
            &labels(2),
            sampler,
            Some(noise.clone()),
            &steps.clone().with_guidance_scale(guidance_scale),
            &mut StdRng::seed_from_u64(1),
        )
        .unwrap();
    assert_eq!(model.denoiser().calls.get(), 10);

    let reference = model
        .sample(
            2,
            &reference_context,
            sampler,
            Some(noise),
            &steps,
            &mut StdRng::seed_from_u64(1),
        )
        .unwrap();

    assert_eq!(
        guided.samples.into_data().value,
        reference.samples.into_data().value
    );
}

#[test]
fn guidance_one_is_plain_conditional_sampling() {
    compare_guided_run(1.0, labels(2), &AncestralSampler::default());
    compare_guided_run(1.0, labels(2), &DdimSampler::default());
}

#[test]
fn guidance_zero_is_unconditional_sampling() {
    compare_guided_run(0.0, Context::new(), &AncestralSampler::default());
    compare_guided_run(0.0, Context::new(), &DdimSampler::default());
}

#[test]
fn guidance_blends_two_predictions_per_step() {
    let model =
        DiffusionModel::new(config(8), CountingDenoiser::new(0.2), &Default::default()).unwrap();
    let options = SampleOptions::default()
        .with_num_sampling_steps(5)
        .with_guidance_scale(4.0);

    model
        .sample(
            1,
            &labels(1),
            &DdimSampler::default(),
            None,
            &options,
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap();

    assert_eq!(model.denoiser().calls.get(), 10);
}
