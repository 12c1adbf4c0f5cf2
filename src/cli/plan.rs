use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;

use cascade_diffusion_burn::config::DiffusionConfig;
use cascade_diffusion_burn::samplers::{ReverseProcessSampler, Sampler};

#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Model configuration file (YAML).
    #[arg(long, value_name = "FILE")]
    config: PathBuf,

    /// The sampler to use, `ancestral` or `ddim`.
    #[arg(long, default_value = "ancestral")]
    sampler: String,

    /// The number of steps to run the diffusion for.
    #[arg(long)]
    num_sampling_steps: Option<usize>,

    /// The step to start from, defaults to the last step of the schedule.
    #[arg(long)]
    start_step: Option<usize>,
}

pub fn handle_plan(args: &PlanArgs) -> Result<()> {
    let config = DiffusionConfig::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let schedule = config.noise_schedule()?;
    let sampler = Sampler::from_name(&args.sampler)?;
    if !sampler.supports(&schedule) {
        bail!(
            "the {} sampler cannot run on a {} schedule",
            sampler.name(),
            schedule.mode()
        );
    }

    let timesteps = schedule.sampling_timesteps(args.start_step, args.num_sampling_steps)?;
    println!("{} steps with the {} sampler", timesteps.len(), sampler.name());
    for (i, t) in timesteps.iter().enumerate() {
        match timesteps.get(i + 1) {
            Some(t_prev) => println!("{i:>5}: {t} -> {t_prev}"),
            None => println!("{i:>5}: {t} -> x_0"),
        }
    }

    Ok(())
}
