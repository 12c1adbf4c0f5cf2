use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use cascade_diffusion_burn::config::DiffusionConfig;

#[derive(Args, Debug)]
pub struct ScheduleArgs {
    /// Model configuration file (YAML).
    #[arg(long, value_name = "FILE")]
    config: PathBuf,

    /// Number of evenly spaced timesteps to print.
    #[arg(long, default_value_t = 10)]
    points: usize,
}

pub fn handle_schedule(args: &ScheduleArgs) -> Result<()> {
    let config = DiffusionConfig::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let schedule = config.noise_schedule()?;
    log::info!(
        "{} {:?} schedule with {} steps",
        schedule.mode(),
        schedule.config().schedule_type,
        schedule.steps()
    );

    let points = args.points.clamp(2, schedule.steps().max(2));
    let last = schedule.steps() - 1;
    println!("{:>10} {:>12} {:>12} {:>12}", "t", "alpha_bar", "snr", "variance");
    for i in 0..points {
        let index = (last as f64 * i as f64 / (points - 1) as f64).round() as usize;
        let t = schedule.timestep(index);
        let t_prev = index.checked_sub(1).map(|p| schedule.timestep(p));
        let posterior = schedule.posterior(t, t_prev)?;
        println!(
            "{:>10} {:>12.6e} {:>12.6e} {:>12.6e}",
            t.to_string(),
            schedule.alpha_bar(t)?,
            schedule.snr(t)?,
            posterior.variance
        );
    }

    Ok(())
}
