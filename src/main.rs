use anyhow::Result;
use clap::{Parser, Subcommand};

mod cli;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the coefficients of a model's noise schedule
    Schedule {
        #[clap(flatten)]
        args: cli::schedule::ScheduleArgs,
    },
    /// Print the timesteps a sampler visits
    Plan {
        #[clap(flatten)]
        args: cli::plan::PlanArgs,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Schedule { args } => {
            cli::schedule::handle_schedule(args)?;
        }
        Commands::Plan { args } => {
            cli::plan::handle_plan(args)?;
        }
    }

    Ok(())
}
