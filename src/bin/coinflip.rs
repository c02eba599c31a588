//! Simulate coinflips, sample the posterior of the probability of heads and
//! print its mean and standard deviation.

use anyhow::{Context, Result};
use clap::Parser;
use coinflip_nuts::{run, ConvergencePolicy, RunConfig};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "coinflip")]
#[command(about = "Posterior of the probability of heads, sampled with NUTS")]
#[command(version)]
struct Cli {
    /// JSON config file. Flags given on the command line take precedence.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of simulated flips
    #[arg(long)]
    flips: Option<usize>,

    /// Probability of heads used for the simulation
    #[arg(long)]
    p_true: Option<f64>,

    #[arg(long)]
    chains: Option<usize>,

    /// Warm-up draws per chain
    #[arg(long)]
    tune: Option<u64>,

    /// Draws per chain after warm-up
    #[arg(long)]
    draws: Option<u64>,

    #[arg(long)]
    seed: Option<u64>,

    /// Maximum depth of the NUTS trajectory tree
    #[arg(long)]
    max_depth: Option<u64>,

    /// Fail instead of warning when R-hat exceeds the threshold
    #[arg(long)]
    strict: bool,

    /// Print the diagnostics table after the summary
    #[arg(long)]
    diagnostics: bool,

    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: tracing::Level,
}

impl Cli {
    fn run_config(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_json_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => RunConfig::default(),
        };
        if let Some(flips) = self.flips {
            config.n_flips = flips;
        }
        if let Some(p_true) = self.p_true {
            config.p_true = p_true;
        }
        if let Some(chains) = self.chains {
            config.chains = chains;
        }
        if let Some(tune) = self.tune {
            config.tune = tune;
        }
        if let Some(draws) = self.draws {
            config.draws = draws;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(max_depth) = self.max_depth {
            config.maxdepth = max_depth;
        }
        if self.strict {
            config.policy = ConvergencePolicy::Fail;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.run_config()?;
    let report = run(&config).map_err(|err| {
        let stage = err.stage();
        anyhow::Error::new(err).context(format!("{stage} stage failed"))
    })?;

    println!("{}", report.summary);
    if cli.diagnostics {
        println!();
        println!("{}", report.diagnostics);
    }
    Ok(())
}
