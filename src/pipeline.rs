//! Stage orchestration: simulate, build the density, sample, diagnose and
//! summarize. Every failure names the stage it happened in.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    config::{ConfigError, RunConfig},
    data::simulate_flips,
    diagnostics::{ConvergencePolicy, Diagnostics},
    euclidean_hamiltonian::CpuLogpFunc,
    model::{BetaPrior, CoinflipProblem, ModelError},
    nuts::NutsError,
    sampler::{sample_parallel, ChainOutput, NutsSettings},
    summary::{pool_constrained, PosteriorSummary, SummaryError},
    transform::{TransformError, TransformedPosterior},
};

/// Random stream of the data simulator. The sampler chains use the
/// streams `0..num_chains` of the same seed.
const SIMULATION_STREAM: u64 = u64::MAX;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
    #[error("simulation failed")]
    Simulation(#[source] ModelError),
    #[error("density construction failed")]
    Model(#[source] ModelError),
    #[error("density evaluation failed")]
    DensityEvaluation(#[source] TransformError),
    #[error("sampling failed in chain {chain}")]
    Sampling {
        chain: u64,
        #[source]
        source: NutsError,
    },
    #[error("chains did not converge: max R-hat {r_hat:.4} exceeds {threshold}")]
    Diagnostics { r_hat: f64, threshold: f64 },
    #[error("summary failed")]
    Summary(#[from] SummaryError),
}

impl PipelineError {
    /// Name of the stage that failed.
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::Config(_) => "config",
            PipelineError::Simulation(_) => "simulation",
            PipelineError::Model(_) | PipelineError::DensityEvaluation(_) => "density evaluation",
            PipelineError::Sampling { .. } => "sampling",
            PipelineError::Diagnostics { .. } => "diagnostics",
            PipelineError::Summary(_) => "summary",
        }
    }
}

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub flips: u64,
    pub heads: u64,
    /// The conjugate posterior, for comparison with the sampled one.
    pub exact_posterior: BetaPrior,
    pub chains: Vec<ChainOutput>,
    pub diagnostics: Diagnostics,
    pub converged: bool,
    pub summary: PosteriorSummary,
}

pub fn simulate(config: &RunConfig) -> Result<Vec<bool>, PipelineError> {
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    rng.set_stream(SIMULATION_STREAM);
    simulate_flips(config.n_flips, config.p_true, &mut rng).map_err(PipelineError::Simulation)
}

/// Build the unconstrained posterior and check that it can be evaluated.
pub fn build_posterior(
    data: &[bool],
    prior: BetaPrior,
) -> Result<TransformedPosterior, PipelineError> {
    let problem = CoinflipProblem::with_prior(data, prior).map_err(PipelineError::Model)?;
    let posterior = TransformedPosterior::new(problem);
    posterior
        .evaluate_with_gradient(0.0)
        .map_err(PipelineError::DensityEvaluation)?;
    Ok(posterior)
}

/// Run all chains. If any chain fails the first failure is returned, the
/// others are logged.
pub fn sample<F>(settings: &NutsSettings, posterior: &F) -> Result<Vec<ChainOutput>, PipelineError>
where
    F: CpuLogpFunc + Clone + Send + Sync,
{
    let mut chains = Vec::with_capacity(settings.num_chains);
    let mut failure = None;
    for (chain, result) in sample_parallel(settings, posterior).into_iter().enumerate() {
        match result {
            Ok(output) => {
                let divergences = output.num_divergences();
                if divergences > 0 {
                    warn!(chain, divergences, "chain has divergent transitions");
                }
                chains.push(output);
            }
            Err(source) => {
                warn!(chain, error = %source, "chain failed");
                if failure.is_none() {
                    failure = Some(PipelineError::Sampling {
                        chain: chain as u64,
                        source,
                    });
                }
            }
        }
    }
    match failure {
        Some(err) => Err(err),
        None => Ok(chains),
    }
}

/// Compute diagnostics and apply the convergence policy.
pub fn diagnose(
    chains: &[ChainOutput],
    threshold: f64,
    policy: ConvergencePolicy,
) -> Result<(Diagnostics, bool), PipelineError> {
    let diagnostics = Diagnostics::from_chains(chains);
    let converged = diagnostics.converged(threshold);
    match diagnostics.max_r_hat() {
        None => warn!(
            chains = diagnostics.num_chains,
            "R-hat can not be assessed, need at least two chains"
        ),
        Some(r_hat) if !converged => {
            if policy == ConvergencePolicy::Fail {
                return Err(PipelineError::Diagnostics { r_hat, threshold });
            }
            warn!(r_hat, threshold, "chains did not converge");
        }
        Some(_) => {}
    }
    if diagnostics.divergence_rate > 0.0 {
        warn!(rate = diagnostics.divergence_rate, "divergent transitions after warm-up");
    }
    Ok((diagnostics, converged))
}

pub fn summarize(
    chains: &[ChainOutput],
    posterior: &TransformedPosterior,
) -> Result<PosteriorSummary, PipelineError> {
    let pooled = pool_constrained(chains, &posterior.transform());
    Ok(PosteriorSummary::from_draws(&pooled)?)
}

/// Run the whole pipeline for one configuration.
pub fn run(config: &RunConfig) -> Result<PipelineReport, PipelineError> {
    config.validate()?;

    let data = simulate(config)?;
    info!(flips = data.len(), p_true = config.p_true, "simulated data");

    let posterior = build_posterior(&data, config.prior)?;
    let problem = posterior.problem();
    info!(
        flips = problem.flips(),
        heads = problem.heads(),
        "built posterior"
    );

    let settings = config.to_nuts_settings();
    let chains = sample(&settings, &posterior)?;
    info!(
        chains = chains.len(),
        draws = settings.num_draws,
        tune = settings.num_tune,
        "sampling finished"
    );

    let (diagnostics, converged) = diagnose(&chains, config.rhat_threshold, config.policy)?;
    info!(
        r_hat = ?diagnostics.max_r_hat(),
        ess_bulk = ?diagnostics.min_ess_bulk(),
        converged,
        "diagnostics computed"
    );

    let summary = summarize(&chains, &posterior)?;
    info!(
        mean = summary.mean,
        sd = summary.sd,
        q05 = summary.q05,
        q95 = summary.q95,
        "posterior summarized"
    );

    Ok(PipelineReport {
        flips: problem.flips(),
        heads: problem.heads(),
        exact_posterior: problem.posterior(),
        chains,
        diagnostics,
        converged,
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::euclidean_hamiltonian::tests::OneBadChain;
    use pretty_assertions::assert_eq;

    fn small_config() -> RunConfig {
        RunConfig {
            chains: 2,
            tune: 300,
            draws: 300,
            ..Default::default()
        }
    }

    #[test]
    fn simulation_is_seeded() {
        let config = small_config();
        assert_eq!(simulate(&config).unwrap(), simulate(&config).unwrap());
        let other = RunConfig { seed: 1, ..config };
        assert!(simulate(&config).unwrap() != simulate(&other).unwrap());
    }

    #[test]
    fn invalid_config_is_a_config_error() {
        let config = RunConfig {
            p_true: 1.5,
            ..small_config()
        };
        let err = run(&config).unwrap_err();
        assert_eq!(err.stage(), "config");
    }

    #[test]
    fn empty_data_fails_in_density_stage() {
        let err = build_posterior(&[], BetaPrior::default()).unwrap_err();
        assert!(matches!(err, PipelineError::Model(ModelError::EmptyObservations)));
        assert_eq!(err.stage(), "density evaluation");
    }

    #[test]
    fn strict_policy_rejects_unconverged_chains() {
        let config = small_config();
        let data = simulate(&config).unwrap();
        let posterior = build_posterior(&data, config.prior).unwrap();
        let mut chains = sample(&config.to_nuts_settings(), &posterior).unwrap();

        let (_, converged) = diagnose(&chains, 1.1, ConvergencePolicy::Fail).unwrap();
        assert!(converged);

        // Move one chain away from the others.
        chains[0]
            .draws
            .iter_mut()
            .for_each(|draw| draw[0] += 3.0);
        let (_, converged) = diagnose(&chains, 1.1, ConvergencePolicy::Warn).unwrap();
        assert!(!converged);
        let err = diagnose(&chains, 1.1, ConvergencePolicy::Fail).unwrap_err();
        assert_eq!(err.stage(), "diagnostics");
    }

    #[test]
    fn failing_chain_is_a_sampling_error() {
        let settings = NutsSettings {
            num_tune: 100,
            num_draws: 100,
            num_chains: 3,
            ..Default::default()
        };
        let err = sample(&settings, &OneBadChain::new(50)).unwrap_err();
        assert_eq!(err.stage(), "sampling");
        let PipelineError::Sampling { chain, source } = err else {
            panic!("expected a sampling error, got {err:?}");
        };
        assert!(chain < 3);
        assert!(matches!(source, NutsError::LogpFailure(_)));
    }

    #[test]
    fn run_reports_all_stages() {
        let report = run(&small_config()).unwrap();
        assert_eq!(report.flips, 100);
        assert_eq!(report.chains.len(), 2);
        assert_eq!(report.summary.n, 600);
        assert!((report.summary.mean - report.exact_posterior.mean()).abs() < 0.05);
    }
}
