use coinflip_nuts::{
    ess_bulk, pipeline, pool_constrained, r_hat, run, sample_chain, sample_parallel,
    simulate_flips, CoinflipProblem, CpuLogpFunc, LogitTransform, LogpError, NutsError,
    NutsSettings, PipelineError, PosteriorSummary, RunConfig, TransformedPosterior,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

fn posterior(seed: u64) -> TransformedPosterior {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let data = simulate_flips(100, 0.7, &mut rng).unwrap();
    TransformedPosterior::new(CoinflipProblem::new(&data).unwrap())
}

#[test]
fn hundred_flips_match_conjugate_posterior() {
    let report = run(&RunConfig::default()).unwrap();

    assert_eq!(report.flips, 100);
    assert!(report.heads >= 55 && report.heads <= 85, "{}", report.heads);
    assert_eq!(report.chains.len(), 4);
    assert_eq!(report.summary.n, 4000);

    let exact = report.exact_posterior;
    assert!((report.summary.mean - exact.mean()).abs() < 0.05);
    assert!((report.summary.sd - exact.sd()).abs() < 0.01);
    assert!(report.summary.q05 < report.summary.mean);
    assert!(report.summary.q95 > report.summary.mean);

    let diagnostics = &report.diagnostics;
    assert!(diagnostics.r_hat[0] < 1.05);
    assert!(diagnostics.r_hat_rank[0] < 1.05);
    assert!(diagnostics.ess_bulk[0] > 0.0 && diagnostics.ess_bulk[0] <= 4000.0);
    assert!(diagnostics.ess_tail[0] > 0.0 && diagnostics.ess_tail[0] <= 4000.0);
    assert!(diagnostics.divergence_rate < 0.01);
    assert!(report.converged);
}

#[test]
fn single_chain_has_nan_rhat() {
    let settings = NutsSettings {
        num_tune: 200,
        num_draws: 200,
        ..Default::default()
    };
    let output = sample_chain(&settings, posterior(1), 0).unwrap();
    let trace = output.param(0);
    assert!(r_hat(&[&trace]).is_nan());
    assert!(ess_bulk(&[&trace]) > 0.0);

    let config = RunConfig {
        chains: 1,
        tune: 200,
        draws: 200,
        ..Default::default()
    };
    let report = run(&config).unwrap();
    assert!(!report.diagnostics.is_assessable());
    assert!(report.converged);
}

#[test]
fn fixed_seed_is_reproducible() {
    let settings = NutsSettings {
        num_tune: 200,
        num_draws: 200,
        num_chains: 3,
        seed: 11,
        ..Default::default()
    };
    let post = posterior(2);
    let first: Vec<_> = sample_parallel(&settings, &post)
        .into_iter()
        .map(|chain| chain.unwrap().param(0))
        .collect();
    let second: Vec<_> = sample_parallel(&settings, &post)
        .into_iter()
        .map(|chain| chain.unwrap().param(0))
        .collect();
    assert_eq!(first, second);
    assert!(first[0] != first[1]);
}

#[test]
fn summary_is_idempotent() {
    let settings = NutsSettings {
        num_tune: 200,
        num_draws: 200,
        num_chains: 2,
        ..Default::default()
    };
    let chains: Vec<_> = sample_parallel(&settings, &posterior(3))
        .into_iter()
        .map(Result::unwrap)
        .collect();
    let pooled = pool_constrained(&chains, &LogitTransform);
    assert!(pooled.iter().all(|&p| p > 0.0 && p < 1.0));

    let first = PosteriorSummary::from_draws(&pooled).unwrap().to_string();
    let second = PosteriorSummary::from_draws(&pooled).unwrap().to_string();
    assert_eq!(first, second);
    let lines: Vec<&str> = first.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("posterior mean: 0."));
    assert!(lines[1].starts_with("posterior sd: 0."));
}

#[derive(Error, Debug)]
#[error("position out of bounds")]
struct OutOfBounds;

impl LogpError for OutOfBounds {
    fn is_recoverable(&self) -> bool {
        true
    }
}

/// A standard normal restricted to `x > -1`.
#[derive(Clone)]
struct TruncatedNormal;

impl CpuLogpFunc for TruncatedNormal {
    type LogpError = OutOfBounds;

    fn dim(&self) -> usize {
        1
    }

    fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, OutOfBounds> {
        let x = position[0];
        if x <= -1.0 {
            return Err(OutOfBounds);
        }
        grad[0] = -x;
        Ok(-x * x / 2.0)
    }
}

#[test]
fn recoverable_errors_do_not_abort_chains() {
    let settings = NutsSettings {
        num_tune: 300,
        num_draws: 300,
        num_chains: 2,
        ..Default::default()
    };
    for result in sample_parallel(&settings, &TruncatedNormal) {
        let output = result.unwrap();
        assert_eq!(output.draws.len(), 300);
        assert!(output.param(0).iter().all(|&x| x > -1.0));
    }
}

#[derive(Error, Debug)]
#[error("density backend crashed")]
struct Crashed;

impl LogpError for Crashed {
    fn is_recoverable(&self) -> bool {
        false
    }
}

/// The coinflip posterior, crashing after `remaining` evaluations.
#[derive(Clone)]
struct CrashingPosterior {
    posterior: TransformedPosterior,
    remaining: usize,
}

impl CpuLogpFunc for CrashingPosterior {
    type LogpError = Crashed;

    fn dim(&self) -> usize {
        self.posterior.dim()
    }

    fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, Crashed> {
        if self.remaining == 0 {
            return Err(Crashed);
        }
        self.remaining -= 1;
        self.posterior.logp(position, grad).map_err(|_| Crashed)
    }
}

#[test]
fn fatal_errors_during_sampling_abort_the_chain() {
    let settings = NutsSettings {
        num_tune: 200,
        num_draws: 200,
        num_chains: 2,
        ..Default::default()
    };
    let density = CrashingPosterior {
        posterior: posterior(3),
        remaining: 40,
    };

    let err = sample_chain(&settings, density.clone(), 0).unwrap_err();
    assert!(matches!(err, NutsError::LogpFailure(_)));

    let err = pipeline::sample(&settings, &density).unwrap_err();
    assert_eq!(err.stage(), "sampling");
    assert!(matches!(
        err,
        PipelineError::Sampling {
            chain: 0,
            source: NutsError::LogpFailure(_)
        }
    ));
}
