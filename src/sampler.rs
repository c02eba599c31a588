use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    adapt_strategy::{CombinedOptions, DefaultStrategy, DualAverageSettings},
    chain::{AdaptStrategy, Chain, DrawStats, NutsChain},
    euclidean_hamiltonian::{CpuLogpFunc, EuclideanHamiltonian},
    mass_matrix::{DiagAdaptExpSettings, DiagMassMatrix},
    nuts::{NutsError, NutsOptions},
};

/// Number of random initial points tried before a chain gives up.
pub const MAX_INIT_TRIES: usize = 100;

/// Upper bound on the number of draws reserved up front.
const MAX_PREALLOC: usize = 1 << 16;

/// Settings for the NUTS sampler
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NutsSettings {
    /// The number of tuning steps, where we fit the step size and mass matrix.
    pub num_tune: u64,
    /// The number of draws after tuning
    pub num_draws: u64,
    /// The maximum tree depth during sampling. The number of leapfrog steps
    /// is smaller than 2 ^ maxdepth.
    pub maxdepth: u64,
    /// If the energy error is larger than this threshold we treat the leapfrog
    /// step as a divergence.
    pub max_energy_error: f64,
    pub num_chains: usize,
    pub seed: u64,
    /// Settings for step size adaptation.
    pub step_size_adapt: DualAverageSettings,
    /// Settings for mass matrix adaptation.
    pub mass_matrix_adapt: DiagAdaptExpSettings,
}

impl Default for NutsSettings {
    fn default() -> Self {
        Self {
            num_tune: 1000,
            num_draws: 1000,
            maxdepth: 10,
            max_energy_error: 1000f64,
            num_chains: 4,
            seed: 0,
            step_size_adapt: DualAverageSettings::default(),
            mass_matrix_adapt: DiagAdaptExpSettings::default(),
        }
    }
}

/// Draws and statistics of one chain.
///
/// `draws` only holds the draws after warm-up, `stats` holds one entry
/// for every draw including warm-up.
#[derive(Debug, Clone)]
pub struct ChainOutput {
    pub chain: u64,
    pub draws: Vec<Box<[f64]>>,
    pub stats: Vec<DrawStats>,
}

impl ChainOutput {
    /// The post warm-up trace of one unconstrained parameter.
    pub fn param(&self, index: usize) -> Vec<f64> {
        self.draws.iter().map(|draw| draw[index]).collect()
    }

    /// Statistics of the draws after warm-up.
    pub fn sampling_stats(&self) -> impl Iterator<Item = &DrawStats> {
        self.stats.iter().filter(|stats| !stats.tuning)
    }

    pub fn num_divergences(&self) -> usize {
        self.sampling_stats().filter(|stats| stats.diverging).count()
    }
}

fn new_chain<F: CpuLogpFunc, R: Rng>(
    settings: &NutsSettings,
    chain: u64,
    logp: F,
    rng: &mut R,
) -> NutsChain<ChaCha8Rng, DefaultStrategy<F>> {
    let dim = logp.dim();
    let options = CombinedOptions {
        options1: settings.step_size_adapt,
        options2: settings.mass_matrix_adapt,
    };
    let strategy = DefaultStrategy::new(options, settings.num_tune, dim);
    let mass_matrix = DiagMassMatrix::new(dim);
    let hamiltonian = EuclideanHamiltonian::new(
        logp,
        mass_matrix,
        settings.max_energy_error,
        settings.step_size_adapt.initial_step,
    );
    let options = NutsOptions {
        maxdepth: settings.maxdepth,
    };
    let rng = ChaCha8Rng::from_rng(rng);
    NutsChain::new(hamiltonian, strategy, options, rng, chain, settings.num_tune)
}

/// Set the chain to a random point in `[-2, 2]^dim` on the unconstrained
/// scale, retrying with a new point if the density can not be evaluated
/// there. Unrecoverable logp errors abort at once.
fn init_chain<C: Chain, R: Rng + ?Sized>(
    sampler: &mut C,
    chain: u64,
    rng: &mut R,
) -> Result<(), NutsError> {
    let mut initval = vec![0f64; sampler.dim()];
    let mut last = None;
    for attempt in 0..MAX_INIT_TRIES {
        initval
            .iter_mut()
            .for_each(|x| *x = rng.random_range(-2f64..2f64));
        match sampler.set_position(&initval) {
            Ok(()) => return Ok(()),
            Err(err @ NutsError::LogpFailure(_)) => return Err(err),
            Err(err) => {
                warn!(chain, attempt, error = %err, "initial point rejected");
                last = Some(Box::new(err));
            }
        }
    }
    Err(NutsError::NoInitialPoint {
        attempts: MAX_INIT_TRIES,
        last,
    })
}

/// Run a single chain to completion.
///
/// The random stream of chain `chain` only depends on `settings.seed`
/// and the chain id, so results do not depend on thread scheduling.
pub fn sample_chain<F: CpuLogpFunc>(
    settings: &NutsSettings,
    logp: F,
    chain: u64,
) -> Result<ChainOutput, NutsError> {
    let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
    rng.set_stream(chain);

    let mut sampler = new_chain(settings, chain, logp, &mut rng);
    init_chain(&mut sampler, chain, &mut rng)?;

    let total = settings.num_tune.saturating_add(settings.num_draws);
    let reserve = |n: u64| usize::try_from(n).map_or(MAX_PREALLOC, |n| n.min(MAX_PREALLOC));
    let mut draws = Vec::with_capacity(reserve(settings.num_draws));
    let mut stats = Vec::with_capacity(reserve(total));
    for _ in 0..total {
        let (draw, draw_stats) = sampler.draw()?;
        if !draw_stats.tuning {
            draws.push(draw);
        }
        stats.push(draw_stats);
    }

    let output = ChainOutput {
        chain,
        draws,
        stats,
    };
    debug!(
        chain,
        divergences = output.num_divergences(),
        step_size = ?output.stats.last().map(|s| s.step_size),
        "chain finished"
    );
    Ok(output)
}

/// Run `settings.num_chains` independent chains on the rayon thread pool.
///
/// Every chain gets its own clone of the density and its own result, in
/// chain order. A chain that fails does not affect the others.
pub fn sample_parallel<F>(settings: &NutsSettings, logp: &F) -> Vec<Result<ChainOutput, NutsError>>
where
    F: CpuLogpFunc + Clone + Send + Sync,
{
    (0..settings.num_chains)
        .into_par_iter()
        .map(|chain| sample_chain(settings, logp.clone(), chain as u64))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::euclidean_hamiltonian::tests::{NormalDensity, OneBadChain};
    use pretty_assertions::assert_eq;

    fn small_settings() -> NutsSettings {
        NutsSettings {
            num_tune: 200,
            num_draws: 200,
            num_chains: 3,
            seed: 7,
            ..Default::default()
        }
    }

    #[test]
    fn default_settings() {
        let settings = NutsSettings::default();
        assert_eq!(settings.num_tune, 1000);
        assert_eq!(settings.num_chains, 4);
        assert_eq!(settings.maxdepth, 10);
    }

    #[test]
    fn parallel_chains_keep_order() {
        let settings = small_settings();
        let results = sample_parallel(&settings, &NormalDensity::new(2, 1.));
        assert_eq!(results.len(), 3);
        for (idx, result) in results.into_iter().enumerate() {
            let output = result.unwrap();
            assert_eq!(output.chain, idx as u64);
            assert_eq!(output.draws.len(), 200);
            assert_eq!(output.stats.len(), 400);
            assert_eq!(output.sampling_stats().count(), 200);
            assert!(output.stats.iter().all(|s| s.chain == idx as u64));
        }
    }

    #[test]
    fn chains_are_reproducible_and_distinct() {
        let settings = small_settings();
        let a = sample_chain(&settings, NormalDensity::new(1, 0.), 1).unwrap();
        let b = sample_chain(&settings, NormalDensity::new(1, 0.), 1).unwrap();
        let c = sample_chain(&settings, NormalDensity::new(1, 0.), 2).unwrap();
        assert_eq!(a.param(0), b.param(0));
        assert!(a.param(0) != c.param(0));
    }

    #[test]
    fn fatal_density_aborts_init_at_once() {
        let mut func = NormalDensity::new(1, 0.);
        func.fatal = true;
        let err = sample_chain(&small_settings(), func, 0).unwrap_err();
        assert!(matches!(err, NutsError::LogpFailure(_)));
    }

    #[test]
    fn unreachable_support_keeps_last_init_error() {
        // Every point of the init box lies outside of the support.
        let mut func = NormalDensity::new(1, 0.);
        func.bound = 0.;
        let err = sample_chain(&small_settings(), func, 0).unwrap_err();
        let NutsError::NoInitialPoint { attempts, last } = err else {
            panic!("expected NoInitialPoint, got {err:?}");
        };
        assert_eq!(attempts, MAX_INIT_TRIES);
        assert!(matches!(last.as_deref(), Some(NutsError::BadInitLogp(_))));
    }

    #[test]
    fn fatal_error_during_sampling_aborts_chain() {
        let mut func = NormalDensity::new(1, 0.);
        func.fatal_after = Some(50);
        let err = sample_chain(&small_settings(), func, 0).unwrap_err();
        assert!(matches!(err, NutsError::LogpFailure(_)));
    }

    #[test]
    fn failing_chain_does_not_affect_siblings() {
        let settings = small_settings();
        let results = sample_parallel(&settings, &OneBadChain::new(50));
        assert_eq!(results.len(), 3);
        let failed: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, result)| result.is_err())
            .map(|(idx, _)| idx)
            .collect();
        assert_eq!(failed.len(), 1);
        for (idx, result) in results.into_iter().enumerate() {
            match result {
                Ok(output) => {
                    assert_eq!(output.chain, idx as u64);
                    assert_eq!(output.draws.len(), 200);
                    assert_eq!(output.stats.len(), 400);
                }
                Err(err) => assert!(matches!(err, NutsError::LogpFailure(_))),
            }
        }
    }

    #[test]
    fn huge_draw_counts_do_not_overflow() {
        let settings = NutsSettings {
            num_tune: u64::MAX,
            num_draws: u64::MAX,
            ..small_settings()
        };
        let mut func = NormalDensity::new(1, 0.);
        func.fatal_after = Some(20);
        // Fails in the first draws, after the buffers were reserved.
        let err = sample_chain(&settings, func, 0).unwrap_err();
        assert!(matches!(err, NutsError::LogpFailure(_)));
    }
}
