//! Convergence diagnostics over the post warm-up draws of several chains.
//!
//! All functions take one slice per chain and are read-only reductions.
//! Degenerate input (a single chain, too few draws, zero variance) yields
//! a `NaN` sentinel for R-hat instead of an error.

use std::fmt;

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::sampler::ChainOutput;

/// Chains shorter than this can not be split into two useful halves.
const MIN_DRAWS: usize = 4;
const VAR_EPS: f64 = 1e-30;

/// What to do when R-hat exceeds the threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvergencePolicy {
    /// Log a warning and report the summary anyway.
    #[default]
    Warn,
    /// Abort the run with a diagnostics error.
    Fail,
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_variance(values: &[f64], mean: f64) -> f64 {
    let n = values.len() as f64;
    values.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / (n.max(2.0) - 1.0)
}

/// Split every chain in half and cut all halves to a common length.
fn split_chains<'a>(chains: &[&'a [f64]], min_len: usize) -> Option<Vec<&'a [f64]>> {
    if chains.is_empty() {
        return None;
    }
    let mut halves = Vec::with_capacity(2 * chains.len());
    for chain in chains {
        if chain.len() < MIN_DRAWS {
            return None;
        }
        let (first, second) = chain.split_at(chain.len() / 2);
        halves.push(first);
        halves.push(second);
    }
    let len = halves.iter().map(|half| half.len()).min()?;
    if len < min_len {
        return None;
    }
    Some(halves.into_iter().map(|half| &half[..len]).collect())
}

/// Between-chain and mean within-chain variance of equally long chains.
fn between_within(chains: &[&[f64]]) -> (f64, f64, f64) {
    let m = chains.len() as f64;
    let n = chains[0].len() as f64;
    let means: Vec<f64> = chains.iter().map(|chain| mean(chain)).collect();
    let grand_mean = mean(&means);
    let between = means.iter().map(|&mu| (mu - grand_mean).powi(2)).sum::<f64>() * n / (m - 1.0);
    let within = chains
        .iter()
        .zip(means.iter())
        .map(|(chain, &mu)| sample_variance(chain, mu))
        .sum::<f64>()
        / m;
    let var_hat_plus = (n - 1.0) / n * within + between / n;
    (between, within, var_hat_plus)
}

/// Split R-hat (Gelman et al.) of one parameter.
///
/// Returns `NaN` for fewer than two chains, chains with fewer than four
/// draws, or zero within-chain variance.
pub fn r_hat(chains: &[&[f64]]) -> f64 {
    if chains.len() < 2 {
        return f64::NAN;
    }
    let Some(halves) = split_chains(chains, 2) else {
        return f64::NAN;
    };
    let (_, within, var_hat_plus) = between_within(&halves);
    if !(within >= VAR_EPS) {
        return f64::NAN;
    }
    (var_hat_plus / within).sqrt()
}

fn sort_floats(values: &mut [f64]) {
    values.sort_by(f64::total_cmp);
}

/// Replace every draw by the normal quantile of its pooled average rank.
fn rank_normalize(chains: &[&[f64]]) -> Option<Vec<Vec<f64>>> {
    let normal = Normal::new(0.0, 1.0).ok()?;
    let total: usize = chains.iter().map(|chain| chain.len()).sum();

    let mut flat: Vec<(f64, usize, usize)> = Vec::with_capacity(total);
    for (ci, chain) in chains.iter().enumerate() {
        flat.extend(chain.iter().enumerate().map(|(ti, &x)| (x, ci, ti)));
    }
    flat.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut out: Vec<Vec<f64>> = chains.iter().map(|chain| vec![0.0; chain.len()]).collect();
    let mut start = 0;
    while start < flat.len() {
        let mut end = start + 1;
        while end < flat.len() && flat[end].0 == flat[start].0 {
            end += 1;
        }
        // Ties share the average of their 1-based ranks.
        let rank = 0.5 * ((start + 1) as f64 + end as f64);
        let quantile = ((rank - 0.375) / (total as f64 + 0.25)).clamp(1e-12, 1.0 - 1e-12);
        let z = normal.inverse_cdf(quantile);
        for &(_, ci, ti) in &flat[start..end] {
            out[ci][ti] = z;
        }
        start = end;
    }
    Some(out)
}

fn as_slices(chains: &[Vec<f64>]) -> Vec<&[f64]> {
    chains.iter().map(Vec::as_slice).collect()
}

/// Rank-normalized split R-hat, the maximum of the bulk and the folded
/// (tail) statistic.
pub fn r_hat_rank_normalized(chains: &[&[f64]]) -> f64 {
    if chains.len() < 2 || chains.iter().any(|chain| chain.len() < MIN_DRAWS) {
        return f64::NAN;
    }
    let Some(ranked) = rank_normalize(chains) else {
        return f64::NAN;
    };
    let bulk = r_hat(&as_slices(&ranked));

    let mut pooled: Vec<f64> = chains.iter().flat_map(|chain| chain.iter().copied()).collect();
    sort_floats(&mut pooled);
    let median = quantile_sorted(&pooled, 0.5);
    let folded: Vec<Vec<f64>> = chains
        .iter()
        .map(|chain| chain.iter().map(|&x| (x - median).abs()).collect())
        .collect();
    let Some(folded) = rank_normalize(&as_slices(&folded)) else {
        return f64::NAN;
    };
    let tail = r_hat(&as_slices(&folded));

    if bulk.is_nan() || tail.is_nan() {
        f64::NAN
    } else {
        bulk.max(tail)
    }
}

/// Linearly interpolated quantile of sorted values.
pub(crate) fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] * (1.0 - frac) + sorted[hi] * frac
}

/// Bulk effective sample size.
///
/// Autocorrelations are estimated from the variogram of the split chains
/// and truncated with Geyer's initial monotone sequence. The result lies in
/// `[1, total draws]`; constant input returns the total number of draws and
/// input too short to split returns 0.
pub fn ess_bulk(chains: &[&[f64]]) -> f64 {
    let Some(halves) = split_chains(chains, MIN_DRAWS) else {
        return 0.0;
    };
    let n = halves[0].len();
    let total = (halves.len() * n) as f64;

    let (_, _, var_hat_plus) = between_within(&halves);
    if !var_hat_plus.is_finite() || var_hat_plus < VAR_EPS {
        return total;
    }

    let mut rho: Vec<f64> = Vec::with_capacity(n);
    for lag in 1..n {
        let mut sum = 0.0;
        let mut count = 0usize;
        for half in &halves {
            for (a, b) in half.iter().zip(&half[lag..]) {
                sum += (a - b).powi(2);
                count += 1;
            }
        }
        let variogram = sum / count as f64;
        rho.push((1.0 - variogram / (2.0 * var_hat_plus)).clamp(-1.0, 1.0));

        let k = rho.len();
        if k % 2 == 0 && rho[k - 2] + rho[k - 1] < 0.0 {
            break;
        }
    }

    // Paired sums, truncated at the first negative one and made monotone.
    let mut tau = 1.0;
    let mut previous = f64::INFINITY;
    for pair in rho.chunks_exact(2) {
        let gamma = pair[0] + pair[1];
        if gamma < 0.0 {
            break;
        }
        previous = previous.min(gamma);
        tau += 2.0 * previous;
    }
    if !tau.is_finite() || tau <= 0.0 {
        return total;
    }
    (total / tau).clamp(1.0, total)
}

/// Tail effective sample size, the smaller ESS of the indicator chains
/// for the 5% and 95% quantiles.
pub fn ess_tail(chains: &[&[f64]]) -> f64 {
    let mut pooled: Vec<f64> = chains.iter().flat_map(|chain| chain.iter().copied()).collect();
    if pooled.is_empty() {
        return 0.0;
    }
    sort_floats(&mut pooled);
    let q05 = quantile_sorted(&pooled, 0.05);
    let q95 = quantile_sorted(&pooled, 0.95);

    let indicator = |pred: &dyn Fn(f64) -> bool| -> Vec<Vec<f64>> {
        chains
            .iter()
            .map(|chain| chain.iter().map(|&x| if pred(x) { 1.0 } else { 0.0 }).collect())
            .collect()
    };
    let lower = indicator(&|x| x <= q05);
    let upper = indicator(&|x| x >= q95);
    ess_bulk(&as_slices(&lower)).min(ess_bulk(&as_slices(&upper)))
}

/// Energy Bayesian fraction of missing information of one chain.
///
/// Values below 0.3 indicate that the momentum resampling explores the
/// energy distribution poorly.
pub fn ebfmi(energies: &[f64]) -> f64 {
    if energies.len() < MIN_DRAWS {
        return f64::NAN;
    }
    let var = sample_variance(energies, mean(energies));
    if var < VAR_EPS {
        return f64::NAN;
    }
    let msd = energies
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).powi(2))
        .sum::<f64>()
        / (energies.len() - 1) as f64;
    msd / var
}

/// Diagnostics of every parameter plus sampler health over all chains.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostics {
    pub num_chains: usize,
    pub total_draws: usize,
    /// Split R-hat per parameter.
    pub r_hat: Vec<f64>,
    /// Rank-normalized split R-hat per parameter.
    pub r_hat_rank: Vec<f64>,
    pub ess_bulk: Vec<f64>,
    pub ess_tail: Vec<f64>,
    /// E-BFMI per chain.
    pub ebfmi: Vec<f64>,
    pub divergence_rate: f64,
    pub maxdepth_rate: f64,
}

impl Diagnostics {
    /// Compute diagnostics from per-parameter traces, one slice per chain.
    pub fn from_traces(params: &[Vec<&[f64]>], energies: &[&[f64]]) -> Self {
        let num_chains = params.first().map(Vec::len).unwrap_or(0);
        let total_draws = params
            .first()
            .map(|chains| chains.iter().map(|chain| chain.len()).sum())
            .unwrap_or(0);
        Self {
            num_chains,
            total_draws,
            r_hat: params.iter().map(|chains| r_hat(chains)).collect(),
            r_hat_rank: params
                .iter()
                .map(|chains| r_hat_rank_normalized(chains))
                .collect(),
            ess_bulk: params.iter().map(|chains| ess_bulk(chains)).collect(),
            ess_tail: params.iter().map(|chains| ess_tail(chains)).collect(),
            ebfmi: energies.iter().map(|energy| ebfmi(energy)).collect(),
            divergence_rate: 0.0,
            maxdepth_rate: 0.0,
        }
    }

    /// Diagnostics of the unconstrained draws of finished chains.
    pub fn from_chains(chains: &[ChainOutput]) -> Self {
        let dim = chains
            .iter()
            .find_map(|chain| chain.draws.first().map(|draw| draw.len()))
            .unwrap_or(0);
        let traces: Vec<Vec<Vec<f64>>> = (0..dim)
            .map(|idx| chains.iter().map(|chain| chain.param(idx)).collect())
            .collect();
        let params: Vec<Vec<&[f64]>> = traces.iter().map(|chains| as_slices(chains)).collect();
        let energies: Vec<Vec<f64>> = chains
            .iter()
            .map(|chain| chain.sampling_stats().map(|stats| stats.energy).collect())
            .collect();

        let mut diagnostics = Self::from_traces(&params, &as_slices(&energies));
        diagnostics.num_chains = chains.len();

        let (draws, divergences, maxdepth) = chains
            .iter()
            .flat_map(|chain| chain.sampling_stats())
            .fold((0usize, 0usize, 0usize), |(n, div, depth), stats| {
                (
                    n + 1,
                    div + usize::from(stats.diverging),
                    depth + usize::from(stats.maxdepth_reached),
                )
            });
        if draws > 0 {
            diagnostics.divergence_rate = divergences as f64 / draws as f64;
            diagnostics.maxdepth_rate = maxdepth as f64 / draws as f64;
        }
        diagnostics
    }

    /// Largest finite rank-normalized R-hat, `None` if none can be computed.
    pub fn max_r_hat(&self) -> Option<f64> {
        self.r_hat_rank
            .iter()
            .copied()
            .filter(|r| r.is_finite())
            .reduce(f64::max)
    }

    /// R-hat needs at least two chains with enough non-constant draws.
    pub fn is_assessable(&self) -> bool {
        self.max_r_hat().is_some()
    }

    /// Whether no parameter has an R-hat above `threshold`.
    ///
    /// A NaN R-hat can not be assessed and does not count as a failure.
    pub fn converged(&self, threshold: f64) -> bool {
        self.max_r_hat().map_or(true, |r| r <= threshold)
    }

    pub fn min_ess_bulk(&self) -> Option<f64> {
        self.ess_bulk.iter().copied().reduce(f64::min)
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "chains: {}, draws: {}",
            self.num_chains, self.total_draws
        )?;
        writeln!(
            f,
            "{:>5} {:>8} {:>8} {:>9} {:>9}",
            "param", "r_hat", "rank", "ess_bulk", "ess_tail"
        )?;
        for idx in 0..self.r_hat.len() {
            writeln!(
                f,
                "{:>5} {:>8.4} {:>8.4} {:>9.1} {:>9.1}",
                idx, self.r_hat[idx], self.r_hat_rank[idx], self.ess_bulk[idx], self.ess_tail[idx]
            )?;
        }
        let ebfmi: Vec<String> = self.ebfmi.iter().map(|e| format!("{e:.3}")).collect();
        writeln!(f, "ebfmi: [{}]", ebfmi.join(", "))?;
        write!(
            f,
            "divergence rate: {:.4}, maxdepth rate: {:.4}",
            self.divergence_rate, self.maxdepth_rate
        )
    }
}
