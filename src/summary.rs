use std::fmt;

use thiserror::Error;

use crate::{diagnostics::quantile_sorted, sampler::ChainOutput, transform::LogitTransform};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SummaryError {
    #[error("can not summarize an empty set of posterior draws")]
    Empty,
    #[error("posterior draw {index} is not finite")]
    NonFinite { index: usize },
}

/// Concatenate the post warm-up draws of all chains in chain order and map
/// them to the probability scale.
pub fn pool_constrained(chains: &[ChainOutput], transform: &LogitTransform) -> Vec<f64> {
    chains
        .iter()
        .flat_map(|chain| chain.draws.iter())
        .filter_map(|draw| draw.first())
        .map(|&x| transform.to_constrained(x))
        .collect()
}

/// Mean and spread of the pooled posterior draws of `p`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PosteriorSummary {
    pub mean: f64,
    /// Sample standard deviation, with `n - 1` in the denominator.
    pub sd: f64,
    pub q05: f64,
    pub q95: f64,
    pub n: usize,
}

impl PosteriorSummary {
    pub fn from_draws(draws: &[f64]) -> Result<Self, SummaryError> {
        if draws.is_empty() {
            return Err(SummaryError::Empty);
        }
        if let Some(index) = draws.iter().position(|x| !x.is_finite()) {
            return Err(SummaryError::NonFinite { index });
        }
        let n = draws.len();
        let mean = draws.iter().sum::<f64>() / n as f64;
        let sd = if n > 1 {
            let ss = draws.iter().map(|&x| (x - mean).powi(2)).sum::<f64>();
            (ss / (n - 1) as f64).sqrt()
        } else {
            0.0
        };

        let mut sorted = draws.to_vec();
        sorted.sort_by(f64::total_cmp);
        Ok(Self {
            mean,
            sd,
            q05: quantile_sorted(&sorted, 0.05),
            q95: quantile_sorted(&sorted, 0.95),
            n,
        })
    }
}

/// The two report lines, `posterior mean: X` and `posterior sd: Y`.
impl fmt::Display for PosteriorSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "posterior mean: {:.2}", self.mean)?;
        write!(f, "posterior sd: {:.2}", self.sd)
    }
}
