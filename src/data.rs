//! Simulated coinflip observations.

use rand::Rng;
use rand_distr::{Bernoulli, Distribution};

use crate::model::ModelError;

/// Draw `n` independent flips that come up heads (`true`) with probability `p`.
pub fn simulate_flips<R: Rng + ?Sized>(
    n: usize,
    p: f64,
    rng: &mut R,
) -> Result<Vec<bool>, ModelError> {
    if n == 0 {
        return Err(ModelError::NoFlips);
    }
    if !(p > 0.0 && p < 1.0) {
        return Err(ModelError::InvalidProbability(p));
    }
    let dist = Bernoulli::new(p).map_err(|_| ModelError::InvalidProbability(p))?;
    Ok(dist.sample_iter(rng).take(n).collect())
}
